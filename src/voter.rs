//! Voter
//!
//! Entry point of the library: one voter identity registered with any
//! number of independently named stripes, each backed by its own
//! [`VotingSession`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::{normalize_address, VoterConfig};
use crate::error::{Error, Result};
use crate::voting::{tcp_peer_factory, PeerFactory, SessionConfig, VoterStatus, VotingSession};

/// A voter process registered with zero or more stripes
pub struct Voter {
    config: SessionConfig,
    factory: PeerFactory,
    sessions: RwLock<HashMap<String, VotingSession>>,
}

impl Voter {
    /// Create a voter reaching servers over TCP
    pub fn new(config: &VoterConfig) -> Self {
        Self::with_factory(SessionConfig::from(config), tcp_peer_factory())
    }

    /// Create a voter with a custom peer factory
    pub fn with_factory(config: SessionConfig, factory: PeerFactory) -> Self {
        Self {
            config,
            factory,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Voter ID presented to servers
    pub fn id(&self) -> &str {
        &self.config.voter_id
    }

    /// Start voting for `stripe`, bootstrapping from `addresses`
    pub async fn register(&self, stripe: &str, addresses: &[String]) -> Result<VoterStatus> {
        if addresses.is_empty() {
            return Err(Error::Config(format!("stripe '{}' has no servers", stripe)));
        }
        let seeds = addresses
            .iter()
            .map(|address| normalize_address(address))
            .collect::<Result<Vec<_>>>()?;

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(stripe) {
            return Err(Error::StripeAlreadyRegistered(stripe.to_string()));
        }

        let session = VotingSession::new(stripe, seeds, self.config.clone(), self.factory.clone());
        let status = session.start();
        sessions.insert(stripe.to_string(), session);

        tracing::info!("Voter {} registered stripe {}", self.config.voter_id, stripe);
        Ok(status)
    }

    /// Stop voting for `stripe`
    pub async fn deregister(&self, stripe: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(stripe)
            .ok_or_else(|| Error::StripeNotRegistered(stripe.to_string()))?;

        session.stop().await;
        tracing::info!("Voter {} deregistered stripe {}", self.config.voter_id, stripe);
        Ok(())
    }

    /// Status of a registered stripe
    pub async fn status(&self, stripe: &str) -> Option<VoterStatus> {
        self.sessions.read().await.get(stripe).map(VotingSession::status)
    }

    /// Names of the registered stripes, sorted
    pub async fn stripes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Cast one unconditional vote for the server at `address`.
    ///
    /// Independent of any registered stripe; the server only accepts it
    /// while it is itself mid-election.
    pub async fn override_vote(&self, address: &str) -> Result<bool> {
        let address = normalize_address(address)?;
        let client = (self.factory)(&address);

        client.connect(&self.config.connection).await?;
        let result = client.override_vote(&self.config.voter_id).await;
        client.close().await;

        match &result {
            Ok(true) => tracing::info!("Successfully cast an override vote to {}", address),
            Ok(false) => tracing::info!("Override vote to {} was rejected", address),
            Err(e) => tracing::warn!("Override vote to {} failed: {}", address, e),
        }
        result
    }

    /// Read a server's state, configuration and voter capacity
    pub async fn probe(&self, address: &str) -> Result<ProbeReport> {
        let address = normalize_address(address)?;
        let client = (self.factory)(&address);

        client.connect(&self.config.connection).await?;
        let report = async {
            Ok::<_, Error>(ProbeReport {
                address: address.clone(),
                state: client.get_server_state().await?,
                config: client.get_server_config().await?,
                registered_voters: client.registered_voter_count().await?,
                voter_limit: client.registered_voter_limit().await?,
            })
        }
        .await;
        client.close().await;
        report
    }

    /// Deregister every stripe
    pub async fn shutdown(&self) {
        let sessions: Vec<VotingSession> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();

        for session in sessions {
            session.stop().await;
        }
        tracing::info!("Voter {} shut down", self.config.voter_id);
    }
}

impl std::fmt::Debug for Voter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Voter").field("id", &self.config.voter_id).finish()
    }
}

/// What a server reports about itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    pub address: String,
    pub state: String,
    pub config: String,
    pub registered_voters: i64,
    pub voter_limit: i64,
}
