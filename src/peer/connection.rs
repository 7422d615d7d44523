//! Peer Connection
//!
//! Per-server handle for the voter-manager operations of one stripe
//! server, tracking that server's election term as seen by this voter.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::network::{Diagnostics, DiagnosticsConnector, REQUEST_TIMEOUT};

/// Managed object exposing the voter operations on a server
pub const VOTER_MANAGER: &str = "VoterManager";

/// Managed object exposing stripe membership on a server
pub const TOPOLOGY_MBEAN: &str = "TopologyMBean";

/// Response meaning the server does not (or no longer) recognise this voter
pub const INVALID_VOTER_RESPONSE: i64 = -1;

/// Heartbeat response meaning no election is in progress
pub const HEARTBEAT_RESPONSE: i64 = 0;

/// Point-in-time view of a peer's vote state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub connected: bool,
    pub voting: bool,
    pub generation: i64,
    pub last_voted_generation: i64,
}

/// Operations the voting session needs from one stripe server.
///
/// Methods returning [`Result`] surface transport timeouts as
/// [`Error::RequestTimeout`].
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Stable identity of the peer (host:port)
    fn address(&self) -> &str;

    /// Open the transport, replacing any channel already open
    async fn connect(&self, props: &ConnectionConfig) -> Result<()>;

    /// Register this voter; true when the server accepted it
    async fn register(&self, id: &str) -> Result<bool>;

    /// Heartbeat; `0` when idle, otherwise the term the server wants a vote for
    async fn heartbeat(&self, id: &str) -> Result<i64>;

    /// Vote in the current generation; `0` when the vote was accepted
    async fn vote(&self, id: &str) -> Result<i64>;

    /// Unconditional vote, accepted only by a server that is mid-election
    async fn override_vote(&self, id: &str) -> Result<bool>;

    async fn deregister_voter(&self, id: &str) -> Result<bool>;

    async fn get_server_state(&self) -> Result<String>;

    async fn get_server_config(&self) -> Result<String>;

    /// The server's view of stripe membership
    async fn get_topology(&self) -> Result<HashSet<String>>;

    async fn registered_voter_count(&self) -> Result<i64>;

    async fn registered_voter_limit(&self) -> Result<i64>;

    /// Release the transport; safe to call repeatedly
    async fn close(&self);

    /// Stop supporting this peer for its current generation without telling it
    fn zombie(&self);

    fn is_connected(&self) -> bool;

    fn is_voting(&self) -> bool;

    fn generation(&self) -> i64;

    fn last_voted_generation(&self) -> i64;

    fn is_registered(&self) -> bool {
        self.generation() >= 0
    }

    fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            connected: self.is_connected(),
            voting: self.is_voting(),
            generation: self.generation(),
            last_voted_generation: self.last_voted_generation(),
        }
    }
}

/// [`PeerClient`] backed by a diagnostics channel
pub struct PeerConnection {
    address: String,
    connector: Arc<dyn DiagnosticsConnector>,
    channel: Mutex<Option<Arc<dyn Diagnostics>>>,
    voting: AtomicBool,
    generation: AtomicI64,
    last_voted_generation: AtomicI64,
    /// Generation this connection was zombied in, if any
    zombied_generation: AtomicI64,
}

impl PeerConnection {
    /// Create an unconnected handle for `address`
    pub fn new(address: impl Into<String>, connector: Arc<dyn DiagnosticsConnector>) -> Self {
        Self {
            address: address.into(),
            connector,
            channel: Mutex::new(None),
            voting: AtomicBool::new(false),
            generation: AtomicI64::new(INVALID_VOTER_RESPONSE),
            last_voted_generation: AtomicI64::new(INVALID_VOTER_RESPONSE),
            zombied_generation: AtomicI64::new(INVALID_VOTER_RESPONSE),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<dyn Diagnostics>>> {
        self.channel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn channel(&self) -> Result<Arc<dyn Diagnostics>> {
        self.slot()
            .clone()
            .ok_or_else(|| Error::NotConnected(self.address.clone()))
    }

    /// Translate the timeout sentinel into an error
    fn process_invocation(&self, result: String) -> Result<String> {
        if result == REQUEST_TIMEOUT {
            return Err(Error::RequestTimeout(self.address.clone()));
        }
        Ok(result)
    }

    fn parse_long(&self, operation: &str, result: &str) -> Result<i64> {
        result.trim().parse::<i64>().map_err(|_| Error::ProtocolViolation {
            address: self.address.clone(),
            detail: format!("non-numeric {} response '{}'", operation, result),
        })
    }

    async fn invoke_voter_manager(&self, operation: &str, arg: Option<&str>) -> Result<String> {
        let channel = self.channel()?;
        let result = match arg {
            Some(arg) => channel.invoke_with_arg(VOTER_MANAGER, operation, arg).await?,
            None => channel.invoke(VOTER_MANAGER, operation).await?,
        };
        self.process_invocation(result)
    }
}

#[async_trait]
impl PeerClient for PeerConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self, props: &ConnectionConfig) -> Result<()> {
        let fresh = self.connector.connect(&self.address, props).await?;
        let former = self.slot().replace(fresh);
        if let Some(former) = former {
            former.close().await;
        }
        tracing::info!("Connected to {}", self.address);
        Ok(())
    }

    async fn register(&self, id: &str) -> Result<bool> {
        let result = self.invoke_voter_manager("registerVoter", Some(id)).await?;
        let value = match self.parse_long("registerVoter", &result) {
            Ok(value) => value,
            Err(e) => {
                self.generation.store(INVALID_VOTER_RESPONSE, Ordering::SeqCst);
                return Err(e);
            }
        };
        if value < INVALID_VOTER_RESPONSE {
            return Err(Error::ProtocolViolation {
                address: self.address.clone(),
                detail: format!("registerVoter returned {}", value),
            });
        }
        self.generation.store(value, Ordering::SeqCst);
        Ok(self.is_registered())
    }

    async fn heartbeat(&self, id: &str) -> Result<i64> {
        let started = std::time::Instant::now();
        let result = self.invoke_voter_manager("heartbeat", Some(id)).await?;
        tracing::debug!(
            "heartbeat result {} in {:?} from {}",
            result,
            started.elapsed(),
            self.address
        );

        let response = self.parse_long("heartbeat", &result)?;
        match response {
            INVALID_VOTER_RESPONSE => {
                self.voting.store(false, Ordering::SeqCst);
                self.generation.store(INVALID_VOTER_RESPONSE, Ordering::SeqCst);
                Err(Error::NotRegistered(self.address.clone()))
            }
            r if r < 0 => Err(Error::ProtocolViolation {
                address: self.address.clone(),
                detail: format!("negative heartbeat response {}", r),
            }),
            HEARTBEAT_RESPONSE => {
                self.voting.store(false, Ordering::SeqCst);
                Ok(HEARTBEAT_RESPONSE)
            }
            term => {
                if !self.voting.load(Ordering::SeqCst)
                    && self.zombied_generation.load(Ordering::SeqCst) == term
                {
                    // already zombied for this generation, cannot vote
                    return Ok(HEARTBEAT_RESPONSE);
                }
                self.generation.store(term, Ordering::SeqCst);
                self.voting.store(true, Ordering::SeqCst);
                Ok(term)
            }
        }
    }

    async fn vote(&self, id: &str) -> Result<i64> {
        if !self.voting.load(Ordering::SeqCst) {
            return Err(Error::NotVoting(self.address.clone()));
        }
        let generation = self.generation.load(Ordering::SeqCst);
        let ballot = format!("{}:{}", id, generation);
        let result = self.invoke_voter_manager("vote", Some(&ballot)).await?;
        let value = self.parse_long("vote", &result)?;
        if value == HEARTBEAT_RESPONSE {
            self.last_voted_generation.fetch_max(generation, Ordering::SeqCst);
        }
        Ok(value)
    }

    async fn override_vote(&self, id: &str) -> Result<bool> {
        let result = self.invoke_voter_manager("overrideVote", Some(id)).await?;
        Ok(result.trim().eq_ignore_ascii_case("true"))
    }

    async fn deregister_voter(&self, id: &str) -> Result<bool> {
        let result = self.invoke_voter_manager("deregisterVoter", Some(id)).await?;
        Ok(result.trim().eq_ignore_ascii_case("true"))
    }

    async fn get_server_state(&self) -> Result<String> {
        let result = self.channel()?.get_state().await?;
        self.process_invocation(result)
    }

    async fn get_server_config(&self) -> Result<String> {
        let result = self.channel()?.get_config().await?;
        self.process_invocation(result)
    }

    async fn get_topology(&self) -> Result<HashSet<String>> {
        let result = self.channel()?.invoke(TOPOLOGY_MBEAN, "getTopology").await?;
        let result = self.process_invocation(result)?;
        Ok(result
            .split(',')
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn registered_voter_count(&self) -> Result<i64> {
        let result = self.invoke_voter_manager("getRegisteredVoters", None).await?;
        self.parse_long("getRegisteredVoters", &result)
    }

    async fn registered_voter_limit(&self) -> Result<i64> {
        let result = self.invoke_voter_manager("getVoterLimit", None).await?;
        self.parse_long("getVoterLimit", &result)
    }

    async fn close(&self) {
        let channel = self.slot().take();
        if let Some(channel) = channel {
            channel.close().await;
            tracing::info!("Connection closed to {}", self.address);
        }
    }

    fn zombie(&self) {
        let generation = self.generation.load(Ordering::SeqCst);
        tracing::debug!("Zombied {} for generation {}", self.address, generation);
        self.zombied_generation.store(generation, Ordering::SeqCst);
        self.voting.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.slot().is_some()
    }

    fn is_voting(&self) -> bool {
        self.voting.load(Ordering::SeqCst)
    }

    fn generation(&self) -> i64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn last_voted_generation(&self) -> i64 {
        self.last_voted_generation.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .field("voting", &self.is_voting())
            .field("generation", &self.generation())
            .field("last_voted_generation", &self.last_voted_generation())
            .finish()
    }
}
