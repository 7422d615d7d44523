//! Voter Status
//!
//! Read-only view of a voting session handed back to whoever registered
//! the stripe.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use super::session::SessionShared;
use crate::error::{Error, Result};

/// Registration progress of one stripe
#[derive(Clone)]
pub struct VoterStatus {
    shared: Arc<SessionShared>,
}

impl VoterStatus {
    pub(crate) fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    pub fn stripe(&self) -> &str {
        self.shared.stripe()
    }

    /// Bootstrap completed and every tracked server has this voter registered
    pub async fn is_active(&self) -> bool {
        if self.shared.bootstrapped_at().is_none() {
            return false;
        }
        self.shared
            .monitors()
            .await
            .iter()
            .all(|monitor| monitor.client().is_registered())
    }

    /// Wait for bootstrap, then for every tracked monitor to become operational.
    ///
    /// Fails with [`Error::Cancelled`] if the session stops first or a
    /// tracked monitor is closed before registering.
    pub async fn await_registration_with_all(&self) -> Result<()> {
        self.shared.wait_bootstrapped().await?;
        let monitors = self.shared.monitors().await;
        try_join_all(monitors.iter().map(|monitor| monitor.operational())).await?;
        Ok(())
    }

    /// [`await_registration_with_all`](Self::await_registration_with_all) bounded by `limit`
    pub async fn await_registration_with_all_timeout(&self, limit: Duration) -> Result<()> {
        tokio::time::timeout(limit, self.await_registration_with_all())
            .await
            .map_err(|_| Error::RegistrationTimeout)?
    }

    /// Serializable summary for display
    pub async fn snapshot(&self) -> StatusSnapshot {
        let mut servers: Vec<ServerStatus> = self
            .shared
            .monitors()
            .await
            .iter()
            .map(|monitor| {
                let peer = monitor.client().snapshot();
                ServerStatus {
                    address: monitor.address().to_string(),
                    connected: peer.connected,
                    registered: peer.generation >= 0,
                    operational: monitor.is_operational() && !monitor.is_closed(),
                    voting: peer.voting,
                    generation: peer.generation,
                    last_voted_generation: peer.last_voted_generation,
                }
            })
            .collect();
        servers.sort_by(|a, b| a.address.cmp(&b.address));

        StatusSnapshot {
            stripe: self.stripe().to_string(),
            active: self.is_active().await,
            bootstrapped_at: self.shared.bootstrapped_at(),
            owner: self.shared.owner_address().await,
            servers,
        }
    }
}

impl std::fmt::Debug for VoterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoterStatus")
            .field("stripe", &self.stripe())
            .field("bootstrapped_at", &self.shared.bootstrapped_at())
            .finish()
    }
}

/// Point-in-time state of a stripe registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub stripe: String,
    pub active: bool,
    pub bootstrapped_at: Option<DateTime<Utc>>,
    pub owner: Option<String>,
    pub servers: Vec<ServerStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub address: String,
    pub connected: bool,
    pub registered: bool,
    pub operational: bool,
    pub voting: bool,
    pub generation: i64,
    pub last_voted_generation: i64,
}
