//! WolfVote Configuration
//!
//! This module provides configuration structures for the voter process:
//! connection properties handed to every peer transport, the fixed
//! intervals driving heartbeats, registration and topology polling, and
//! the stripes to register with at startup.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Port assumed when an address is given without one
pub const DEFAULT_PORT: u16 = 9410;

/// Main WolfVote configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VoterConfig {
    /// Voter identity
    #[serde(default)]
    pub voter: VoterSection,

    /// Properties used to open peer connections
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Heartbeat, retry and polling intervals
    #[serde(default)]
    pub timing: TimingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Stripes to register with on start
    #[serde(default)]
    pub stripes: Vec<StripeConfig>,
}

/// Voter identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoterSection {
    /// Voter ID presented to every server (random if omitted)
    #[serde(default = "default_voter_id")]
    pub id: String,

    /// Send deregisterVoter to tracked servers when a stripe is stopped
    #[serde(default = "default_true")]
    pub deregister_on_stop: bool,
}

/// Connection properties for the diagnostics transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Connection name announced to servers
    #[serde(default = "default_connection_name")]
    pub name: String,

    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Session timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Heartbeat period per tracked server in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Registration retry period in milliseconds
    #[serde(default = "default_registration_retry_ms")]
    pub registration_retry_ms: u64,

    /// How long one registration round may run before refreshing seeds
    #[serde(default = "default_registration_round_ms")]
    pub registration_round_ms: u64,

    /// Topology polling period in milliseconds
    #[serde(default = "default_topology_fetch_interval_ms")]
    pub topology_fetch_interval_ms: u64,

    /// Grace period for heartbeat tasks on shutdown in milliseconds
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// A stripe to register with at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeConfig {
    /// Stripe name, unique per voter
    pub name: String,

    /// Seed server addresses (host:port)
    pub servers: Vec<String>,
}

// Default value functions
fn default_voter_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_true() -> bool {
    true
}

fn default_connection_name() -> String {
    "wolfvote".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    1_000
}

fn default_registration_retry_ms() -> u64 {
    5_000
}

fn default_registration_round_ms() -> u64 {
    60_000
}

fn default_topology_fetch_interval_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for VoterSection {
    fn default() -> Self {
        Self {
            id: default_voter_id(),
            deregister_on_stop: true,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: default_connection_name(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ConnectionConfig {
    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            registration_retry_ms: default_registration_retry_ms(),
            registration_round_ms: default_registration_round_ms(),
            topology_fetch_interval_ms: default_topology_fetch_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl TimingConfig {
    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Get registration retry interval as Duration
    pub fn registration_retry(&self) -> Duration {
        Duration::from_millis(self.registration_retry_ms)
    }

    /// Get registration round length as Duration
    pub fn registration_round(&self) -> Duration {
        Duration::from_millis(self.registration_round_ms)
    }

    /// Get topology polling interval as Duration
    pub fn topology_fetch_interval(&self) -> Duration {
        Duration::from_millis(self.topology_fetch_interval_ms)
    }

    /// Get shutdown grace period as Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl VoterConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: VoterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.voter.id.is_empty() {
            return Err(crate::Error::Config("voter.id cannot be empty".into()));
        }

        if self.timing.heartbeat_interval_ms == 0 {
            return Err(crate::Error::Config(
                "timing.heartbeat_interval_ms must be positive".into(),
            ));
        }

        if self.timing.registration_retry_ms == 0
            || self.timing.registration_round_ms == 0
            || self.timing.topology_fetch_interval_ms == 0
        {
            return Err(crate::Error::Config(
                "timing intervals must be positive".into(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for stripe in &self.stripes {
            if stripe.name.is_empty() {
                return Err(crate::Error::Config("stripe name cannot be empty".into()));
            }
            if !names.insert(stripe.name.as_str()) {
                return Err(crate::Error::Config(format!(
                    "stripe '{}' is listed more than once",
                    stripe.name
                )));
            }
            if stripe.servers.is_empty() {
                return Err(crate::Error::Config(format!(
                    "stripe '{}' has no servers",
                    stripe.name
                )));
            }
            for server in &stripe.servers {
                normalize_address(server)?;
            }
        }

        Ok(())
    }
}

/// Parse a `host:port` address, defaulting the port to [`DEFAULT_PORT`].
///
/// Bracketed IPv6 literals (`[::1]:9410`) are accepted.
pub fn parse_host_port(address: &str) -> crate::Result<(String, u16)> {
    let address = address.trim();
    let invalid = || crate::Error::InvalidAddress(address.to_string());

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        match tail.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if tail.is_empty() => (host, None),
            None => return Err(invalid()),
        }
    } else {
        match address.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, Some(port)),
            Some(_) => return Err(invalid()),
            None => (address, None),
        }
    };

    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(invalid());
    }

    let port = match port {
        Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
        None => DEFAULT_PORT,
    };
    if port == 0 {
        return Err(invalid());
    }

    Ok((host.to_string(), port))
}

/// Canonical `host:port` form of an address
pub fn normalize_address(address: &str) -> crate::Result<String> {
    let (host, port) = parse_host_port(address)?;
    if host.contains(':') {
        Ok(format!("[{}]:{}", host, port))
    } else {
        Ok(format!("{}:{}", host, port))
    }
}
