//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{NodeError, Result};

/// Largest accepted burst size; bulk budgets are derived as twenty times this.
pub const MAX_BURST_LIMIT: i64 = i64::MAX / 20;

/// Main configuration for a Tollgate node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Peer scoring configuration
    #[serde(default)]
    pub peer_scoring: PeerScoringConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address the node accepts inbound streams on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Upper bound for reading a stream header and for each response write
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            stream_timeout_ms: default_stream_timeout(),
        }
    }
}

impl NetworkConfig {
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 13000))
}

fn default_stream_timeout() -> u64 {
    10_000
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Burst size most topic budgets are derived from
    #[serde(default = "default_burst_limit")]
    pub default_burst_limit: i64,

    /// How often fully replenished peer entries are dropped, in seconds (0 disables)
    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            default_burst_limit: default_burst_limit(),
            prune_interval_secs: default_prune_interval(),
        }
    }
}

fn default_burst_limit() -> i64 {
    5
}

fn default_prune_interval() -> u64 {
    60
}

/// Peer scoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerScoringConfig {
    /// Number of bad responses after which a peer is refused
    #[serde(default = "default_bad_response_threshold")]
    pub bad_response_threshold: u64,

    /// How often every peer's bad response count is reduced by one, in seconds
    #[serde(default = "default_decay_interval")]
    pub decay_interval_secs: u64,
}

impl Default for PeerScoringConfig {
    fn default() -> Self {
        Self {
            bad_response_threshold: default_bad_response_threshold(),
            decay_interval_secs: default_decay_interval(),
        }
    }
}

fn default_bad_response_threshold() -> u64 {
    6
}

fn default_decay_interval() -> u64 {
    600
}

impl NodeConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading node configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: NodeConfig = serde_yaml::from_str(yaml)
            .map_err(|e| NodeError::Config(format!("Failed to parse node config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        let burst = self.rate_limiting.default_burst_limit;
        if burst < 1 {
            return Err(NodeError::Config(
                "rate_limiting.default_burst_limit must be at least 1".to_string(),
            ));
        }
        if burst > MAX_BURST_LIMIT {
            return Err(NodeError::Config(format!(
                "rate_limiting.default_burst_limit must be at most {}",
                MAX_BURST_LIMIT
            )));
        }
        if self.peer_scoring.bad_response_threshold == 0 {
            return Err(NodeError::Config(
                "peer_scoring.bad_response_threshold must be at least 1".to_string(),
            ));
        }
        if self.network.stream_timeout_ms == 0 {
            return Err(NodeError::Config(
                "network.stream_timeout_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
