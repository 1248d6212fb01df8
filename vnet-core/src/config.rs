//! Controller configuration.
//!
//! Resolver, traversal and NAT binding policy is configurable. The flow
//! idle timeout is fixed (`flow::IDLE_TIMEOUT_SECS`).

use std::path::Path;
use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config value: {0}")]
    Invalid(&'static str),
}

/// Decision engine policy values.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Seconds between ARP requests for an unresolved next hop
    pub arp_retry_interval_secs: u64,
    /// ARP requests sent before queued packets are dropped
    pub arp_max_retries: u32,
    /// Seconds a resolved ARP entry stays valid
    pub arp_expiry_secs: u64,
    /// Packets queued per unresolved next hop; later arrivals are dropped
    pub max_pending_packets: usize,
    /// Routers a packet may traverse over logical ports
    pub max_router_hops: usize,
    /// Seconds a NAT binding survives without traffic
    pub nat_idle_timeout_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            arp_retry_interval_secs: 10,
            arp_max_retries: 6,
            arp_expiry_secs: 3600,
            max_pending_packets: 256,
            max_router_hops: 16,
            nat_idle_timeout_secs: 300,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: ControllerConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arp_retry_interval_secs == 0 {
            return Err(ConfigError::Invalid("arp_retry_interval_secs must be > 0"));
        }
        if self.arp_max_retries == 0 {
            return Err(ConfigError::Invalid("arp_max_retries must be > 0"));
        }
        if self.max_router_hops == 0 {
            return Err(ConfigError::Invalid("max_router_hops must be > 0"));
        }
        if self.nat_idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("nat_idle_timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn arp_retry_interval(&self) -> Duration {
        Duration::from_secs(self.arp_retry_interval_secs)
    }

    pub fn arp_expiry(&self) -> Duration {
        Duration::from_secs(self.arp_expiry_secs)
    }

    pub fn nat_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.nat_idle_timeout_secs)
    }
}

/// Source of the current time for resolver state.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
