//! Ground station parameters, from `gcu.toml` and `GCU__*` environment
//! overrides.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const CONFIG_FILE: &str = "gcu";

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct GcuConfig {
    pub local_port: u16,
    /// Aircraft endpoint used until a session is active.
    pub drone_address: String,
    pub drone_port: u16,
    pub heartbeat_interval_ms: u64,
    pub discovery_interval_ms: u64,
    pub link_timeout_ms: u64,
    /// Sessions unseen for this long are evicted.
    pub connection_timeout_ms: u64,
    /// First three octets of the assignment pool network.
    pub address_prefix: String,
    pub pool_first: u8,
    pub pool_last: u8,
}

impl Default for GcuConfig {
    fn default() -> Self {
        Self {
            local_port: airlink::DEFAULT_GCU_PORT,
            drone_address: "192.168.1.10".into(),
            drone_port: airlink::DEFAULT_ACU_PORT,
            heartbeat_interval_ms: airlink::HEARTBEAT_INTERVAL.as_millis() as u64,
            discovery_interval_ms: airlink::DISCOVERY_INTERVAL.as_millis() as u64,
            link_timeout_ms: airlink::LINK_TIMEOUT.as_millis() as u64,
            connection_timeout_ms: airlink::CONNECTION_TIMEOUT.as_millis() as u64,
            address_prefix: "172.16.0".into(),
            pool_first: 100,
            pool_last: 254,
        }
    }
}

impl GcuConfig {
    /// Reads `gcu.toml` when present, overlaid with `GCU__*` environment
    /// variables. Missing file and variables leave the defaults.
    pub fn load() -> Result<Self> {
        config::Config::builder()
            .add_source(config::File::with_name(CONFIG_FILE).required(false))
            .add_source(config::Environment::with_prefix("GCU").separator("__"))
            .build()
            .context("Cannot read configuration")?
            .try_deserialize()
            .context("Cannot parse configuration")
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn link_timeout(&self) -> Duration {
        Duration::from_millis(self.link_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_link_constants() {
        let config = GcuConfig::default();
        assert_eq!(config.local_port, 5761);
        assert_eq!(config.drone_port, 5760);
        assert_eq!(config.connection_timeout(), Duration::from_secs(5));
        assert_eq!(config.discovery_interval(), Duration::from_secs(1));
        assert_eq!(config.pool_first, 100);
        assert_eq!(config.pool_last, 254);
    }
}
