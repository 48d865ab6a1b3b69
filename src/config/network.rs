//! Network fabric configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::error::ConfigError;
use crate::constants;

/// Network fabric configuration (bridges, DNS, rate limiting, persistence)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Number of tenant bridges on this host (typically 8 or 32)
    pub bridge_count: u32,
    /// Bridge name prefix; bridge N is named `<prefix>-<N>`
    pub bridge_prefix: String,
    /// Subnet covering all VM addresses, used for the masquerade rule
    pub vm_subnet: String,
    /// DNS servers handed to guests
    pub dns_servers: Vec<String>,
    /// Enable per-VM token-bucket rate limiting on the host veth
    pub enable_rate_limit: bool,
    /// Per-VM rate limit in Mbps
    pub rate_limit_mbps: u32,
    /// Inject network configuration into the guest kernel command line
    pub enable_kernel_network_config: bool,
    /// Path of the persisted tenant fabric state file
    pub fabric_state_path: PathBuf,
    /// Lower bound of the host port range used for forwarding
    pub port_range_start: u16,
    /// Upper bound of the host port range used for forwarding
    pub port_range_end: u16,
}

impl NetworkConfig {
    /// Load network configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides to existing configuration
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("METALD_BRIDGE_COUNT") {
            self.bridge_count = val.parse().map_err(|_| ConfigError::InvalidValue {
                key: "METALD_BRIDGE_COUNT".to_string(),
                value: val,
                reason: "expected a positive integer".to_string(),
            })?;
        }
        if let Ok(val) = std::env::var("METALD_BRIDGE_PREFIX") {
            self.bridge_prefix = val;
        }
        if let Ok(val) = std::env::var("METALD_VM_SUBNET") {
            self.vm_subnet = val;
        }
        if let Ok(val) = std::env::var("METALD_DNS_SERVERS") {
            self.dns_servers = val.split(',').map(str::to_string).collect();
        }
        if let Ok(val) = std::env::var("METALD_ENABLE_RATE_LIMIT") {
            self.enable_rate_limit = val.parse().ok().unwrap_or(self.enable_rate_limit);
        }
        if let Ok(val) = std::env::var("METALD_RATE_LIMIT_MBPS") {
            self.rate_limit_mbps = val.parse().ok().unwrap_or(self.rate_limit_mbps);
        }
        if let Ok(val) = std::env::var("METALD_KERNEL_NETWORK_CONFIG") {
            self.enable_kernel_network_config =
                val.parse().ok().unwrap_or(self.enable_kernel_network_config);
        }
        if let Ok(val) = std::env::var("METALD_FABRIC_STATE_PATH") {
            self.fabric_state_path = val.into();
        }
        if let Ok(val) = std::env::var("METALD_PORT_RANGE_START") {
            self.port_range_start = val.parse().ok().unwrap_or(self.port_range_start);
        }
        if let Ok(val) = std::env::var("METALD_PORT_RANGE_END") {
            self.port_range_end = val.parse().ok().unwrap_or(self.port_range_end);
        }
        if self.bridge_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "METALD_BRIDGE_COUNT".to_string(),
                value: "0".to_string(),
                reason: "at least one bridge is required".to_string(),
            });
        }
        if self.port_range_start > self.port_range_end {
            return Err(ConfigError::InvalidValue {
                key: "METALD_PORT_RANGE_START".to_string(),
                value: self.port_range_start.to_string(),
                reason: "range start exceeds range end".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge_count: 8,
            bridge_prefix: "br-vms".to_string(),
            vm_subnet: "172.16.0.0/16".to_string(),
            dns_servers: vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()],
            enable_rate_limit: true,
            rate_limit_mbps: 1000,
            enable_kernel_network_config: true,
            fabric_state_path: constants::DEFAULT_FABRIC_STATE_PATH.into(),
            port_range_start: constants::DEFAULT_PORT_RANGE_START,
            port_range_end: constants::DEFAULT_PORT_RANGE_END,
        }
    }
}
