//! Asset resolution configuration

use serde::{Deserialize, Serialize};

use super::error::ConfigError;

/// Asset service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetConfig {
    /// Tenant id sent to the builder when the spec metadata carries none
    pub default_tenant: String,
    /// Maximum seconds to wait for an on-demand build
    pub build_timeout_secs: u64,
}

impl AssetConfig {
    /// Load asset configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides to existing configuration
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("METALD_ASSET_DEFAULT_TENANT") {
            self.default_tenant = val;
        }
        if let Ok(val) = std::env::var("METALD_ASSET_BUILD_TIMEOUT_SECS") {
            self.build_timeout_secs = val.parse().ok().unwrap_or(self.build_timeout_secs);
        }
        Ok(())
    }
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            default_tenant: "cli-tenant".to_string(),
            build_timeout_secs: crate::constants::ASSET_BUILD_TIMEOUT_SECS,
        }
    }
}
