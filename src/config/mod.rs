//! Service configuration, loaded from environment variables with sane
//! defaults for every field.

mod asset;
mod error;
mod network;
mod vmm;

pub use asset::AssetConfig;
pub use error::ConfigError;
pub use network::NetworkConfig;
pub use vmm::VmmConfig;

use serde::{Deserialize, Serialize};

/// Aggregated provisioner configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Network fabric settings
    pub network: NetworkConfig,
    /// VMM supervision settings
    pub vmm: VmmConfig,
    /// Asset resolution settings
    pub asset: AssetConfig,
}

impl Config {
    /// Load the full configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            network: NetworkConfig::load()?,
            vmm: VmmConfig::load()?,
            asset: AssetConfig::load()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = Config::default();
        assert_eq!(config.network.bridge_count, 8);
        assert_eq!(config.network.bridge_prefix, "br-vms");
        assert!(config.network.port_range_start <= config.network.port_range_end);
        assert!(!config.vmm.fail_boot_on_port_forward_error);
    }

    #[test]
    fn vm_paths_follow_layout() {
        let config = VmmConfig::default();
        assert_eq!(
            config.vm_dir("ud-0011223344556677"),
            std::path::Path::new("/run/metald/vms/ud-0011223344556677")
        );
        assert_eq!(
            config.chroot_root("ud-0011223344556677"),
            std::path::Path::new("/srv/jailer/firecracker/ud-0011223344556677/root")
        );
    }
}
