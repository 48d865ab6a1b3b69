//! VMM supervision configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::error::ConfigError;

/// VMM process configuration (binary, per-VM directories, chroot base)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmmConfig {
    /// Path to the VMM binary
    pub firecracker_bin: PathBuf,
    /// Base directory for per-VM sockets and logs (`<base>/<vmid>/...`)
    pub base_dir: PathBuf,
    /// Base directory for per-VM chroots (`<base>/firecracker/<vmid>/root`)
    pub chroot_base_dir: PathBuf,
    /// Milliseconds to wait for the control socket after spawning the VMM
    pub boot_timeout_ms: u64,
    /// Fail the boot when port-forward rule installation partially fails.
    /// The default preserves the historical continue-with-warning behavior.
    pub fail_boot_on_port_forward_error: bool,
}

impl VmmConfig {
    /// Load VMM configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides to existing configuration
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("METALD_FIRECRACKER_BIN") {
            self.firecracker_bin = val.into();
        }
        if let Ok(val) = std::env::var("METALD_BASE_DIR") {
            self.base_dir = val.into();
        }
        if let Ok(val) = std::env::var("METALD_CHROOT_BASE_DIR") {
            self.chroot_base_dir = val.into();
        }
        if let Ok(val) = std::env::var("METALD_BOOT_TIMEOUT_MS") {
            self.boot_timeout_ms = val.parse().ok().unwrap_or(self.boot_timeout_ms);
        }
        if let Ok(val) = std::env::var("METALD_FAIL_BOOT_ON_PORT_FORWARD_ERROR") {
            self.fail_boot_on_port_forward_error = val
                .parse()
                .ok()
                .unwrap_or(self.fail_boot_on_port_forward_error);
        }
        Ok(())
    }

    /// Per-VM directory holding the control socket and logs
    pub fn vm_dir(&self, vm_id: &str) -> PathBuf {
        self.base_dir.join(vm_id)
    }

    /// Per-VM chroot root, where assets and runtime artifacts live
    pub fn chroot_root(&self, vm_id: &str) -> PathBuf {
        self.chroot_base_dir
            .join("firecracker")
            .join(vm_id)
            .join("root")
    }
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            firecracker_bin: "/usr/bin/firecracker".into(),
            base_dir: "/run/metald/vms".into(),
            chroot_base_dir: "/srv/jailer".into(),
            boot_timeout_ms: 30_000,
            fail_boot_on_port_forward_error: false,
        }
    }
}
