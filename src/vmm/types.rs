//! VM domain types: the immutable spec, the state tag, and the persistent
//! record the repository projects.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::asset::AssetMapping;
use crate::network::types::{PortMapping, VmNetwork};

/// CPU shape of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSpec {
    /// Number of vCPUs at boot.
    pub vcpu_count: u32,
    /// Optional hotplug ceiling; zero means unset.
    #[serde(default)]
    pub max_vcpu_count: u32,
}

/// Memory shape of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySpec {
    /// Guest memory in bytes.
    pub size_bytes: u64,
}

/// Boot assets and kernel command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSpec {
    /// Kernel image path as known to the caller.
    pub kernel_path: String,
    /// Optional init ramdisk path.
    #[serde(default)]
    pub initrd_path: String,
    /// Base kernel command line; the composer merges network and container
    /// tokens into it.
    #[serde(default)]
    pub kernel_args: String,
}

/// One storage device of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSpec {
    /// Drive id; defaults to `rootfs` / `drive_<n>` when empty.
    #[serde(default)]
    pub id: String,
    /// Image path as known to the caller.
    pub path: String,
    /// Whether this device is the root filesystem.
    #[serde(default)]
    pub is_root_device: bool,
    /// Whether the guest sees the device read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Free-form options; `docker_image` selects the built rootfs.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// The immutable VM specification supplied at create time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    /// CPU shape.
    pub cpu: CpuSpec,
    /// Memory shape.
    pub memory: MemorySpec,
    /// Boot configuration.
    pub boot: BootSpec,
    /// Storage devices; at least one, with a root device among them.
    pub storage: Vec<StorageSpec>,
    /// Free-form metadata; recognized keys: `docker_image`, `tenant_id`,
    /// `force_rebuild`.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Lifecycle state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmState {
    /// Record exists; no VMM process was ever started.
    Created,
    /// VMM process is live and the guest is executing.
    Running,
    /// Guest paused; VMM process and control socket preserved.
    Paused,
    /// Shut down; implemented as a pause so the socket survives for resume.
    Shutdown,
    /// Tombstoned. Never re-materialized.
    Deleted,
}

impl VmState {
    /// Wire name, matching the persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Created => "CREATED",
            VmState::Running => "RUNNING",
            VmState::Paused => "PAUSED",
            VmState::Shutdown => "SHUTDOWN",
            VmState::Deleted => "DELETED",
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The durable VM record, owned by the lifecycle engine and projected to
/// the repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    /// Opaque id, `ud-` + 16 hex chars.
    pub id: String,
    /// Tenant the VM belongs to.
    pub tenant_id: String,
    /// Immutable spec.
    pub spec: VmSpec,
    /// Current lifecycle state.
    pub state: VmState,
    /// Network binding while allocated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<VmNetwork>,
    /// Asset mapping, including lease ids once acquired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<AssetMapping>,
    /// Live port mappings.
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
    /// Creation timestamp (unix seconds).
    pub created_at: i64,
    /// Last mutation timestamp (unix seconds).
    pub updated_at: i64,
}

/// A point-in-time metrics snapshot read from the VMM metrics stream.
/// All-zero snapshots are returned when the stream is silent; that is a
/// valid observation, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmMetricsSnapshot {
    /// When the snapshot was taken (unix seconds).
    pub timestamp: i64,
    /// Guest CPU time, when derivable.
    pub cpu_time_nanos: i64,
    /// Guest memory usage, when derivable.
    pub memory_usage_bytes: i64,
    /// Bytes read across all block devices.
    pub disk_read_bytes: i64,
    /// Bytes written across all block devices.
    pub disk_write_bytes: i64,
    /// Bytes received across all network interfaces.
    pub network_rx_bytes: i64,
    /// Bytes sent across all network interfaces.
    pub network_tx_bytes: i64,
}
