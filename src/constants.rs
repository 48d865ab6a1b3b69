//! Protocol-exact constants shared across the provisioner.
//!
//! Values that appear on the wire or on disk (ID prefixes, device name
//! prefixes, the /29 layout, file names) live here so the lifecycle engine,
//! the network fabric, and the tests agree on a single definition.

/// Prefix for externally visible VM identifiers (`ud-` + 16 hex chars).
pub const VM_ID_PREFIX: &str = "ud-";

/// Number of random bytes backing a VM identifier (16 hex chars).
pub const VM_ID_BYTES: usize = 8;

/// Number of random bytes backing an internal network identifier (8 hex chars).
pub const NETWORK_ID_BYTES: usize = 4;

/// Prefix for deterministic asset identifiers (`asset-` + 16 hex chars).
pub const ASSET_ID_PREFIX: &str = "asset-";

/// TAP device name prefix.
pub const TAP_PREFIX: &str = "tap_";

/// Host-side veth name prefix.
pub const VETH_HOST_PREFIX: &str = "vh_";

/// Namespace-side veth name prefix. The network namespace itself shares this
/// name so that creation and lookup use the same token.
pub const VETH_NS_PREFIX: &str = "vn_";

/// Kernel limit on interface name length.
pub const MAX_IFNAME_LEN: usize = 15;

/// Locally administered unicast OUI lead byte for tenant MACs.
pub const MAC_LOCAL_ADMIN: u8 = 0x02;

/// Third OUI byte of tenant MACs (0x4B).
pub const MAC_TENANT_MARKER: u8 = 0x4B;

/// First usable VM offset inside a tenant /29 slot (.0 network, .1 gateway,
/// .7 broadcast).
pub const SLOT_FIRST_VM_OFFSET: u8 = 2;

/// Last usable VM offset inside a tenant /29 slot.
pub const SLOT_LAST_VM_OFFSET: u8 = 6;

/// Maximum VMs per tenant /29 slot.
pub const SLOT_CAPACITY: u32 = 5;

/// Number of /29 slots inside a bridge /24.
pub const SLOTS_PER_BRIDGE: u32 = 32;

/// First VLAN id handed to projects.
pub const VLAN_RANGE_START: u16 = 100;

/// Last VLAN id handed to projects.
pub const VLAN_RANGE_END: u16 = 4000;

/// Upper bound for `next_vm_index` inside a project /27.
pub const VLAN_MAX_VM_INDEX: u32 = 30;

/// Default lower bound of the host port range used for forwarding.
pub const DEFAULT_PORT_RANGE_START: u16 = 32768;

/// Default upper bound of the host port range used for forwarding.
pub const DEFAULT_PORT_RANGE_END: u16 = 65535;

/// Default path of the persisted tenant fabric state.
pub const DEFAULT_FABRIC_STATE_PATH: &str = "/var/lib/metald/multibridge-state.json";

/// Sysctl drop-in that persists IPv4 forwarding across reboots.
pub const SYSCTL_DROPIN_PATH: &str = "/etc/sysctl.d/99-metald.conf";

/// Kernel toggle for IPv4 forwarding.
pub const IP_FORWARD_PROC_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// VMM control socket file name inside the per-VM directory.
pub const VMM_SOCKET_NAME: &str = "firecracker.sock";

/// VMM log file name inside the per-VM directory.
pub const VMM_LOG_NAME: &str = "firecracker.log";

/// Guest serial console capture file inside the per-VM directory.
pub const CONSOLE_LOG_NAME: &str = "console.log";

/// Guest serial console FIFO inside the per-VM directory.
pub const CONSOLE_FIFO_NAME: &str = "console.fifo";

/// Metrics FIFO name inside the VM chroot, consumed by the metering collector.
pub const METRICS_FIFO_NAME: &str = "metrics.fifo";

/// Standardized kernel image name inside the VM chroot.
pub const KERNEL_IMAGE_NAME: &str = "vmlinux";

/// Standardized root filesystem image name inside the VM chroot.
pub const ROOTFS_IMAGE_NAME: &str = "rootfs.ext4";

/// Container command file written into the root filesystem, read by the
/// guest-side init.
pub const CONTAINER_CMD_FILE: &str = "container.cmd";

/// Guest init binary used when container metadata is present.
pub const GUEST_INIT_PATH: &str = "/usr/bin/metald-init";

/// Wall-clock budget for one metrics FIFO read.
pub const METRICS_READ_TIMEOUT_MS: u64 = 2_000;

/// Number of streaming-decode attempts tolerated when the FIFO writer
/// started mid-object.
pub const METRICS_DECODE_ATTEMPTS: usize = 5;

/// Maximum time to wait for an on-demand asset build.
pub const ASSET_BUILD_TIMEOUT_SECS: u64 = 1_800;

/// Default graceful shutdown budget for the pause RPC.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Settle delay between the shutdown and boot halves of a reboot.
pub const REBOOT_SETTLE_DELAY_MS: u64 = 1_000;

/// Tenant used when the caller carries no workspace baggage.
pub const DEFAULT_TENANT: &str = "default";

/// FNV-1a 32-bit hash, as used for tenant-to-bridge and project-to-VLAN
/// mapping. The constant set is wire-exact: persisted state and MAC
/// addresses depend on it.
pub fn fnv1a32(data: &str) -> u32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;
    let mut hash = FNV_OFFSET;
    for byte in data.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
