//! Identifier and device-name generation.
//!
//! Two id classes exist. The external VM id (`ud-` + 16 hex) comes straight
//! from the OS CSPRNG; a collision is a caller-visible error caught by the
//! repository's unique constraint. The internal network id (8 hex) names
//! kernel devices, so it is tracked in an in-process registry to keep
//! concurrent allocations from colliding before any device exists.

use dashmap::DashSet;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::constants::{
    MAX_IFNAME_LEN, NETWORK_ID_BYTES, TAP_PREFIX, VETH_HOST_PREFIX, VETH_NS_PREFIX, VM_ID_BYTES,
    VM_ID_PREFIX,
};
use crate::error::{Error, Result};

/// Generate an external VM identifier: `ud-` + 16 lowercase hex chars.
pub fn generate_vm_id() -> String {
    let mut bytes = [0u8; VM_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    format!("{VM_ID_PREFIX}{}", hex_encode(&bytes))
}

/// Device names derived from one network id. The namespace intentionally
/// shares the namespace-side veth name so creation and lookup use the same
/// token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNames {
    /// TAP device in the host namespace, read and written by the VMM.
    pub tap: String,
    /// Host-side veth leg.
    pub veth_host: String,
    /// Namespace-side veth leg.
    pub veth_ns: String,
    /// Network namespace name (equals `veth_ns`).
    pub namespace: String,
}

impl DeviceNames {
    /// Derive the device name set for a network id.
    pub fn for_network_id(network_id: &str) -> Self {
        Self {
            tap: format!("{TAP_PREFIX}{network_id}"),
            veth_host: format!("{VETH_HOST_PREFIX}{network_id}"),
            veth_ns: format!("{VETH_NS_PREFIX}{network_id}"),
            namespace: format!("{VETH_NS_PREFIX}{network_id}"),
        }
    }
}

/// Validate a kernel interface name: 1..=15 chars, alphanumerics plus
/// `-`, `_` and `.`, not starting with a dot.
pub fn validate_interface_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_IFNAME_LEN {
        return Err(Error::InvalidArgument {
            what: "interface name".to_string(),
            reason: format!("{name:?} must be 1-{MAX_IFNAME_LEN} characters"),
        });
    }
    if name.starts_with('.') {
        return Err(Error::InvalidArgument {
            what: "interface name".to_string(),
            reason: format!("{name:?} must not start with a dot"),
        });
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(Error::InvalidArgument {
            what: "interface name".to_string(),
            reason: format!("{name:?} contains characters outside [A-Za-z0-9._-]"),
        });
    }
    Ok(())
}

/// Collision-tracked generator for internal network ids.
pub struct IdGenerator {
    active: DashSet<String>,
}

impl IdGenerator {
    /// Create an empty generator.
    pub fn new() -> Self {
        Self {
            active: DashSet::new(),
        }
    }

    /// Generate a fresh 8-hex network id and mark it active.
    pub fn generate_network_id(&self) -> Result<String> {
        const MAX_ATTEMPTS: usize = 16;
        for _ in 0..MAX_ATTEMPTS {
            let mut bytes = [0u8; NETWORK_ID_BYTES];
            OsRng.fill_bytes(&mut bytes);
            let id = hex_encode(&bytes);
            // insert returns false when the id is already active
            if self.active.insert(id.clone()) {
                return Ok(id);
            }
        }
        Err(Error::NetworkIdExhausted {
            attempts: MAX_ATTEMPTS,
        })
    }

    /// Mark an id active without generating it (used when restoring state).
    pub fn adopt(&self, id: &str) {
        self.active.insert(id.to_string());
    }

    /// Release an id back for reuse.
    pub fn release(&self, id: &str) {
        self.active.remove(id);
    }

    /// Number of currently active ids.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
