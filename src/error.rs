//! Error types for the provisioner core.
//!
//! One enum covers every failure site; callers that need a coarse,
//! transport-stable classification use [`Error::kind`]. Variants carry the
//! context needed to act on the failure (VM id, device name, path), not the
//! call stack.

use std::path::PathBuf;

use snafu::Snafu;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse error classification surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Validation of specs, names, IPs, ports, protocols, VM ids.
    InvalidArgument,
    /// VM id absent from registry or repository.
    NotFound,
    /// Illegal state transition.
    StateConflict,
    /// Tenant /29 full, port range full, too many rows to enumerate.
    ResourceExhausted,
    /// Asset service unreachable, VMM start failure, link operation failure.
    Dependency,
    /// Persisted state checksum mismatch or schema violation.
    Integrity,
    /// VMM RPC, build wait, or metrics read exceeded its budget.
    Timeout,
}

/// Errors from provisioner operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[allow(missing_docs)] // Snafu errors are documented via display attributes
pub enum Error {
    /// Invalid caller-supplied value.
    #[snafu(display("invalid {what}: {reason}"))]
    InvalidArgument { what: String, reason: String },

    /// VM is not known to the engine or the repository.
    #[snafu(display("vm {vm_id} not found"))]
    VmNotFound { vm_id: String },

    /// Operation not legal in the VM's current state.
    #[snafu(display("vm {vm_id} is in {state} state, cannot {operation}"))]
    InvalidState {
        vm_id: String,
        state: String,
        operation: String,
    },

    /// The tenant's /29 slot has no free VM address.
    #[snafu(display("tenant {tenant_id} /29 subnet is full ({capacity}/{capacity} VMs)"))]
    TenantSubnetFull { tenant_id: String, capacity: u32 },

    /// The configured host port range has no free port.
    #[snafu(display("host port range {start}-{end} exhausted"))]
    PortRangeExhausted { start: u16, end: u16 },

    /// Internal network id space could not produce a fresh id.
    #[snafu(display("failed to generate a unique network id after {attempts} attempts"))]
    NetworkIdExhausted { attempts: usize },

    /// Persisted fabric state failed its checksum.
    #[snafu(display("fabric state checksum mismatch: stored={stored}, calculated={calculated}"))]
    ChecksumMismatch { stored: String, calculated: String },

    /// Persisted fabric state failed semantic validation.
    #[snafu(display("corrupted fabric state: {reason}"))]
    CorruptState { reason: String },

    /// Reading or writing the fabric state file failed.
    #[snafu(display("fabric state io on {}: {source}", path.display()))]
    FabricStateIo {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A link/addr/route/tc operation failed.
    #[snafu(display("link operation `{operation}` on {device} failed: {output}"))]
    LinkOp {
        operation: String,
        device: String,
        output: String,
    },

    /// Namespace create/enter/delete failed.
    #[snafu(display("namespace {name}: {reason}"))]
    Namespace { name: String, reason: String },

    /// Firewall rule install/remove failed.
    #[snafu(display("firewall `{rule}` failed: {output}"))]
    Firewall { rule: String, output: String },

    /// Required asset could not be matched.
    #[snafu(display("no matching asset for kind {kind} with labels {{{labels}}}"))]
    AssetUnmatched { kind: String, labels: String },

    /// Asset service call failed.
    #[snafu(display("asset service {call} failed: {reason}"))]
    AssetService { call: String, reason: String },

    /// Filesystem work during asset preparation failed.
    #[snafu(display("asset preparation: {what} at {}: {source}", path.display()))]
    AssetIo {
        what: String,
        path: PathBuf,
        source: std::io::Error,
    },

    /// Mounting the root filesystem to inject the container command failed.
    #[snafu(display("rootfs mount for {vm_id} failed: {output}"))]
    RootfsMount { vm_id: String, output: String },

    /// VMM process could not be spawned.
    #[snafu(display("failed to spawn VMM for {vm_id}: {source}"))]
    VmmSpawn {
        vm_id: String,
        source: std::io::Error,
    },

    /// VMM control socket never appeared or the process died while booting.
    #[snafu(display("VMM socket for {vm_id} not ready at {} after {timeout_ms}ms", path.display()))]
    VmmSocketTimeout {
        vm_id: String,
        path: PathBuf,
        timeout_ms: u64,
    },

    /// VMM control socket connection failed.
    #[snafu(display("failed to connect VMM socket at {}: {source}", path.display()))]
    VmmConnect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// VMM API returned a non-success status.
    #[snafu(display("VMM API {method} {uri} returned {status}: {body}"))]
    VmmApi {
        method: String,
        uri: String,
        status: u16,
        body: String,
    },

    /// VMM API transport failure.
    #[snafu(display("VMM API request failed: {source}"))]
    VmmHttp { source: hyper::Error },

    /// VMM handle is missing for an operation that needs one.
    #[snafu(display("vm {vm_id} has no live VMM handle"))]
    VmmUnavailable { vm_id: String },

    /// VMM RPC exceeded its deadline.
    #[snafu(display("VMM {operation} for {vm_id} timed out after {timeout_ms}ms"))]
    VmmTimeout {
        vm_id: String,
        operation: String,
        timeout_ms: u64,
    },

    /// Repository row already exists (unique constraint).
    #[snafu(display("vm {vm_id} already exists in repository"))]
    DuplicateVm { vm_id: String },

    /// Repository call failed.
    #[snafu(display("repository {call} failed: {reason}"))]
    Repository { call: String, reason: String },

    /// Too many rows to enumerate in one response.
    #[snafu(display("too many VMs to list: {count}"))]
    TooManyVms { count: usize },

    /// Generic filesystem failure with location context.
    #[snafu(display("{what} at {}: {source}", path.display()))]
    Io {
        what: String,
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Error {
    /// Map the variant onto its transport-stable kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Error::VmNotFound { .. } => ErrorKind::NotFound,
            Error::InvalidState { .. } => ErrorKind::StateConflict,
            Error::TenantSubnetFull { .. }
            | Error::PortRangeExhausted { .. }
            | Error::NetworkIdExhausted { .. }
            | Error::TooManyVms { .. } => ErrorKind::ResourceExhausted,
            Error::ChecksumMismatch { .. } | Error::CorruptState { .. } => ErrorKind::Integrity,
            Error::VmmSocketTimeout { .. } | Error::VmmTimeout { .. } => ErrorKind::Timeout,
            Error::DuplicateVm { .. } => ErrorKind::InvalidArgument,
            _ => ErrorKind::Dependency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        let err = Error::TenantSubnetFull {
            tenant_id: "ws_A".to_string(),
            capacity: 5,
        };
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

        let err = Error::InvalidState {
            vm_id: "ud-0011223344556677".to_string(),
            state: "RUNNING".to_string(),
            operation: "boot".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::StateConflict);

        let err = Error::ChecksumMismatch {
            stored: "aa".to_string(),
            calculated: "bb".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn display_carries_context() {
        let err = Error::VmNotFound {
            vm_id: "ud-deadbeefdeadbeef".to_string(),
        };
        assert!(err.to_string().contains("ud-deadbeefdeadbeef"));
    }
}
