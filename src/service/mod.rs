//! Thin service layer over the lifecycle engine.
//!
//! The RPC façade is a separate process concern; this module carries what
//! the façade would call: spec validation, tenant extraction from baggage,
//! and the engine operations. Errors surface with their stable kinds for
//! the transport layer to map.

mod context;

pub use context::RequestContext;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::vmm::types::{VmMetricsSnapshot, VmRecord, VmSpec, VmState};
use crate::vmm::VmEngine;

/// VM service: validation plus engine dispatch.
pub struct VmService {
    engine: Arc<VmEngine>,
}

impl VmService {
    /// Service over an engine.
    pub fn new(engine: Arc<VmEngine>) -> Self {
        Self { engine }
    }

    /// The underlying engine.
    pub fn engine(&self) -> &Arc<VmEngine> {
        &self.engine
    }

    /// Create a VM for the tenant carried in the request baggage.
    pub async fn create_vm(&self, ctx: &RequestContext, spec: VmSpec) -> Result<String> {
        validate_spec(&spec)?;
        let tenant_id = ctx.tenant_id();
        tracing::info!(tenant_id = %tenant_id, "creating vm");
        let vm_id = self.engine.create_vm(tenant_id, spec).await?;
        tracing::info!(vm_id = %vm_id, tenant_id = %tenant_id, "vm created");
        Ok(vm_id)
    }

    /// Boot a created VM.
    pub async fn boot_vm(&self, vm_id: &str) -> Result<()> {
        require_vm_id(vm_id)?;
        self.engine.boot_vm(vm_id).await
    }

    /// Pause a running VM.
    pub async fn pause_vm(&self, vm_id: &str) -> Result<()> {
        require_vm_id(vm_id)?;
        self.engine.pause_vm(vm_id).await
    }

    /// Resume a paused or shut-down VM.
    pub async fn resume_vm(&self, vm_id: &str) -> Result<()> {
        require_vm_id(vm_id)?;
        self.engine.resume_vm(vm_id).await
    }

    /// Shut down a running VM (graceful or force; both pause the VMM).
    pub async fn shutdown_vm(&self, vm_id: &str, force: bool, timeout_secs: u64) -> Result<()> {
        require_vm_id(vm_id)?;
        self.engine.shutdown_vm(vm_id, force, timeout_secs).await
    }

    /// Reboot a running VM.
    pub async fn reboot_vm(&self, vm_id: &str) -> Result<()> {
        require_vm_id(vm_id)?;
        self.engine.reboot_vm(vm_id).await
    }

    /// Delete a VM.
    pub async fn delete_vm(&self, vm_id: &str) -> Result<()> {
        require_vm_id(vm_id)?;
        self.engine.delete_vm(vm_id).await
    }

    /// Current record of a VM.
    pub async fn vm_info(&self, vm_id: &str) -> Result<VmRecord> {
        require_vm_id(vm_id)?;
        self.engine.vm_record(vm_id).await
    }

    /// Metrics snapshot for a VM.
    pub async fn vm_metrics(&self, vm_id: &str) -> Result<VmMetricsSnapshot> {
        require_vm_id(vm_id)?;
        self.engine.vm_metrics(vm_id).await
    }

    /// All live records for the calling tenant.
    pub async fn list_vms(&self, ctx: &RequestContext) -> Result<Vec<VmRecord>> {
        let tenant_id = ctx.tenant_id();
        let records: Vec<VmRecord> = self
            .engine
            .list_records()
            .await
            .into_iter()
            .filter(|record| record.tenant_id == tenant_id && record.state != VmState::Deleted)
            .collect();
        if records.len() > i32::MAX as usize {
            return Err(Error::TooManyVms {
                count: records.len(),
            });
        }
        Ok(records)
    }
}

fn require_vm_id(vm_id: &str) -> Result<()> {
    if vm_id.is_empty() {
        return Err(Error::InvalidArgument {
            what: "vm_id".to_string(),
            reason: "vm_id is required".to_string(),
        });
    }
    Ok(())
}

/// Validate a VM spec: CPU, memory, and boot configuration are mandatory;
/// storage must name at least one device with a root among them.
pub fn validate_spec(spec: &VmSpec) -> Result<()> {
    if spec.cpu.vcpu_count == 0 {
        return Err(Error::InvalidArgument {
            what: "vm spec".to_string(),
            reason: "vcpu_count must be greater than 0".to_string(),
        });
    }
    if spec.cpu.max_vcpu_count > 0 && spec.cpu.max_vcpu_count < spec.cpu.vcpu_count {
        return Err(Error::InvalidArgument {
            what: "vm spec".to_string(),
            reason: "max_vcpu_count must be greater than or equal to vcpu_count".to_string(),
        });
    }
    if spec.memory.size_bytes == 0 {
        return Err(Error::InvalidArgument {
            what: "vm spec".to_string(),
            reason: "memory size_bytes must be greater than 0".to_string(),
        });
    }
    if spec.boot.kernel_path.is_empty() {
        return Err(Error::InvalidArgument {
            what: "vm spec".to_string(),
            reason: "kernel_path is required".to_string(),
        });
    }
    if spec.storage.is_empty() {
        return Err(Error::InvalidArgument {
            what: "vm spec".to_string(),
            reason: "at least one storage device is required".to_string(),
        });
    }
    let mut has_root = false;
    for (i, disk) in spec.storage.iter().enumerate() {
        if disk.path.is_empty() {
            return Err(Error::InvalidArgument {
                what: "vm spec".to_string(),
                reason: format!("storage device {i} path is required"),
            });
        }
        if disk.is_root_device || i == 0 {
            has_root = true;
        }
    }
    if !has_root {
        return Err(Error::InvalidArgument {
            what: "vm spec".to_string(),
            reason: "at least one storage device must be marked as root device".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::types::{BootSpec, CpuSpec, MemorySpec, StorageSpec};

    fn spec() -> VmSpec {
        VmSpec {
            cpu: CpuSpec {
                vcpu_count: 2,
                max_vcpu_count: 4,
            },
            memory: MemorySpec { size_bytes: 1 << 27 },
            boot: BootSpec {
                kernel_path: "/assets/vmlinux".to_string(),
                initrd_path: String::new(),
                kernel_args: String::new(),
            },
            storage: vec![StorageSpec {
                id: String::new(),
                path: "/assets/rootfs.ext4".to_string(),
                is_root_device: true,
                read_only: false,
                options: Default::default(),
            }],
            metadata: Default::default(),
        }
    }

    #[test]
    fn valid_spec_passes() {
        validate_spec(&spec()).unwrap();
    }

    #[test]
    fn zero_vcpus_rejected() {
        let mut bad = spec();
        bad.cpu.vcpu_count = 0;
        assert_eq!(
            validate_spec(&bad).unwrap_err().kind(),
            crate::error::ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn max_vcpus_below_count_rejected() {
        let mut bad = spec();
        bad.cpu.max_vcpu_count = 1;
        assert!(validate_spec(&bad).is_err());
    }

    #[test]
    fn zero_memory_rejected() {
        let mut bad = spec();
        bad.memory.size_bytes = 0;
        assert!(validate_spec(&bad).is_err());
    }

    #[test]
    fn missing_kernel_rejected() {
        let mut bad = spec();
        bad.boot.kernel_path.clear();
        assert!(validate_spec(&bad).is_err());
    }

    #[test]
    fn empty_storage_rejected() {
        let mut bad = spec();
        bad.storage.clear();
        assert!(validate_spec(&bad).is_err());
    }

    #[test]
    fn storage_without_path_rejected() {
        let mut bad = spec();
        bad.storage[0].path.clear();
        assert!(validate_spec(&bad).is_err());
    }
}
