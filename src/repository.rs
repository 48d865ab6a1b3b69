//! VM repository: the narrow persistence interface the engine projects
//! records through.
//!
//! Implementations must be transactional per call. The engine tolerates a
//! best-effort failure mode where the physical action succeeded but the
//! repository write did not; such drift is logged, never reverted.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::vmm::types::{VmSpec, VmState};

/// One persisted VM row.
#[derive(Debug, Clone)]
pub struct VmRow {
    /// VM id, unique.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Immutable spec.
    pub spec: VmSpec,
    /// Current lifecycle state.
    pub state: VmState,
    /// Port mappings as a JSON blob, in the stable wire shape.
    pub port_mappings_json: String,
    /// Extra fields attached by state updates (lease ids and the like).
    pub extra: BTreeMap<String, String>,
    /// Creation timestamp (unix seconds).
    pub created_at: i64,
    /// Last update timestamp (unix seconds).
    pub updated_at: i64,
}

/// Narrow persistence interface for VM records.
#[async_trait]
pub trait VmRepository: Send + Sync {
    /// Insert a new row. Fails on duplicate id (the unique constraint that
    /// catches generator collisions).
    async fn create_vm(&self, row: VmRow) -> Result<()>;

    /// Fetch one row, tombstoned rows included.
    async fn get_vm(&self, vm_id: &str) -> Result<VmRow>;

    /// Update the state and merge optional extra fields.
    async fn update_vm_state(
        &self,
        vm_id: &str,
        state: VmState,
        extra: Option<BTreeMap<String, String>>,
    ) -> Result<()>;

    /// Soft-delete: the row is tombstoned, never re-materialized.
    async fn delete_vm(&self, vm_id: &str) -> Result<()>;

    /// All non-deleted rows of one tenant.
    async fn list_vms_by_tenant(&self, tenant_id: &str) -> Result<Vec<VmRow>>;

    /// All non-deleted rows.
    async fn list_all_vms(&self) -> Result<Vec<VmRow>>;

    /// Replace the port-mapping JSON blob.
    async fn update_vm_port_mappings(&self, vm_id: &str, port_mappings_json: &str) -> Result<()>;
}

/// In-memory repository used by tests and single-process deployments.
pub struct MemoryVmRepository {
    rows: DashMap<String, VmRow>,
}

impl MemoryVmRepository {
    /// Empty repository.
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }
}

impl Default for MemoryVmRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VmRepository for MemoryVmRepository {
    async fn create_vm(&self, row: VmRow) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.rows.entry(row.id.clone()) {
            Entry::Occupied(_) => Err(Error::DuplicateVm { vm_id: row.id }),
            Entry::Vacant(slot) => {
                slot.insert(row);
                Ok(())
            }
        }
    }

    async fn get_vm(&self, vm_id: &str) -> Result<VmRow> {
        self.rows
            .get(vm_id)
            .map(|row| row.clone())
            .ok_or_else(|| Error::VmNotFound {
                vm_id: vm_id.to_string(),
            })
    }

    async fn update_vm_state(
        &self,
        vm_id: &str,
        state: VmState,
        extra: Option<BTreeMap<String, String>>,
    ) -> Result<()> {
        let mut row = self.rows.get_mut(vm_id).ok_or_else(|| Error::VmNotFound {
            vm_id: vm_id.to_string(),
        })?;
        row.state = state;
        row.updated_at = Utc::now().timestamp();
        if let Some(extra) = extra {
            row.extra.extend(extra);
        }
        Ok(())
    }

    async fn delete_vm(&self, vm_id: &str) -> Result<()> {
        let mut row = self.rows.get_mut(vm_id).ok_or_else(|| Error::VmNotFound {
            vm_id: vm_id.to_string(),
        })?;
        row.state = VmState::Deleted;
        row.updated_at = Utc::now().timestamp();
        Ok(())
    }

    async fn list_vms_by_tenant(&self, tenant_id: &str) -> Result<Vec<VmRow>> {
        Ok(self
            .rows
            .iter()
            .filter(|row| row.tenant_id == tenant_id && row.state != VmState::Deleted)
            .map(|row| row.clone())
            .collect())
    }

    async fn list_all_vms(&self) -> Result<Vec<VmRow>> {
        Ok(self
            .rows
            .iter()
            .filter(|row| row.state != VmState::Deleted)
            .map(|row| row.clone())
            .collect())
    }

    async fn update_vm_port_mappings(&self, vm_id: &str, port_mappings_json: &str) -> Result<()> {
        let mut row = self.rows.get_mut(vm_id).ok_or_else(|| Error::VmNotFound {
            vm_id: vm_id.to_string(),
        })?;
        row.port_mappings_json = port_mappings_json.to_string();
        row.updated_at = Utc::now().timestamp();
        Ok(())
    }
}

/// Build a fresh row for a new VM.
pub fn new_row(vm_id: &str, tenant_id: &str, spec: VmSpec) -> VmRow {
    let now = Utc::now().timestamp();
    VmRow {
        id: vm_id.to_string(),
        tenant_id: tenant_id.to_string(),
        spec,
        state: VmState::Created,
        port_mappings_json: String::new(),
        extra: BTreeMap::new(),
        created_at: now,
        updated_at: now,
    }
}
