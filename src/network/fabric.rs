//! Multi-tenant network fabric: deterministic tenant-to-bridge mapping,
//! per-tenant /29 VM slots, project VLAN bookkeeping, OUI-encoded MAC
//! synthesis, and checksummed state persistence with self-repair.
//!
//! Layout invariants:
//! - tenant -> bridge via FNV-1a 32 modulo the bridge count; bridge N owns
//!   `172.16.N.0/24` and is named `<prefix>-<N>`
//! - project -> VLAN via FNV-1a 32 over the project id; each VLAN owns a
//!   /27 slice of the bridge /24 at offset `(vlan % 8) * 32`
//! - each tenant owns one /29 slice at `(fnv1a32(tenant) % 32) * 8`;
//!   within it .0 is the network, .1 the gateway, .2-.6 the five VM
//!   addresses, .7 the broadcast

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::{
    fnv1a32, MAC_LOCAL_ADMIN, MAC_TENANT_MARKER, SLOTS_PER_BRIDGE, SLOT_CAPACITY,
    SLOT_FIRST_VM_OFFSET, SLOT_LAST_VM_OFFSET, VLAN_MAX_VM_INDEX, VLAN_RANGE_END,
    VLAN_RANGE_START,
};
use crate::error::{Error, Result};

/// A project's VLAN inside a tenant bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectVlan {
    /// Project identifier, e.g. a repository URL.
    pub project_id: String,
    /// VLAN id in `[100, 4000]`.
    pub vlan_id: u16,
    /// The /27 slice this VLAN owns inside the bridge /24.
    pub subnet_cidr: String,
    /// Next VM index for allocation inside the /27 (max 30).
    pub next_vm_index: u32,
    /// RFC3339 creation timestamp.
    pub created_at: String,
}

/// A tenant's allocation: bridge assignment, VLANs, VM count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantAllocation {
    /// Tenant (workspace) identifier.
    pub tenant_id: String,
    /// Bridge index in `[0, bridge_count)`.
    pub bridge_index: u32,
    /// Bridge name, always `<prefix>-<index>`.
    pub bridge_name: String,
    /// Project VLANs inside this tenant's bridge.
    #[serde(default)]
    pub project_vlans: BTreeMap<String, ProjectVlan>,
    /// RFC3339 creation timestamp.
    pub created_at: String,
    /// Live VM count inside the tenant /29 slot (0..=5).
    pub vm_count: u32,
}

/// The persisted fabric document. Maps are ordered so serialization is
/// deterministic, which the checksum depends on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FabricState {
    /// Tenant id -> allocation.
    pub tenants: BTreeMap<String, TenantAllocation>,
    /// Bridge index -> tenants on that bridge. A strict consequence of
    /// `tenants`; validated on load.
    pub bridge_usage: BTreeMap<u32, BTreeSet<String>>,
    /// When the document was last written.
    pub last_saved: DateTime<Utc>,
    /// SHA-256 hex over the document serialized with this field empty.
    pub checksum: String,
}

impl FabricState {
    /// Compute and store the checksum over the current contents. Tools that
    /// hand-author state files use this to produce a loadable document.
    pub fn seal(&mut self) -> Result<()> {
        self.checksum = self.compute_checksum()?;
        Ok(())
    }

    fn compute_checksum(&self) -> Result<String> {
        let mut unsealed = self.clone();
        unsealed.checksum = String::new();
        let data = serde_json::to_vec(&unsealed).map_err(|e| Error::CorruptState {
            reason: format!("failed to serialize state for checksum: {e}"),
        })?;
        let digest = Sha256::digest(&data);
        Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
    }
}

struct FabricInner {
    tenants: BTreeMap<String, TenantAllocation>,
    bridge_usage: BTreeMap<u32, BTreeSet<String>>,
}

/// Tenant fabric manager. All allocation decisions are deterministic
/// functions of the tenant and project ids; this type only records their
/// outcomes and keeps the record durable.
pub struct FabricManager {
    bridge_count: u32,
    bridge_prefix: String,
    state_path: PathBuf,
    inner: RwLock<FabricInner>,
}

impl FabricManager {
    /// Create a manager, loading and repairing any persisted state at
    /// `state_path`. A missing file is a fresh start; an unreadable or
    /// corrupt file is logged and replaced by empty state.
    pub fn new(bridge_count: u32, bridge_prefix: &str, state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let manager = Self {
            bridge_count,
            bridge_prefix: bridge_prefix.to_string(),
            state_path,
            inner: RwLock::new(FabricInner {
                tenants: BTreeMap::new(),
                bridge_usage: BTreeMap::new(),
            }),
        };

        match manager.load_state() {
            Ok(loaded) => {
                if loaded {
                    tracing::info!(
                        state_path = %manager.state_path.display(),
                        tenant_count = manager.inner.read().unwrap().tenants.len(),
                        "fabric state loaded"
                    );
                    if manager.validate_and_repair() {
                        tracing::info!("fabric state validation completed with repairs applied");
                    } else {
                        tracing::debug!("fabric state validation completed, no repairs needed");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    state_path = %manager.state_path.display(),
                    "failed to load fabric state, starting with empty state"
                );
            }
        }

        manager
    }

    /// Deterministic tenant -> bridge index mapping.
    pub fn bridge_for_tenant(&self, tenant_id: &str) -> u32 {
        fnv1a32(tenant_id) % self.bridge_count
    }

    /// Bridge name for an index.
    pub fn bridge_name(&self, bridge_index: u32) -> String {
        format!("{}-{}", self.bridge_prefix, bridge_index)
    }

    /// Deterministic project -> VLAN id mapping within `[100, 4000]`.
    pub fn vlan_for_project(&self, project_id: &str) -> u16 {
        let range = u32::from(VLAN_RANGE_END - VLAN_RANGE_START) + 1;
        VLAN_RANGE_START + (fnv1a32(project_id) % range) as u16
    }

    /// The /27 slice a VLAN owns inside its bridge /24.
    pub fn vlan_subnet(&self, bridge_index: u32, vlan_id: u16) -> String {
        let offset = (u32::from(vlan_id) % 8) * 32;
        format!("172.16.{bridge_index}.{offset}/27")
    }

    /// The /29 slot index a tenant owns inside its bridge /24.
    pub fn slot_index_for_tenant(&self, tenant_id: &str) -> u32 {
        fnv1a32(tenant_id) % SLOTS_PER_BRIDGE
    }

    /// Get or create the VLAN allocation for a project inside a tenant.
    /// New allocations are persisted best-effort.
    pub fn get_or_create_project_vlan(
        &self,
        tenant_id: &str,
        project_id: &str,
    ) -> Result<ProjectVlan> {
        let mut inner = self.inner.write().unwrap();
        self.ensure_tenant_locked(&mut inner, tenant_id);

        let bridge_index = inner.tenants[tenant_id].bridge_index;
        if let Some(vlan) = inner.tenants[tenant_id].project_vlans.get(project_id) {
            return Ok(vlan.clone());
        }

        let vlan_id = self.vlan_for_project(project_id);
        let vlan = ProjectVlan {
            project_id: project_id.to_string(),
            vlan_id,
            subnet_cidr: self.vlan_subnet(bridge_index, vlan_id),
            next_vm_index: 0,
            created_at: Utc::now().to_rfc3339(),
        };
        inner
            .tenants
            .get_mut(tenant_id)
            .expect("tenant ensured above")
            .project_vlans
            .insert(project_id.to_string(), vlan.clone());

        tracing::info!(
            tenant_id = %tenant_id,
            project_id = %project_id,
            vlan_id,
            subnet_cidr = %vlan.subnet_cidr,
            "created project VLAN"
        );

        if let Err(e) = self.save_state_locked(&inner) {
            tracing::warn!(error = %e, "failed to save state after creating project VLAN");
        }

        Ok(vlan)
    }

    /// Allocate the next VM address in the tenant's /29 slot. Returns the
    /// address and the tenant's bridge name. The allocation is persisted
    /// before returning; a persistence failure rolls the count back.
    pub fn allocate_ip(&self, tenant_id: &str) -> Result<(Ipv4Addr, String)> {
        if tenant_id.is_empty() {
            return Err(Error::InvalidArgument {
                what: "tenant id".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        let mut inner = self.inner.write().unwrap();
        self.ensure_tenant_locked(&mut inner, tenant_id);

        let (bridge_index, bridge_name, vm_count) = {
            let alloc = &inner.tenants[tenant_id];
            self.validate_allocation(alloc)?;
            (alloc.bridge_index, alloc.bridge_name.clone(), alloc.vm_count)
        };

        if vm_count >= SLOT_CAPACITY {
            return Err(Error::TenantSubnetFull {
                tenant_id: tenant_id.to_string(),
                capacity: SLOT_CAPACITY,
            });
        }

        let slot_base = self.slot_index_for_tenant(tenant_id) * 8;
        let vm_offset = slot_base + u32::from(SLOT_FIRST_VM_OFFSET) + vm_count;
        self.validate_vm_offset(slot_base, vm_offset, vm_count)?;

        let ip = Ipv4Addr::new(172, 16, bridge_index as u8, vm_offset as u8);
        self.validate_ip_in_slot(ip, bridge_index, slot_base)?;

        inner
            .tenants
            .get_mut(tenant_id)
            .expect("tenant ensured above")
            .vm_count += 1;

        tracing::info!(
            tenant_id = %tenant_id,
            ip = %ip,
            bridge = %bridge_name,
            vm_count = vm_count + 1,
            "IP allocated for tenant"
        );

        if let Err(e) = self.save_state_locked(&inner) {
            // Roll the allocation back before surfacing the error.
            inner
                .tenants
                .get_mut(tenant_id)
                .expect("tenant ensured above")
                .vm_count -= 1;
            tracing::error!(
                tenant_id = %tenant_id,
                ip = %ip,
                error = %e,
                "IP allocation failed due to state persistence error"
            );
            return Err(e);
        }

        Ok((ip, bridge_name))
    }

    /// Release a VM address back to the tenant's slot. The count never goes
    /// below zero; a persistence failure rolls the decrement back.
    pub fn release_ip(&self, tenant_id: &str, ip: Ipv4Addr) -> Result<()> {
        let mut inner = self.inner.write().unwrap();

        let Some(alloc) = inner.tenants.get_mut(tenant_id) else {
            return Err(Error::VmNotFound {
                vm_id: format!("tenant {tenant_id}"),
            });
        };

        let old_count = alloc.vm_count;
        if alloc.vm_count > 0 {
            alloc.vm_count -= 1;
        }
        let new_count = alloc.vm_count;

        tracing::info!(
            tenant_id = %tenant_id,
            ip = %ip,
            old_vm_count = old_count,
            new_vm_count = new_count,
            "IP released for tenant"
        );

        if let Err(e) = self.save_state_locked(&inner) {
            inner
                .tenants
                .get_mut(tenant_id)
                .expect("checked above")
                .vm_count = old_count;
            tracing::error!(
                tenant_id = %tenant_id,
                ip = %ip,
                error = %e,
                "IP release failed due to state persistence error"
            );
            return Err(e);
        }

        Ok(())
    }

    /// Generate a random tenant MAC: `02:<bridge_hex>:4B:<random 3 bytes>`.
    pub fn generate_tenant_mac(&self, tenant_id: &str) -> String {
        let bridge_index = self.bridge_for_tenant(tenant_id);
        let mut tail = [0u8; 3];
        OsRng.fill_bytes(&mut tail);
        format!(
            "{MAC_LOCAL_ADMIN:02X}:{bridge_index:02X}:{MAC_TENANT_MARKER:02X}:{:02X}:{:02X}:{:02X}",
            tail[0], tail[1], tail[2]
        )
    }

    /// Generate a sequential tenant MAC with the VM index encoded big-endian
    /// in the last three bytes.
    pub fn generate_sequential_tenant_mac(&self, tenant_id: &str, vm_index: u32) -> String {
        let bridge_index = self.bridge_for_tenant(tenant_id);
        format!(
            "{MAC_LOCAL_ADMIN:02X}:{bridge_index:02X}:{MAC_TENANT_MARKER:02X}:{:02X}:{:02X}:{:02X}",
            (vm_index >> 16) & 0xFF,
            (vm_index >> 8) & 0xFF,
            vm_index & 0xFF
        )
    }

    /// Check that a MAC belongs to the tenant's hashed bridge.
    pub fn validate_tenant_mac(&self, tenant_id: &str, mac: &str) -> Result<()> {
        let expected = self.bridge_for_tenant(tenant_id);
        let actual = parse_tenant_mac(mac)?;
        if actual != expected {
            return Err(Error::InvalidArgument {
                what: "tenant MAC".to_string(),
                reason: format!("MAC bridge {actual} does not match tenant bridge {expected}"),
            });
        }
        Ok(())
    }

    /// A copy of one tenant's allocation.
    pub fn tenant_info(&self, tenant_id: &str) -> Option<TenantAllocation> {
        self.inner.read().unwrap().tenants.get(tenant_id).cloned()
    }

    /// Tenants per bridge, zero-filled for unused bridges.
    pub fn bridge_usage_stats(&self) -> BTreeMap<u32, usize> {
        let inner = self.inner.read().unwrap();
        let mut stats: BTreeMap<u32, usize> = (0..self.bridge_count).map(|i| (i, 0)).collect();
        for (bridge, tenants) in &inner.bridge_usage {
            stats.insert(*bridge, tenants.len());
        }
        stats
    }

    /// All tenant allocations.
    pub fn list_tenants(&self) -> Vec<TenantAllocation> {
        self.inner.read().unwrap().tenants.values().cloned().collect()
    }

    /// Path of the persisted state file.
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Validate the in-memory state and repair inconsistencies: tenants on
    /// invalid bridges are deleted, VM counts beyond capacity reset to zero,
    /// wrong bridge names rewritten, orphaned bridge-usage entries pruned.
    /// Repairs are persisted best-effort; returns whether anything changed.
    pub fn validate_and_repair(&self) -> bool {
        let mut inner = self.inner.write().unwrap();
        let mut repaired = false;
        let mut repaired_tenants: Vec<String> = Vec::new();

        let tenant_ids: Vec<String> = inner.tenants.keys().cloned().collect();
        for tenant_id in tenant_ids {
            let (bridge_index, vm_count, bridge_name) = {
                let alloc = &inner.tenants[&tenant_id];
                (alloc.bridge_index, alloc.vm_count, alloc.bridge_name.clone())
            };

            if bridge_index >= self.bridge_count {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    invalid_bridge = bridge_index,
                    max_bridge = self.bridge_count - 1,
                    "invalid bridge index in state, deleting tenant"
                );
                inner.tenants.remove(&tenant_id);
                repaired = true;
                repaired_tenants.push(format!("{tenant_id} (deleted)"));
                continue;
            }

            if vm_count > SLOT_CAPACITY {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    invalid_vm_count = vm_count,
                    max_vm_count = SLOT_CAPACITY,
                    "tenant VM count exceeds /29 capacity, resetting to 0"
                );
                inner.tenants.get_mut(&tenant_id).unwrap().vm_count = 0;
                repaired = true;
                repaired_tenants.push(format!("{tenant_id} (vm_count: {vm_count}->0)"));
            }

            let expected_name = self.bridge_name(bridge_index);
            if bridge_name != expected_name {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    invalid_name = %bridge_name,
                    expected_name = %expected_name,
                    "invalid bridge name in state, correcting"
                );
                inner.tenants.get_mut(&tenant_id).unwrap().bridge_name = expected_name;
                repaired = true;
            }

            inner
                .bridge_usage
                .entry(bridge_index)
                .or_default()
                .insert(tenant_id.clone());
        }

        // Prune orphaned bridge-usage entries and empty buckets.
        let tenants_snapshot: BTreeSet<String> = inner.tenants.keys().cloned().collect();
        let bridges: Vec<u32> = inner.bridge_usage.keys().copied().collect();
        for bridge in bridges {
            let bucket = inner.bridge_usage.get_mut(&bridge).unwrap();
            let before = bucket.len();
            bucket.retain(|tenant| tenants_snapshot.contains(tenant));
            if bucket.len() != before {
                repaired = true;
                tracing::warn!(bridge_index = bridge, "removed orphaned bridge usage entries");
            }
            if bucket.is_empty() {
                inner.bridge_usage.remove(&bridge);
            }
        }

        if repaired {
            tracing::info!(
                repaired_tenant_count = repaired_tenants.len(),
                repaired_tenants = ?repaired_tenants,
                "state validation found issues, applying repairs"
            );
            if let Err(e) = self.save_state_locked(&inner) {
                // Repairs stay in memory; the service continues.
                tracing::error!(error = %e, "failed to persist state repairs");
            } else {
                tracing::info!("state repairs persisted successfully");
            }
        }

        repaired
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn ensure_tenant_locked(&self, inner: &mut FabricInner, tenant_id: &str) {
        if inner.tenants.contains_key(tenant_id) {
            return;
        }
        let bridge_index = self.bridge_for_tenant(tenant_id);
        let bridge_name = self.bridge_name(bridge_index);
        inner.tenants.insert(
            tenant_id.to_string(),
            TenantAllocation {
                tenant_id: tenant_id.to_string(),
                bridge_index,
                bridge_name: bridge_name.clone(),
                project_vlans: BTreeMap::new(),
                created_at: Utc::now().to_rfc3339(),
                vm_count: 0,
            },
        );
        inner
            .bridge_usage
            .entry(bridge_index)
            .or_default()
            .insert(tenant_id.to_string());
        tracing::info!(
            tenant_id = %tenant_id,
            bridge_index,
            bridge_name = %bridge_name,
            "created new tenant allocation"
        );
    }

    fn validate_allocation(&self, alloc: &TenantAllocation) -> Result<()> {
        if alloc.bridge_index >= self.bridge_count {
            return Err(Error::CorruptState {
                reason: format!(
                    "bridge index {} out of range [0, {})",
                    alloc.bridge_index, self.bridge_count
                ),
            });
        }
        let expected_name = self.bridge_name(alloc.bridge_index);
        if alloc.bridge_name != expected_name {
            return Err(Error::CorruptState {
                reason: format!(
                    "bridge name mismatch: got {}, expected {expected_name}",
                    alloc.bridge_name
                ),
            });
        }
        Ok(())
    }

    fn validate_vm_offset(&self, slot_base: u32, vm_offset: u32, vm_count: u32) -> Result<()> {
        if slot_base % 8 != 0 || slot_base > 248 {
            return Err(Error::CorruptState {
                reason: format!("slot base {slot_base} is not a valid /29 boundary"),
            });
        }
        let min = slot_base + u32::from(SLOT_FIRST_VM_OFFSET);
        let max = slot_base + u32::from(SLOT_LAST_VM_OFFSET);
        if vm_offset < min || vm_offset > max {
            return Err(Error::CorruptState {
                reason: format!("VM offset {vm_offset} outside /29 range ({min}-{max})"),
            });
        }
        if vm_offset != slot_base + u32::from(SLOT_FIRST_VM_OFFSET) + vm_count {
            return Err(Error::CorruptState {
                reason: format!(
                    "VM offset {vm_offset} does not match slot base {slot_base} + 2 + count {vm_count}"
                ),
            });
        }
        Ok(())
    }

    fn validate_ip_in_slot(&self, ip: Ipv4Addr, bridge_index: u32, slot_base: u32) -> Result<()> {
        let o = ip.octets();
        if o[0] != 172 || o[1] != 16 || u32::from(o[2]) != bridge_index {
            return Err(Error::CorruptState {
                reason: format!("IP {ip} is outside bridge subnet 172.16.{bridge_index}.0/24"),
            });
        }
        let offset = u32::from(o[3]);
        if offset < slot_base + u32::from(SLOT_FIRST_VM_OFFSET)
            || offset > slot_base + u32::from(SLOT_LAST_VM_OFFSET)
        {
            return Err(Error::CorruptState {
                reason: format!(
                    "IP {ip} is not in the usable range of slot 172.16.{bridge_index}.{slot_base}/29"
                ),
            });
        }
        Ok(())
    }

    fn save_state_locked(&self, inner: &FabricInner) -> Result<()> {
        if let Some(dir) = self.state_path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| Error::FabricStateIo {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let mut state = FabricState {
            tenants: inner.tenants.clone(),
            bridge_usage: inner.bridge_usage.clone(),
            last_saved: Utc::now(),
            checksum: String::new(),
        };
        state.checksum = state.compute_checksum()?;

        let data = serde_json::to_vec_pretty(&state).map_err(|e| Error::CorruptState {
            reason: format!("failed to serialize fabric state: {e}"),
        })?;

        // Temp file plus atomic rename so readers never see a torn write.
        let tmp_path = self.state_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &data).map_err(|source| Error::FabricStateIo {
            path: tmp_path.clone(),
            source,
        })?;
        std::fs::rename(&tmp_path, &self.state_path).map_err(|source| Error::FabricStateIo {
            path: self.state_path.clone(),
            source,
        })?;

        tracing::debug!(
            state_path = %self.state_path.display(),
            data_size_bytes = data.len(),
            "fabric state saved"
        );
        Ok(())
    }

    /// Returns Ok(false) when no state file exists.
    fn load_state(&self) -> Result<bool> {
        if !self.state_path.exists() {
            return Ok(false);
        }

        let data = std::fs::read(&self.state_path).map_err(|source| Error::FabricStateIo {
            path: self.state_path.clone(),
            source,
        })?;
        let state: FabricState =
            serde_json::from_slice(&data).map_err(|e| Error::CorruptState {
                reason: format!("failed to parse fabric state: {e}"),
            })?;

        if state.checksum.is_empty() {
            tracing::warn!(
                state_path = %self.state_path.display(),
                "state file has no checksum, skipping integrity verification"
            );
        } else {
            let calculated = state.compute_checksum()?;
            if state.checksum != calculated {
                return Err(Error::ChecksumMismatch {
                    stored: state.checksum,
                    calculated,
                });
            }
        }

        self.validate_state(&state)?;

        let mut inner = self.inner.write().unwrap();
        inner.tenants = state.tenants;
        inner.bridge_usage = state.bridge_usage;
        Ok(true)
    }

    fn validate_state(&self, state: &FabricState) -> Result<()> {
        for (tenant_id, alloc) in &state.tenants {
            if &alloc.tenant_id != tenant_id {
                return Err(Error::CorruptState {
                    reason: format!(
                        "tenant id mismatch: map key {tenant_id} != field {}",
                        alloc.tenant_id
                    ),
                });
            }
            for (project_id, vlan) in &alloc.project_vlans {
                if &vlan.project_id != project_id {
                    return Err(Error::CorruptState {
                        reason: format!(
                            "project id mismatch under tenant {tenant_id}: {project_id} != {}",
                            vlan.project_id
                        ),
                    });
                }
                if vlan.vlan_id < VLAN_RANGE_START || vlan.vlan_id > VLAN_RANGE_END {
                    return Err(Error::CorruptState {
                        reason: format!(
                            "VLAN {} out of range [{VLAN_RANGE_START}, {VLAN_RANGE_END}]",
                            vlan.vlan_id
                        ),
                    });
                }
                if parse_cidr(&vlan.subnet_cidr).is_none() {
                    return Err(Error::CorruptState {
                        reason: format!("invalid VLAN subnet CIDR {}", vlan.subnet_cidr),
                    });
                }
                if vlan.next_vm_index > VLAN_MAX_VM_INDEX {
                    return Err(Error::CorruptState {
                        reason: format!(
                            "next VM index {} exceeds /27 capacity",
                            vlan.next_vm_index
                        ),
                    });
                }
            }
        }

        // Bridge usage must be a strict consequence of the tenant map.
        let mut expected: BTreeMap<u32, BTreeSet<String>> = BTreeMap::new();
        for (tenant_id, alloc) in &state.tenants {
            expected
                .entry(alloc.bridge_index)
                .or_default()
                .insert(tenant_id.clone());
        }
        for (bridge, tenants) in &state.bridge_usage {
            let expected_tenants = expected.get(bridge).cloned().unwrap_or_default();
            if tenants != &expected_tenants {
                return Err(Error::CorruptState {
                    reason: format!("bridge {bridge} usage does not match tenant allocations"),
                });
            }
        }
        for (bridge, expected_tenants) in &expected {
            if state.bridge_usage.get(bridge) != Some(expected_tenants) {
                return Err(Error::CorruptState {
                    reason: format!("bridge {bridge} missing from usage map"),
                });
            }
        }

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn insert_allocation_for_test(&self, alloc: TenantAllocation) {
        let mut inner = self.inner.write().unwrap();
        inner.tenants.insert(alloc.tenant_id.clone(), alloc);
    }

    #[cfg(test)]
    pub(crate) fn insert_bridge_usage_for_test(&self, bridge: u32, tenant: &str) {
        let mut inner = self.inner.write().unwrap();
        inner
            .bridge_usage
            .entry(bridge)
            .or_default()
            .insert(tenant.to_string());
    }
}

/// Extract the bridge index from a tenant MAC `02:XX:4B:YY:YY:YY`.
pub fn parse_tenant_mac(mac: &str) -> Result<u32> {
    if mac.len() != 17 {
        return Err(Error::InvalidArgument {
            what: "tenant MAC".to_string(),
            reason: format!("invalid length: {mac}"),
        });
    }
    if !mac[..2].eq_ignore_ascii_case("02") || !mac[6..8].eq_ignore_ascii_case("4B") {
        return Err(Error::InvalidArgument {
            what: "tenant MAC".to_string(),
            reason: format!("not tenant-encoded format: {mac}"),
        });
    }
    u32::from_str_radix(&mac[3..5], 16).map_err(|_| Error::InvalidArgument {
        what: "tenant MAC".to_string(),
        reason: format!("failed to parse bridge index from {mac}"),
    })
}

fn parse_cidr(cidr: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    (prefix <= 32).then_some((addr, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> FabricManager {
        FabricManager::new(8, "br-vms", dir.path().join("state.json"))
    }

    #[test]
    fn bridge_mapping_is_referentially_transparent() {
        let dir = TempDir::new().unwrap();
        let fabric = manager(&dir);
        let a = fabric.bridge_for_tenant("ws_A");
        assert_eq!(a, fabric.bridge_for_tenant("ws_A"));
        assert_eq!(a, fnv1a32("ws_A") % 8);
        assert!(a < 8);
        assert_eq!(fabric.bridge_name(a), format!("br-vms-{a}"));
    }

    #[test]
    fn mac_round_trips_to_bridge() {
        let dir = TempDir::new().unwrap();
        let fabric = manager(&dir);
        let mac = fabric.generate_tenant_mac("ws_A");
        assert_eq!(
            parse_tenant_mac(&mac).unwrap(),
            fabric.bridge_for_tenant("ws_A")
        );
        fabric.validate_tenant_mac("ws_A", &mac).unwrap();

        let sequential = fabric.generate_sequential_tenant_mac("ws_A", 1);
        assert!(sequential.ends_with("00:00:01"));
        fabric.validate_tenant_mac("ws_A", &sequential).unwrap();
    }

    #[test]
    fn parse_tenant_mac_rejects_foreign_macs() {
        assert!(parse_tenant_mac("00:11:22:33:44:55").is_err());
        assert!(parse_tenant_mac("02:01:4C:00:00:01").is_err());
        assert!(parse_tenant_mac("garbage").is_err());
    }

    #[test]
    fn allocate_release_leaves_count_unchanged() {
        let dir = TempDir::new().unwrap();
        let fabric = manager(&dir);
        let (ip, _bridge) = fabric.allocate_ip("ws_A").unwrap();
        assert_eq!(fabric.tenant_info("ws_A").unwrap().vm_count, 1);
        fabric.release_ip("ws_A", ip).unwrap();
        assert_eq!(fabric.tenant_info("ws_A").unwrap().vm_count, 0);
    }

    #[test]
    fn sixth_allocation_fails_resource_exhausted() {
        let dir = TempDir::new().unwrap();
        let fabric = manager(&dir);
        let mut ips = Vec::new();
        for _ in 0..5 {
            ips.push(fabric.allocate_ip("ws_full").unwrap().0);
        }
        let err = fabric.allocate_ip("ws_full").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ResourceExhausted);

        // all five addresses sit in the same /29 with offsets 2..=6
        let slot_base = fabric.slot_index_for_tenant("ws_full") * 8;
        for (i, ip) in ips.iter().enumerate() {
            assert_eq!(u32::from(ip.octets()[3]), slot_base + 2 + i as u32);
        }
    }

    #[test]
    fn allocated_ip_layout_matches_slot() {
        let dir = TempDir::new().unwrap();
        let fabric = manager(&dir);
        let (ip, bridge) = fabric.allocate_ip("ws_A").unwrap();
        let o = ip.octets();
        assert_eq!((o[0], o[1]), (172, 16));
        assert_eq!(u32::from(o[2]), fabric.bridge_for_tenant("ws_A"));
        let base = (o[3] / 8) * 8;
        assert!(o[3] >= base + 2 && o[3] <= base + 6);
        assert_eq!(bridge, fabric.bridge_name(fabric.bridge_for_tenant("ws_A")));
    }

    #[test]
    fn state_survives_reload_with_checksum() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        {
            let fabric = FabricManager::new(8, "br-vms", &path);
            fabric.allocate_ip("ws_A").unwrap();
            fabric.allocate_ip("ws_B").unwrap();
        }
        let reloaded = FabricManager::new(8, "br-vms", &path);
        assert_eq!(reloaded.tenant_info("ws_A").unwrap().vm_count, 1);
        assert_eq!(reloaded.tenant_info("ws_B").unwrap().vm_count, 1);
    }

    #[test]
    fn missing_state_file_is_a_fresh_start() {
        let dir = TempDir::new().unwrap();
        let fabric = FabricManager::new(8, "br-vms", dir.path().join("absent.json"));
        assert!(fabric.list_tenants().is_empty());
    }

    #[test]
    fn tampered_state_file_fails_checksum() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        {
            let fabric = FabricManager::new(8, "br-vms", &path);
            fabric.allocate_ip("ws_A").unwrap();
        }
        // Flip the persisted vm_count without updating the checksum.
        let text = std::fs::read_to_string(&path).unwrap();
        let tampered = text.replace("\"vm_count\": 1", "\"vm_count\": 3");
        assert_ne!(text, tampered);
        std::fs::write(&path, tampered).unwrap();

        // Load fails; the manager comes up empty rather than corrupt.
        let fabric = FabricManager::new(8, "br-vms", &path);
        assert!(fabric.tenant_info("ws_A").is_none());
    }

    #[test]
    fn repair_resets_excessive_vm_count() {
        let dir = TempDir::new().unwrap();
        let fabric = manager(&dir);
        fabric.insert_allocation_for_test(TenantAllocation {
            tenant_id: "corrupted-tenant".to_string(),
            bridge_index: 2,
            bridge_name: "br-vms-2".to_string(),
            project_vlans: BTreeMap::new(),
            created_at: Utc::now().to_rfc3339(),
            vm_count: 25,
        });

        assert!(fabric.validate_and_repair());
        assert_eq!(fabric.tenant_info("corrupted-tenant").unwrap().vm_count, 0);

        // Repaired file must checksum-verify on the next load.
        let reloaded = FabricManager::new(8, "br-vms", fabric.state_path());
        assert_eq!(reloaded.tenant_info("corrupted-tenant").unwrap().vm_count, 0);
    }

    #[test]
    fn repair_deletes_invalid_bridge_index() {
        let dir = TempDir::new().unwrap();
        let fabric = manager(&dir);
        fabric.insert_allocation_for_test(TenantAllocation {
            tenant_id: "invalid-bridge".to_string(),
            bridge_index: 10,
            bridge_name: "br-vms-10".to_string(),
            project_vlans: BTreeMap::new(),
            created_at: Utc::now().to_rfc3339(),
            vm_count: 2,
        });

        assert!(fabric.validate_and_repair());
        assert!(fabric.tenant_info("invalid-bridge").is_none());
    }

    #[test]
    fn repair_rewrites_wrong_bridge_name() {
        let dir = TempDir::new().unwrap();
        let fabric = manager(&dir);
        fabric.insert_allocation_for_test(TenantAllocation {
            tenant_id: "wrong-name".to_string(),
            bridge_index: 3,
            bridge_name: "old-bridge-name".to_string(),
            project_vlans: BTreeMap::new(),
            created_at: Utc::now().to_rfc3339(),
            vm_count: 2,
        });

        assert!(fabric.validate_and_repair());
        assert_eq!(
            fabric.tenant_info("wrong-name").unwrap().bridge_name,
            "br-vms-3"
        );
    }

    #[test]
    fn repair_prunes_orphaned_bridge_usage() {
        let dir = TempDir::new().unwrap();
        let fabric = manager(&dir);
        fabric.insert_bridge_usage_for_test(5, "nonexistent-tenant");

        assert!(fabric.validate_and_repair());
        assert_eq!(fabric.bridge_usage_stats()[&5], 0);
    }

    #[test]
    fn valid_state_needs_no_repair() {
        let dir = TempDir::new().unwrap();
        let fabric = manager(&dir);
        fabric.allocate_ip("ws_A").unwrap();
        assert!(!fabric.validate_and_repair());
        assert_eq!(fabric.tenant_info("ws_A").unwrap().vm_count, 1);
    }

    #[test]
    fn project_vlan_layout() {
        let dir = TempDir::new().unwrap();
        let fabric = manager(&dir);
        let vlan = fabric
            .get_or_create_project_vlan("ws_A", "github.com/example/repo")
            .unwrap();
        assert!(vlan.vlan_id >= VLAN_RANGE_START && vlan.vlan_id <= VLAN_RANGE_END);
        let bridge = fabric.bridge_for_tenant("ws_A");
        let offset = (u32::from(vlan.vlan_id) % 8) * 32;
        assert_eq!(vlan.subnet_cidr, format!("172.16.{bridge}.{offset}/27"));

        // second lookup returns the same allocation
        let again = fabric
            .get_or_create_project_vlan("ws_A", "github.com/example/repo")
            .unwrap();
        assert_eq!(again, vlan);
    }

    #[test]
    fn create_delete_leaves_state_equal_modulo_volatile_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let fabric = FabricManager::new(8, "br-vms", &path);
        fabric.allocate_ip("ws_A").unwrap();
        let before: FabricState =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();

        let (ip, _) = fabric.allocate_ip("ws_A").unwrap();
        fabric.release_ip("ws_A", ip).unwrap();

        let after: FabricState = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(before.tenants, after.tenants);
        assert_eq!(before.bridge_usage, after.bridge_usage);
    }
}
