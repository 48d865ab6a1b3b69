//! The VM lifecycle engine.
//!
//! Correlates the persistent VM record, the ephemeral VMM process, the
//! on-disk chroot, the network binding, and the port-forwarding rules.
//! Operations on a single VM serialize on that VM's entry lock; operations
//! across VMs run concurrently.
//!
//! Shutdown is a VMM pause, not termination: the control socket survives so
//! resume reattaches in O(1). Only delete (and nothing else) kills the
//! process. The engine's own shutdown preserves every VM for the next
//! startup to restore.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::asset::AssetResolver;
use crate::config::VmmConfig;
use crate::constants::{
    DEFAULT_SHUTDOWN_TIMEOUT_SECS, METRICS_FIFO_NAME, REBOOT_SETTLE_DELAY_MS, ROOTFS_IMAGE_NAME,
    VMM_SOCKET_NAME,
};
use crate::error::{Error, Result};
use crate::network::NetworkManager;
use crate::repository::{self, VmRepository};
use crate::vmm::kernel_args;
use crate::vmm::machine::{LaunchParams, VmmHandle, VmmLauncher};
use crate::vmm::metrics;
use crate::vmm::types::{VmMetricsSnapshot, VmRecord, VmSpec, VmState};

struct VmInner {
    record: VmRecord,
    handle: Option<Arc<dyn VmmHandle>>,
    cancel: Option<CancellationToken>,
}

struct VmEntry {
    inner: tokio::sync::Mutex<VmInner>,
}

/// The per-host VM lifecycle engine.
pub struct VmEngine {
    config: VmmConfig,
    network: Arc<NetworkManager>,
    assets: Arc<AssetResolver>,
    repo: Arc<dyn VmRepository>,
    launcher: Arc<dyn VmmLauncher>,
    vms: DashMap<String, Arc<VmEntry>>,
}

impl VmEngine {
    /// Build an engine over its collaborators.
    pub fn new(
        config: VmmConfig,
        network: Arc<NetworkManager>,
        assets: Arc<AssetResolver>,
        repo: Arc<dyn VmRepository>,
        launcher: Arc<dyn VmmLauncher>,
    ) -> Self {
        Self {
            config,
            network,
            assets,
            repo,
            launcher,
            vms: DashMap::new(),
        }
    }

    /// Restore VMs from the repository after a service restart. Created
    /// records are skipped (no process ever existed); every other record is
    /// reconstructed and its control socket probed. Records whose VMM died
    /// with the host stay cold until a resume recreates them.
    pub async fn initialize(&self) -> Result<()> {
        let rows = self.repo.list_all_vms().await?;
        let mut restored = 0usize;
        let mut reconnected = 0usize;

        for row in &rows {
            if row.state == VmState::Created {
                tracing::info!(vm_id = %row.id, "skipping CREATED VM - no VMM process exists");
                continue;
            }

            let port_mappings = if row.port_mappings_json.is_empty() {
                vec![]
            } else {
                serde_json::from_str(&row.port_mappings_json).unwrap_or_else(|e| {
                    tracing::warn!(vm_id = %row.id, error = %e, "failed to parse persisted port mappings");
                    vec![]
                })
            };

            let record = VmRecord {
                id: row.id.clone(),
                tenant_id: row.tenant_id.clone(),
                spec: row.spec.clone(),
                state: row.state,
                network: None,
                assets: None,
                port_mappings,
                created_at: row.created_at,
                updated_at: row.updated_at,
            };

            // Reconnect whatever still has a live socket; records whose
            // process is gone stay cold until a resume recreates them.
            let socket = self.config.vm_dir(&row.id).join(VMM_SOCKET_NAME);
            let handle = match self.launcher.reconnect(&row.id, &socket).await {
                Ok(live) => {
                    reconnected += 1;
                    tracing::info!(vm_id = %row.id, state = %row.state, "reconnected to VMM");
                    Some(live)
                }
                Err(e) => {
                    if row.state == VmState::Running {
                        tracing::warn!(
                            vm_id = %row.id,
                            error = %e,
                            "failed to reconnect to running VM - resume will recreate it"
                        );
                    } else {
                        tracing::debug!(vm_id = %row.id, error = %e, "VMM socket not reachable");
                    }
                    None
                }
            };

            self.vms.insert(
                row.id.clone(),
                Arc::new(VmEntry {
                    inner: tokio::sync::Mutex::new(VmInner {
                        record,
                        handle,
                        cancel: None,
                    }),
                }),
            );
            restored += 1;
            tracing::info!(vm_id = %row.id, state = %row.state, "restored VM to registry");
        }

        tracing::info!(
            total_rows = rows.len(),
            restored_count = restored,
            reconnected_count = reconnected,
            "VM restoration completed"
        );
        Ok(())
    }

    /// Create a VM: allocate resources in order (id, network, assets,
    /// chroot, record) and roll back in reverse on any failure.
    pub async fn create_vm(&self, tenant_id: &str, spec: VmSpec) -> Result<String> {
        let vm_id = crate::idgen::generate_vm_id();
        tracing::info!(
            vm_id = %vm_id,
            tenant_id = %tenant_id,
            vcpus = spec.cpu.vcpu_count,
            memory_bytes = spec.memory.size_bytes,
            "creating VM"
        );

        let network = self.network.create_vm_network(&vm_id, tenant_id).await?;
        tracing::info!(
            vm_id = %vm_id,
            namespace = %network.namespace,
            tap_device = %network.tap_device,
            ip_address = %network.ip,
            "allocated network for VM"
        );

        let chroot_root = self.config.chroot_root(&vm_id);
        let assets = match self.assets.prepare(&vm_id, &spec, &chroot_root).await {
            Ok(mapping) => mapping,
            Err(e) => {
                if let Err(cleanup_err) = self.network.delete_vm_network(&vm_id).await {
                    tracing::error!(vm_id = %vm_id, error = %cleanup_err, "failed to cleanup network after asset preparation failure");
                }
                return Err(e);
            }
        };

        let vm_dir = self.config.vm_dir(&vm_id);
        if let Err(source) = tokio::fs::create_dir_all(&vm_dir).await {
            self.rollback_create(&vm_id).await;
            return Err(Error::Io {
                what: "create vm dir".to_string(),
                path: vm_dir,
                source,
            });
        }

        if let Err(e) = self
            .repo
            .create_vm(repository::new_row(&vm_id, tenant_id, spec.clone()))
            .await
        {
            self.rollback_create(&vm_id).await;
            return Err(e);
        }

        let now = Utc::now().timestamp();
        let record = VmRecord {
            id: vm_id.clone(),
            tenant_id: tenant_id.to_string(),
            spec,
            state: VmState::Created,
            network: Some(network),
            assets,
            port_mappings: vec![],
            created_at: now,
            updated_at: now,
        };
        self.vms.insert(
            vm_id.clone(),
            Arc::new(VmEntry {
                inner: tokio::sync::Mutex::new(VmInner {
                    record,
                    handle: None,
                    cancel: None,
                }),
            }),
        );

        tracing::info!(vm_id = %vm_id, "VM created");
        Ok(vm_id)
    }

    async fn rollback_create(&self, vm_id: &str) {
        let chroot_dir = self.config.chroot_base_dir.join("firecracker").join(vm_id);
        let _ = tokio::fs::remove_dir_all(&chroot_dir).await;
        let _ = tokio::fs::remove_dir_all(self.config.vm_dir(vm_id)).await;
        if let Err(e) = self.network.delete_vm_network(vm_id).await {
            tracing::error!(vm_id = %vm_id, error = %e, "failed to cleanup network during create rollback");
        }
    }

    /// Boot a created VM: load container metadata, inject the command file,
    /// compose kernel arguments, start the VMM in the VM's namespace,
    /// acquire leases, then install port forwarding.
    pub async fn boot_vm(&self, vm_id: &str) -> Result<()> {
        let entry = self.entry(vm_id)?;
        let mut inner = entry.inner.lock().await;

        if inner.record.state != VmState::Created {
            return Err(Error::InvalidState {
                vm_id: vm_id.to_string(),
                state: inner.record.state.to_string(),
                operation: "boot".to_string(),
            });
        }

        tracing::info!(vm_id = %vm_id, state = %inner.record.state, "booting VM");

        let chroot_root = self.config.chroot_root(vm_id);
        let metadata = self
            .assets
            .load_container_metadata(&chroot_root, ROOTFS_IMAGE_NAME)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(vm_id = %vm_id, error = %e, "failed to load container metadata");
                None
            });

        if let Some(metadata) = &metadata {
            if !metadata.full_command().is_empty() {
                if let Err(e) = self
                    .assets
                    .write_container_cmd(vm_id, &chroot_root, metadata)
                    .await
                {
                    // Read-only root images land here; the guest then boots
                    // without a container command.
                    tracing::warn!(vm_id = %vm_id, error = %e, "failed to create container.cmd file");
                }
            }
        }

        let boot_args = kernel_args::build_with_network_and_metadata(
            &inner.record.spec.boot.kernel_args,
            inner.record.network.as_ref(),
            metadata.as_ref(),
            self.network.kernel_network_config_enabled(),
        );

        let launch = LaunchParams {
            vm_id: vm_id.to_string(),
            vm_dir: self.config.vm_dir(vm_id),
            chroot_root: chroot_root.clone(),
            netns: inner.record.network.as_ref().map(|n| n.namespace.clone()),
            kernel_args: boot_args,
            spec: inner.record.spec.clone(),
            network: inner.record.network.clone(),
        };
        let handle = self.launcher.launch(launch).await?;

        inner.handle = Some(handle);
        inner.cancel = Some(CancellationToken::new());
        self.set_state(&mut inner, VmState::Running).await;

        // Leases only after a successful boot, so a boot failure leaves
        // none outstanding.
        if let Some(mapping) = inner.record.assets.as_mut() {
            let mut mapping_copy = mapping.clone();
            self.assets.acquire_leases(vm_id, &mut mapping_copy).await;
            *mapping = mapping_copy.clone();
            if !mapping_copy.lease_ids.is_empty() {
                let mut extra = BTreeMap::new();
                extra.insert("lease_ids".to_string(), mapping_copy.lease_ids.join(","));
                if let Err(e) = self
                    .repo
                    .update_vm_state(vm_id, VmState::Running, Some(extra))
                    .await
                {
                    tracing::warn!(vm_id = %vm_id, error = %e, "failed to persist lease ids");
                }
            }
        }

        // Port forwarding for metadata-exposed ports.
        let exposed_ports = metadata
            .as_ref()
            .map(|m| m.exposed_ports.clone())
            .unwrap_or_default();
        if !exposed_ports.is_empty() {
            match self.network.allocate_ports_for_vm(vm_id, &exposed_ports).await {
                Ok(mappings) => {
                    inner.record.port_mappings = mappings.clone();
                    match serde_json::to_string(&mappings) {
                        Ok(json) => {
                            if let Err(e) = self.repo.update_vm_port_mappings(vm_id, &json).await {
                                tracing::warn!(vm_id = %vm_id, error = %e, "failed to persist port mappings");
                            } else {
                                tracing::info!(
                                    vm_id = %vm_id,
                                    port_count = mappings.len(),
                                    "persisted port mappings"
                                );
                            }
                        }
                        Err(e) => {
                            tracing::warn!(vm_id = %vm_id, error = %e, "failed to serialize port mappings");
                        }
                    }
                }
                Err(e) if self.config.fail_boot_on_port_forward_error => {
                    tracing::error!(vm_id = %vm_id, error = %e, "port forwarding failed, rolling boot back");
                    if let Some(handle) = inner.handle.take() {
                        let _ = handle.stop().await;
                    }
                    if let Some(cancel) = inner.cancel.take() {
                        cancel.cancel();
                    }
                    self.set_state(&mut inner, VmState::Created).await;
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!(vm_id = %vm_id, error = %e, "failed to configure port forwarding");
                }
            }
        }

        tracing::info!(vm_id = %vm_id, "VM booted");
        Ok(())
    }

    /// Pause a running VM.
    pub async fn pause_vm(&self, vm_id: &str) -> Result<()> {
        let entry = self.entry(vm_id)?;
        let mut inner = entry.inner.lock().await;

        if inner.record.state != VmState::Running {
            return Err(Error::InvalidState {
                vm_id: vm_id.to_string(),
                state: inner.record.state.to_string(),
                operation: "pause".to_string(),
            });
        }
        let handle = inner.handle.clone().ok_or_else(|| Error::VmmUnavailable {
            vm_id: vm_id.to_string(),
        })?;

        tracing::info!(vm_id = %vm_id, "pausing VM");
        handle
            .pause(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS))
            .await?;
        self.set_state(&mut inner, VmState::Paused).await;
        tracing::info!(vm_id = %vm_id, "VM paused");
        Ok(())
    }

    /// Resume a paused or shut-down VM. A dead control socket triggers the
    /// recreation path: assets and network are rebuilt, the VMM started and
    /// immediately paused, then resumed like any other.
    pub async fn resume_vm(&self, vm_id: &str) -> Result<()> {
        let entry = self.entry(vm_id)?;
        let mut inner = entry.inner.lock().await;

        if inner.record.state != VmState::Paused && inner.record.state != VmState::Shutdown {
            return Err(Error::InvalidState {
                vm_id: vm_id.to_string(),
                state: inner.record.state.to_string(),
                operation: "resume".to_string(),
            });
        }

        if inner.handle.is_none() {
            let socket = self.config.vm_dir(vm_id).join(VMM_SOCKET_NAME);
            tracing::info!(vm_id = %vm_id, "reconnecting to existing VMM process");
            match self.launcher.reconnect(vm_id, &socket).await {
                Ok(handle) => inner.handle = Some(handle),
                Err(e) => {
                    tracing::warn!(
                        vm_id = %vm_id,
                        error = %e,
                        "failed to reconnect to VMM process, recreating VM"
                    );
                    self.recreate_for_resume(vm_id, &mut inner).await?;
                }
            }
        }

        let handle = inner.handle.clone().ok_or_else(|| Error::VmmUnavailable {
            vm_id: vm_id.to_string(),
        })?;

        tracing::info!(vm_id = %vm_id, state = %inner.record.state, "resuming VM");
        handle.resume().await?;
        self.set_state(&mut inner, VmState::Running).await;

        if let Err(e) = self.network.startup_vm_interfaces(vm_id).await {
            tracing::warn!(vm_id = %vm_id, error = %e, "failed to bring up VM interfaces");
        }

        tracing::info!(vm_id = %vm_id, "VM resumed");
        Ok(())
    }

    /// Recreate the VMM for a VM whose process is gone (service restart).
    /// The fresh instance boots and is immediately paused; the caller's
    /// resume then brings it to Running.
    async fn recreate_for_resume(&self, vm_id: &str, inner: &mut VmInner) -> Result<()> {
        tracing::info!(vm_id = %vm_id, state = %inner.record.state, "recreating VM for resume");

        let chroot_root = self.config.chroot_root(vm_id);
        inner.record.assets = self
            .assets
            .prepare(vm_id, &inner.record.spec, &chroot_root)
            .await?;

        let network = self
            .network
            .create_vm_network(vm_id, &inner.record.tenant_id)
            .await?;
        inner.record.network = Some(network);

        let vm_dir = self.config.vm_dir(vm_id);
        tokio::fs::create_dir_all(&vm_dir)
            .await
            .map_err(|source| Error::Io {
                what: "create vm dir".to_string(),
                path: vm_dir.clone(),
                source,
            })?;

        let metadata = self
            .assets
            .load_container_metadata(&chroot_root, ROOTFS_IMAGE_NAME)
            .await
            .unwrap_or(None);
        let boot_args = kernel_args::build_with_network_and_metadata(
            &inner.record.spec.boot.kernel_args,
            inner.record.network.as_ref(),
            metadata.as_ref(),
            self.network.kernel_network_config_enabled(),
        );

        let handle = self
            .launcher
            .launch(LaunchParams {
                vm_id: vm_id.to_string(),
                vm_dir,
                chroot_root,
                netns: inner.record.network.as_ref().map(|n| n.namespace.clone()),
                kernel_args: boot_args,
                spec: inner.record.spec.clone(),
                network: inner.record.network.clone(),
            })
            .await?;

        // The record says Paused or Shutdown; match reality to it.
        if let Err(e) = handle.pause(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS)).await {
            tracing::warn!(vm_id = %vm_id, error = %e, "failed to pause recreated VM - continuing");
        }

        inner.handle = Some(handle);
        inner.cancel = Some(CancellationToken::new());
        tracing::info!(vm_id = %vm_id, "VM recreated for resume");
        Ok(())
    }

    /// Shut down a running VM. Both modes pause the VMM so the socket
    /// survives for resume; `force` skips nothing but records intent.
    pub async fn shutdown_vm(&self, vm_id: &str, force: bool, timeout_secs: u64) -> Result<()> {
        let entry = self.entry(vm_id)?;
        let mut inner = entry.inner.lock().await;

        if inner.record.state != VmState::Running {
            return Err(Error::InvalidState {
                vm_id: vm_id.to_string(),
                state: inner.record.state.to_string(),
                operation: "shutdown".to_string(),
            });
        }
        let handle = inner.handle.clone().ok_or_else(|| Error::VmmUnavailable {
            vm_id: vm_id.to_string(),
        })?;

        tracing::info!(vm_id = %vm_id, force, timeout_secs, "shutting down VM");
        handle.pause(Duration::from_secs(timeout_secs)).await?;

        if let Some(cancel) = inner.cancel.take() {
            cancel.cancel();
        }

        if let Err(e) = self.network.shutdown_vm_interfaces(vm_id).await {
            tracing::warn!(vm_id = %vm_id, error = %e, "failed to bring down VM interfaces");
        }

        self.set_state(&mut inner, VmState::Shutdown).await;
        tracing::info!(vm_id = %vm_id, "VM shutdown complete");
        Ok(())
    }

    /// Reboot: internal shutdown then boot with a settle delay in between.
    /// The VMM is paused and resumed; the record stays Running afterwards.
    pub async fn reboot_vm(&self, vm_id: &str) -> Result<()> {
        tracing::info!(vm_id = %vm_id, "rebooting VM");
        self.shutdown_vm(vm_id, false, DEFAULT_SHUTDOWN_TIMEOUT_SECS)
            .await?;
        tokio::time::sleep(Duration::from_millis(REBOOT_SETTLE_DELAY_MS)).await;
        self.resume_vm(vm_id).await?;
        tracing::info!(vm_id = %vm_id, "VM rebooted");
        Ok(())
    }

    /// Delete a VM, always permitted and never rolled back. Resources fall
    /// in order: VMM process, forwarding rules and ports, network devices,
    /// directories, leases, then the record tombstone.
    pub async fn delete_vm(&self, vm_id: &str) -> Result<()> {
        let entry = match self.entry(vm_id) {
            Ok(entry) => entry,
            Err(not_found) => {
                // Known to the repository but not the registry (a Created
                // row skipped at restore): tombstone it and sweep the disk.
                self.repo.get_vm(vm_id).await.map_err(|_| not_found)?;
                tracing::info!(vm_id = %vm_id, "deleting VM known only to the repository");
                let _ = tokio::fs::remove_dir_all(self.config.vm_dir(vm_id)).await;
                let _ = tokio::fs::remove_dir_all(
                    self.config.chroot_base_dir.join("firecracker").join(vm_id),
                )
                .await;
                self.repo.delete_vm(vm_id).await?;
                return Ok(());
            }
        };
        let mut inner = entry.inner.lock().await;

        tracing::info!(vm_id = %vm_id, "deleting VM");

        if let Some(handle) = inner.handle.take() {
            if let Err(e) = handle.stop().await {
                tracing::warn!(vm_id = %vm_id, error = %e, "failed to stop VMM during delete");
            }
        }
        if let Some(cancel) = inner.cancel.take() {
            cancel.cancel();
        }

        let released = self.network.release_vm_ports(vm_id).await;
        if !released.is_empty() {
            tracing::info!(vm_id = %vm_id, port_count = released.len(), "released VM port allocations");
        }

        if let Err(e) = self.network.delete_vm_network(vm_id).await {
            tracing::error!(vm_id = %vm_id, error = %e, "failed to delete VM network");
        }

        let vm_dir = self.config.vm_dir(vm_id);
        if let Err(e) = tokio::fs::remove_dir_all(&vm_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(vm_id = %vm_id, path = %vm_dir.display(), error = %e, "failed to remove VM directory");
            }
        }
        let chroot_dir = self.config.chroot_base_dir.join("firecracker").join(vm_id);
        if let Err(e) = tokio::fs::remove_dir_all(&chroot_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(vm_id = %vm_id, path = %chroot_dir.display(), error = %e, "failed to remove VM chroot");
            }
        }

        if let Some(mapping) = inner.record.assets.take() {
            self.assets.release_leases(vm_id, &mapping.lease_ids).await;
        }

        inner.record.state = VmState::Deleted;
        if let Err(e) = self.repo.delete_vm(vm_id).await {
            // The physical delete succeeded; the row is now out of sync.
            tracing::warn!(
                vm_id = %vm_id,
                error = %e,
                backend_status = "deleted",
                action_required = "manual_database_cleanup",
                "vm deleted in backend but repository delete failed - state drift"
            );
        }

        drop(inner);
        self.vms.remove(vm_id);

        tracing::info!(vm_id = %vm_id, "VM deleted");
        Ok(())
    }

    /// Stop every live VMM and cancel tokens while keeping records, so the
    /// next startup restores everything.
    pub async fn shutdown(&self) {
        let vm_count = self.vms.len();
        tracing::info!(vm_count, "preserving all VMs during engine shutdown");

        let entries: Vec<Arc<VmEntry>> = self.vms.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            let mut inner = entry.inner.lock().await;
            tracing::info!(vm_id = %inner.record.id, state = %inner.record.state, "preserving VM during engine shutdown");
            if let Some(handle) = inner.handle.take() {
                if let Err(e) = handle.stop().await {
                    tracing::error!(vm_id = %inner.record.id, error = %e, "failed to stop VMM during engine shutdown");
                }
            }
            if let Some(cancel) = inner.cancel.take() {
                cancel.cancel();
            }
        }

        tracing::info!(preserved_vm_count = vm_count, "engine shutdown complete - all VMs preserved");
    }

    /// Read one metrics snapshot from the VM's metrics FIFO. Timeouts yield
    /// a zero-valued snapshot.
    pub async fn vm_metrics(&self, vm_id: &str) -> Result<VmMetricsSnapshot> {
        let _ = self.entry(vm_id)?;
        let fifo = self.config.chroot_root(vm_id).join(METRICS_FIFO_NAME);
        Ok(metrics::read_snapshot(vm_id, &fifo).await)
    }

    /// A copy of the VM record.
    pub async fn vm_record(&self, vm_id: &str) -> Result<VmRecord> {
        let entry = self.entry(vm_id)?;
        let inner = entry.inner.lock().await;
        Ok(inner.record.clone())
    }

    /// Copies of every record in the registry.
    pub async fn list_records(&self) -> Vec<VmRecord> {
        let mut records = Vec::new();
        let entries: Vec<Arc<VmEntry>> = self.vms.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            records.push(entry.inner.lock().await.record.clone());
        }
        records
    }

    fn entry(&self, vm_id: &str) -> Result<Arc<VmEntry>> {
        self.vms
            .get(vm_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::VmNotFound {
                vm_id: vm_id.to_string(),
            })
    }

    async fn set_state(&self, inner: &mut VmInner, state: VmState) {
        inner.record.state = state;
        inner.record.updated_at = Utc::now().timestamp();
        if let Err(e) = self.repo.update_vm_state(&inner.record.id, state, None).await {
            // The physical transition already happened; record the drift.
            tracing::warn!(
                vm_id = %inner.record.id,
                state = %state,
                error = %e,
                action_required = "manual_state_sync",
                "state transition succeeded but repository update failed - state drift"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{Asset, AssetKind, InMemoryAssetClient, NoopMountOps};
    use crate::config::{AssetConfig, NetworkConfig};
    use crate::network::firewall::fake::FakeFirewallOps;
    use crate::network::firewall::FirewallController;
    use crate::network::netlink::fake::FakeLinkOps;
    use crate::repository::MemoryVmRepository;
    use crate::vmm::machine::fake::FakeVmmLauncher;
    use crate::vmm::types::{BootSpec, CpuSpec, MemorySpec, StorageSpec};
    use tempfile::TempDir;

    struct Harness {
        engine: VmEngine,
        launcher: Arc<FakeVmmLauncher>,
        repo: Arc<MemoryVmRepository>,
        asset_client: Arc<InMemoryAssetClient>,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let link_ops = Arc::new(FakeLinkOps::new());
        let firewall = Arc::new(FirewallController::with_paths(
            Arc::new(FakeFirewallOps::new()),
            dir.path().join("ip_forward"),
            dir.path().join("sysctl.conf"),
        ));
        let network_config = NetworkConfig {
            fabric_state_path: dir.path().join("fabric.json"),
            enable_rate_limit: false,
            ..NetworkConfig::default()
        };
        let network = Arc::new(NetworkManager::new(network_config, link_ops, firewall));

        let asset_client = Arc::new(InMemoryAssetClient::new());
        asset_client.register(Asset {
            id: "asset-kernel01".to_string(),
            kind: AssetKind::Kernel,
            labels: Default::default(),
        });
        asset_client.register(Asset {
            id: "asset-rootfs01".to_string(),
            kind: AssetKind::Rootfs,
            labels: Default::default(),
        });
        let assets = Arc::new(AssetResolver::new(
            asset_client.clone(),
            AssetConfig::default(),
            Arc::new(NoopMountOps),
        ));

        let repo = Arc::new(MemoryVmRepository::new());
        let launcher = Arc::new(FakeVmmLauncher::new());
        let vmm_config = VmmConfig {
            base_dir: dir.path().join("vms"),
            chroot_base_dir: dir.path().join("jailer"),
            ..VmmConfig::default()
        };

        Harness {
            engine: VmEngine::new(
                vmm_config,
                network,
                assets,
                repo.clone(),
                launcher.clone(),
            ),
            launcher,
            repo,
            asset_client,
            _dir: dir,
        }
    }

    fn spec() -> VmSpec {
        VmSpec {
            cpu: CpuSpec {
                vcpu_count: 1,
                max_vcpu_count: 0,
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

    #[tokio::test]
    async fn create_boot_transitions_to_running() {
        let h = harness();
        let vm_id = h.engine.create_vm("ws_A", spec()).await.unwrap();
        assert!(vm_id.starts_with("ud-"));

        let record = h.engine.vm_record(&vm_id).await.unwrap();
        assert_eq!(record.state, VmState::Created);
        assert!(record.network.is_some());

        h.engine.boot_vm(&vm_id).await.unwrap();
        let record = h.engine.vm_record(&vm_id).await.unwrap();
        assert_eq!(record.state, VmState::Running);
        assert_eq!(h.repo.get_vm(&vm_id).await.unwrap().state, VmState::Running);

        // leases were acquired after boot
        assert_eq!(h.asset_client.outstanding_leases().len(), 2);
    }

    #[tokio::test]
    async fn boot_requires_created_state() {
        let h = harness();
        let vm_id = h.engine.create_vm("ws_A", spec()).await.unwrap();
        h.engine.boot_vm(&vm_id).await.unwrap();

        let err = h.engine.boot_vm(&vm_id).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StateConflict);
    }

    #[tokio::test]
    async fn pause_resume_cycle() {
        let h = harness();
        let vm_id = h.engine.create_vm("ws_A", spec()).await.unwrap();
        h.engine.boot_vm(&vm_id).await.unwrap();

        h.engine.pause_vm(&vm_id).await.unwrap();
        assert_eq!(
            h.engine.vm_record(&vm_id).await.unwrap().state,
            VmState::Paused
        );

        // pausing again conflicts
        let err = h.engine.pause_vm(&vm_id).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StateConflict);

        h.engine.resume_vm(&vm_id).await.unwrap();
        assert_eq!(
            h.engine.vm_record(&vm_id).await.unwrap().state,
            VmState::Running
        );
    }

    #[tokio::test]
    async fn shutdown_is_pause_and_resume_reattaches() {
        let h = harness();
        let vm_id = h.engine.create_vm("ws_A", spec()).await.unwrap();
        h.engine.boot_vm(&vm_id).await.unwrap();

        h.engine.shutdown_vm(&vm_id, true, 30).await.unwrap();
        assert_eq!(
            h.engine.vm_record(&vm_id).await.unwrap().state,
            VmState::Shutdown
        );
        // force shutdown still paused, never killed
        let handle = h.launcher.handle(&vm_id).unwrap();
        assert_eq!(*handle.state.lock().unwrap(), "Paused");

        h.engine.resume_vm(&vm_id).await.unwrap();
        assert_eq!(
            h.engine.vm_record(&vm_id).await.unwrap().state,
            VmState::Running
        );
        // no second launch happened: the original process was reused
        assert_eq!(h.launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn delete_is_always_permitted_and_tombstones() {
        let h = harness();
        let vm_id = h.engine.create_vm("ws_A", spec()).await.unwrap();
        h.engine.boot_vm(&vm_id).await.unwrap();

        h.engine.delete_vm(&vm_id).await.unwrap();
        assert_eq!(
            h.repo.get_vm(&vm_id).await.unwrap().state,
            VmState::Deleted
        );
        let err = h.engine.vm_record(&vm_id).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
        // leases released
        assert!(h.asset_client.outstanding_leases().is_empty());
    }

    #[tokio::test]
    async fn launch_failure_leaves_created_and_no_leases() {
        let h = harness();
        let vm_id = h.engine.create_vm("ws_A", spec()).await.unwrap();
        h.launcher.fail_next_launch();

        let err = h.engine.boot_vm(&vm_id).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Dependency);
        assert_eq!(
            h.engine.vm_record(&vm_id).await.unwrap().state,
            VmState::Created
        );
        assert!(h.asset_client.outstanding_leases().is_empty());
    }

    #[tokio::test]
    async fn engine_shutdown_preserves_records() {
        let h = harness();
        let vm_id = h.engine.create_vm("ws_A", spec()).await.unwrap();
        h.engine.boot_vm(&vm_id).await.unwrap();

        h.engine.shutdown().await;
        // record remains, handle is gone
        let record = h.engine.vm_record(&vm_id).await.unwrap();
        assert_eq!(record.state, VmState::Running);
        assert_eq!(h.repo.get_vm(&vm_id).await.unwrap().state, VmState::Running);
    }

    #[tokio::test]
    async fn reboot_settles_back_to_running() {
        let h = harness();
        let vm_id = h.engine.create_vm("ws_A", spec()).await.unwrap();
        h.engine.boot_vm(&vm_id).await.unwrap();

        h.engine.reboot_vm(&vm_id).await.unwrap();
        assert_eq!(
            h.engine.vm_record(&vm_id).await.unwrap().state,
            VmState::Running
        );
        let handle = h.launcher.handle(&vm_id).unwrap();
        assert!(handle.pause_calls.load(std::sync::atomic::Ordering::SeqCst) >= 1);
        assert!(handle.resume_calls.load(std::sync::atomic::Ordering::SeqCst) >= 1);
        // the VMM process was reused, not replaced
        assert_eq!(h.launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn metrics_for_unknown_vm_is_not_found() {
        let h = harness();
        let err = h.engine.vm_metrics("ud-absent").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
