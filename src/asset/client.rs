//! Asset service capability: query, build-on-demand, prepare, lease.
//!
//! The external asset service owns image builds and content-addressed
//! storage; this crate only consumes it through [`AssetClient`]. The
//! in-memory implementation backs tests and the static-fallback probe.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kinds of boot assets a VM needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetKind {
    /// Kernel image.
    Kernel,
    /// Root filesystem image.
    Rootfs,
    /// Init ramdisk.
    Initrd,
}

impl AssetKind {
    /// Wire name, used in deterministic asset ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Kernel => "KERNEL",
            AssetKind::Rootfs => "ROOTFS",
            AssetKind::Initrd => "INITRD",
        }
    }
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An asset record as returned by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Asset id.
    pub id: String,
    /// Asset kind.
    pub kind: AssetKind,
    /// Exact labels; matching never considers partial overlaps.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Build options sent with a query to allow on-demand builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Allow the service to start a build for a missing asset.
    pub enable_auto_build: bool,
    /// Block the query until a triggered build completes.
    pub wait_for_completion: bool,
    /// Build wait ceiling in seconds.
    pub build_timeout_seconds: u64,
    /// Tenant the build is attributed to.
    pub tenant_id: String,
    /// Deterministic id the service should assign to the built asset.
    pub suggested_asset_id: String,
    /// Labels for the build itself. `force_rebuild` travels here, never as
    /// an asset label.
    #[serde(default)]
    pub build_labels: BTreeMap<String, String>,
}

/// A build the service kicked off while answering a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggeredBuild {
    /// Build id.
    pub build_id: String,
    /// Image the build produces a rootfs for.
    pub docker_image: String,
    /// `pending` / `completed` / `failed`.
    pub status: String,
    /// Failure detail when status is `failed`.
    #[serde(default)]
    pub error_message: String,
}

/// Response of a query: matching assets plus any builds it triggered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryAssetsResponse {
    /// Assets matching the query.
    pub assets: Vec<Asset>,
    /// Builds the query triggered.
    pub triggered_builds: Vec<TriggeredBuild>,
}

/// Capability over the external asset service.
#[async_trait]
pub trait AssetClient: Send + Sync {
    /// Query assets by kind and labels, optionally allowing builds.
    async fn query_assets(
        &self,
        kind: AssetKind,
        labels: &BTreeMap<String, String>,
        build_options: Option<&BuildOptions>,
    ) -> Result<QueryAssetsResponse>;

    /// Materialize assets into `target_dir`. The contract is only that the
    /// returned paths exist under the directory afterwards; the service may
    /// copy, hardlink, or bind.
    async fn prepare_assets(
        &self,
        asset_ids: &[String],
        target_dir: &Path,
        vm_id: &str,
    ) -> Result<BTreeMap<String, PathBuf>>;

    /// Take a reference-counted lease on an asset for a VM.
    async fn acquire_asset(&self, asset_id: &str, vm_id: &str) -> Result<String>;

    /// Release a lease.
    async fn release_asset(&self, lease_id: &str) -> Result<()>;
}

/// In-memory asset service for tests and local development.
pub struct InMemoryAssetClient {
    assets: Mutex<Vec<Asset>>,
    leases: Mutex<Vec<(String, String, String)>>, // (lease_id, asset_id, vm_id)
    lease_counter: Mutex<u64>,
    unavailable: Mutex<bool>,
    fail_release: Mutex<bool>,
}

impl InMemoryAssetClient {
    /// Empty service with no assets registered.
    pub fn new() -> Self {
        Self {
            assets: Mutex::new(Vec::new()),
            leases: Mutex::new(Vec::new()),
            lease_counter: Mutex::new(0),
            unavailable: Mutex::new(false),
            fail_release: Mutex::new(false),
        }
    }

    /// Register an asset the service will return.
    pub fn register(&self, asset: Asset) {
        self.assets.lock().unwrap().push(asset);
    }

    /// Make every call fail, as an unreachable service would.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }

    /// Make lease releases fail, to exercise tolerant cleanup.
    pub fn set_fail_release(&self, fail: bool) {
        *self.fail_release.lock().unwrap() = fail;
    }

    /// Currently outstanding lease ids.
    pub fn outstanding_leases(&self) -> Vec<String> {
        self.leases
            .lock()
            .unwrap()
            .iter()
            .map(|(lease, _, _)| lease.clone())
            .collect()
    }

    fn check_available(&self, call: &str) -> Result<()> {
        if *self.unavailable.lock().unwrap() {
            return Err(Error::AssetService {
                call: call.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for InMemoryAssetClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssetClient for InMemoryAssetClient {
    async fn query_assets(
        &self,
        kind: AssetKind,
        labels: &BTreeMap<String, String>,
        _build_options: Option<&BuildOptions>,
    ) -> Result<QueryAssetsResponse> {
        self.check_available("query_assets")?;
        let assets = self
            .assets
            .lock()
            .unwrap()
            .iter()
            .filter(|asset| {
                asset.kind == kind
                    && labels
                        .iter()
                        .all(|(k, v)| asset.labels.get(k) == Some(v))
            })
            .cloned()
            .collect();
        Ok(QueryAssetsResponse {
            assets,
            triggered_builds: vec![],
        })
    }

    async fn prepare_assets(
        &self,
        asset_ids: &[String],
        target_dir: &Path,
        _vm_id: &str,
    ) -> Result<BTreeMap<String, PathBuf>> {
        self.check_available("prepare_assets")?;
        tokio::fs::create_dir_all(target_dir)
            .await
            .map_err(|source| Error::AssetIo {
                what: "create target dir".to_string(),
                path: target_dir.to_path_buf(),
                source,
            })?;

        let assets = self.assets.lock().unwrap().clone();
        let mut prepared = BTreeMap::new();
        for asset_id in asset_ids {
            let Some(asset) = assets.iter().find(|a| &a.id == asset_id) else {
                return Err(Error::AssetService {
                    call: "prepare_assets".to_string(),
                    reason: format!("unknown asset {asset_id}"),
                });
            };
            let file_name = match asset.kind {
                AssetKind::Kernel => crate::constants::KERNEL_IMAGE_NAME,
                AssetKind::Rootfs => crate::constants::ROOTFS_IMAGE_NAME,
                AssetKind::Initrd => "initrd.img",
            };
            let path = target_dir.join(file_name);
            tokio::fs::write(&path, asset.id.as_bytes())
                .await
                .map_err(|source| Error::AssetIo {
                    what: "materialize asset".to_string(),
                    path: path.clone(),
                    source,
                })?;
            prepared.insert(asset_id.clone(), path);
        }
        Ok(prepared)
    }

    async fn acquire_asset(&self, asset_id: &str, vm_id: &str) -> Result<String> {
        self.check_available("acquire_asset")?;
        let mut counter = self.lease_counter.lock().unwrap();
        *counter += 1;
        let lease_id = format!("lease-{:08x}", *counter);
        self.leases.lock().unwrap().push((
            lease_id.clone(),
            asset_id.to_string(),
            vm_id.to_string(),
        ));
        Ok(lease_id)
    }

    async fn release_asset(&self, lease_id: &str) -> Result<()> {
        self.check_available("release_asset")?;
        if *self.fail_release.lock().unwrap() {
            return Err(Error::AssetService {
                call: "release_asset".to_string(),
                reason: format!("lease {lease_id} release rejected"),
            });
        }
        self.leases.lock().unwrap().retain(|(lease, _, _)| lease != lease_id);
        Ok(())
    }
}
