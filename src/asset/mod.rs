//! Asset resolution and chroot preparation.
//!
//! Turns a VM spec into asset requirements, resolves them against the
//! external asset service (building on demand when allowed), materializes
//! the results into the VM chroot, and manages post-boot leases. When the
//! service is unreachable the resolver falls back to copying the spec's
//! literal paths.

pub mod client;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::AssetConfig;
use crate::constants::{ASSET_ID_PREFIX, CONTAINER_CMD_FILE, KERNEL_IMAGE_NAME, ROOTFS_IMAGE_NAME};
use crate::error::{Error, Result};
use crate::vmm::types::VmSpec;

pub use client::{Asset, AssetClient, AssetKind, BuildOptions, InMemoryAssetClient, QueryAssetsResponse};

/// One asset a VM needs before boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRequirement {
    /// What kind of asset.
    pub kind: AssetKind,
    /// Exact labels the asset must carry.
    pub labels: BTreeMap<String, String>,
    /// Whether creation fails if the requirement cannot be satisfied.
    pub required: bool,
}

/// Resolved assets of a VM and, after boot, the leases held on them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMapping {
    /// Ids of the assets backing this VM.
    pub asset_ids: Vec<String>,
    /// Lease ids, populated after a successful boot.
    #[serde(default)]
    pub lease_ids: Vec<String>,
}

/// Container image metadata written by the builder next to a rootfs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    /// Image entrypoint.
    #[serde(default)]
    pub entrypoint: Vec<String>,
    /// Image command.
    #[serde(default)]
    pub command: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory.
    #[serde(default)]
    pub working_dir: String,
    /// Exposed ports (`"80"`, `"80/tcp"`).
    #[serde(default)]
    pub exposed_ports: Vec<String>,
    /// Original image reference.
    #[serde(default)]
    pub original_image: String,
}

impl ContainerMetadata {
    /// Entrypoint and command concatenated, the full guest command line.
    pub fn full_command(&self) -> Vec<String> {
        let mut cmd = self.entrypoint.clone();
        cmd.extend(self.command.iter().cloned());
        cmd
    }
}

/// Deterministic asset id: `asset-` + first 16 hex chars of SHA-256 over
/// `type=<kind>,k=v,...` with label keys sorted.
pub fn deterministic_asset_id(kind: AssetKind, labels: &BTreeMap<String, String>) -> String {
    let mut parts = vec![format!("type={kind}")];
    for (k, v) in labels {
        parts.push(format!("{k}={v}"));
    }
    let digest = Sha256::digest(parts.join(",").as_bytes());
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{ASSET_ID_PREFIX}{hex}")
}

/// Capability over filesystem image mounting, used to inject the container
/// command file into a rootfs.
#[async_trait]
pub trait MountOps: Send + Sync {
    /// Loop-mount an image read-write.
    async fn mount_loop(&self, image: &Path, mountpoint: &Path) -> Result<()>;
    /// Unmount a mountpoint.
    async fn unmount(&self, mountpoint: &Path) -> Result<()>;
}

/// Production implementation driving `mount -o loop` / `umount`.
pub struct LoopMountOps;

#[async_trait]
impl MountOps for LoopMountOps {
    async fn mount_loop(&self, image: &Path, mountpoint: &Path) -> Result<()> {
        let output = tokio::process::Command::new("mount")
            .arg("-o")
            .arg("loop")
            .arg(image)
            .arg(mountpoint)
            .output()
            .await
            .map_err(|e| Error::RootfsMount {
                vm_id: String::new(),
                output: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(Error::RootfsMount {
                vm_id: String::new(),
                output: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    async fn unmount(&self, mountpoint: &Path) -> Result<()> {
        let output = tokio::process::Command::new("umount")
            .arg(mountpoint)
            .output()
            .await
            .map_err(|e| Error::RootfsMount {
                vm_id: String::new(),
                output: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(Error::RootfsMount {
                vm_id: String::new(),
                output: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

/// No-op mount for tests: the mountpoint directory stands in for the
/// mounted filesystem.
pub struct NoopMountOps;

#[async_trait]
impl MountOps for NoopMountOps {
    async fn mount_loop(&self, _image: &Path, mountpoint: &Path) -> Result<()> {
        tokio::fs::create_dir_all(mountpoint)
            .await
            .map_err(|source| Error::AssetIo {
                what: "create mountpoint".to_string(),
                path: mountpoint.to_path_buf(),
                source,
            })
    }

    async fn unmount(&self, _mountpoint: &Path) -> Result<()> {
        Ok(())
    }
}

/// The asset resolver.
pub struct AssetResolver {
    client: Arc<dyn AssetClient>,
    config: AssetConfig,
    mount_ops: Arc<dyn MountOps>,
}

impl AssetResolver {
    /// Create a resolver over an asset client and a mount capability.
    pub fn new(client: Arc<dyn AssetClient>, config: AssetConfig, mount_ops: Arc<dyn MountOps>) -> Self {
        Self {
            client,
            config,
            mount_ops,
        }
    }

    /// Derive asset requirements from a VM spec: a kernel when a kernel
    /// path is set, one rootfs per root-marked storage device (labeled with
    /// any `docker_image` from the device options or the spec metadata),
    /// and an optional initrd.
    pub fn build_requirements(&self, spec: &VmSpec) -> Vec<AssetRequirement> {
        let mut requirements = Vec::new();

        if !spec.boot.kernel_path.is_empty() {
            requirements.push(AssetRequirement {
                kind: AssetKind::Kernel,
                labels: BTreeMap::new(),
                required: true,
            });
        }

        for disk in &spec.storage {
            if !disk.is_root_device {
                continue;
            }
            let mut labels = BTreeMap::new();
            if let Some(image) = disk
                .options
                .get("docker_image")
                .or_else(|| spec.metadata.get("docker_image"))
            {
                labels.insert("docker_image".to_string(), image.clone());
            }
            requirements.push(AssetRequirement {
                kind: AssetKind::Rootfs,
                labels,
                required: true,
            });
        }

        if !spec.boot.initrd_path.is_empty() {
            requirements.push(AssetRequirement {
                kind: AssetKind::Initrd,
                labels: BTreeMap::new(),
                required: false,
            });
        }

        requirements
    }

    /// Resolve the spec's requirements and materialize the assets into the
    /// chroot. Returns `None` when the asset service is unavailable and the
    /// static fallback was used instead.
    pub async fn prepare(
        &self,
        vm_id: &str,
        spec: &VmSpec,
        chroot_root: &Path,
    ) -> Result<Option<AssetMapping>> {
        tracing::info!(
            vm_id = %vm_id,
            target_path = %chroot_root.display(),
            "preparing VM assets"
        );
        tokio::fs::create_dir_all(chroot_root)
            .await
            .map_err(|source| Error::AssetIo {
                what: "create chroot root".to_string(),
                path: chroot_root.to_path_buf(),
                source,
            })?;

        // Probe the service; an unreachable service selects the static
        // copying path for backward compatibility.
        if let Err(e) = self
            .client
            .query_assets(AssetKind::Kernel, &BTreeMap::new(), None)
            .await
        {
            tracing::info!(
                vm_id = %vm_id,
                error = %e,
                "asset service unavailable, using static file copying"
            );
            self.prepare_static(vm_id, spec, chroot_root).await?;
            return Ok(None);
        }

        let requirements = self.build_requirements(spec);
        tracing::debug!(vm_id = %vm_id, required_count = requirements.len(), "determined asset requirements");

        let tenant_id = spec
            .metadata
            .get("tenant_id")
            .cloned()
            .unwrap_or_else(|| self.config.default_tenant.clone());

        // Group by (kind, labels) so identical requirements share a query.
        let mut groups: BTreeMap<(AssetKind, String), BTreeMap<String, String>> = BTreeMap::new();
        for requirement in &requirements {
            let key = (
                requirement.kind,
                serialize_labels(&requirement.labels),
            );
            groups.entry(key).or_insert_with(|| requirement.labels.clone());
        }

        let mut available: Vec<Asset> = Vec::new();
        for ((kind, _), labels) in &groups {
            let suggested_id = deterministic_asset_id(*kind, labels);

            // force_rebuild is a build trigger, not an asset attribute; it
            // travels in the build labels only.
            let mut build_labels = labels.clone();
            if spec.metadata.get("force_rebuild").map(String::as_str) == Some("true") {
                build_labels.insert("force_rebuild".to_string(), "true".to_string());
            }

            let build_options = BuildOptions {
                enable_auto_build: true,
                wait_for_completion: true,
                build_timeout_seconds: self.config.build_timeout_secs,
                tenant_id: tenant_id.clone(),
                suggested_asset_id: suggested_id.clone(),
                build_labels,
            };

            tracing::info!(
                vm_id = %vm_id,
                asset_id = %suggested_id,
                asset_kind = %kind,
                labels = ?labels,
                "querying assets"
            );

            let response = self
                .client
                .query_assets(*kind, labels, Some(&build_options))
                .await?;

            for build in &response.triggered_builds {
                if build.status == "failed" {
                    tracing::error!(
                        vm_id = %vm_id,
                        build_id = %build.build_id,
                        error = %build.error_message,
                        "automatic build failed"
                    );
                } else {
                    tracing::info!(
                        vm_id = %vm_id,
                        build_id = %build.build_id,
                        docker_image = %build.docker_image,
                        status = %build.status,
                        "automatic build triggered for missing asset"
                    );
                }
            }

            available.extend(response.assets);
        }

        tracing::info!(vm_id = %vm_id, available_count = available.len(), "retrieved available assets");

        let mapping = match_assets(&requirements, &available)?;

        let prepared = self
            .client
            .prepare_assets(&mapping.asset_ids, chroot_root, vm_id)
            .await?;
        tracing::info!(vm_id = %vm_id, asset_count = prepared.len(), "assets prepared");

        // The builder leaves metadata next to the original rootfs; the
        // service only materializes the image, so metadata rides along here.
        if let Err(e) = self.copy_metadata_files(vm_id, spec, chroot_root).await {
            tracing::warn!(vm_id = %vm_id, error = %e, "failed to copy metadata files");
        }

        Ok(Some(mapping))
    }

    /// Static fallback: copy the spec's literal paths into the chroot. The
    /// kernel lands as `vmlinux`, each disk keeps its basename except root
    /// devices which become `rootfs.ext4`, and an adjacent
    /// `<base>.metadata.json` rides along when present.
    async fn prepare_static(&self, vm_id: &str, spec: &VmSpec, chroot_root: &Path) -> Result<()> {
        if !spec.boot.kernel_path.is_empty() {
            let dst = chroot_root.join(KERNEL_IMAGE_NAME);
            copy_file(Path::new(&spec.boot.kernel_path), &dst).await?;
            tracing::info!(src = %spec.boot.kernel_path, dst = %dst.display(), "copied kernel to chroot");
        }

        for disk in &spec.storage {
            if disk.path.is_empty() {
                continue;
            }
            let src = Path::new(&disk.path);
            let file_name = if disk.is_root_device {
                ROOTFS_IMAGE_NAME.to_string()
            } else {
                src.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "disk.img".to_string())
            };
            let dst = chroot_root.join(&file_name);
            copy_file(src, &dst).await?;
            tracing::info!(src = %disk.path, dst = %dst.display(), "copied disk to chroot");

            if disk.is_root_device {
                if let Some(metadata_src) = adjacent_metadata_path(src) {
                    if metadata_src.exists() {
                        let metadata_dst = chroot_root
                            .join(metadata_src.file_name().expect("metadata path has file name"));
                        if let Err(e) = copy_file(&metadata_src, &metadata_dst).await {
                            tracing::warn!(
                                src = %metadata_src.display(),
                                dst = %metadata_dst.display(),
                                error = %e,
                                "failed to copy metadata file"
                            );
                        } else if let Some(metadata) = read_metadata_file(&metadata_src).await {
                            // Inject the command file while we are here so a
                            // later boot does not depend on the service.
                            if !metadata.full_command().is_empty() {
                                if let Err(e) = self
                                    .write_container_cmd(vm_id, chroot_root, &metadata)
                                    .await
                                {
                                    tracing::warn!(vm_id = %vm_id, error = %e, "failed to write container command file");
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn copy_metadata_files(
        &self,
        vm_id: &str,
        spec: &VmSpec,
        chroot_root: &Path,
    ) -> Result<()> {
        for disk in &spec.storage {
            if !disk.is_root_device || disk.path.is_empty() {
                continue;
            }
            let Some(metadata_src) = adjacent_metadata_path(Path::new(&disk.path)) else {
                continue;
            };
            if !metadata_src.exists() {
                tracing::debug!(
                    vm_id = %vm_id,
                    expected_metadata = %metadata_src.display(),
                    "no metadata file found for asset"
                );
                continue;
            }
            let dst = chroot_root.join("metadata.json");
            copy_file(&metadata_src, &dst).await?;
            tracing::info!(
                vm_id = %vm_id,
                src = %metadata_src.display(),
                dst = %dst.display(),
                "copied metadata file for asset"
            );
        }
        Ok(())
    }

    /// Load container metadata for a rootfs in the chroot. Looks for
    /// `<base>.metadata.json` first, then the service's `metadata.json`.
    /// Absence is not an error.
    pub async fn load_container_metadata(
        &self,
        chroot_root: &Path,
        rootfs_file_name: &str,
    ) -> Result<Option<ContainerMetadata>> {
        let base = rootfs_file_name
            .rsplit_once('.')
            .map(|(base, _)| base)
            .unwrap_or(rootfs_file_name);
        let primary = chroot_root.join(format!("{base}.metadata.json"));
        let fallback = chroot_root.join("metadata.json");

        let path = if primary.exists() {
            primary
        } else if fallback.exists() {
            fallback
        } else {
            tracing::debug!(
                primary_path = %primary.display(),
                fallback_path = %fallback.display(),
                "no metadata file found in either location"
            );
            return Ok(None);
        };

        let data = tokio::fs::read(&path).await.map_err(|source| Error::AssetIo {
            what: "read metadata".to_string(),
            path: path.clone(),
            source,
        })?;
        let metadata: ContainerMetadata =
            serde_json::from_slice(&data).map_err(|e| Error::AssetService {
                call: "load_container_metadata".to_string(),
                reason: format!("failed to parse {}: {e}", path.display()),
            })?;

        tracing::info!(
            image = %metadata.original_image,
            entrypoint_len = metadata.entrypoint.len(),
            cmd_len = metadata.command.len(),
            env_vars = metadata.env.len(),
            exposed_ports = metadata.exposed_ports.len(),
            "loaded container metadata"
        );
        Ok(Some(metadata))
    }

    /// Write `/container.cmd` (a JSON array of strings) into the rootfs
    /// image by loop-mounting it. The guest init reads this file instead of
    /// taking the command from the kernel line.
    pub async fn write_container_cmd(
        &self,
        vm_id: &str,
        chroot_root: &Path,
        metadata: &ContainerMetadata,
    ) -> Result<()> {
        let full_cmd = metadata.full_command();
        if full_cmd.is_empty() {
            return Err(Error::InvalidArgument {
                what: "container metadata".to_string(),
                reason: "no entrypoint or command found".to_string(),
            });
        }
        let cmd_json = serde_json::to_vec(&full_cmd).map_err(|e| Error::AssetService {
            call: "write_container_cmd".to_string(),
            reason: format!("failed to serialize command: {e}"),
        })?;

        let rootfs_path = chroot_root.join(ROOTFS_IMAGE_NAME);
        let mount_dir = std::env::temp_dir().join(format!("rootfs-mount-{vm_id}"));
        tokio::fs::create_dir_all(&mount_dir)
            .await
            .map_err(|source| Error::AssetIo {
                what: "create mount dir".to_string(),
                path: mount_dir.clone(),
                source,
            })?;

        let result = async {
            self.mount_ops.mount_loop(&rootfs_path, &mount_dir).await?;
            let cmd_path = mount_dir.join(CONTAINER_CMD_FILE);
            let write_result =
                tokio::fs::write(&cmd_path, &cmd_json)
                    .await
                    .map_err(|source| Error::AssetIo {
                        what: "write container.cmd".to_string(),
                        path: cmd_path.clone(),
                        source,
                    });
            // Unmount regardless of the write outcome.
            if let Err(e) = self.mount_ops.unmount(&mount_dir).await {
                tracing::warn!(vm_id = %vm_id, error = %e, "failed to unmount rootfs");
            }
            write_result.map(|()| cmd_path)
        }
        .await;

        let _ = tokio::fs::remove_dir_all(&mount_dir).await;

        let cmd_path = result?;
        tracing::info!(
            vm_id = %vm_id,
            path = %cmd_path.display(),
            command = %String::from_utf8_lossy(&cmd_json),
            "created container command file"
        );
        Ok(())
    }

    /// Acquire a lease per asset after a successful boot. Individual
    /// failures are logged and skipped so one bad asset does not strand the
    /// others.
    pub async fn acquire_leases(&self, vm_id: &str, mapping: &mut AssetMapping) {
        if mapping.asset_ids.is_empty() {
            return;
        }
        tracing::info!(
            vm_id = %vm_id,
            asset_count = mapping.asset_ids.len(),
            "acquiring asset leases"
        );
        for asset_id in mapping.asset_ids.clone() {
            match self.client.acquire_asset(&asset_id, vm_id).await {
                Ok(lease_id) => mapping.lease_ids.push(lease_id),
                Err(e) => {
                    tracing::error!(
                        vm_id = %vm_id,
                        asset_id = %asset_id,
                        error = %e,
                        "failed to acquire asset lease"
                    );
                }
            }
        }
        if !mapping.lease_ids.is_empty() {
            tracing::info!(
                vm_id = %vm_id,
                lease_count = mapping.lease_ids.len(),
                "acquired asset leases"
            );
        }
    }

    /// Release leases on delete, tolerating individual failures.
    pub async fn release_leases(&self, vm_id: &str, lease_ids: &[String]) {
        if lease_ids.is_empty() {
            return;
        }
        tracing::info!(vm_id = %vm_id, lease_count = lease_ids.len(), "releasing asset leases");
        for lease_id in lease_ids {
            if let Err(e) = self.client.release_asset(lease_id).await {
                tracing::error!(
                    vm_id = %vm_id,
                    lease_id = %lease_id,
                    error = %e,
                    "failed to release asset lease"
                );
            }
        }
    }
}

/// Match requirements to available assets by exact kind and exact label
/// equality. An unmatched required requirement fails the whole match.
fn match_assets(requirements: &[AssetRequirement], available: &[Asset]) -> Result<AssetMapping> {
    let mut mapping = AssetMapping::default();
    for requirement in requirements {
        let matched = available.iter().find(|asset| {
            asset.kind == requirement.kind
                && requirement
                    .labels
                    .iter()
                    .all(|(k, v)| asset.labels.get(k) == Some(v))
        });

        match matched {
            Some(asset) => mapping.asset_ids.push(asset.id.clone()),
            None if requirement.required => {
                return Err(Error::AssetUnmatched {
                    kind: requirement.kind.to_string(),
                    labels: serialize_labels(&requirement.labels),
                });
            }
            None => {}
        }
    }
    Ok(mapping)
}

fn serialize_labels(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

async fn read_metadata_file(path: &Path) -> Option<ContainerMetadata> {
    let data = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&data) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "unparseable container metadata");
            None
        }
    }
}

fn adjacent_metadata_path(rootfs_path: &Path) -> Option<PathBuf> {
    let file_name = rootfs_path.file_name()?.to_string_lossy();
    let base = file_name
        .rsplit_once('.')
        .map(|(base, _)| base.to_string())
        .unwrap_or_else(|| file_name.into_owned());
    Some(
        rootfs_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!("{base}.metadata.json")),
    )
}

async fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    tokio::fs::copy(src, dst)
        .await
        .map(drop)
        .map_err(|source| Error::AssetIo {
            what: format!("copy {}", src.display()),
            path: dst.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::types::{BootSpec, CpuSpec, MemorySpec, StorageSpec};
    use tempfile::TempDir;

    fn spec_with_image(image: Option<&str>) -> VmSpec {
        let mut options = BTreeMap::new();
        if let Some(image) = image {
            options.insert("docker_image".to_string(), image.to_string());
        }
        VmSpec {
            cpu: CpuSpec {
                vcpu_count: 1,
                max_vcpu_count: 0,
            },
            memory: MemorySpec {
                size_bytes: 128 * 1024 * 1024,
            },
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
                options,
            }],
            metadata: BTreeMap::new(),
        }
    }

    fn resolver(client: Arc<InMemoryAssetClient>) -> AssetResolver {
        AssetResolver::new(client, AssetConfig::default(), Arc::new(NoopMountOps))
    }

    #[test]
    fn deterministic_id_is_stable_and_sorted() {
        let mut ab = BTreeMap::new();
        ab.insert("a".to_string(), "1".to_string());
        ab.insert("b".to_string(), "2".to_string());

        let id = deterministic_asset_id(AssetKind::Rootfs, &ab);
        assert!(id.starts_with("asset-"));
        assert_eq!(id.len(), 6 + 16);

        // Insertion order cannot matter: BTreeMap sorts keys.
        let mut ba = BTreeMap::new();
        ba.insert("b".to_string(), "2".to_string());
        ba.insert("a".to_string(), "1".to_string());
        assert_eq!(id, deterministic_asset_id(AssetKind::Rootfs, &ba));

        assert_ne!(id, deterministic_asset_id(AssetKind::Kernel, &ab));
    }

    #[test]
    fn requirements_follow_spec_shape() {
        let resolver = resolver(Arc::new(InMemoryAssetClient::new()));
        let reqs = resolver.build_requirements(&spec_with_image(Some("nginx:latest")));
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].kind, AssetKind::Kernel);
        assert!(reqs[0].required);
        assert_eq!(reqs[1].kind, AssetKind::Rootfs);
        assert_eq!(
            reqs[1].labels.get("docker_image").map(String::as_str),
            Some("nginx:latest")
        );

        // docker_image falls back to the spec metadata
        let mut spec = spec_with_image(None);
        spec.metadata
            .insert("docker_image".to_string(), "redis:7".to_string());
        let reqs = resolver.build_requirements(&spec);
        assert_eq!(
            reqs[1].labels.get("docker_image").map(String::as_str),
            Some("redis:7")
        );
    }

    #[test]
    fn unmatched_required_requirement_fails() {
        let requirements = vec![AssetRequirement {
            kind: AssetKind::Rootfs,
            labels: BTreeMap::new(),
            required: true,
        }];
        let err = match_assets(&requirements, &[]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Dependency);
    }

    #[test]
    fn partial_label_matches_are_rejected() {
        let mut want = BTreeMap::new();
        want.insert("docker_image".to_string(), "nginx:latest".to_string());
        let requirements = vec![AssetRequirement {
            kind: AssetKind::Rootfs,
            labels: want,
            required: true,
        }];
        let mut have = BTreeMap::new();
        have.insert("docker_image".to_string(), "nginx:1.27".to_string());
        let available = vec![Asset {
            id: "asset-x".to_string(),
            kind: AssetKind::Rootfs,
            labels: have,
        }];
        assert!(match_assets(&requirements, &available).is_err());
    }

    #[tokio::test]
    async fn prepare_resolves_and_materializes() {
        let client = Arc::new(InMemoryAssetClient::new());
        client.register(Asset {
            id: "asset-kernel01".to_string(),
            kind: AssetKind::Kernel,
            labels: BTreeMap::new(),
        });
        let mut labels = BTreeMap::new();
        labels.insert("docker_image".to_string(), "nginx:latest".to_string());
        client.register(Asset {
            id: "asset-rootfs01".to_string(),
            kind: AssetKind::Rootfs,
            labels,
        });

        let dir = TempDir::new().unwrap();
        let chroot = dir.path().join("root");
        let resolver = resolver(client);
        let mapping = resolver
            .prepare("ud-0011223344556677", &spec_with_image(Some("nginx:latest")), &chroot)
            .await
            .unwrap()
            .expect("service available");

        assert_eq!(mapping.asset_ids.len(), 2);
        assert!(chroot.join(KERNEL_IMAGE_NAME).exists());
        assert!(chroot.join(ROOTFS_IMAGE_NAME).exists());
        assert!(mapping.lease_ids.is_empty());
    }

    #[tokio::test]
    async fn unavailable_service_falls_back_to_static_copy() {
        let client = Arc::new(InMemoryAssetClient::new());
        client.set_unavailable(true);

        let dir = TempDir::new().unwrap();
        let assets = dir.path().join("assets");
        std::fs::create_dir_all(&assets).unwrap();
        std::fs::write(assets.join("vmlinux"), b"kernel").unwrap();
        std::fs::write(assets.join("app.ext4"), b"rootfs").unwrap();

        let mut spec = spec_with_image(None);
        spec.boot.kernel_path = assets.join("vmlinux").to_string_lossy().into_owned();
        spec.storage[0].path = assets.join("app.ext4").to_string_lossy().into_owned();

        let chroot = dir.path().join("root");
        let resolver = resolver(client);
        let mapping = resolver
            .prepare("ud-0011223344556677", &spec, &chroot)
            .await
            .unwrap();

        assert!(mapping.is_none());
        assert_eq!(std::fs::read(chroot.join(KERNEL_IMAGE_NAME)).unwrap(), b"kernel");
        // root device is renamed to the standardized name
        assert_eq!(std::fs::read(chroot.join(ROOTFS_IMAGE_NAME)).unwrap(), b"rootfs");
    }

    #[tokio::test]
    async fn metadata_loading_prefers_base_name() {
        let dir = TempDir::new().unwrap();
        let chroot = dir.path().join("root");
        std::fs::create_dir_all(&chroot).unwrap();
        let metadata = ContainerMetadata {
            entrypoint: vec!["/docker-entrypoint.sh".to_string()],
            command: vec!["nginx".to_string(), "-g".to_string(), "daemon off;".to_string()],
            ..ContainerMetadata::default()
        };
        std::fs::write(
            chroot.join("rootfs.metadata.json"),
            serde_json::to_vec(&metadata).unwrap(),
        )
        .unwrap();

        let resolver = resolver(Arc::new(InMemoryAssetClient::new()));
        let loaded = resolver
            .load_container_metadata(&chroot, "rootfs.ext4")
            .await
            .unwrap()
            .expect("metadata present");
        assert_eq!(
            loaded.full_command(),
            vec!["/docker-entrypoint.sh", "nginx", "-g", "daemon off;"]
        );

        // absence is not an error
        let missing = resolver
            .load_container_metadata(&chroot, "other.ext4")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    /// Captures what was written into the "mounted" filesystem at unmount
    /// time, before the resolver removes the mountpoint.
    struct CapturingMountOps {
        captured: std::sync::Mutex<Option<Vec<u8>>>,
    }

    #[async_trait]
    impl MountOps for CapturingMountOps {
        async fn mount_loop(&self, _image: &Path, mountpoint: &Path) -> Result<()> {
            tokio::fs::create_dir_all(mountpoint).await.unwrap();
            Ok(())
        }

        async fn unmount(&self, mountpoint: &Path) -> Result<()> {
            if let Ok(data) = std::fs::read(mountpoint.join(CONTAINER_CMD_FILE)) {
                *self.captured.lock().unwrap() = Some(data);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn container_cmd_is_json_array() {
        let dir = TempDir::new().unwrap();
        let chroot = dir.path().join("root");
        std::fs::create_dir_all(&chroot).unwrap();
        std::fs::write(chroot.join(ROOTFS_IMAGE_NAME), b"image").unwrap();

        let mount_ops = Arc::new(CapturingMountOps {
            captured: std::sync::Mutex::new(None),
        });
        let resolver = AssetResolver::new(
            Arc::new(InMemoryAssetClient::new()),
            AssetConfig::default(),
            mount_ops.clone(),
        );

        let metadata = ContainerMetadata {
            entrypoint: vec!["/bin/sh".to_string()],
            command: vec!["-c".to_string(), "echo hi".to_string()],
            ..ContainerMetadata::default()
        };
        resolver
            .write_container_cmd("ud-0011223344556677", &chroot, &metadata)
            .await
            .unwrap();

        let written = mount_ops.captured.lock().unwrap().clone().expect("cmd written");
        let parsed: Vec<String> = serde_json::from_slice(&written).unwrap();
        assert_eq!(parsed, vec!["/bin/sh", "-c", "echo hi"]);

        let empty = ContainerMetadata::default();
        let err = resolver
            .write_container_cmd("ud-0011223344556677", &chroot, &empty)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn leases_acquired_after_boot_and_released_tolerantly() {
        let client = Arc::new(InMemoryAssetClient::new());
        let resolver = resolver(client.clone());

        let mut mapping = AssetMapping {
            asset_ids: vec!["asset-a".to_string(), "asset-b".to_string()],
            lease_ids: vec![],
        };
        resolver.acquire_leases("ud-0011223344556677", &mut mapping).await;
        assert_eq!(mapping.lease_ids.len(), 2);
        assert_eq!(client.outstanding_leases().len(), 2);

        client.set_fail_release(true);
        resolver
            .release_leases("ud-0011223344556677", &mapping.lease_ids)
            .await;
        // failures tolerated; nothing panicked and the engine keeps going
        assert_eq!(client.outstanding_leases().len(), 2);
    }
}
