//! Shared harness for lifecycle integration tests.
//!
//! Builds the whole stack over fake capabilities so create/boot/delete run
//! end to end without namespaces, iptables, or a VMM binary.

use std::collections::BTreeMap;
use std::sync::Arc;

use tempfile::TempDir;

use metald::asset::{Asset, AssetKind, AssetResolver, InMemoryAssetClient, NoopMountOps};
use metald::config::{AssetConfig, NetworkConfig, VmmConfig};
use metald::network::firewall::fake::FakeFirewallOps;
use metald::network::firewall::FirewallController;
use metald::network::netlink::fake::FakeLinkOps;
use metald::network::NetworkManager;
use metald::repository::MemoryVmRepository;
use metald::service::VmService;
use metald::vmm::machine::fake::FakeVmmLauncher;
use metald::vmm::types::{BootSpec, CpuSpec, MemorySpec, StorageSpec};
use metald::{VmEngine, VmSpec};

/// The assembled stack plus every fake for assertions.
pub struct Harness {
    pub dir: TempDir,
    pub service: VmService,
    pub engine: Arc<VmEngine>,
    pub network: Arc<NetworkManager>,
    pub repo: Arc<MemoryVmRepository>,
    pub launcher: Arc<FakeVmmLauncher>,
    pub asset_client: Arc<InMemoryAssetClient>,
    pub link_ops: Arc<FakeLinkOps>,
    pub firewall_ops: Arc<FakeFirewallOps>,
}

impl Harness {
    /// Fresh stack over a fresh temp dir.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let repo = Arc::new(MemoryVmRepository::new());
        Self::with_parts(dir, repo, Arc::new(FakeVmmLauncher::new()))
    }

    /// Stack sharing a directory, repository, and launcher with a previous
    /// instance, simulating a service restart on the same host.
    pub fn with_parts(
        dir: TempDir,
        repo: Arc<MemoryVmRepository>,
        launcher: Arc<FakeVmmLauncher>,
    ) -> Self {
        let link_ops = Arc::new(FakeLinkOps::new());
        let firewall_ops = Arc::new(FakeFirewallOps::new());
        let firewall = Arc::new(FirewallController::with_paths(
            firewall_ops.clone(),
            dir.path().join("ip_forward"),
            dir.path().join("sysctl.conf"),
        ));
        let network_config = NetworkConfig {
            fabric_state_path: dir.path().join("fabric.json"),
            enable_rate_limit: false,
            ..NetworkConfig::default()
        };
        let network = Arc::new(NetworkManager::new(
            network_config,
            link_ops.clone(),
            firewall,
        ));

        let asset_client = Arc::new(InMemoryAssetClient::new());
        asset_client.register(Asset {
            id: "asset-kernel01".to_string(),
            kind: AssetKind::Kernel,
            labels: BTreeMap::new(),
        });
        asset_client.register(Asset {
            id: "asset-rootfs01".to_string(),
            kind: AssetKind::Rootfs,
            labels: BTreeMap::new(),
        });
        let assets = Arc::new(AssetResolver::new(
            asset_client.clone(),
            AssetConfig::default(),
            Arc::new(NoopMountOps),
        ));

        let vmm_config = VmmConfig {
            base_dir: dir.path().join("vms"),
            chroot_base_dir: dir.path().join("jailer"),
            ..VmmConfig::default()
        };
        let engine = Arc::new(VmEngine::new(
            vmm_config,
            network.clone(),
            assets,
            repo.clone(),
            launcher.clone(),
        ));

        Self {
            dir,
            service: VmService::new(engine.clone()),
            engine,
            network,
            repo,
            launcher,
            asset_client,
            link_ops,
            firewall_ops,
        }
    }

    /// A minimal valid spec pointing at asset paths under the harness dir.
    pub fn spec(&self) -> VmSpec {
        VmSpec {
            cpu: CpuSpec {
                vcpu_count: 1,
                max_vcpu_count: 0,
            },
            memory: MemorySpec {
                size_bytes: 128 * 1024 * 1024,
            },
            boot: BootSpec {
                kernel_path: self
                    .dir
                    .path()
                    .join("assets/vmlinux")
                    .to_string_lossy()
                    .into_owned(),
                initrd_path: String::new(),
                kernel_args: String::new(),
            },
            storage: vec![StorageSpec {
                id: String::new(),
                path: self
                    .dir
                    .path()
                    .join("assets/rootfs.ext4")
                    .to_string_lossy()
                    .into_owned(),
                is_root_device: true,
                read_only: false,
                options: BTreeMap::new(),
            }],
            metadata: BTreeMap::new(),
        }
    }

    /// Drop container metadata next to the spec's rootfs so the resolver
    /// copies it into the chroot during create.
    pub fn write_container_metadata(&self, metadata: &serde_json::Value) {
        let assets = self.dir.path().join("assets");
        std::fs::create_dir_all(&assets).expect("assets dir");
        std::fs::write(assets.join("rootfs.ext4"), b"rootfs").expect("rootfs");
        std::fs::write(assets.join("vmlinux"), b"kernel").expect("kernel");
        std::fs::write(
            assets.join("rootfs.metadata.json"),
            serde_json::to_vec(metadata).expect("metadata json"),
        )
        .expect("metadata");
    }
}
