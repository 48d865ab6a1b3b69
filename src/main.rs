//! metald daemon entrypoint.
//!
//! Wires the production capabilities together: the fabric and network
//! manager over the `ip`/`tc`/`iptables` binaries, the Firecracker
//! launcher, the asset resolver, and the in-memory repository, then
//! restores persisted VMs and waits for shutdown.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use metald::asset::{AssetResolver, InMemoryAssetClient, LoopMountOps};
use metald::config::Config;
use metald::network::firewall::{FirewallController, IptablesOps};
use metald::network::netlink::IpCommandOps;
use metald::network::NetworkManager;
use metald::repository::MemoryVmRepository;
use metald::service::VmService;
use metald::vmm::{FirecrackerLauncher, VmEngine};

#[derive(Debug, Parser)]
#[command(name = "metald", about = "Per-host microVM provisioner")]
struct Args {
    /// Skip host firewall/NAT initialization (for unprivileged runs)
    #[arg(long, env = "METALD_SKIP_HOST_INIT")]
    skip_host_init: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        bridge_count = config.network.bridge_count,
        bridge_prefix = %config.network.bridge_prefix,
        base_dir = %config.vmm.base_dir.display(),
        "starting metald"
    );

    let link_ops = Arc::new(IpCommandOps);
    let firewall = Arc::new(FirewallController::new(Arc::new(IptablesOps)));
    let network = Arc::new(NetworkManager::new(
        config.network.clone(),
        link_ops,
        firewall,
    ));

    if args.skip_host_init {
        tracing::warn!("skipping host firewall/NAT initialization");
    } else {
        network
            .initialize_host()
            .await
            .context("host network initialization failed")?;

        // Bridges are created at host boot by a separate unit; verify they
        // came up, but do not refuse to start over a missing one.
        for bridge_index in 0..config.network.bridge_count {
            let bridge = format!("{}-{}", config.network.bridge_prefix, bridge_index);
            if let Err(e) = network.verify_bridge(&bridge).await {
                tracing::warn!(bridge = %bridge, error = %e, "tenant bridge not ready");
            }
        }
    }

    // Without a connected asset service the resolver's probe must fail so
    // that VM creation takes the static copying path.
    let asset_client = Arc::new(InMemoryAssetClient::new());
    asset_client.set_unavailable(true);
    let assets = Arc::new(AssetResolver::new(
        asset_client,
        config.asset.clone(),
        Arc::new(LoopMountOps),
    ));
    let repo = Arc::new(MemoryVmRepository::new());
    let launcher = Arc::new(FirecrackerLauncher::new(config.vmm.clone()));

    let engine = Arc::new(VmEngine::new(
        config.vmm.clone(),
        network.clone(),
        assets,
        repo,
        launcher,
    ));
    engine
        .initialize()
        .await
        .context("failed to restore VMs from repository")?;

    let _service = VmService::new(engine.clone());
    tracing::info!("metald ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    engine.shutdown().await;
    network.shutdown_host().await;
    tracing::info!("metald stopped");
    Ok(())
}
