//! End-to-end lifecycle tests over fake capabilities.
//!
//! Covers the create -> boot -> delete happy path with metadata-exposed
//! ports, restart survival of a paused VM (recreate on resume), and the
//! resource-cleanup invariants after delete.

mod support;

use metald::repository::VmRepository;
use metald::service::RequestContext;
use metald::VmState;
use support::Harness;

fn nginx_metadata() -> serde_json::Value {
    serde_json::json!({
        "entrypoint": ["/docker-entrypoint.sh"],
        "command": ["nginx", "-g", "daemon off;"],
        "env": {"APP_MODE": "production"},
        "working_dir": "/srv",
        "exposed_ports": ["80/tcp"],
        "original_image": "nginx:latest"
    })
}

/// Create -> boot -> delete with one exposed port: the host port comes
/// from the configured ephemeral range, a DNAT rule is installed, the
/// repository row carries the mappings JSON, and delete removes the rule
/// and tombstones the record.
#[tokio::test]
async fn create_boot_delete_happy_path() {
    let h = Harness::new();
    h.write_container_metadata(&nginx_metadata());
    let ctx = RequestContext::new().with_member("workspace_id", "ws_A");

    let vm_id = h.service.create_vm(&ctx, h.spec()).await.expect("create");
    assert!(vm_id.starts_with("ud-"));
    assert_eq!(vm_id.len(), 19);

    let record = h.service.vm_info(&vm_id).await.expect("info");
    assert_eq!(record.state, VmState::Created);
    assert_eq!(record.tenant_id, "ws_A");
    let network = record.network.clone().expect("binding");
    assert_eq!(network.prefix_len, 29);

    h.service.boot_vm(&vm_id).await.expect("boot");

    let record = h.service.vm_info(&vm_id).await.expect("info");
    assert_eq!(record.state, VmState::Running);
    assert_eq!(record.port_mappings.len(), 1);
    let mapping = &record.port_mappings[0];
    assert_eq!(mapping.container_port, 80);
    assert!(mapping.host_port >= 32768);

    // DNAT rule installed for the mapping
    let dnat = format!(
        "--dport {} -j DNAT --to-destination {}:80",
        mapping.host_port, network.ip
    );
    assert!(
        h.firewall_ops.recorded().iter().any(|rule| rule.contains(&dnat)),
        "expected DNAT rule for {dnat}"
    );

    // repository row carries the mappings blob and the running state
    let row = h.repo.get_vm(&vm_id).await.expect("row");
    assert_eq!(row.state, VmState::Running);
    assert!(row.port_mappings_json.contains(&mapping.host_port.to_string()));

    // leases held while running
    assert_eq!(h.asset_client.outstanding_leases().len(), 2);

    let host_port = mapping.host_port;
    h.service.delete_vm(&vm_id).await.expect("delete");

    // tombstoned, rule removed, ports freed, leases released
    let row = h.repo.get_vm(&vm_id).await.expect("row");
    assert_eq!(row.state, VmState::Deleted);
    assert!(h
        .firewall_ops
        .recorded()
        .iter()
        .any(|rule| rule.contains("-D PREROUTING") && rule.contains(&format!("--dport {host_port}"))));
    assert!(!h.network.is_port_allocated(host_port));
    assert!(h.asset_client.outstanding_leases().is_empty());

    // network devices and namespace torn down
    let names = [
        format!("tap_{}", network.network_id),
        format!("vh_{}", network.network_id),
    ];
    for device in names {
        assert!(h
            .link_ops
            .recorded()
            .iter()
            .any(|c| c.contains(&format!("ip link del {device}"))));
    }
    assert!(h
        .link_ops
        .recorded()
        .iter()
        .any(|c| c.contains(&format!("ip netns delete vn_{}", network.network_id))));

    // fabric slot count back to zero
    assert_eq!(
        h.network.fabric().tenant_info("ws_A").expect("tenant").vm_count,
        0
    );
}

/// Tenant mapping per the deterministic layout: with eight bridges,
/// `ws_A` hashes to bridge 3, the bridge is named `br-vms-3`, and the
/// generated MAC encodes that bridge index.
#[tokio::test]
async fn tenant_mapping_is_deterministic() {
    let h = Harness::new();
    let fabric = h.network.fabric();

    assert_eq!(fabric.bridge_for_tenant("ws_A"), 3);
    assert_eq!(fabric.bridge_name(3), "br-vms-3");

    let mac = fabric.generate_tenant_mac("ws_A");
    assert!(mac.starts_with("02:03:4B:"), "unexpected MAC {mac}");
    assert_eq!(metald::network::fabric::parse_tenant_mac(&mac).unwrap(), 3);
}

/// A paused VM whose VMM died with the host is not resurrected at engine
/// startup; the next resume triggers recreation (assets and network
/// rebuilt, VMM started and immediately paused) and then runs.
#[tokio::test]
async fn paused_vm_survives_restart_via_recreate() {
    let h = Harness::new();
    h.write_container_metadata(&nginx_metadata());
    let ctx = RequestContext::new().with_member("workspace_id", "ws_A");

    let vm_id = h.service.create_vm(&ctx, h.spec()).await.expect("create");
    h.service.boot_vm(&vm_id).await.expect("boot");
    h.service.pause_vm(&vm_id).await.expect("pause");
    assert_eq!(h.launcher.launch_count(), 1);

    h.engine.shutdown().await;

    // host restart: processes gone, sockets stale
    h.launcher.kill_all();
    let Harness { dir, repo, launcher, .. } = h;
    let h2 = Harness::with_parts(dir, repo, launcher);
    h2.engine.initialize().await.expect("restore");

    // restored, still paused, and not resurrected automatically
    let record = h2.service.vm_info(&vm_id).await.expect("restored record");
    assert_eq!(record.state, VmState::Paused);
    assert_eq!(h2.launcher.launch_count(), 1);

    // resume finds the socket dead and recreates: new launch, immediate
    // pause, then the resume brings it to running
    h2.service.resume_vm(&vm_id).await.expect("resume");
    assert_eq!(h2.launcher.launch_count(), 2);
    let record = h2.service.vm_info(&vm_id).await.expect("record");
    assert_eq!(record.state, VmState::Running);
    assert!(record.network.is_some(), "network rebuilt during recreate");

    let handle = h2.launcher.handle(&vm_id).expect("fake handle");
    assert!(handle.pause_calls.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    assert!(handle.resume_calls.load(std::sync::atomic::Ordering::SeqCst) >= 1);
}

/// A running VM reconnects to its preserved socket across an engine
/// restart without any new VMM launch.
#[tokio::test]
async fn running_vm_reconnects_across_restart() {
    let h = Harness::new();
    h.write_container_metadata(&nginx_metadata());
    let ctx = RequestContext::new().with_member("workspace_id", "ws_A");

    let vm_id = h.service.create_vm(&ctx, h.spec()).await.expect("create");
    h.service.boot_vm(&vm_id).await.expect("boot");

    h.engine.shutdown().await;

    // the socket stays live (engine shutdown preserves VMs)
    let Harness { dir, repo, launcher, .. } = h;
    let h2 = Harness::with_parts(dir, repo, launcher);
    h2.engine.initialize().await.expect("restore");

    let record = h2.service.vm_info(&vm_id).await.expect("record");
    assert_eq!(record.state, VmState::Running);
    assert_eq!(h2.launcher.launch_count(), 1, "no relaunch needed");
}

/// Created records are skipped at startup: no process ever existed.
#[tokio::test]
async fn created_vms_are_not_restored() {
    let h = Harness::new();
    h.write_container_metadata(&nginx_metadata());
    let ctx = RequestContext::new();

    let vm_id = h.service.create_vm(&ctx, h.spec()).await.expect("create");

    let Harness { dir, repo, launcher, .. } = h;
    let h2 = Harness::with_parts(dir, repo, launcher);
    h2.engine.initialize().await.expect("restore");

    let err = h2.service.vm_info(&vm_id).await.unwrap_err();
    assert_eq!(err.kind(), metald::ErrorKind::NotFound);
    // the repository row is still there, untouched
    assert_eq!(h2.repo.get_vm(&vm_id).await.unwrap().state, VmState::Created);

    // delete stays permitted: the row tombstones even without a registry
    // entry
    h2.service.delete_vm(&vm_id).await.expect("delete");
    assert_eq!(h2.repo.get_vm(&vm_id).await.unwrap().state, VmState::Deleted);
}

/// The tenant /29 slot admits five VMs; the sixth create fails with
/// ResourceExhausted and rolls everything back.
#[tokio::test]
async fn sixth_vm_in_tenant_slot_is_rejected() {
    let h = Harness::new();
    h.write_container_metadata(&nginx_metadata());
    let ctx = RequestContext::new().with_member("workspace_id", "ws_crowded");

    for _ in 0..5 {
        h.service.create_vm(&ctx, h.spec()).await.expect("create");
    }
    let err = h.service.create_vm(&ctx, h.spec()).await.unwrap_err();
    assert_eq!(err.kind(), metald::ErrorKind::ResourceExhausted);
    assert_eq!(
        h.network.fabric().tenant_info("ws_crowded").unwrap().vm_count,
        5
    );
}

/// Metrics for a booted VM read from the FIFO path; a silent stream is a
/// zero snapshot, not an error.
#[tokio::test]
async fn metrics_read_is_never_an_error() {
    let h = Harness::new();
    h.write_container_metadata(&nginx_metadata());
    let ctx = RequestContext::new();

    let vm_id = h.service.create_vm(&ctx, h.spec()).await.expect("create");
    h.service.boot_vm(&vm_id).await.expect("boot");

    let snapshot = h.service.vm_metrics(&vm_id).await.expect("metrics");
    assert_eq!(snapshot.disk_read_bytes, 0);
    assert!(snapshot.timestamp > 0);
}
