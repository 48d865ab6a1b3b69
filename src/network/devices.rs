//! VM device construction and teardown.
//!
//! For a VM with address X in a /29 with base B:
//! the TAP lives beside the namespace-side veth and the two mirror each
//! other's frames through ingress qdiscs with mirred redirects. No Linux
//! bridge is used on the VM side; the host-side veth carries the slot
//! gateway B+1/29 and routes the /29. Teardown deletes the namespace first
//! (which clears every interface inside it), then whatever survived on the
//! host.

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::idgen::DeviceNames;
use crate::network::netlink::{LinkOps, Scope};

/// Rate limit parameters for the host veth shaper.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    /// Megabits per second.
    pub mbps: u32,
}

impl RateLimit {
    /// Token rate in bytes per second.
    pub fn rate_bytes_per_sec(&self) -> u64 {
        u64::from(self.mbps) * 125_000
    }

    /// Burst allowance, a tenth of the rate.
    pub fn burst_bytes(&self) -> u64 {
        self.rate_bytes_per_sec() / 10
    }

    /// Queue limit.
    pub fn limit_bytes(&self) -> u64 {
        32 * 1024
    }
}

/// Device plumber: builds and tears down the per-VM namespace, TAP, veth
/// pair, addressing, routes, and traffic mirroring.
pub struct DevicePlumber {
    ops: Arc<dyn LinkOps>,
}

impl DevicePlumber {
    /// Create a plumber over a link-operations capability.
    pub fn new(ops: Arc<dyn LinkOps>) -> Self {
        Self { ops }
    }

    /// Build the complete device set for a VM.
    ///
    /// `tenant_subnet` (the bridge /24) gets a route through the veth inside
    /// the namespace so the VM can reach its tenant's other slots.
    pub async fn setup_vm_network(
        &self,
        ns_name: &str,
        names: &DeviceNames,
        ip: Ipv4Addr,
        mac: &str,
        tenant_subnet: &str,
        rate_limit: Option<RateLimit>,
    ) -> Result<()> {
        tracing::info!(
            namespace = %ns_name,
            tap = %names.tap,
            veth_host = %names.veth_host,
            veth_ns = %names.veth_ns,
            ip = %ip,
            mac = %mac,
            tenant_subnet = %tenant_subnet,
            "setting up VM networking devices"
        );

        // TAP first, in the host namespace, so the VMM can claim it.
        self.ops.create_tap(Scope::Host, &names.tap).await?;
        self.ops.link_set_up(Scope::Host, &names.tap).await?;
        // The VMM runs inside the namespace, so the TAP follows the veth leg.
        self.ops.move_to_netns(&names.tap, ns_name).await?;

        self.ops.create_veth(&names.veth_host, &names.veth_ns).await?;
        self.ops.move_to_netns(&names.veth_ns, ns_name).await?;

        self.configure_namespace(ns_name, names, ip, mac, tenant_subnet)
            .await?;

        // Host side: bring the veth up and give it the slot gateway so the
        // host routes the /29.
        self.ops.link_set_up(Scope::Host, &names.veth_host).await?;
        let gateway = gateway_for(ip);
        self.ops
            .addr_add(Scope::Host, &names.veth_host, &format!("{gateway}/29"))
            .await?;
        tracing::info!(
            veth = %names.veth_host,
            gateway_ip = %gateway,
            "configured gateway IP on host veth"
        );

        if let Some(limit) = rate_limit {
            self.apply_rate_limit(&names.veth_host, limit).await;
        }

        tracing::info!(
            tap = %names.tap,
            veth_host = %names.veth_host,
            namespace = %ns_name,
            ip = %ip,
            "VM networking setup completed"
        );
        Ok(())
    }

    /// Configure the namespace interior: veth address, MAC, loopback,
    /// default route, tenant route, and TAP mirroring.
    async fn configure_namespace(
        &self,
        ns_name: &str,
        names: &DeviceNames,
        ip: Ipv4Addr,
        mac: &str,
        tenant_subnet: &str,
    ) -> Result<()> {
        let scope = Scope::ns(ns_name);

        self.ops
            .addr_add(scope.clone(), &names.veth_ns, &format!("{ip}/29"))
            .await?;
        if !mac.is_empty() {
            self.ops
                .link_set_mac(scope.clone(), &names.veth_ns, mac)
                .await?;
        }
        self.ops.link_set_up(scope.clone(), &names.veth_ns).await?;
        self.ops.link_set_up(scope.clone(), "lo").await?;
        self.ops.link_set_up(scope.clone(), &names.tap).await?;

        let gateway = gateway_for(ip);
        if let Err(e) = self
            .ops
            .route_add_default(scope.clone(), &gateway.to_string())
            .await
        {
            tracing::warn!(gateway = %gateway, error = %e, "failed to add default route (may already exist)");
        }

        if !tenant_subnet.is_empty() {
            if let Err(e) = self
                .ops
                .route_add_dev(scope.clone(), tenant_subnet, &names.veth_ns)
                .await
            {
                tracing::warn!(subnet = %tenant_subnet, error = %e, "failed to add tenant subnet route (may already exist)");
            }
        }

        // Frame mirroring: ingress of each device redirected to the other's
        // egress. This is the bridging primitive between the TAP and veth.
        tracing::info!(tap = %names.tap, veth = %names.veth_ns, "bridging TAP to veth using mirred redirect");
        self.ops.add_ingress_qdisc(scope.clone(), &names.tap).await?;
        self.ops.add_ingress_qdisc(scope.clone(), &names.veth_ns).await?;
        self.ops
            .add_mirred_redirect(scope.clone(), &names.tap, &names.veth_ns)
            .await?;
        self.ops
            .add_mirred_redirect(scope, &names.veth_ns, &names.tap)
            .await?;

        Ok(())
    }

    /// Attach the host veth to the tenant bridge, legacy flat mode only:
    /// point-to-point veths carrying a host IP are routed, never enslaved.
    pub async fn attach_to_bridge_if_flat(&self, veth_host: &str, bridge: &str) -> Result<bool> {
        if self.ops.has_address(Scope::Host, veth_host).await? {
            return Ok(false);
        }
        self.ops.attach_to_bridge(veth_host, bridge).await?;
        Ok(true)
    }

    async fn apply_rate_limit(&self, dev: &str, limit: RateLimit) {
        match self
            .ops
            .add_tbf_qdisc(
                Scope::Host,
                dev,
                limit.rate_bytes_per_sec(),
                limit.burst_bytes(),
                limit.limit_bytes(),
            )
            .await
        {
            Ok(()) => {
                tracing::info!(
                    device = %dev,
                    mbps = limit.mbps,
                    rate_bytes_per_sec = limit.rate_bytes_per_sec(),
                    "applied rate limit to interface"
                );
            }
            Err(e) => {
                tracing::warn!(device = %dev, mbps = limit.mbps, error = %e, "failed to add rate limit qdisc");
            }
        }
    }

    /// Tear down everything for a VM. The namespace goes first, taking its
    /// interfaces with it; the host-side veth and TAP are deleted only if
    /// they survived.
    pub async fn teardown_vm_network(&self, ns_name: &str, names: &DeviceNames) {
        self.ops.netns_delete(ns_name).await;

        if self.ops.link_exists(Scope::Host, &names.veth_host).await {
            if let Err(e) = self.ops.link_delete(Scope::Host, &names.veth_host).await {
                tracing::warn!(device = %names.veth_host, error = %e, "failed to delete veth pair");
            } else {
                tracing::info!(device = %names.veth_host, "deleted veth pair");
            }
        }

        if self.ops.link_exists(Scope::Host, &names.tap).await {
            if let Err(e) = self.ops.link_delete(Scope::Host, &names.tap).await {
                tracing::warn!(device = %names.tap, error = %e, "failed to delete TAP device");
            } else {
                tracing::info!(device = %names.tap, "deleted TAP device");
            }
        }
    }

    /// Verify nothing remains after teardown; reports every leak at once.
    pub async fn verify_cleanup(&self, vm_id: &str, names: &DeviceNames) -> Result<()> {
        let mut issues = Vec::new();
        if self.ops.link_exists(Scope::Host, &names.tap).await {
            issues.push(format!("TAP device {} still exists", names.tap));
        }
        if self.ops.link_exists(Scope::Host, &names.veth_host).await {
            issues.push(format!("veth device {} still exists", names.veth_host));
        }
        if self.ops.netns_exists(&names.namespace).await {
            issues.push(format!("namespace {} still exists", names.namespace));
        }

        if !issues.is_empty() {
            return Err(Error::Namespace {
                name: names.namespace.clone(),
                reason: format!(
                    "cleanup verification failed for VM {vm_id}: {}",
                    issues.join(", ")
                ),
            });
        }

        tracing::info!(
            vm_id = %vm_id,
            tap = %names.tap,
            veth = %names.veth_host,
            namespace = %names.namespace,
            "network cleanup verified"
        );
        Ok(())
    }

    /// Bring every non-loopback link in the namespace down and mirror the
    /// action on the host TAP, making a paused VM non-pingable without
    /// touching allocations.
    pub async fn shutdown_interfaces(&self, ns_name: &str, tap: &str) -> Result<()> {
        if self.ops.link_exists(Scope::Host, tap).await {
            if let Err(e) = self.ops.link_set_down(Scope::Host, tap).await {
                tracing::warn!(device = %tap, error = %e, "failed to bring down TAP device");
            }
        }
        let scope = Scope::ns(ns_name);
        for name in self.ops.list_link_names(scope.clone()).await? {
            if name == "lo" {
                continue;
            }
            if let Err(e) = self.ops.link_set_down(scope.clone(), &name).await {
                tracing::warn!(device = %name, namespace = %ns_name, error = %e, "failed to bring down interface in namespace");
            }
        }
        tracing::info!(namespace = %ns_name, "VM network interfaces shut down");
        Ok(())
    }

    /// Inverse of [`Self::shutdown_interfaces`].
    pub async fn startup_interfaces(&self, ns_name: &str, tap: &str) -> Result<()> {
        if self.ops.link_exists(Scope::Host, tap).await {
            if let Err(e) = self.ops.link_set_up(Scope::Host, tap).await {
                tracing::warn!(device = %tap, error = %e, "failed to bring up TAP device");
            }
        }
        let scope = Scope::ns(ns_name);
        for name in self.ops.list_link_names(scope.clone()).await? {
            if name == "lo" {
                continue;
            }
            if let Err(e) = self.ops.link_set_up(scope.clone(), &name).await {
                tracing::warn!(device = %name, namespace = %ns_name, error = %e, "failed to bring up interface in namespace");
            }
        }
        tracing::info!(namespace = %ns_name, "VM network interfaces brought up");
        Ok(())
    }
}

/// Gateway of the /29 slot containing `ip`: slot base plus one.
pub fn gateway_for(ip: Ipv4Addr) -> Ipv4Addr {
    let o = ip.octets();
    Ipv4Addr::new(o[0], o[1], o[2], (o[3] / 8) * 8 + 1)
}
