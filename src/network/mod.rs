//! Multi-tenant VM networking.
//!
//! [`NetworkManager`] is the façade the lifecycle engine talks to. It owns
//! the tenant fabric (bridge mapping, /29 slots, persisted state), the port
//! allocator, the device plumber, and the firewall controller, and keeps
//! the registry of live VM network bindings.

pub mod devices;
pub mod fabric;
pub mod firewall;
pub mod netlink;
pub mod netns;
pub mod ports;
pub mod types;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;

use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::idgen::{DeviceNames, IdGenerator};
use crate::network::devices::{DevicePlumber, RateLimit};
use crate::network::fabric::FabricManager;
use crate::network::firewall::FirewallController;
use crate::network::netlink::{LinkOps, Scope};
use crate::network::ports::PortAllocator;
use crate::network::types::{PortMapping, Protocol, VmNetwork};

/// Network manager: one per host, shared by all VM operations.
pub struct NetworkManager {
    config: NetworkConfig,
    fabric: Arc<FabricManager>,
    ports: PortAllocator,
    plumber: DevicePlumber,
    firewall: Arc<FirewallController>,
    idgen: IdGenerator,
    link_ops: Arc<dyn LinkOps>,
    bindings: RwLock<HashMap<String, VmNetwork>>,
    /// Serializes binding creation so check-and-create is atomic.
    create_lock: tokio::sync::Mutex<()>,
    /// Dedicated lock so bridge verification does not starve VM operations.
    bridge_verified: tokio::sync::RwLock<HashMap<String, bool>>,
}

impl NetworkManager {
    /// Build a manager from configuration and capabilities.
    pub fn new(
        config: NetworkConfig,
        link_ops: Arc<dyn LinkOps>,
        firewall: Arc<FirewallController>,
    ) -> Self {
        tracing::info!(
            bridge_count = config.bridge_count,
            bridge_prefix = %config.bridge_prefix,
            vm_subnet = %config.vm_subnet,
            "creating network manager"
        );
        let fabric = Arc::new(FabricManager::new(
            config.bridge_count,
            &config.bridge_prefix,
            config.fabric_state_path.clone(),
        ));
        let ports = PortAllocator::new(config.port_range_start, config.port_range_end);
        let plumber = DevicePlumber::new(link_ops.clone());
        Self {
            config,
            fabric,
            ports,
            plumber,
            firewall,
            idgen: IdGenerator::new(),
            link_ops,
            bindings: RwLock::new(HashMap::new()),
            create_lock: tokio::sync::Mutex::new(()),
            bridge_verified: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    /// The tenant fabric manager.
    pub fn fabric(&self) -> &FabricManager {
        &self.fabric
    }

    /// Whether guest network configuration rides on the kernel command line.
    pub fn kernel_network_config_enabled(&self) -> bool {
        self.config.enable_kernel_network_config
    }

    /// Host-wide startup: IPv4 forwarding plus NAT and FORWARD rules for
    /// the VM subnet through the default-route interface.
    pub async fn initialize_host(&self) -> Result<()> {
        self.firewall.enable_ip_forwarding()?;
        let default_iface = self.link_ops.default_route_interface().await?;
        tracing::info!(interface = %default_iface, "identified default route interface");
        // The masquerade covers the whole VM subnet; forwarding accepts are
        // installed for bridge 0 and apply identically to every tenant
        // bridge through the shared prefix convention.
        for bridge_index in 0..self.config.bridge_count {
            let bridge = self.fabric.bridge_name(bridge_index);
            self.firewall
                .setup_nat(&self.config.vm_subnet, &bridge, &default_iface)
                .await?;
        }
        Ok(())
    }

    /// Remove host-wide rules installed by [`Self::initialize_host`].
    pub async fn shutdown_host(&self) {
        self.firewall.remove_host_rules().await;
    }

    /// Verify a tenant bridge exists and is up. Bridges are created by an
    /// external process at host boot; this only observes them, under the
    /// dedicated bridge lock with a few retries for link-state settling.
    pub async fn verify_bridge(&self, bridge_name: &str) -> Result<()> {
        {
            let verified = self.bridge_verified.read().await;
            if verified.get(bridge_name).copied().unwrap_or(false)
                && self
                    .link_ops
                    .link_is_up(Scope::Host, bridge_name)
                    .await
                    .unwrap_or(false)
            {
                return Ok(());
            }
        }

        let mut verified = self.bridge_verified.write().await;
        const MAX_RETRIES: usize = 5;
        for attempt in 1..=MAX_RETRIES {
            match self.link_ops.link_is_up(Scope::Host, bridge_name).await {
                Ok(true) => {
                    verified.insert(bridge_name.to_string(), true);
                    tracing::info!(bridge = %bridge_name, attempt, "verified bridge is ready");
                    return Ok(());
                }
                Ok(false) => {
                    tracing::debug!(bridge = %bridge_name, attempt, "bridge not yet up, retrying");
                }
                Err(e) => {
                    return Err(Error::LinkOp {
                        operation: "verify_bridge".to_string(),
                        device: bridge_name.to_string(),
                        output: format!("bridge not found, initialization may have failed: {e}"),
                    });
                }
            }
            if attempt < MAX_RETRIES {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        Err(Error::LinkOp {
            operation: "verify_bridge".to_string(),
            device: bridge_name.to_string(),
            output: format!("bridge not up after {MAX_RETRIES} attempts"),
        })
    }

    /// Create the complete network binding for a VM: namespace, TAP, veth
    /// pair, addressing, routes, and traffic mirroring. Idempotent per VM.
    /// Failures clean up in reverse construction order.
    pub async fn create_vm_network(&self, vm_id: &str, tenant_id: &str) -> Result<VmNetwork> {
        let _create = self.create_lock.lock().await;

        if let Some(existing) = self.bindings.read().unwrap().get(vm_id) {
            tracing::warn!(vm_id = %vm_id, ip = %existing.ip, "VM network already exists");
            return Ok(existing.clone());
        }

        tracing::info!(vm_id = %vm_id, tenant_id = %tenant_id, "creating VM network");

        let network_id = self.idgen.generate_network_id()?;
        let names = DeviceNames::for_network_id(&network_id);
        for name in [&names.tap, &names.veth_host, &names.veth_ns] {
            if let Err(e) = crate::idgen::validate_interface_name(name) {
                self.idgen.release(&network_id);
                return Err(e);
            }
        }

        let (ip, bridge_name) = match self.fabric.allocate_ip(tenant_id) {
            Ok(allocated) => allocated,
            Err(e) => {
                self.idgen.release(&network_id);
                return Err(e);
            }
        };
        tracing::info!(
            tenant_id = %tenant_id,
            ip = %ip,
            bridge = %bridge_name,
            "multi-bridge IP allocated"
        );

        let mac = self.fabric.generate_tenant_mac(tenant_id);
        let ns_name = names.namespace.clone();

        // Construction with reverse-order cleanup from here on.
        if let Err(e) = self.link_ops.netns_add(&ns_name).await {
            let _ = self.fabric.release_ip(tenant_id, ip);
            self.idgen.release(&network_id);
            return Err(e);
        }

        let bridge_index = self.fabric.bridge_for_tenant(tenant_id);
        let tenant_subnet = format!("172.16.{bridge_index}.0/24");
        let rate_limit = (self.config.enable_rate_limit && self.config.rate_limit_mbps > 0)
            .then_some(RateLimit {
                mbps: self.config.rate_limit_mbps,
            });

        if let Err(e) = self
            .plumber
            .setup_vm_network(&ns_name, &names, ip, &mac, &tenant_subnet, rate_limit)
            .await
        {
            self.plumber.teardown_vm_network(&ns_name, &names).await;
            let _ = self.fabric.release_ip(tenant_id, ip);
            self.idgen.release(&network_id);
            return Err(e);
        }

        // Routed point-to-point veths are never enslaved; this only fires
        // in legacy flat mode where the host leg carries no address.
        match self
            .plumber
            .attach_to_bridge_if_flat(&names.veth_host, &bridge_name)
            .await
        {
            Ok(true) => {
                tracing::info!(veth_host = %names.veth_host, bridge = %bridge_name, "VM attached to tenant bridge");
            }
            Ok(false) => {}
            Err(e) => {
                self.plumber.teardown_vm_network(&ns_name, &names).await;
                let _ = self.fabric.release_ip(tenant_id, ip);
                self.idgen.release(&network_id);
                return Err(e);
            }
        }

        let binding = VmNetwork {
            vm_id: vm_id.to_string(),
            network_id: network_id.clone(),
            tenant_id: tenant_id.to_string(),
            namespace: ns_name,
            tap_device: names.tap.clone(),
            veth_host: names.veth_host.clone(),
            veth_ns: names.veth_ns.clone(),
            ip,
            prefix_len: 29,
            gateway: devices::gateway_for(ip),
            mac,
            dns_servers: self.config.dns_servers.clone(),
            created_at: Utc::now().timestamp(),
            vlan_id: None,
            ipv6: None,
            routes: vec![],
        };

        self.bindings
            .write()
            .unwrap()
            .insert(vm_id.to_string(), binding.clone());

        tracing::info!(
            vm_id = %vm_id,
            tenant_id = %tenant_id,
            ip = %ip,
            mac = %binding.mac,
            tap = %binding.tap_device,
            namespace = %binding.namespace,
            network_id = %network_id,
            bridge = %bridge_name,
            "created VM network"
        );

        Ok(binding)
    }

    /// Tear down a VM's network binding. Missing bindings are fine; partial
    /// failures log and continue so delete always makes progress.
    pub async fn delete_vm_network(&self, vm_id: &str) -> Result<()> {
        let removed = self.bindings.write().unwrap().remove(vm_id);
        let binding = match removed {
            Some(binding) => binding,
            None => {
                tracing::info!(vm_id = %vm_id, "VM network already deleted");
                return Ok(());
            }
        };

        tracing::info!(vm_id = %vm_id, network_id = %binding.network_id, "deleting VM network");

        if let Err(e) = self.fabric.release_ip(&binding.tenant_id, binding.ip) {
            tracing::warn!(
                tenant_id = %binding.tenant_id,
                ip = %binding.ip,
                error = %e,
                "failed to release IP from fabric"
            );
        }

        let names = DeviceNames::for_network_id(&binding.network_id);
        self.plumber.teardown_vm_network(&binding.namespace, &names).await;

        if let Err(e) = self.plumber.verify_cleanup(vm_id, &names).await {
            tracing::warn!(vm_id = %vm_id, error = %e, "network cleanup verification failed");
        }

        self.idgen.release(&binding.network_id);

        tracing::info!(vm_id = %vm_id, ip = %binding.ip, "deleted VM network");
        Ok(())
    }

    /// The live binding for a VM.
    pub fn get_vm_network(&self, vm_id: &str) -> Result<VmNetwork> {
        self.bindings
            .read()
            .unwrap()
            .get(vm_id)
            .cloned()
            .ok_or_else(|| Error::VmNotFound {
                vm_id: vm_id.to_string(),
            })
    }

    /// Allocate host ports for the exposed ports of a VM and install the
    /// DNAT rules. Specs look like `"80"`, `"80/tcp"`, `"53/udp"`; invalid
    /// entries are skipped with a warning. Installation is atomic: any rule
    /// failure releases the ports and removes rules already added.
    pub async fn allocate_ports_for_vm(
        &self,
        vm_id: &str,
        exposed_ports: &[String],
    ) -> Result<Vec<PortMapping>> {
        let binding = self.get_vm_network(vm_id)?;

        let mut mappings = Vec::new();
        for spec in exposed_ports {
            let (port_part, proto_part) = match spec.split_once('/') {
                Some((p, proto)) => (p, proto),
                None => (spec.as_str(), "tcp"),
            };
            let container_port: u16 = match port_part.parse() {
                Ok(p) if p > 0 => p,
                _ => {
                    tracing::warn!(port_spec = %spec, "invalid port format");
                    continue;
                }
            };
            let Some(protocol) = Protocol::parse(&proto_part.to_ascii_lowercase()) else {
                tracing::warn!(port_spec = %spec, "invalid protocol");
                continue;
            };

            match self.ports.allocate(vm_id, container_port, protocol) {
                Ok(mapping) => mappings.push(mapping),
                Err(e) => {
                    self.ports.release_vm_ports(vm_id);
                    return Err(e);
                }
            }
        }

        if let Err(e) = self
            .firewall
            .install_port_forwarding(vm_id, binding.ip, &mappings)
            .await
        {
            self.ports.release_vm_ports(vm_id);
            return Err(e);
        }

        for mapping in &mappings {
            tracing::info!(
                vm_id = %vm_id,
                vm_ip = %binding.ip,
                container_port = mapping.container_port,
                host_port = mapping.host_port,
                protocol = %mapping.protocol,
                "allocated port mapping with forwarding rule"
            );
        }

        Ok(mappings)
    }

    /// Release every port a VM holds and remove its forwarding rules
    /// (best effort). Returns the released mappings.
    pub async fn release_vm_ports(&self, vm_id: &str) -> Vec<PortMapping> {
        let mappings = self.ports.release_vm_ports(vm_id);
        if mappings.is_empty() {
            return mappings;
        }

        if let Ok(binding) = self.get_vm_network(vm_id) {
            self.firewall
                .remove_port_forwarding(vm_id, binding.ip, &mappings)
                .await;
        }

        for mapping in &mappings {
            tracing::info!(
                vm_id = %vm_id,
                container_port = mapping.container_port,
                host_port = mapping.host_port,
                protocol = %mapping.protocol,
                "released port mapping"
            );
        }
        mappings
    }

    /// All mappings currently held by a VM.
    pub fn get_vm_ports(&self, vm_id: &str) -> Vec<PortMapping> {
        self.ports.get_vm_ports(vm_id)
    }

    /// Whether a host port is allocated.
    pub fn is_port_allocated(&self, host_port: u16) -> bool {
        self.ports.is_port_allocated(host_port)
    }

    /// (allocated, available) port counts.
    pub fn port_allocation_stats(&self) -> (usize, usize) {
        (self.ports.allocated_count(), self.ports.available_count())
    }

    /// Bring a VM's interfaces down without touching allocations.
    pub async fn shutdown_vm_interfaces(&self, vm_id: &str) -> Result<()> {
        let binding = self.get_vm_network(vm_id)?;
        self.plumber
            .shutdown_interfaces(&binding.namespace, &binding.tap_device)
            .await
    }

    /// Bring a VM's interfaces back up.
    pub async fn startup_vm_interfaces(&self, vm_id: &str) -> Result<()> {
        let binding = self.get_vm_network(vm_id)?;
        self.plumber
            .startup_interfaces(&binding.namespace, &binding.tap_device)
            .await
    }
}
