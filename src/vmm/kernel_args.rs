//! Kernel command-line composition.
//!
//! Merges the caller's base command line with guest network configuration
//! and container metadata. The container command itself never rides on the
//! kernel line; the guest init reads it from `/container.cmd` inside the
//! root filesystem, which sidesteps every quoting problem spaces would
//! cause here.

use crate::asset::ContainerMetadata;
use crate::constants::GUEST_INIT_PATH;
use crate::network::types::VmNetwork;

/// Caller-supplied token prefixes that are preserved verbatim.
const PRESERVED_PREFIXES: [&str; 5] = ["console=", "reboot=", "panic=", "pci=", "i8042."];

/// Default token set used when the caller preserved nothing.
const DEFAULT_PARAMS: [&str; 10] = [
    "console=ttyS0,115200",
    "reboot=k",
    "panic=1",
    "pci=off",
    "i8042.noaux",
    "i8042.nomux",
    "i8042.nopnp",
    "i8042.dumbkbd",
    "root=/dev/vda",
    "rw",
];

/// Network token prefixes replaced when network injection is enabled.
const NETWORK_PREFIXES: [&str; 5] = ["ip=", "nameserver=", "route=", "ipv6=", "vlan="];

/// Compose kernel arguments from container metadata.
///
/// Preserves the caller's console/reboot/panic/pci/i8042 tokens (or
/// supplies the default set), forces the verbose-logging tokens, and, when
/// metadata is present and the caller set no `init=`, adds sanitized
/// `env.K=V` tokens, the working directory, and the guest init.
pub fn build_with_metadata(base_args: &str, metadata: Option<&ContainerMetadata>) -> String {
    let mut has_init = false;
    let mut params: Vec<String> = Vec::new();

    for token in base_args.split_whitespace() {
        if token.starts_with("init=") {
            has_init = true;
        }
        if PRESERVED_PREFIXES
            .iter()
            .any(|prefix| token.starts_with(prefix))
        {
            params.push(token.to_string());
        }
    }

    if params.is_empty() {
        params.extend(DEFAULT_PARAMS.iter().map(|s| s.to_string()));
    }

    if !params.iter().any(|p| p.starts_with("earlyprintk=")) {
        params.push("earlyprintk=serial,ttyS0,115200".to_string());
    }
    if !params.iter().any(|p| p.starts_with("loglevel=")) {
        params.push("loglevel=8".to_string());
    }
    params.push("debug".to_string());
    params.push("ignore_loglevel".to_string());
    params.push("printk.devkmsg=on".to_string());

    let Some(metadata) = metadata else {
        // No metadata: the caller's line stands as supplied.
        return base_args.to_string();
    };
    if has_init {
        return base_args.to_string();
    }

    for (key, value) in &metadata.env {
        // PATH and anything containing spaces would corrupt the line.
        if key == "PATH" || key.contains(' ') || value.contains(' ') {
            continue;
        }
        params.push(format!("env.{key}={value}"));
    }

    if !metadata.working_dir.is_empty() {
        params.push(format!("workdir={}", metadata.working_dir));
    }

    params.push(format!("init={GUEST_INIT_PATH}"));

    let args = params.join(" ");
    tracing::info!(init = GUEST_INIT_PATH, final_args = %args, "built kernel args with container metadata");
    args
}

/// Network tokens for a binding: the Firecracker `ip=` token, nameservers,
/// up to five routes, and optional IPv6 and VLAN tokens.
pub fn network_tokens(network: &VmNetwork) -> Vec<String> {
    let mut tokens = vec![network.kernel_ip_token()];

    if let Some(primary) = network.dns_servers.first() {
        tokens.push(format!("nameserver={primary}"));
    }
    if let Some(secondary) = network.dns_servers.get(1) {
        tokens.push(format!("nameserver1={secondary}"));
    }

    for (i, route) in network.routes.iter().enumerate() {
        if i >= 5 {
            tracing::warn!(
                total_routes = network.routes.len(),
                max_routes = 5,
                "limiting routes to prevent kernel cmdline overflow"
            );
            break;
        }
        tokens.push(format!(
            "route={},{},{}",
            route.destination, route.gateway, route.metric
        ));
    }

    if let Some(ipv6) = &network.ipv6 {
        tokens.push(format!("ipv6={ipv6}"));
    }
    if let Some(vlan) = network.vlan_id {
        if vlan > 0 {
            tokens.push(format!("vlan={vlan}"));
        }
    }

    tokens
}

/// Full composition: metadata first, then (when enabled) network injection.
/// Pre-existing `ip=`/`nameserver=`/`route=`/`ipv6=`/`vlan=` tokens are
/// removed before the fresh network tokens are appended.
pub fn build_with_network_and_metadata(
    base_args: &str,
    network: Option<&VmNetwork>,
    metadata: Option<&ContainerMetadata>,
    enable_network_config: bool,
) -> String {
    let args = build_with_metadata(base_args, metadata);

    if !enable_network_config {
        tracing::debug!("kernel-based network configuration disabled");
        return args;
    }
    let Some(network) = network else {
        return args;
    };

    let fresh = network_tokens(network);
    if fresh.is_empty() {
        return args;
    }

    let mut final_params: Vec<String> = args
        .split_whitespace()
        .filter(|token| !NETWORK_PREFIXES.iter().any(|prefix| token.starts_with(prefix)))
        .map(str::to_string)
        .collect();
    final_params.extend(fresh);

    let composed = final_params.join(" ");
    tracing::info!(
        vm_id = %network.vm_id,
        final_args = %composed,
        "built kernel args with network and metadata"
    );
    composed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::types::Route;
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;

    fn binding(ip: [u8; 4]) -> VmNetwork {
        let ip = Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]);
        VmNetwork {
            vm_id: "ud-0011223344556677".to_string(),
            network_id: "a1b2c3d4".to_string(),
            tenant_id: "ws_A".to_string(),
            namespace: "vn_a1b2c3d4".to_string(),
            tap_device: "tap_a1b2c3d4".to_string(),
            veth_host: "vh_a1b2c3d4".to_string(),
            veth_ns: "vn_a1b2c3d4".to_string(),
            ip,
            prefix_len: 29,
            gateway: crate::network::devices::gateway_for(ip),
            mac: "02:02:4B:00:00:01".to_string(),
            dns_servers: vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()],
            created_at: 0,
            vlan_id: None,
            ipv6: None,
            routes: vec![],
        }
    }

    #[test]
    fn slot_29_ip_token_and_nameservers() {
        let args = build_with_network_and_metadata("console=ttyS0", Some(&binding([172, 16, 2, 175])), None, true);
        assert!(args.contains("ip=172.16.2.175::172.16.2.174:255.255.255.248:eth0:off"));
        assert!(args.contains("nameserver=8.8.8.8"));
        assert!(args.contains("nameserver1=8.8.4.4"));
        assert!(args.contains("console=ttyS0"));
    }

    #[test]
    fn conflicting_network_tokens_are_replaced() {
        let base = "console=ttyS0 ip=192.168.1.100::192.168.1.1:255.255.255.0:eth0:off nameserver=1.1.1.1";
        let args = build_with_network_and_metadata(base, Some(&binding([172, 16, 2, 18])), None, true);
        assert!(!args.contains("ip=192.168.1.100"));
        assert!(!args.contains("nameserver=1.1.1.1"));
        assert!(args.contains("ip=172.16.2.18::172.16.2.17:255.255.255.248:eth0:off"));
    }

    #[test]
    fn network_injection_respects_feature_gate() {
        let base = "console=ttyS0 ip=192.168.1.100::192.168.1.1:255.255.255.0:eth0:off";
        let args = build_with_network_and_metadata(base, Some(&binding([172, 16, 2, 18])), None, false);
        assert!(args.contains("ip=192.168.1.100"));
        assert!(!args.contains("ip=172.16.2.18"));
    }

    #[test]
    fn routes_are_capped_at_five() {
        let mut network = binding([172, 16, 2, 18]);
        network.routes = (0..7)
            .map(|i| Route {
                destination: format!("10.{i}.0.0/16"),
                gateway: Ipv4Addr::new(172, 16, 2, 17),
                metric: 100,
            })
            .collect();
        let tokens = network_tokens(&network);
        let route_count = tokens.iter().filter(|t| t.starts_with("route=")).count();
        assert_eq!(route_count, 5);
        assert!(tokens.contains(&"route=10.0.0.0/16,172.16.2.17,100".to_string()));
    }

    #[test]
    fn vlan_and_ipv6_tokens() {
        let mut network = binding([172, 16, 2, 18]);
        network.vlan_id = Some(142);
        network.ipv6 = Some("fd00::2".parse().unwrap());
        let tokens = network_tokens(&network);
        assert!(tokens.contains(&"vlan=142".to_string()));
        assert!(tokens.contains(&"ipv6=fd00::2".to_string()));
    }

    #[test]
    fn metadata_adds_env_workdir_and_init() {
        let mut env = BTreeMap::new();
        env.insert("APP_MODE".to_string(), "production".to_string());
        env.insert("PATH".to_string(), "/usr/bin".to_string());
        env.insert("BAD KEY".to_string(), "x".to_string());
        env.insert("MESSAGE".to_string(), "has spaces".to_string());
        let metadata = ContainerMetadata {
            entrypoint: vec!["/entry".to_string()],
            env,
            working_dir: "/srv/app".to_string(),
            ..ContainerMetadata::default()
        };

        let args = build_with_metadata("", Some(&metadata));
        assert!(args.contains("env.APP_MODE=production"));
        assert!(!args.contains("PATH="));
        assert!(!args.contains("BAD KEY"));
        assert!(!args.contains("has spaces"));
        assert!(args.contains("workdir=/srv/app"));
        assert!(args.contains("init=/usr/bin/metald-init"));
        // the command itself never appears on the kernel line
        assert!(!args.contains("/entry"));
    }

    #[test]
    fn caller_init_wins_over_metadata() {
        let metadata = ContainerMetadata {
            entrypoint: vec!["/entry".to_string()],
            ..ContainerMetadata::default()
        };
        let base = "console=ttyS0 init=/sbin/custom-init";
        assert_eq!(build_with_metadata(base, Some(&metadata)), base);
    }

    #[test]
    fn defaults_fill_in_when_nothing_preserved() {
        let metadata = ContainerMetadata {
            command: vec!["sleep".to_string()],
            ..ContainerMetadata::default()
        };
        let args = build_with_metadata("", Some(&metadata));
        assert!(args.contains("console=ttyS0,115200"));
        assert!(args.contains("reboot=k"));
        assert!(args.contains("panic=1"));
        assert!(args.contains("pci=off"));
        assert!(args.contains("root=/dev/vda"));
        assert!(args.contains("earlyprintk=serial,ttyS0,115200"));
        assert!(args.contains("loglevel=8"));
        assert!(args.contains("debug"));
        assert!(args.contains("ignore_loglevel"));
        assert!(args.contains("printk.devkmsg=on"));
    }

    #[test]
    fn no_metadata_leaves_base_untouched() {
        let base = "console=ttyS0 quiet special=1";
        assert_eq!(build_with_metadata(base, None), base);
    }
}
