//! Host firewall control: NAT masquerade and forwarding at startup, per-VM
//! DNAT rules at boot.
//!
//! Two regimes with different failure contracts. Host-wide rules are
//! installed once and rolled back as a set if any rule fails; they are
//! recorded argv-exact so shutdown removes precisely what was added. Per-VM
//! DNAT rules are install-all-or-roll-back-all on boot and best-effort
//! remove on delete.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::constants::{IP_FORWARD_PROC_PATH, SYSCTL_DROPIN_PATH};
use crate::error::{Error, Result};
use crate::network::types::{PortMapping, Protocol};

/// Capability over the firewall binary.
#[async_trait]
pub trait FirewallOps: Send + Sync {
    /// Run `iptables` with the given arguments.
    async fn run(&self, argv: Vec<String>) -> Result<()>;
}

/// Production implementation driving the `iptables` binary.
pub struct IptablesOps;

#[async_trait]
impl FirewallOps for IptablesOps {
    async fn run(&self, argv: Vec<String>) -> Result<()> {
        let rendered = argv.join(" ");
        let output = tokio::process::Command::new("iptables")
            .args(&argv)
            .output()
            .await
            .map_err(|e| Error::Firewall {
                rule: rendered.clone(),
                output: e.to_string(),
            })?;
        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(Error::Firewall {
                rule: rendered,
                output: combined,
            });
        }
        Ok(())
    }
}

/// Firewall controller owning the host ruleset and per-VM DNAT rules.
pub struct FirewallController {
    ops: std::sync::Arc<dyn FirewallOps>,
    /// Host-wide rules installed at startup, recorded for exact removal.
    host_rules: Mutex<Vec<Vec<String>>>,
    /// Overridable for tests; production uses the /proc and sysctl.d paths.
    ip_forward_path: PathBuf,
    sysctl_dropin_path: PathBuf,
}

impl FirewallController {
    /// Create a controller over a firewall capability.
    pub fn new(ops: std::sync::Arc<dyn FirewallOps>) -> Self {
        Self {
            ops,
            host_rules: Mutex::new(Vec::new()),
            ip_forward_path: IP_FORWARD_PROC_PATH.into(),
            sysctl_dropin_path: SYSCTL_DROPIN_PATH.into(),
        }
    }

    /// Create a controller with redirected sysctl paths (tests).
    pub fn with_paths(
        ops: std::sync::Arc<dyn FirewallOps>,
        ip_forward_path: PathBuf,
        sysctl_dropin_path: PathBuf,
    ) -> Self {
        Self {
            ops,
            host_rules: Mutex::new(Vec::new()),
            ip_forward_path,
            sysctl_dropin_path,
        }
    }

    /// Enable IPv4 forwarding now and persist it across reboots.
    pub fn enable_ip_forwarding(&self) -> Result<()> {
        std::fs::write(&self.ip_forward_path, "1").map_err(|source| Error::Io {
            what: "enable ip_forward".to_string(),
            path: self.ip_forward_path.clone(),
            source,
        })?;
        if let Some(dir) = self.sysctl_dropin_path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| Error::Io {
                what: "create sysctl.d".to_string(),
                path: dir.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&self.sysctl_dropin_path, "net.ipv4.ip_forward = 1\n").map_err(
            |source| Error::Io {
                what: "persist ip_forward sysctl".to_string(),
                path: self.sysctl_dropin_path.clone(),
                source,
            },
        )?;
        tracing::info!("IPv4 forwarding enabled and persisted");
        Ok(())
    }

    /// Install the host-wide NAT and forwarding rules: masquerade for the VM
    /// subnet out of the default-route interface, plus FORWARD accepts for
    /// bridge-to-external, established-back, and intra-bridge traffic.
    /// Any failure removes the rules already installed.
    pub async fn setup_nat(
        &self,
        vm_subnet: &str,
        bridge_name: &str,
        default_iface: &str,
    ) -> Result<()> {
        tracing::info!(
            vm_subnet = %vm_subnet,
            bridge = %bridge_name,
            interface = %default_iface,
            "setting up NAT rules"
        );

        let rules: Vec<Vec<String>> = vec![
            argv(&[
                "-t", "nat", "-A", "POSTROUTING", "-s", vm_subnet, "-o", default_iface, "-j",
                "MASQUERADE",
            ]),
            argv(&["-A", "FORWARD", "-i", bridge_name, "-o", default_iface, "-j", "ACCEPT"]),
            argv(&[
                "-A", "FORWARD", "-i", default_iface, "-o", bridge_name, "-m", "state",
                "--state", "RELATED,ESTABLISHED", "-j", "ACCEPT",
            ]),
            argv(&["-A", "FORWARD", "-i", bridge_name, "-o", bridge_name, "-j", "ACCEPT"]),
        ];

        for rule in rules {
            if let Err(e) = self.ops.run(rule.clone()).await {
                tracing::error!(rule = %rule.join(" "), error = %e, "failed to add iptables rule");
                self.remove_host_rules().await;
                return Err(e);
            }
            tracing::info!(rule = %rule.join(" "), "iptables rule added");
            self.host_rules.lock().unwrap().push(rule);
        }

        Ok(())
    }

    /// Remove every recorded host rule (best effort), in reverse order.
    pub async fn remove_host_rules(&self) {
        let rules: Vec<Vec<String>> = {
            let mut guard = self.host_rules.lock().unwrap();
            guard.drain(..).rev().collect()
        };
        for rule in rules {
            let delete = to_delete(&rule);
            if let Err(e) = self.ops.run(delete.clone()).await {
                tracing::warn!(rule = %delete.join(" "), error = %e, "failed to remove iptables rule");
            }
        }
    }

    /// Install DNAT plus FORWARD-accept for every mapping. On any failure
    /// the rules already installed for this call are removed and the error
    /// surfaces.
    pub async fn install_port_forwarding(
        &self,
        vm_id: &str,
        vm_ip: Ipv4Addr,
        mappings: &[PortMapping],
    ) -> Result<()> {
        validate_vm_id(vm_id)?;
        if mappings.is_empty() {
            return Ok(());
        }

        tracing::info!(
            vm_id = %vm_id,
            vm_ip = %vm_ip,
            port_count = mappings.len(),
            "configuring port forwarding"
        );

        let mut installed: Vec<PortMapping> = Vec::new();
        for mapping in mappings {
            validate_mapping(mapping)?;

            let result = async {
                self.ops.run(dnat_rule("-A", vm_ip, mapping)).await?;
                self.ops.run(forward_rule("-A", vm_ip, mapping)).await
            }
            .await;

            if let Err(e) = result {
                tracing::error!(
                    vm_id = %vm_id,
                    host_port = mapping.host_port,
                    container_port = mapping.container_port,
                    error = %e,
                    "failed to configure port forwarding, rolling back"
                );
                self.remove_port_forwarding(vm_id, vm_ip, &installed).await;
                return Err(e);
            }

            tracing::info!(
                host_port = mapping.host_port,
                container_port = mapping.container_port,
                protocol = %mapping.protocol,
                vm_ip = %vm_ip,
                "configured port forwarding"
            );
            installed.push(mapping.clone());
        }

        Ok(())
    }

    /// Remove the DNAT and FORWARD rules for the given mappings. Failures
    /// are recorded and logged, never fatal: delete paths must make
    /// progress.
    pub async fn remove_port_forwarding(
        &self,
        vm_id: &str,
        vm_ip: Ipv4Addr,
        mappings: &[PortMapping],
    ) -> usize {
        let mut failures = 0;
        for mapping in mappings {
            if validate_mapping(mapping).is_err() {
                failures += 1;
                continue;
            }
            if let Err(e) = self.ops.run(dnat_rule("-D", vm_ip, mapping)).await {
                tracing::warn!(vm_id = %vm_id, host_port = mapping.host_port, error = %e, "failed to remove DNAT rule");
                failures += 1;
            }
            if let Err(e) = self.ops.run(forward_rule("-D", vm_ip, mapping)).await {
                tracing::warn!(vm_id = %vm_id, container_port = mapping.container_port, error = %e, "failed to remove FORWARD rule");
                failures += 1;
            }
        }
        failures
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn dnat_rule(action: &str, vm_ip: Ipv4Addr, mapping: &PortMapping) -> Vec<String> {
    argv(&[
        "-t",
        "nat",
        action,
        "PREROUTING",
        "-p",
        mapping.protocol.as_str(),
        "--dport",
        &mapping.host_port.to_string(),
        "-j",
        "DNAT",
        "--to-destination",
        &format!("{vm_ip}:{}", mapping.container_port),
    ])
}

fn forward_rule(action: &str, vm_ip: Ipv4Addr, mapping: &PortMapping) -> Vec<String> {
    argv(&[
        action,
        "FORWARD",
        "-p",
        mapping.protocol.as_str(),
        "-d",
        &vm_ip.to_string(),
        "--dport",
        &mapping.container_port.to_string(),
        "-j",
        "ACCEPT",
    ])
}

/// VM ids feeding rule text: alphanumerics, hyphens, underscores, 1..=64.
pub fn validate_vm_id(vm_id: &str) -> Result<()> {
    if vm_id.is_empty() || vm_id.len() > 64 {
        return Err(Error::InvalidArgument {
            what: "vm id".to_string(),
            reason: format!("invalid length: {vm_id}"),
        });
    }
    if !vm_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidArgument {
            what: "vm id".to_string(),
            reason: format!("only alphanumeric, hyphens, and underscores allowed: {vm_id}"),
        });
    }
    Ok(())
}

fn validate_mapping(mapping: &PortMapping) -> Result<()> {
    // Protocol is typed; ports only need the non-zero check since u16
    // bounds the upper end.
    if mapping.host_port == 0 {
        return Err(Error::InvalidArgument {
            what: "host port".to_string(),
            reason: "port must be 1-65535".to_string(),
        });
    }
    if mapping.container_port == 0 && mapping.protocol != Protocol::Icmp {
        return Err(Error::InvalidArgument {
            what: "container port".to_string(),
            reason: "port must be 1-65535".to_string(),
        });
    }
    Ok(())
}

pub mod fake {
    //! Recording fake for tests.

    use std::sync::Mutex;

    use super::*;

    /// Records iptables invocations; failures scriptable per substring.
    pub struct FakeFirewallOps {
        /// Rendered rules seen.
        pub calls: Mutex<Vec<String>>,
        /// Substring -> error output.
        pub failures: Mutex<Vec<(String, String)>>,
    }

    impl FakeFirewallOps {
        /// Empty fake where every rule succeeds.
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
            }
        }

        /// Script a failure for rules containing `needle`.
        pub fn fail_on(&self, needle: &str, output: &str) {
            self.failures
                .lock()
                .unwrap()
                .push((needle.to_string(), output.to_string()));
        }

        /// Rules seen so far.
        pub fn recorded(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FirewallOps for FakeFirewallOps {
        async fn run(&self, argv: Vec<String>) -> Result<()> {
            let rendered = argv.join(" ");
            self.calls.lock().unwrap().push(rendered.clone());
            for (needle, output) in self.failures.lock().unwrap().iter() {
                if rendered.contains(needle.as_str()) {
                    return Err(Error::Firewall {
                        rule: rendered,
                        output: output.clone(),
                    });
                }
            }
            Ok(())
        }
    }
}

fn to_delete(rule: &[String]) -> Vec<String> {
    rule.iter()
        .map(|token| if token == "-A" { "-D".to_string() } else { token.clone() })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::fake::FakeFirewallOps;
    use super::*;
    use std::sync::Arc;

    fn mapping(host_port: u16, container_port: u16) -> PortMapping {
        PortMapping {
            vm_id: "ud-0011223344556677".to_string(),
            container_port,
            host_port,
            protocol: Protocol::Tcp,
        }
    }

    #[tokio::test]
    async fn dnat_and_forward_rules_render_exactly() {
        let ops = Arc::new(FakeFirewallOps::new());
        let fw = FirewallController::new(ops.clone());
        fw.install_port_forwarding(
            "ud-0011223344556677",
            Ipv4Addr::new(172, 16, 2, 18),
            &[mapping(40000, 80)],
        )
        .await
        .unwrap();

        let calls = ops.recorded();
        assert_eq!(
            calls[0],
            "-t nat -A PREROUTING -p tcp --dport 40000 -j DNAT --to-destination 172.16.2.18:80"
        );
        assert_eq!(calls[1], "-A FORWARD -p tcp -d 172.16.2.18 --dport 80 -j ACCEPT");
    }

    #[tokio::test]
    async fn install_rolls_back_on_partial_failure() {
        let ops = Arc::new(FakeFirewallOps::new());
        ops.fail_on("--dport 40001", "iptables: No chain by that name");
        let fw = FirewallController::new(ops.clone());

        let err = fw
            .install_port_forwarding(
                "ud-0011223344556677",
                Ipv4Addr::new(172, 16, 2, 18),
                &[mapping(40000, 80), mapping(40001, 81)],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Dependency);

        // first mapping's rules were removed again
        let calls = ops.recorded();
        assert!(calls
            .iter()
            .any(|c| c.contains("-D PREROUTING -p tcp --dport 40000")));
    }

    #[tokio::test]
    async fn remove_is_best_effort() {
        let ops = Arc::new(FakeFirewallOps::new());
        ops.fail_on("-D PREROUTING -p tcp --dport 40000", "gone already");
        let fw = FirewallController::new(ops.clone());

        let failures = fw
            .remove_port_forwarding(
                "ud-0011223344556677",
                Ipv4Addr::new(172, 16, 2, 18),
                &[mapping(40000, 80), mapping(40001, 81)],
            )
            .await;
        assert_eq!(failures, 1);
        // second mapping still removed
        assert!(ops
            .recorded()
            .iter()
            .any(|c| c.contains("-D PREROUTING -p tcp --dport 40001")));
    }

    #[tokio::test]
    async fn nat_failure_removes_installed_rules() {
        let ops = Arc::new(FakeFirewallOps::new());
        ops.fail_on("RELATED,ESTABLISHED", "denied");
        let fw = FirewallController::new(ops.clone());

        let err = fw.setup_nat("172.16.0.0/16", "br-vms-2", "eth0").await;
        assert!(err.is_err());

        let calls = ops.recorded();
        assert!(calls
            .iter()
            .any(|c| c == "-t nat -A POSTROUTING -s 172.16.0.0/16 -o eth0 -j MASQUERADE"));
        assert!(calls
            .iter()
            .any(|c| c == "-t nat -D POSTROUTING -s 172.16.0.0/16 -o eth0 -j MASQUERADE"));
    }

    #[tokio::test]
    async fn shutdown_removes_exactly_what_was_added() {
        let ops = Arc::new(FakeFirewallOps::new());
        let fw = FirewallController::new(ops.clone());
        fw.setup_nat("172.16.0.0/16", "br-vms-2", "eth0").await.unwrap();
        fw.remove_host_rules().await;

        let calls = ops.recorded();
        let adds = calls.iter().filter(|c| c.contains("-A ")).count();
        let dels = calls.iter().filter(|c| c.contains("-D ")).count();
        assert_eq!(adds, dels);
    }

    #[test]
    fn vm_id_validation() {
        assert!(validate_vm_id("ud-0011223344556677").is_ok());
        assert!(validate_vm_id("").is_err());
        assert!(validate_vm_id(&"x".repeat(65)).is_err());
        assert!(validate_vm_id("bad;id").is_err());
    }

    #[test]
    fn ip_forward_files_are_written() {
        let dir = tempfile::TempDir::new().unwrap();
        let fw = FirewallController::with_paths(
            Arc::new(FakeFirewallOps::new()),
            dir.path().join("ip_forward"),
            dir.path().join("sysctl.d/99-metald.conf"),
        );
        fw.enable_ip_forwarding().unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("ip_forward")).unwrap(),
            "1"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("sysctl.d/99-metald.conf")).unwrap(),
            "net.ipv4.ip_forward = 1\n"
        );
    }
}
