//! Link manipulation capability.
//!
//! Every link, address, route, and traffic-control operation goes through
//! [`LinkOps`] so the device plumber can be exercised against a recording
//! fake. The typed methods build `ip`/`tc` argument vectors and hand them to
//! [`LinkOps::run`], the single point implementations override. The
//! production implementation dispatches host-side calls through
//! `tokio::process::Command` and namespace-side calls through the pinned
//! thread capability in [`super::netns`].

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::network::netns;

/// Where an operation executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// The host network namespace.
    Host,
    /// A named VM namespace.
    Netns(String),
}

impl Scope {
    /// Namespace scope helper.
    pub fn ns(name: &str) -> Self {
        Scope::Netns(name.to_string())
    }
}

/// Capability over link/address/route/tc operations.
#[async_trait]
pub trait LinkOps: Send + Sync {
    /// Execute one command in the given scope, returning stdout on success.
    /// Implementations surface non-zero exits as [`Error::LinkOp`] with the
    /// combined output attached.
    async fn run(&self, scope: Scope, argv: Vec<String>) -> Result<String>;

    /// Create a TAP device.
    async fn create_tap(&self, scope: Scope, name: &str) -> Result<()> {
        self.run(
            scope,
            args(&["ip", "tuntap", "add", "dev", name, "mode", "tap"]),
        )
        .await
        .map(drop)
    }

    /// Create a veth pair in the host namespace.
    async fn create_veth(&self, host_name: &str, peer_name: &str) -> Result<()> {
        self.run(
            Scope::Host,
            args(&[
                "ip", "link", "add", host_name, "type", "veth", "peer", "name", peer_name,
            ]),
        )
        .await
        .map(drop)
    }

    /// Move a host-side link into a named namespace.
    async fn move_to_netns(&self, dev: &str, ns: &str) -> Result<()> {
        self.run(Scope::Host, args(&["ip", "link", "set", dev, "netns", ns]))
            .await
            .map(drop)
    }

    /// Bring a link up.
    async fn link_set_up(&self, scope: Scope, dev: &str) -> Result<()> {
        self.run(scope, args(&["ip", "link", "set", dev, "up"]))
            .await
            .map(drop)
    }

    /// Bring a link down.
    async fn link_set_down(&self, scope: Scope, dev: &str) -> Result<()> {
        self.run(scope, args(&["ip", "link", "set", dev, "down"]))
            .await
            .map(drop)
    }

    /// Delete a link.
    async fn link_delete(&self, scope: Scope, dev: &str) -> Result<()> {
        self.run(scope, args(&["ip", "link", "del", dev]))
            .await
            .map(drop)
    }

    /// Whether a link exists in the scope.
    async fn link_exists(&self, scope: Scope, dev: &str) -> bool {
        self.run(scope, args(&["ip", "-o", "link", "show", "dev", dev]))
            .await
            .is_ok()
    }

    /// Whether a link exists and is up.
    async fn link_is_up(&self, scope: Scope, dev: &str) -> Result<bool> {
        let output = self
            .run(scope, args(&["ip", "-o", "link", "show", "dev", dev]))
            .await?;
        Ok(output.contains("UP"))
    }

    /// Assign an address (CIDR notation) to a link.
    async fn addr_add(&self, scope: Scope, dev: &str, cidr: &str) -> Result<()> {
        self.run(scope, args(&["ip", "addr", "add", cidr, "dev", dev]))
            .await
            .map(drop)
    }

    /// Whether a link carries any IPv4 address.
    async fn has_address(&self, scope: Scope, dev: &str) -> Result<bool> {
        let output = self
            .run(scope, args(&["ip", "-4", "-o", "addr", "show", "dev", dev]))
            .await?;
        Ok(!output.trim().is_empty())
    }

    /// Set a link's MAC address.
    async fn link_set_mac(&self, scope: Scope, dev: &str, mac: &str) -> Result<()> {
        self.run(scope, args(&["ip", "link", "set", dev, "address", mac]))
            .await
            .map(drop)
    }

    /// Install the default route via a gateway.
    async fn route_add_default(&self, scope: Scope, gateway: &str) -> Result<()> {
        self.run(scope, args(&["ip", "route", "add", "default", "via", gateway]))
            .await
            .map(drop)
    }

    /// Install a route to a subnet through a device.
    async fn route_add_dev(&self, scope: Scope, subnet: &str, dev: &str) -> Result<()> {
        self.run(scope, args(&["ip", "route", "add", subnet, "dev", dev]))
            .await
            .map(drop)
    }

    /// Name of the interface carrying the IPv4 default route.
    async fn default_route_interface(&self) -> Result<String> {
        let output = self
            .run(Scope::Host, args(&["ip", "-4", "route", "show", "default"]))
            .await?;
        // "default via 10.0.0.1 dev eth0 proto dhcp ..."
        let mut tokens = output.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "dev" {
                if let Some(iface) = tokens.next() {
                    return Ok(iface.to_string());
                }
            }
        }
        Err(Error::LinkOp {
            operation: "default_route_interface".to_string(),
            device: "default".to_string(),
            output: format!("no default route found in: {output}"),
        })
    }

    /// Enslave a link to a bridge.
    async fn attach_to_bridge(&self, dev: &str, bridge: &str) -> Result<()> {
        self.run(Scope::Host, args(&["ip", "link", "set", dev, "master", bridge]))
            .await
            .map(drop)
    }

    /// Install an ingress qdisc on a link (required for mirred redirect).
    /// An already-present qdisc is not an error.
    async fn add_ingress_qdisc(&self, scope: Scope, dev: &str) -> Result<()> {
        match self
            .run(
                scope,
                args(&["tc", "qdisc", "add", "dev", dev, "ingress"]),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::LinkOp { output, .. }) if output.contains("File exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Redirect all ingress traffic of `src` to the egress of `dst`.
    async fn add_mirred_redirect(&self, scope: Scope, src: &str, dst: &str) -> Result<()> {
        self.run(
            scope,
            args(&[
                "tc", "filter", "add", "dev", src, "parent", "ffff:", "protocol", "all", "u32",
                "match", "u8", "0", "0", "action", "mirred", "egress", "redirect", "dev", dst,
            ]),
        )
        .await
        .map(drop)
    }

    /// Attach a token-bucket shaper to a link.
    async fn add_tbf_qdisc(
        &self,
        scope: Scope,
        dev: &str,
        rate_bytes_per_sec: u64,
        burst_bytes: u64,
        limit_bytes: u64,
    ) -> Result<()> {
        match self
            .run(
                scope,
                args(&[
                    "tc",
                    "qdisc",
                    "add",
                    "dev",
                    dev,
                    "root",
                    "tbf",
                    "rate",
                    &format!("{rate_bytes_per_sec}bps"),
                    "burst",
                    &format!("{burst_bytes}b"),
                    "limit",
                    &format!("{limit_bytes}b"),
                ]),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::LinkOp { output, .. }) if output.contains("File exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Create a named network namespace. Present namespaces are fine.
    async fn netns_add(&self, name: &str) -> Result<()> {
        if self.netns_exists(name).await {
            tracing::info!(namespace = %name, "namespace already exists");
            return Ok(());
        }
        tracing::info!(namespace = %name, "creating new namespace");
        self.run(Scope::Host, args(&["ip", "netns", "add", name]))
            .await
            .map(drop)
    }

    /// Delete a named network namespace, tolerating its absence.
    async fn netns_delete(&self, name: &str) {
        tracing::info!(namespace = %name, "deleting namespace");
        if let Err(e) = self
            .run(Scope::Host, args(&["ip", "netns", "delete", name]))
            .await
        {
            let text = e.to_string();
            if !text.contains("No such file") && !text.contains("not found") {
                tracing::warn!(namespace = %name, error = %e, "failed to delete namespace");
            }
        }
    }

    /// Whether a named namespace exists.
    async fn netns_exists(&self, name: &str) -> bool {
        match self
            .run(Scope::Host, args(&["ip", "netns", "list"]))
            .await
        {
            Ok(output) => output
                .lines()
                .any(|line| line.split_whitespace().next() == Some(name)),
            Err(_) => false,
        }
    }

    /// Names of all links in the scope.
    async fn list_link_names(&self, scope: Scope) -> Result<Vec<String>> {
        let output = self.run(scope, args(&["ip", "-o", "link", "show"])).await?;
        // each line: "2: eth0: <BROADCAST,...> ..."
        let mut names = Vec::new();
        for line in output.lines() {
            if let Some(rest) = line.splitn(2, ": ").nth(1) {
                let name = rest.split(&[':', '@'][..]).next().unwrap_or("").trim();
                if !name.is_empty() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }
}

fn args(argv: &[&str]) -> Vec<String> {
    argv.iter().map(|s| s.to_string()).collect()
}

/// Production implementation driving the `ip` and `tc` binaries. Host-scope
/// commands run as child processes; namespace-scope commands run inside the
/// target namespace on a pinned thread.
pub struct IpCommandOps;

#[async_trait]
impl LinkOps for IpCommandOps {
    async fn run(&self, scope: Scope, argv: Vec<String>) -> Result<String> {
        let rendered = argv.join(" ");
        tracing::debug!(scope = ?scope, command = %rendered, "link operation");

        match scope {
            Scope::Host => {
                let output = tokio::process::Command::new(&argv[0])
                    .args(&argv[1..])
                    .output()
                    .await
                    .map_err(|e| Error::LinkOp {
                        operation: rendered.clone(),
                        device: argv.get(4).cloned().unwrap_or_default(),
                        output: e.to_string(),
                    })?;
                check_output(&rendered, &argv, output.status.success(), &output.stdout, &output.stderr)
            }
            Scope::Netns(ns) => {
                // Blocking child process on the pinned, namespace-switched
                // thread; the guard restores the host namespace afterwards.
                netns::with_netns_async(&ns, move || {
                    let output = std::process::Command::new(&argv[0])
                        .args(&argv[1..])
                        .output()
                        .map_err(|e| Error::LinkOp {
                            operation: rendered.clone(),
                            device: argv.get(4).cloned().unwrap_or_default(),
                            output: e.to_string(),
                        })?;
                    check_output(
                        &rendered,
                        &argv,
                        output.status.success(),
                        &output.stdout,
                        &output.stderr,
                    )
                })
                .await
            }
        }
    }
}

fn check_output(
    rendered: &str,
    argv: &[String],
    success: bool,
    stdout: &[u8],
    stderr: &[u8],
) -> Result<String> {
    if success {
        Ok(String::from_utf8_lossy(stdout).into_owned())
    } else {
        let mut combined = String::from_utf8_lossy(stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(stderr));
        Err(Error::LinkOp {
            operation: rendered.to_string(),
            device: argv.get(4).cloned().unwrap_or_default(),
            output: combined,
        })
    }
}

pub mod fake {
    //! Recording fake for tests.

    use std::sync::Mutex;

    use super::*;

    /// Records every command; responses can be scripted per substring.
    pub struct FakeLinkOps {
        /// Commands seen, rendered as `scope-prefixed` strings.
        pub calls: Mutex<Vec<String>>,
        /// Substring -> canned stdout for query commands.
        pub responses: Mutex<Vec<(String, String)>>,
        /// Substring -> error output for failure injection.
        pub failures: Mutex<Vec<(String, String)>>,
    }

    impl FakeLinkOps {
        /// Empty fake: every command succeeds with empty output.
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                responses: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
            }
        }

        /// Script stdout for commands containing `needle`.
        pub fn respond(&self, needle: &str, stdout: &str) {
            self.responses
                .lock()
                .unwrap()
                .push((needle.to_string(), stdout.to_string()));
        }

        /// Script a failure for commands containing `needle`.
        pub fn fail_on(&self, needle: &str, output: &str) {
            self.failures
                .lock()
                .unwrap()
                .push((needle.to_string(), output.to_string()));
        }

        /// Rendered commands seen so far.
        pub fn recorded(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LinkOps for FakeLinkOps {
        async fn run(&self, scope: Scope, argv: Vec<String>) -> Result<String> {
            let prefix = match &scope {
                Scope::Host => "host".to_string(),
                Scope::Netns(ns) => format!("netns:{ns}"),
            };
            let rendered = format!("{prefix} {}", argv.join(" "));
            self.calls.lock().unwrap().push(rendered.clone());

            for (needle, output) in self.failures.lock().unwrap().iter() {
                if rendered.contains(needle.as_str()) {
                    return Err(Error::LinkOp {
                        operation: rendered.clone(),
                        device: String::new(),
                        output: output.clone(),
                    });
                }
            }
            for (needle, stdout) in self.responses.lock().unwrap().iter() {
                if rendered.contains(needle.as_str()) {
                    return Ok(stdout.clone());
                }
            }
            Ok(String::new())
        }
    }
}
