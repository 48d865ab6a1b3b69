//! Network data types shared between the fabric, the device plumber, and
//! the lifecycle engine.

use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// Transport protocol of a port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
    /// ICMP (no ports on the wire, used for policy rules)
    Icmp,
}

impl Protocol {
    /// Parse the lowercase wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            "icmp" => Some(Protocol::Icmp),
            _ => None,
        }
    }

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One host-port to container-port forwarding entry. Serializes to the
/// stable shape persisted in the repository's port-mapping blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Owning VM.
    pub vm_id: String,
    /// Port inside the guest.
    pub container_port: u16,
    /// Host port drawn from the configured ephemeral range.
    pub host_port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
}

/// A static route pushed to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination CIDR, e.g. `10.1.0.0/16`.
    pub destination: String,
    /// Next hop.
    pub gateway: Ipv4Addr,
    /// Route metric.
    pub metric: u32,
}

/// Network binding of one VM: namespace, devices, addressing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmNetwork {
    /// Owning VM.
    pub vm_id: String,
    /// Internal 8-hex id the device names derive from.
    pub network_id: String,
    /// Tenant the /29 slot belongs to, needed for release.
    pub tenant_id: String,
    /// Network namespace name (`vn_<network_id>`).
    pub namespace: String,
    /// TAP device name (`tap_<network_id>`).
    pub tap_device: String,
    /// Host-side veth leg (`vh_<network_id>`).
    pub veth_host: String,
    /// Namespace-side veth leg (`vn_<network_id>`).
    pub veth_ns: String,
    /// Guest IPv4 address inside the tenant /29.
    pub ip: Ipv4Addr,
    /// Prefix length of the guest address (always 29).
    pub prefix_len: u8,
    /// Gateway, first usable address of the /29.
    pub gateway: Ipv4Addr,
    /// Tenant-encoded MAC address.
    pub mac: String,
    /// DNS servers handed to the guest.
    pub dns_servers: Vec<String>,
    /// Creation timestamp (unix seconds).
    pub created_at: i64,
    /// Optional VLAN id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u16>,
    /// Optional IPv6 address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Ipv6Addr>,
    /// Optional static routes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

impl VmNetwork {
    /// Base of the /29 slot this address lives in (last octet floored to a
    /// multiple of 8).
    pub fn slot_base(&self) -> Ipv4Addr {
        let o = self.ip.octets();
        Ipv4Addr::new(o[0], o[1], o[2], (o[3] / 8) * 8)
    }

    /// Host-side veth address: guest IP minus one. The host leg carries the
    /// gateway address of the point-to-point /29.
    pub fn veth_host_ip(&self) -> Ipv4Addr {
        let o = self.ip.octets();
        Ipv4Addr::new(o[0], o[1], o[2], o[3] - 1)
    }

    /// Dotted-quad rendering of the /29 netmask.
    pub fn netmask(&self) -> Ipv4Addr {
        prefix_to_netmask(self.prefix_len)
    }

    /// Firecracker-style `ip=` kernel token: `ip=G::T:GM:GI:off` where
    /// G is the guest IP, T the host veth IP, GM the dotted-quad netmask
    /// and GI the guest interface.
    pub fn kernel_ip_token(&self) -> String {
        format!(
            "ip={}::{}:{}:eth0:off",
            self.ip,
            self.veth_host_ip(),
            self.netmask()
        )
    }
}

/// Convert a prefix length to a dotted-quad IPv4 netmask.
pub fn prefix_to_netmask(prefix_len: u8) -> Ipv4Addr {
    let bits = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    };
    Ipv4Addr::from(bits)
}
