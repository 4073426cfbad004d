//! The Peer/PeerMap data model and the local node's static context.

use std::collections::BTreeMap;
use std::net::Ipv6Addr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// A single pod subnet, v4 or v6, compared and ordered by its canonical
/// string form so equality is independent of parse order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Subnet(pub IpNet);

impl Subnet {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        s.trim()
            .parse::<IpNet>()
            .map(Subnet)
            .map_err(|e| ParseError::InvalidSubnet {
                subnet: s.to_string(),
                reason: e.to_string(),
            })
    }

    /// The first address of the subnet — used to build a gateway address.
    pub fn first_address(&self) -> std::net::IpAddr {
        self.0.network()
    }

    /// Prefix length equal to the address family's full bit width (a
    /// single-host mask): /32 for v4, /128 for v6.
    pub fn host_bits(&self) -> u8 {
        match self.0 {
            IpNet::V4(_) => 32,
            IpNet::V6(_) => 128,
        }
    }

    pub fn canonical_string(&self) -> String {
        self.0.to_string()
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parse a list of CIDR strings into a canonically sorted, deduplicated
/// set of [`Subnet`]s.
pub fn parse_subnets<I, S>(strings: I) -> Result<Vec<Subnet>, ParseError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::BTreeSet::new();
    for s in strings {
        let s = s.as_ref();
        if s.is_empty() {
            continue;
        }
        seen.insert(Subnet::parse(s)?);
    }
    Ok(seen.into_iter().collect())
}

/// An immutable, fully-parsed view of a peer node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,
    pub endpoint: Ipv6Addr,
    pub subnets: Vec<Subnet>,
    pub tunnel_id: String,
}

impl Peer {
    /// Semantic equality that ignores `tunnel_id`: names, endpoints, and
    /// canonically-sorted subnet sets must all match.
    pub fn semantically_equal(&self, other: &Peer) -> bool {
        self.name == other.name && self.endpoint == other.endpoint && self.subnets == other.subnets
    }

    pub fn differs_from(&self, other: &Peer) -> bool {
        !self.semantically_equal(other)
    }
}

/// name -> Peer. Deep-cloned on every snapshot; never shared for mutation.
pub type PeerMap = BTreeMap<String, Peer>;

/// The local node's static context, computed once at boot.
#[derive(Debug, Clone)]
pub struct LocalContext {
    pub local_endpoint: Ipv6Addr,
    pub local_subnets: Vec<Subnet>,
    /// One gateway address per address family present in `local_subnets`.
    pub gateway_addresses: Vec<GatewayAddress>,
    pub tunnel_mtu: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayAddress {
    pub address: std::net::IpAddr,
    pub prefix_len: u8,
}

impl GatewayAddress {
    pub fn canonical_string(&self) -> String {
        format!("{}/{}", self.address, self.prefix_len)
    }
}

impl LocalContext {
    pub fn new(local_endpoint: Ipv6Addr, local_subnets: Vec<Subnet>, tunnel_mtu: u32) -> Self {
        let mut seen_v4 = false;
        let mut seen_v6 = false;
        let mut gateway_addresses = Vec::new();
        for subnet in &local_subnets {
            let is_v4 = matches!(subnet.0, IpNet::V4(_));
            if is_v4 && !seen_v4 {
                seen_v4 = true;
                gateway_addresses.push(GatewayAddress {
                    address: subnet.first_address(),
                    prefix_len: subnet.host_bits(),
                });
            } else if !is_v4 && !seen_v6 {
                seen_v6 = true;
                gateway_addresses.push(GatewayAddress {
                    address: subnet.first_address(),
                    prefix_len: subnet.host_bits(),
                });
            }
        }
        LocalContext {
            local_endpoint,
            local_subnets,
            gateway_addresses,
            tunnel_mtu,
        }
    }

    /// The gateway addresses as a set of canonical strings, for address
    /// comparison in the tunnel reconciler.
    pub fn gateway_string_set(&self) -> std::collections::BTreeSet<String> {
        self.gateway_addresses
            .iter()
            .map(GatewayAddress::canonical_string)
            .collect()
    }
}
