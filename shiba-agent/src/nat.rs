//! One-shot SNAT programmer: ensures traffic leaving cluster pod subnets
//! through this node is masqueraded, using a dedicated chain per address
//! family so the rules can be recognized and are never duplicated.

use std::net::IpAddr;

use crate::error::NatError;
use crate::model::Subnet;

pub const NAT_CHAIN: &str = "SHIBA";
const NAT_TABLE: &str = "nat";

/// Partition `cluster_pod_cidrs` by address family and install SNAT
/// rules for whichever families are present. A family with zero subnets
/// is left entirely untouched.
pub fn setup_nat(cluster_pod_cidrs: &[Subnet]) -> Result<(), NatError> {
    let mut v4_subnets = Vec::new();
    let mut v6_subnets = Vec::new();
    for subnet in cluster_pod_cidrs {
        match subnet.0 {
            ipnet::IpNet::V4(_) => v4_subnets.push(subnet.canonical_string()),
            ipnet::IpNet::V6(_) => v6_subnets.push(subnet.canonical_string()),
        }
    }

    if !v4_subnets.is_empty() {
        let tables = iptables::new(false).map_err(|e| setup_error("ipv4 init", e))?;
        add_rules(&tables, &v4_subnets)?;
        tracing::info!("ipv4 nat rules are ready");
    }
    if !v6_subnets.is_empty() {
        let tables = iptables::new(true).map_err(|e| setup_error("ipv6 init", e))?;
        add_rules(&tables, &v6_subnets)?;
        tracing::info!("ipv6 nat rules are ready");
    }
    Ok(())
}

fn add_rules(tables: &iptables::IPTables, subnets: &[String]) -> Result<(), NatError> {
    let already_exists = tables
        .chain_exists(NAT_TABLE, NAT_CHAIN)
        .map_err(|e| setup_error("check chain", e))?;
    if !already_exists {
        tables
            .new_chain(NAT_TABLE, NAT_CHAIN)
            .map_err(|e| setup_error("create chain", e))?;
    }
    tables
        .append_unique(NAT_TABLE, NAT_CHAIN, "-j MASQUERADE")
        .map_err(|e| setup_error("append masquerade rule", e))?;

    for subnet in subnets {
        tracing::debug!(subnet = %subnet, "adding nat rules");
        // Redirect outgoing traffic originating from the subnet through our chain.
        tables
            .append_unique(
                NAT_TABLE,
                "POSTROUTING",
                &format!("--src {subnet} -j {NAT_CHAIN}"),
            )
            .map_err(|e| setup_error(&format!("redirect outgoing traffic from [{subnet}]"), e))?;
        // But skip masquerading traffic destined back into the subnet.
        tables
            .insert_unique(NAT_TABLE, NAT_CHAIN, &format!("--dst {subnet} -j RETURN"), 1)
            .map_err(|e| setup_error(&format!("add exclusion rule for [{subnet}]"), e))?;
    }
    Ok(())
}

fn setup_error(reason: &str, source: Box<dyn std::error::Error>) -> NatError {
    NatError::Setup {
        table: NAT_TABLE.to_string(),
        chain: NAT_CHAIN.to_string(),
        reason: format!("{reason}: {source}"),
    }
}

/// Pure helper kept separate from `setup_nat` so the family-split logic
/// is unit-testable without touching a real netfilter table.
pub fn split_by_family(subnets: &[Subnet]) -> (Vec<IpAddr>, Vec<IpAddr>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for subnet in subnets {
        match subnet.0 {
            ipnet::IpNet::V4(n) => v4.push(IpAddr::V4(n.addr())),
            ipnet::IpNet::V6(n) => v6.push(IpAddr::V6(n.addr())),
        }
    }
    (v4, v6)
}
