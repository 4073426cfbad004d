//! Tunnel reconciler: converges kernel tunnel links to exactly one
//! IPv6-in-IPv6 link per peer in the snapshot, including the gateway
//! addresses each link must carry.

use std::collections::BTreeMap;

use crate::kernel::{KernelAdapter, Link, LinkAddress, TunnelSpec};
use crate::model::{LocalContext, Peer, PeerMap};
use crate::uid::TUNNEL_PREFIX;

/// Bring kernel tunnel links into agreement with `snapshot`. Per-peer
/// failures are logged and isolated — the loop always continues to the
/// next peer.
pub fn reconcile_tunnels(kernel: &dyn KernelAdapter, local: &LocalContext, snapshot: &PeerMap) {
    let desired: BTreeMap<&str, &Peer> = snapshot
        .values()
        .map(|peer| (peer.tunnel_id.as_str(), peer))
        .collect();

    let links = match kernel.list_links() {
        Ok(links) => links,
        Err(e) => {
            tracing::error!(error = %e, "failed to list links, aborting tunnel reconciliation");
            return;
        }
    };

    let mut existing: BTreeMap<String, Link> = BTreeMap::new();
    for link in links {
        if !link.is_tunnel() || !link.name.starts_with(TUNNEL_PREFIX) {
            continue;
        }
        if desired.contains_key(link.name.as_str()) {
            existing.insert(link.name.clone(), link);
        } else {
            tracing::debug!(link = %link.name, "removing dangling tunnel");
            if let Err(e) = kernel.delete_link(&link.name) {
                tracing::error!(link = %link.name, error = %e, "failed to delete dangling tunnel");
            }
        }
    }

    for (tunnel_id, peer) in desired {
        reconcile_one_tunnel(kernel, local, tunnel_id, peer, existing.get(tunnel_id));
    }
}

fn reconcile_one_tunnel(
    kernel: &dyn KernelAdapter,
    local: &LocalContext,
    tunnel_id: &str,
    peer: &Peer,
    existing: Option<&Link>,
) {
    let gateway_strings = local.gateway_string_set();

    if let Some(link) = existing {
        match addresses_in_sync(kernel, tunnel_id, link, peer, local, &gateway_strings) {
            Ok(true) => {
                tracing::debug!(tunnel = %tunnel_id, peer = %peer.name, "tunnel is up and in sync, skipping");
                return;
            }
            Ok(false) => {
                tracing::debug!(tunnel = %tunnel_id, peer = %peer.name, "tunnel out of sync, recreating");
            }
            Err(e) => {
                tracing::error!(tunnel = %tunnel_id, error = %e, "failed to list addresses, recreating tunnel");
            }
        }
        if let Err(e) = kernel.delete_link(tunnel_id) {
            tracing::error!(tunnel = %tunnel_id, error = %e, "failed to delete stale tunnel");
            return;
        }
    }

    tracing::info!(tunnel = %tunnel_id, peer = %peer.name, remote = %peer.endpoint, "creating tunnel");
    let spec = TunnelSpec {
        name: tunnel_id.to_string(),
        local: local.local_endpoint.into(),
        remote: peer.endpoint.into(),
        mtu: local.tunnel_mtu,
    };
    if let Err(e) = kernel.add_tunnel_link(&spec) {
        tracing::error!(tunnel = %tunnel_id, error = %e, "failed to create tunnel");
        return;
    }
    for gateway in &local.gateway_addresses {
        let addr = LinkAddress {
            address: gateway.address,
            prefix_len: gateway.prefix_len,
        };
        if let Err(e) = kernel.add_address(tunnel_id, &addr) {
            tracing::error!(tunnel = %tunnel_id, error = %e, address = %addr.canonical_string(), "failed to add gateway address");
        }
    }
    if let Err(e) = kernel.set_link_up(tunnel_id) {
        tracing::error!(tunnel = %tunnel_id, error = %e, "failed to bring tunnel up");
    }
}

/// `true` when the link is up, bound to the correct local/remote
/// endpoints and MTU, and carries exactly the expected gateway
/// addresses. "Up" means the UP flag bit is actually set.
fn addresses_in_sync(
    kernel: &dyn KernelAdapter,
    tunnel_id: &str,
    link: &Link,
    peer: &Peer,
    local: &LocalContext,
    gateway_strings: &std::collections::BTreeSet<String>,
) -> Result<bool, crate::error::KernelError> {
    if !link.up
        || link.local != Some(local.local_endpoint.into())
        || link.remote != Some(peer.endpoint.into())
        || link.mtu != local.tunnel_mtu
    {
        return Ok(false);
    }
    let addresses = kernel.list_addresses(tunnel_id)?;
    let installed: std::collections::BTreeSet<String> = addresses
        .iter()
        .filter(|a| a.is_universe_scope_host())
        .map(LinkAddress::canonical_string)
        .collect();
    Ok(&installed == gateway_strings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::FakeKernelAdapter;
    use crate::model::parse_subnets;

    fn local_ctx() -> LocalContext {
        LocalContext::new(
            "2001:db8::1".parse().unwrap(),
            parse_subnets(["10.0.0.0/24", "fd00::/80"]).unwrap(),
            1450,
        )
    }

    fn peer(name: &str, endpoint: &str, tunnel_id: &str, subnets: &[&str]) -> Peer {
        Peer {
            name: name.to_string(),
            endpoint: endpoint.parse().unwrap(),
            subnets: parse_subnets(subnets.iter().copied()).unwrap(),
            tunnel_id: tunnel_id.to_string(),
        }
    }

    #[test]
    fn creates_tunnel_with_gateway_addresses_and_brings_it_up() {
        let kernel = FakeKernelAdapter::new();
        let local = local_ctx();
        let mut snapshot = PeerMap::new();
        snapshot.insert(
            "beta".into(),
            peer("beta", "2001:db8::2", "shiba.beta1", &["10.0.1.0/24"]),
        );

        reconcile_tunnels(&kernel, &local, &snapshot);

        let links = kernel.list_links().unwrap();
        assert_eq!(links.len(), 1);
        assert!(links[0].up);
        let addrs = kernel.list_addresses("shiba.beta1").unwrap();
        let strings: std::collections::BTreeSet<_> =
            addrs.iter().map(LinkAddress::canonical_string).collect();
        assert_eq!(strings, local.gateway_string_set());
    }

    #[test]
    fn repeated_reconciliation_is_a_no_op() {
        let kernel = FakeKernelAdapter::new();
        let local = local_ctx();
        let mut snapshot = PeerMap::new();
        snapshot.insert(
            "beta".into(),
            peer("beta", "2001:db8::2", "shiba.beta1", &["10.0.1.0/24"]),
        );
        reconcile_tunnels(&kernel, &local, &snapshot);
        let first = kernel.list_links().unwrap();
        reconcile_tunnels(&kernel, &local, &snapshot);
        let second = kernel.list_links().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn dangling_tunnels_are_removed() {
        let kernel = FakeKernelAdapter::new();
        let local = local_ctx();
        kernel.seed_link(Link {
            name: "shiba.stale".into(),
            kind: crate::kernel::IP6_TUNNEL_KIND.into(),
            up: true,
            mtu: 1450,
            local: Some(local.local_endpoint.into()),
            remote: Some("2001:db8::99".parse().unwrap()),
        });
        reconcile_tunnels(&kernel, &local, &PeerMap::new());
        assert!(kernel.link_names().is_empty());
    }

    #[test]
    fn out_of_band_remote_drift_forces_recreate() {
        let kernel = FakeKernelAdapter::new();
        let local = local_ctx();
        kernel.seed_link(Link {
            name: "shiba.beta1".into(),
            kind: crate::kernel::IP6_TUNNEL_KIND.into(),
            up: true,
            mtu: 1450,
            local: Some(local.local_endpoint.into()),
            remote: Some("2001:db8::99".parse().unwrap()),
        });
        let mut snapshot = PeerMap::new();
        snapshot.insert(
            "beta".into(),
            peer("beta", "2001:db8::2", "shiba.beta1", &["10.0.1.0/24"]),
        );
        reconcile_tunnels(&kernel, &local, &snapshot);
        let links = kernel.list_links().unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].remote, Some("2001:db8::2".parse().unwrap()));
    }

    #[test]
    fn endpoint_change_recreates_tunnel_under_new_id() {
        let kernel = FakeKernelAdapter::new();
        let local = local_ctx();
        let mut snapshot = PeerMap::new();
        snapshot.insert(
            "beta".into(),
            peer("beta", "2001:db8::2", "shiba.beta1", &["10.0.1.0/24"]),
        );
        reconcile_tunnels(&kernel, &local, &snapshot);

        // New event redraws the tunnel id, as the event processor does.
        let mut next = PeerMap::new();
        next.insert(
            "beta".into(),
            peer("beta", "2001:db8::22", "shiba.beta2", &["10.0.1.0/24"]),
        );
        reconcile_tunnels(&kernel, &local, &next);

        let names = kernel.link_names();
        assert_eq!(names, vec!["shiba.beta2".to_string()]);
    }

    #[test]
    fn result_set_matches_snapshot_tunnel_ids_exactly() {
        let kernel = FakeKernelAdapter::new();
        let local = local_ctx();
        let mut snapshot = PeerMap::new();
        snapshot.insert(
            "beta".into(),
            peer("beta", "2001:db8::2", "shiba.beta1", &["10.0.1.0/24"]),
        );
        snapshot.insert(
            "gamma".into(),
            peer("gamma", "2001:db8::3", "shiba.gamma1", &["10.0.2.0/24"]),
        );
        reconcile_tunnels(&kernel, &local, &snapshot);
        let mut names = kernel.link_names();
        names.sort();
        assert_eq!(names, vec!["shiba.beta1".to_string(), "shiba.gamma1".to_string()]);
    }
}
