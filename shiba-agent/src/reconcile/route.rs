//! Route reconciler: converges on-link routes on each peer's tunnel to
//! exactly that peer's subnet set.

use std::collections::BTreeMap;

use crate::kernel::{KernelAdapter, Route};
use crate::model::PeerMap;

/// For every peer in `snapshot`, find its tunnel link by `tunnel_id` and
/// make its on-link routes match the peer's subnets exactly. Per-peer
/// failures are logged and isolated.
pub fn reconcile_routes(kernel: &dyn KernelAdapter, snapshot: &PeerMap) {
    for peer in snapshot.values() {
        reconcile_peer_routes(kernel, peer);
    }
}

fn reconcile_peer_routes(kernel: &dyn KernelAdapter, peer: &crate::model::Peer) {
    let mut needed: BTreeMap<String, crate::model::Subnet> = peer
        .subnets
        .iter()
        .map(|s| (s.canonical_string(), *s))
        .collect();

    let existing = match kernel.list_routes(&peer.tunnel_id) {
        Ok(routes) => routes,
        Err(e) => {
            tracing::error!(peer = %peer.name, tunnel = %peer.tunnel_id, error = %e, "failed to list routes");
            return;
        }
    };

    for route in existing {
        let key = route.destination_string();
        if route.is_on_link() && needed.remove(&key).is_some() {
            continue;
        }
        tracing::debug!(peer = %peer.name, route = %key, "removing foreign route");
        if let Err(e) = kernel.delete_route(&peer.tunnel_id, &route) {
            tracing::error!(peer = %peer.name, route = %key, error = %e, "failed to delete foreign route");
        }
    }

    for (key, subnet) in needed {
        tracing::info!(peer = %peer.name, route = %key, "adding route");
        let route = Route {
            destination: subnet.0.addr(),
            prefix_len: subnet.0.prefix_len(),
            has_gateway: false,
            has_source: false,
        };
        if let Err(e) = kernel.add_route(&peer.tunnel_id, &route) {
            tracing::error!(peer = %peer.name, route = %key, error = %e, "failed to add route");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{FakeKernelAdapter, Link, IP6_TUNNEL_KIND};
    use crate::model::{parse_subnets, Peer};

    fn peer(name: &str, tunnel_id: &str, subnets: &[&str]) -> Peer {
        Peer {
            name: name.to_string(),
            endpoint: "2001:db8::2".parse().unwrap(),
            subnets: parse_subnets(subnets.iter().copied()).unwrap(),
            tunnel_id: tunnel_id.to_string(),
        }
    }

    fn seed_link(kernel: &FakeKernelAdapter, name: &str) {
        kernel.seed_link(Link {
            name: name.to_string(),
            kind: IP6_TUNNEL_KIND.to_string(),
            up: true,
            mtu: 1450,
            local: Some("2001:db8::1".parse().unwrap()),
            remote: Some("2001:db8::2".parse().unwrap()),
        });
    }

    #[test]
    fn installs_routes_for_every_subnet() {
        let kernel = FakeKernelAdapter::new();
        seed_link(&kernel, "shiba.beta1");
        let mut snapshot = PeerMap::new();
        snapshot.insert(
            "beta".into(),
            peer("beta", "shiba.beta1", &["10.0.1.0/24", "fd00:1::/80"]),
        );

        reconcile_routes(&kernel, &snapshot);

        let routes = kernel.list_routes("shiba.beta1").unwrap();
        assert_eq!(routes.len(), 2);
        assert!(routes.iter().all(Route::is_on_link));
    }

    #[test]
    fn removes_foreign_routes_not_in_the_subnet_set() {
        let kernel = FakeKernelAdapter::new();
        seed_link(&kernel, "shiba.beta1");
        kernel
            .add_route(
                "shiba.beta1",
                &Route {
                    destination: "10.0.99.0".parse().unwrap(),
                    prefix_len: 24,
                    has_gateway: false,
                    has_source: false,
                },
            )
            .unwrap();

        let mut snapshot = PeerMap::new();
        snapshot.insert("beta".into(), peer("beta", "shiba.beta1", &["10.0.1.0/24"]));

        reconcile_routes(&kernel, &snapshot);

        let routes = kernel.list_routes("shiba.beta1").unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].destination_string(), "10.0.1.0/24");
    }

    #[test]
    fn matching_routes_are_left_untouched() {
        let kernel = FakeKernelAdapter::new();
        seed_link(&kernel, "shiba.beta1");
        let mut snapshot = PeerMap::new();
        snapshot.insert("beta".into(), peer("beta", "shiba.beta1", &["10.0.1.0/24"]));

        reconcile_routes(&kernel, &snapshot);
        let first = kernel.list_routes("shiba.beta1").unwrap();
        reconcile_routes(&kernel, &snapshot);
        let second = kernel.list_routes("shiba.beta1").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_tunnel_link_is_logged_and_skipped() {
        let kernel = FakeKernelAdapter::new();
        let mut snapshot = PeerMap::new();
        snapshot.insert("beta".into(), peer("beta", "shiba.beta1", &["10.0.1.0/24"]));
        // Should not panic even though the tunnel link doesn't exist.
        reconcile_routes(&kernel, &snapshot);
    }

    #[test]
    fn gateway_or_source_routes_are_deleted_as_foreign() {
        let kernel = FakeKernelAdapter::new();
        seed_link(&kernel, "shiba.beta1");
        kernel
            .add_route(
                "shiba.beta1",
                &Route {
                    destination: "10.0.1.0".parse().unwrap(),
                    prefix_len: 24,
                    has_gateway: true,
                    has_source: false,
                },
            )
            .unwrap();

        let mut snapshot = PeerMap::new();
        snapshot.insert("beta".into(), peer("beta", "shiba.beta1", &["10.0.1.0/24"]));
        reconcile_routes(&kernel, &snapshot);

        let routes = kernel.list_routes("shiba.beta1").unwrap();
        // The gateway-bound route is never "ours" even though its
        // destination matches a needed subnet: it is deleted as foreign
        // and replaced with a proper on-link route for that subnet.
        assert_eq!(routes.len(), 1);
        assert!(routes[0].is_on_link());
        assert_eq!(routes[0].destination_string(), "10.0.1.0/24");
    }
}
