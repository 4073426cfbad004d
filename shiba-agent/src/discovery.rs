//! One-shot self-discovery at boot: reads the local node's IPv6 endpoint
//! and pod subnets from the cluster client and builds the
//! [`LocalContext`] every reconciler needs.

use std::time::Duration;

use crate::cluster::ClusterClient;
use crate::error::BootError;
use crate::model::{parse_subnets, LocalContext};

/// Resolve the local node's context. `cluster_pod_cidrs` overrides
/// per-node pod subnets when given (the `--cluster-pod-cidrs` flag);
/// otherwise the node's own advertised subnets are used, falling back to
/// `client.get_cluster_pod_cidrs()` if the node has none at all.
pub async fn discover_local_context(
    client: &dyn ClusterClient,
    local_node_name: &str,
    cluster_pod_cidrs: Option<&[String]>,
    api_timeout: Duration,
    tunnel_mtu: u32,
) -> Result<LocalContext, BootError> {
    let node = client
        .get_node(local_node_name, api_timeout)
        .await
        .map_err(BootError::ClusterUnreachable)?;

    let local_endpoint = node.find_internal_ipv6().ok_or(BootError::NoLocalEndpoint)?;

    let raw_subnets = if let Some(overrides) = cluster_pod_cidrs {
        overrides.to_vec()
    } else {
        let own = node.raw_pod_cidrs();
        if own.is_empty() {
            tracing::info!(
                node = local_node_name,
                "local node advertises no pod subnets, falling back to cluster-wide pool"
            );
            client
                .get_cluster_pod_cidrs(api_timeout)
                .await
                .map_err(BootError::ClusterUnreachable)?
        } else {
            own
        }
    };

    let local_subnets = parse_subnets(raw_subnets).map_err(|e| {
        tracing::error!(error = %e, "failed to parse local pod subnets");
        BootError::NoLocalSubnets
    })?;
    if local_subnets.is_empty() {
        return Err(BootError::NoLocalSubnets);
    }

    Ok(LocalContext::new(local_endpoint, local_subnets, tunnel_mtu))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{FakeClusterClient, Node, NodeAddress};

    fn node(name: &str, endpoint: &str, pod_cidrs: &[&str]) -> Node {
        Node {
            name: name.to_string(),
            addresses: vec![NodeAddress {
                kind: "InternalIP".to_string(),
                address: endpoint.to_string(),
            }],
            pod_cidr: String::new(),
            pod_cidrs: pod_cidrs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn discovers_endpoint_and_subnets_from_own_node() {
        let client = FakeClusterClient::new();
        client.seed_node(node("alpha", "2001:db8::1", &["10.0.0.0/24"]));

        let ctx = discover_local_context(&client, "alpha", None, Duration::from_secs(1), 1450)
            .await
            .unwrap();
        assert_eq!(ctx.local_endpoint.to_string(), "2001:db8::1");
        assert_eq!(ctx.local_subnets.len(), 1);
    }

    #[tokio::test]
    async fn cluster_pod_cidrs_override_takes_precedence() {
        let client = FakeClusterClient::new();
        client.seed_node(node("alpha", "2001:db8::1", &["10.0.0.0/24"]));

        let overrides = vec!["10.99.0.0/24".to_string()];
        let ctx = discover_local_context(&client, "alpha", Some(&overrides), Duration::from_secs(1), 1450)
            .await
            .unwrap();
        assert_eq!(ctx.local_subnets[0].canonical_string(), "10.99.0.0/24");
    }

    #[tokio::test]
    async fn falls_back_to_cluster_wide_pool_when_node_has_no_subnets() {
        let client = FakeClusterClient::new();
        client.seed_node(node("alpha", "2001:db8::1", &[]));
        client.set_cluster_pod_cidrs(vec!["10.50.0.0/24".to_string()]);

        let ctx = discover_local_context(&client, "alpha", None, Duration::from_secs(1), 1450)
            .await
            .unwrap();
        assert_eq!(ctx.local_subnets[0].canonical_string(), "10.50.0.0/24");
    }

    #[tokio::test]
    async fn missing_ipv6_address_is_fatal() {
        let client = FakeClusterClient::new();
        client.seed_node(Node {
            name: "alpha".to_string(),
            addresses: vec![],
            pod_cidr: "10.0.0.0/24".to_string(),
            pod_cidrs: vec![],
        });
        let err = discover_local_context(&client, "alpha", None, Duration::from_secs(1), 1450)
            .await
            .unwrap_err();
        assert!(matches!(err, BootError::NoLocalEndpoint));
    }

    #[tokio::test]
    async fn unknown_local_node_is_fatal() {
        let client = FakeClusterClient::new();
        let err = discover_local_context(&client, "alpha", None, Duration::from_secs(1), 1450)
            .await
            .unwrap_err();
        assert!(matches!(err, BootError::ClusterUnreachable(_)));
    }
}
