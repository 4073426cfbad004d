//! The cluster-events interface this agent consumes.
//!
//! The cluster client library itself — the thing that actually talks to
//! the orchestrator's control plane — is out of scope here: only its
//! interface matters to the rest of the agent. This module defines the
//! trait the rest of the agent depends on, a `reqwest`-backed
//! implementation against a generic NDJSON watch endpoint (the simplest
//! real transport that satisfies the interface), and an in-memory fake
//! used by every test in this crate.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use futures::stream::BoxStream;
use serde::Deserialize;

use crate::error::ClusterError;

/// One of the node's addresses, as reported by the control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeAddress {
    #[serde(rename = "type")]
    pub kind: String,
    pub address: String,
}

/// A node as reported by the cluster control plane.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<NodeAddress>,
    #[serde(default)]
    pub pod_cidr: String,
    #[serde(default)]
    pub pod_cidrs: Vec<String>,
}

impl Node {
    /// The first IPv6 address among `addresses` entries of type
    /// `InternalIP`.
    pub fn find_internal_ipv6(&self) -> Option<std::net::Ipv6Addr> {
        self.addresses
            .iter()
            .filter(|a| a.kind == "InternalIP")
            .find_map(|a| match a.address.parse::<std::net::IpAddr>().ok()? {
                std::net::IpAddr::V6(v6) => Some(v6),
                std::net::IpAddr::V4(_) => None,
            })
    }

    /// The union of the primary `pod_cidr` field and the `pod_cidrs`
    /// list, as raw strings (not yet parsed/canonicalized).
    pub fn raw_pod_cidrs(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.pod_cidrs.len() + 1);
        if !self.pod_cidr.is_empty() {
            out.push(self.pod_cidr.clone());
        }
        out.extend(self.pod_cidrs.iter().cloned());
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
    Other,
}

#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub kind: EventKind,
    pub node: Node,
}

/// The upstream cluster-events interface, consumed by discovery, the
/// event processor (via the watcher supervisor), and the peer store's
/// cache validation.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_nodes(&self, timeout: Duration) -> Result<Vec<Node>, ClusterError>;
    async fn get_node(&self, name: &str, timeout: Duration) -> Result<Node, ClusterError>;
    async fn watch_nodes(&self) -> Result<BoxStream<'static, NodeEvent>, ClusterError>;
    /// Supplemental: the cluster-wide pod CIDR pool, used as a fallback
    /// when `--cluster-pod-cidrs` is not given.
    async fn get_cluster_pod_cidrs(&self, timeout: Duration) -> Result<Vec<String>, ClusterError>;
}

/// An in-memory cluster client used by tests: nodes are pre-seeded and
/// events are injected by the test through [`FakeClusterClient::push_event`].
/// The watch stream never closes on its own — tests close it explicitly
/// via [`FakeClusterClient::close_stream`] to exercise the watcher
/// supervisor's reconnect behavior.
pub struct FakeClusterClient {
    nodes: Mutex<std::collections::HashMap<String, Node>>,
    events: Mutex<VecDeque<NodeEvent>>,
    cluster_pod_cidrs: Mutex<Vec<String>>,
    stream_closed: Mutex<bool>,
}

impl FakeClusterClient {
    pub fn new() -> Self {
        FakeClusterClient {
            nodes: Mutex::new(std::collections::HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            cluster_pod_cidrs: Mutex::new(Vec::new()),
            stream_closed: Mutex::new(false),
        }
    }

    pub fn seed_node(&self, node: Node) {
        self.nodes.lock().unwrap().insert(node.name.clone(), node);
    }

    pub fn push_event(&self, event: NodeEvent) {
        self.events.lock().unwrap().push_back(event);
    }

    pub fn close_stream(&self) {
        *self.stream_closed.lock().unwrap() = true;
    }

    pub fn set_cluster_pod_cidrs(&self, cidrs: Vec<String>) {
        *self.cluster_pod_cidrs.lock().unwrap() = cidrs;
    }
}

impl Default for FakeClusterClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ClusterClient for FakeClusterClient {
    async fn list_nodes(&self, _timeout: Duration) -> Result<Vec<Node>, ClusterError> {
        Ok(self.nodes.lock().unwrap().values().cloned().collect())
    }

    async fn get_node(&self, name: &str, _timeout: Duration) -> Result<Node, ClusterError> {
        self.nodes
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))
    }

    async fn watch_nodes(&self) -> Result<BoxStream<'static, NodeEvent>, ClusterError> {
        // Drains whatever events are queued at call time, then ends —
        // tests call `watch_nodes` again (as the watcher supervisor
        // does on stream close) to pick up subsequently pushed events.
        let mut events = self.events.lock().unwrap();
        let drained: Vec<NodeEvent> = events.drain(..).collect();
        Ok(Box::pin(tokio_stream::iter(drained)))
    }

    async fn get_cluster_pod_cidrs(&self, _timeout: Duration) -> Result<Vec<String>, ClusterError> {
        Ok(self.cluster_pod_cidrs.lock().unwrap().clone())
    }
}

/// A `reqwest`-backed client against a generic control-plane REST+NDJSON
/// interface: `GET {base}/nodes`, `GET {base}/nodes/{name}`, and a
/// chunked-NDJSON `GET {base}/watch/nodes`. The real cluster client
/// library is out of scope for this spec; this implementation exists so
/// the agent is runnable end-to-end against a minimal control plane.
pub struct HttpClusterClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    node: Node,
}

impl HttpClusterClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpClusterClient {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl ClusterClient for HttpClusterClient {
    async fn list_nodes(&self, timeout: Duration) -> Result<Vec<Node>, ClusterError> {
        self.http
            .get(format!("{}/nodes", self.base_url))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| ClusterError::Parse(e.to_string()))
    }

    async fn get_node(&self, name: &str, timeout: Duration) -> Result<Node, ClusterError> {
        let resp = self
            .http
            .get(format!("{}/nodes/{name}", self.base_url))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClusterError::NotFound(name.to_string()));
        }
        resp.json()
            .await
            .map_err(|e| ClusterError::Parse(e.to_string()))
    }

    async fn watch_nodes(&self) -> Result<BoxStream<'static, NodeEvent>, ClusterError> {
        use futures::StreamExt;
        let resp = self
            .http
            .get(format!("{}/watch/nodes", self.base_url))
            .send()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        let byte_stream = resp.bytes_stream();
        let lines = tokio_util::codec::FramedRead::new(
            tokio_util::io::StreamReader::new(
                byte_stream.map(|r| r.map_err(std::io::Error::other)),
            ),
            tokio_util::codec::LinesCodec::new(),
        );
        let events = lines.filter_map(|line| async move {
            let line = line.ok()?;
            let wire: WireEvent = serde_json::from_str(&line).ok()?;
            let kind = match wire.kind.as_str() {
                "Added" => EventKind::Added,
                "Modified" => EventKind::Modified,
                "Deleted" => EventKind::Deleted,
                _ => EventKind::Other,
            };
            Some(NodeEvent { kind, node: wire.node })
        });
        Ok(Box::pin(events))
    }

    async fn get_cluster_pod_cidrs(&self, timeout: Duration) -> Result<Vec<String>, ClusterError> {
        #[derive(Deserialize)]
        struct ClusterInfo {
            #[serde(default)]
            pod_cidrs: Vec<String>,
        }
        let info: ClusterInfo = self
            .http
            .get(format!("{}/cluster-info", self.base_url))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| ClusterError::Parse(e.to_string()))?;
        Ok(info.pod_cidrs)
    }
}
