//! Converts cluster-membership events into peer-store mutations and
//! decides when to fire the reconciliation engine.

use tokio::sync::mpsc;

use crate::cluster::{EventKind, Node, NodeEvent};
use crate::model::{parse_subnets, Peer};
use crate::store::PeerStore;
use crate::uid::UidGenerator;

/// Consumes one node event at a time, updates the peer store, and
/// best-effort signals the fire channel. Owned by the watcher
/// supervisor's task — the only place [`Peer`]s are constructed, which
/// is what makes the single-threaded [`UidGenerator`] safe to use here.
pub struct EventProcessor {
    local_node_name: String,
    store: std::sync::Arc<PeerStore>,
    fire_tx: mpsc::Sender<()>,
    uid: UidGenerator,
}

impl EventProcessor {
    pub fn new(
        local_node_name: String,
        store: std::sync::Arc<PeerStore>,
        fire_tx: mpsc::Sender<()>,
    ) -> Self {
        EventProcessor {
            local_node_name,
            store,
            fire_tx,
            uid: UidGenerator::new(),
        }
    }

    /// Process one event. Returns `true` if a fire signal was emitted
    /// (best-effort — the caller cannot distinguish "sent" from "dropped
    /// because the channel was full", which is by design: both mean "a
    /// reconciliation pass is already pending").
    pub fn process(&self, event: NodeEvent) -> bool {
        if event.node.name == self.local_node_name {
            tracing::debug!(node = %event.node.name, "ignoring event about the local node");
            return false;
        }

        let candidate = match self.build_candidate(&event.node) {
            Some(peer) => peer,
            None => return false,
        };

        let fired = match event.kind {
            EventKind::Added => self.handle_added(candidate),
            EventKind::Modified => self.handle_modified(candidate),
            EventKind::Deleted => self.handle_deleted(&event.node.name),
            EventKind::Other => {
                tracing::warn!(node = %event.node.name, "ignoring event of unexpected kind");
                false
            }
        };

        if fired {
            tracing::info!(node = %event.node.name, "processed event, firing reconciliation");
            let _ = self.fire_tx.try_send(());
        }
        fired
    }

    fn build_candidate(&self, node: &Node) -> Option<Peer> {
        let endpoint = match node.find_internal_ipv6() {
            Some(ip) => ip,
            None => {
                tracing::error!(node = %node.name, "failed to find ipv6 address of node");
                return None;
            }
        };
        let subnets = match parse_subnets(node.raw_pod_cidrs()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(node = %node.name, error = %e, "failed to parse pod cidrs of node");
                return None;
            }
        };
        Some(Peer {
            name: node.name.clone(),
            endpoint,
            subnets,
            tunnel_id: self.uid.next(),
        })
    }

    fn handle_added(&self, candidate: Peer) -> bool {
        let mut map = self.store.snapshot();
        if map.contains_key(&candidate.name) {
            tracing::debug!(node = %candidate.name, "added event for an existing node, treating as modified");
            return self.apply_modified(map, candidate);
        }
        let name = candidate.name.clone();
        map.insert(name, candidate);
        self.store.replace(map);
        self.store.persist();
        true
    }

    fn handle_modified(&self, candidate: Peer) -> bool {
        let map = self.store.snapshot();
        if !map.contains_key(&candidate.name) {
            tracing::debug!(node = %candidate.name, "modified event for an unknown node, treating as added");
            return self.handle_added(candidate);
        }
        self.apply_modified(map, candidate)
    }

    fn apply_modified(&self, mut map: crate::model::PeerMap, candidate: Peer) -> bool {
        let name = candidate.name.clone();
        let unchanged = map
            .get(&name)
            .is_some_and(|existing| existing.semantically_equal(&candidate));
        if unchanged {
            tracing::debug!(node = %name, "node has no semantic changes");
            return false;
        }
        map.insert(name, candidate);
        self.store.replace(map);
        self.store.persist();
        true
    }

    fn handle_deleted(&self, name: &str) -> bool {
        let mut map = self.store.snapshot();
        if map.remove(name).is_none() {
            tracing::warn!(node = %name, "deleting node which is not present");
            return false;
        }
        self.store.replace(map);
        self.store.persist();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeAddress;

    fn event(kind: EventKind, name: &str, endpoint: &str, subnets: &[&str]) -> NodeEvent {
        NodeEvent {
            kind,
            node: Node {
                name: name.to_string(),
                addresses: vec![NodeAddress {
                    kind: "InternalIP".to_string(),
                    address: endpoint.to_string(),
                }],
                pod_cidr: String::new(),
                pod_cidrs: subnets.iter().map(|s| s.to_string()).collect(),
            },
        }
    }

    fn processor() -> (EventProcessor, std::sync::Arc<PeerStore>, mpsc::Receiver<()>) {
        let store = std::sync::Arc::new(PeerStore::new());
        let (tx, rx) = mpsc::channel(1);
        let processor = EventProcessor::new("alpha".to_string(), store.clone(), tx);
        (processor, store, rx)
    }

    #[test]
    fn self_node_events_never_mutate_or_fire() {
        let (processor, store, mut rx) = processor();
        let fired = processor.process(event(EventKind::Added, "alpha", "2001:db8::1", &["10.0.0.0/24"]));
        assert!(!fired);
        assert!(store.snapshot().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn added_event_inserts_and_fires() {
        let (processor, store, mut rx) = processor();
        let fired = processor.process(event(EventKind::Added, "beta", "2001:db8::2", &["10.0.1.0/24"]));
        assert!(fired);
        assert!(store.snapshot().contains_key("beta"));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn semantically_identical_modified_does_not_fire() {
        let (processor, _store, mut rx) = processor();
        processor.process(event(EventKind::Added, "beta", "2001:db8::2", &["10.0.1.0/24"]));
        rx.try_recv().unwrap();
        // Same data, subnets reversed order makes no difference post-canonicalization.
        let fired = processor.process(event(EventKind::Modified, "beta", "2001:db8::2", &["10.0.1.0/24"]));
        assert!(!fired);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn modified_event_with_new_subnet_fires_and_redraws_tunnel_id() {
        let (processor, store, mut rx) = processor();
        processor.process(event(EventKind::Added, "beta", "2001:db8::2", &["10.0.1.0/24"]));
        rx.try_recv().unwrap();
        let old_tunnel = store.snapshot()["beta"].tunnel_id.clone();

        let fired = processor.process(event(
            EventKind::Modified,
            "beta",
            "2001:db8::2",
            &["10.0.1.0/24", "10.0.9.0/24"],
        ));
        assert!(fired);
        assert!(rx.try_recv().is_ok());
        let new_peer = store.snapshot()["beta"].clone();
        assert_eq!(new_peer.subnets.len(), 2);
        assert_ne!(new_peer.tunnel_id, old_tunnel);
    }

    #[test]
    fn modified_event_for_unknown_node_behaves_as_added() {
        let (processor, store, mut rx) = processor();
        let fired = processor.process(event(EventKind::Modified, "beta", "2001:db8::2", &["10.0.1.0/24"]));
        assert!(fired);
        assert!(store.snapshot().contains_key("beta"));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn deleted_event_removes_and_fires() {
        let (processor, store, mut rx) = processor();
        processor.process(event(EventKind::Added, "beta", "2001:db8::2", &["10.0.1.0/24"]));
        rx.try_recv().unwrap();
        let fired = processor.process(event(EventKind::Deleted, "beta", "2001:db8::2", &["10.0.1.0/24"]));
        assert!(fired);
        assert!(!store.snapshot().contains_key("beta"));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn deleted_event_for_absent_node_does_not_fire() {
        let (processor, _store, mut rx) = processor();
        let fired = processor.process(event(EventKind::Deleted, "beta", "2001:db8::2", &["10.0.1.0/24"]));
        assert!(!fired);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn malformed_event_is_ignored_without_mutation() {
        let (processor, store, mut rx) = processor();
        // No IPv6 address at all.
        let e = NodeEvent {
            kind: EventKind::Added,
            node: Node {
                name: "beta".to_string(),
                addresses: vec![],
                pod_cidr: "10.0.1.0/24".to_string(),
                pod_cidrs: vec![],
            },
        };
        let fired = processor.process(e);
        assert!(!fired);
        assert!(store.snapshot().is_empty());
        assert!(rx.try_recv().is_err());
    }
}
