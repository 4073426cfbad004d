//! The reconciliation engine: the long-running worker that converges
//! kernel state to the peer store's snapshot whenever it is told to fire.

mod route;
mod tunnel;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::kernel::KernelAdapter;
use crate::model::LocalContext;
use crate::store::PeerStore;

/// Grace period after a fire signal before reconciliation actually
/// starts, so a burst of closely-spaced events collapses into a single
/// pass instead of one pass per event.
const FIRE_DEBOUNCE: Duration = Duration::from_secs(1);

pub struct ReconciliationEngine {
    kernel: Arc<dyn KernelAdapter>,
    local: LocalContext,
    store: Arc<PeerStore>,
    fire_rx: mpsc::Receiver<()>,
    shutdown: CancellationToken,
}

impl ReconciliationEngine {
    pub fn new(
        kernel: Arc<dyn KernelAdapter>,
        local: LocalContext,
        store: Arc<PeerStore>,
        fire_rx: mpsc::Receiver<()>,
        shutdown: CancellationToken,
    ) -> Self {
        ReconciliationEngine {
            kernel,
            local,
            store,
            fire_rx,
            shutdown,
        }
    }

    /// Runs until the shutdown token is cancelled. Blocks on either a
    /// fire signal or shutdown; on fire, waits out [`FIRE_DEBOUNCE`],
    /// draining any further signals that land during the wait so a burst
    /// still produces one pass, then runs a reconciliation pass.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("reconciliation engine shutting down");
                    return;
                }
                signal = self.fire_rx.recv() => {
                    if signal.is_none() {
                        tracing::warn!("fire channel closed, reconciliation engine exiting");
                        return;
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(FIRE_DEBOUNCE) => {}
            }
            while self.fire_rx.try_recv().is_ok() {}

            self.reconcile_once();
        }
    }

    fn reconcile_once(&self) {
        let snapshot = self.store.snapshot();
        tracing::info!(peers = snapshot.len(), "running reconciliation pass");
        tunnel::reconcile_tunnels(self.kernel.as_ref(), &self.local, &snapshot);
        route::reconcile_routes(self.kernel.as_ref(), &snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::FakeKernelAdapter;
    use crate::model::{parse_subnets, Peer};

    fn local_ctx() -> LocalContext {
        LocalContext::new(
            "2001:db8::1".parse().unwrap(),
            parse_subnets(["10.0.0.0/24"]).unwrap(),
            1450,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn fire_triggers_a_reconciliation_pass_after_the_debounce() {
        let fake = Arc::new(FakeKernelAdapter::new());
        let kernel: Arc<dyn KernelAdapter> = fake.clone();
        let store = Arc::new(PeerStore::new());
        let mut map = crate::model::PeerMap::new();
        map.insert(
            "beta".into(),
            Peer {
                name: "beta".into(),
                endpoint: "2001:db8::2".parse().unwrap(),
                subnets: parse_subnets(["10.0.1.0/24"]).unwrap(),
                tunnel_id: "shiba.beta1".into(),
            },
        );
        store.replace(map);

        let (tx, rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let engine = ReconciliationEngine::new(kernel.clone(), local_ctx(), store, rx, shutdown.clone());
        let handle = tokio::spawn(engine.run());

        tx.send(()).await.unwrap();
        tokio::time::advance(FIRE_DEBOUNCE + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;

        assert_eq!(fake.link_names(), vec!["shiba.beta1".to_string()]);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
