//! Periodic healer: fires the reconciliation engine on a fixed interval
//! regardless of cluster activity, so drift introduced out-of-band (a
//! manually deleted route, a rebooted tunnel) is eventually corrected
//! even without a triggering event.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const PERIOD: Duration = Duration::from_secs(60);

pub async fn run(fire_tx: mpsc::Sender<()>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(PERIOD);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("periodic trigger shutting down");
                return;
            }
            _ = interval.tick() => {
                tracing::debug!("periodic trigger firing reconciliation");
                let _ = fire_tx.try_send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_each_period() {
        let (tx, mut rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(tx, shutdown.clone()));

        tokio::time::advance(PERIOD + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_ok());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_with_a_pending_signal() {
        let (tx, mut rx) = mpsc::channel(1);
        tx.try_send(()).unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(tx, shutdown.clone()));

        tokio::time::advance(PERIOD + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        // Channel capacity is 1: the pre-seeded signal plus the tick's
        // own try_send means at most one pending signal, never a panic
        // or a backlog.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
