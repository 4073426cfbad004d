//! Watcher supervisor: keeps a cluster-events watch stream open, feeding
//! every event to the [`EventProcessor`], and reopens it whenever it
//! closes for any reason short of shutdown.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterClient;
use crate::error::{BootError, ClusterError};
use crate::event::EventProcessor;

/// Opens the watch stream once, used at boot where a failure to open is
/// fatal (the agent has nothing to react to and should not start).
pub async fn open_initial_stream(
    client: &dyn ClusterClient,
) -> Result<futures::stream::BoxStream<'static, crate::cluster::NodeEvent>, BootError> {
    client.watch_nodes().await.map_err(BootError::WatchFailed)
}

/// Runs until `shutdown` is cancelled. Consumes `stream` to exhaustion,
/// processing each event; on stream end (or a transport error from the
/// client), reopens a fresh stream via `client.watch_nodes()` and
/// continues, so a restarted API server or a dropped connection is
/// transparent to the rest of the agent.
pub async fn run(
    client: Arc<dyn ClusterClient>,
    processor: Arc<EventProcessor>,
    mut stream: futures::stream::BoxStream<'static, crate::cluster::NodeEvent>,
    shutdown: CancellationToken,
) {
    loop {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("watcher supervisor shutting down");
                    return;
                }
                next = stream.next() => {
                    match next {
                        Some(event) => {
                            processor.process(event);
                        }
                        None => break,
                    }
                }
            }
        }

        tracing::warn!("cluster watch stream closed, reconnecting");
        stream = loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                result = client.watch_nodes() => {
                    match result {
                        Ok(s) => break s,
                        Err(e) => {
                            log_reconnect_failure(&e);
                            tokio::select! {
                                _ = shutdown.cancelled() => return,
                                _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
                            }
                        }
                    }
                }
            }
        };
    }
}

fn log_reconnect_failure(e: &ClusterError) {
    tracing::error!(error = %e, "failed to reopen cluster watch stream, retrying");
}
