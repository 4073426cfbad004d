use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use shiba_agent::cluster::{ClusterClient, HttpClusterClient};
use shiba_agent::config::Config;
use shiba_agent::kernel::{KernelAdapter, NetlinkKernelAdapter};
use shiba_agent::store::PeerStore;
use shiba_agent::{cni, discovery, event, nat, periodic, reconcile, watcher};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    let json_logs = config.log_json || std::env::var("SHIBA_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("shiba_agent=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    warn_if_not_root();

    tracing::info!(node = %config.node_name, "starting shiba-agent");

    let client: Arc<dyn ClusterClient> = Arc::new(HttpClusterClient::new(config.cluster_api_url.clone()));
    let local = discovery::discover_local_context(
        client.as_ref(),
        &config.node_name,
        config.cluster_pod_cidrs.as_deref(),
        config.api_timeout,
        config.ip6tnl_mtu,
    )
    .await
    .context("failed to discover local node context")?;
    tracing::info!(
        endpoint = %local.local_endpoint,
        subnets = local.local_subnets.len(),
        "local node context resolved"
    );

    if let Err(e) = cni::write_cni_config(&config.cni_config_path, &local.local_subnets) {
        tracing::error!(error = %e, "failed to write CNI configuration");
    }

    let cluster_pod_cidrs = match &config.cluster_pod_cidrs {
        Some(cidrs) => shiba_agent::model::parse_subnets(cidrs.iter().cloned())?,
        None => {
            let raw = client
                .get_cluster_pod_cidrs(config.api_timeout)
                .await
                .context("failed to fetch cluster-wide pod cidrs for nat setup")?;
            shiba_agent::model::parse_subnets(raw)?
        }
    };
    if let Err(e) = nat::setup_nat(&cluster_pod_cidrs) {
        tracing::error!(error = %e, "failed to set up nat rules");
    }

    let store = Arc::new(PeerStore::new());
    store.load_and_validate(client.as_ref(), config.api_timeout).await;

    let kernel: Arc<dyn KernelAdapter> = Arc::new(
        NetlinkKernelAdapter::new(tokio::runtime::Handle::current())
            .context("failed to open netlink connection")?,
    );

    let initial_stream = watcher::open_initial_stream(client.as_ref())
        .await
        .context("failed to open initial cluster watch stream")?;

    let (fire_tx, fire_rx) = tokio::sync::mpsc::channel(1);
    let shutdown = CancellationToken::new();

    let processor = Arc::new(event::EventProcessor::new(
        config.node_name.clone(),
        store.clone(),
        fire_tx.clone(),
    ));
    let watcher_handle = tokio::spawn(watcher::run(
        client.clone(),
        processor,
        initial_stream,
        shutdown.clone(),
    ));

    let engine = reconcile::ReconciliationEngine::new(
        kernel,
        local,
        store.clone(),
        fire_rx,
        shutdown.clone(),
    );
    let engine_handle = tokio::spawn(engine.run());

    let periodic_handle = tokio::spawn(periodic::run(fire_tx.clone(), shutdown.clone()));

    // Run at least one pass at startup so cached/validated peers
    // converge immediately rather than waiting for the first event or
    // the first periodic tick.
    let _ = fire_tx.try_send(());

    let debug_handle = if config.debug_port > 0 {
        Some(tokio::spawn(run_debug_endpoint(
            config.debug_port,
            store.clone(),
            shutdown.clone(),
        )))
    } else {
        None
    };

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received");
    shutdown.cancel();

    let _ = watcher_handle.await;
    let _ = engine_handle.await;
    let _ = periodic_handle.await;
    if let Some(handle) = debug_handle {
        let _ = handle.await;
    }

    Ok(())
}

fn warn_if_not_root() {
    #[cfg(unix)]
    {
        // SAFETY: geteuid takes no arguments and has no preconditions.
        let euid = unsafe { libc::geteuid() };
        if euid != 0 {
            tracing::warn!("not running as root: kernel operations will likely fail");
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run_debug_endpoint(port: u16, store: Arc<PeerStore>, shutdown: CancellationToken) {
    use axum::{routing::get, Json, Router};

    async fn healthz() -> &'static str {
        "ok"
    }

    async fn peers(store: axum::extract::State<Arc<PeerStore>>) -> Json<shiba_agent::model::PeerMap> {
        Json(store.snapshot())
    }

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/debug/peers", get(peers))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(store);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, port, "failed to bind debug endpoint");
            return;
        }
    };
    tracing::info!(port, "debug endpoint listening");
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown.cancelled().await;
    });
    if let Err(e) = serve.await {
        tracing::error!(error = %e, "debug endpoint exited with error");
    }
}
