//! Worker mode — one member of the pool.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::Router;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use tracing::{info, warn};

use peermetrics::{Counter, Gauge, MetricsHub, MetricsInit, PeerMetricsConfig};

/// Instruments every worker exports about itself.
struct WorkerInstruments {
    scrapes: Counter,
    uptime: Gauge,
    start_time: Gauge,
}

impl WorkerInstruments {
    fn new() -> Self {
        let started = Instant::now();
        let start_time = Gauge::new(
            "process_start_time_seconds",
            "Start time of the worker since unix epoch in seconds",
        );
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        start_time.set(epoch.floor());

        Self {
            scrapes: Counter::new("peermetricsd_scrapes_total", "Scrapes served by the pool"),
            uptime: Gauge::new("process_uptime_seconds", "Seconds since the worker started")
                .with_collect(move |g| g.set(started.elapsed().as_secs_f64().floor())),
            start_time,
        }
    }

    fn init(&self) -> MetricsInit {
        MetricsInit::new()
            .aggregated(self.scrapes.clone())
            .per_node(self.uptime.clone())
            .per_node(self.start_time.clone())
    }
}

/// Run one worker until Ctrl-C.
pub async fn run_worker(
    config_path: Option<PathBuf>,
    instance: Option<u32>,
    listen: Option<String>,
) -> anyhow::Result<()> {
    let mut config = match &config_path {
        Some(path) => PeerMetricsConfig::from_file(path)?,
        None => PeerMetricsConfig::default(),
    };
    if let Some(instance) = instance {
        config.cluster.instance = Some(instance);
    }
    if let Some(listen) = listen {
        config.http.listen = listen;
    }
    config.validate()?;

    let hub = Arc::new(MetricsHub::new());
    let instruments = WorkerInstruments::new();
    hub.init_from_config(&config, instruments.init())?;
    info!(
        index = hub.index(),
        clustered = hub.cluster().is_some(),
        "worker starting"
    );

    let router = build_router(hub.clone(), instruments.scrapes.clone());
    let listener = tokio::net::TcpListener::bind(&config.http.listen).await?;
    info!(addr = %listener.local_addr()?, "metrics endpoint listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    hub.dispose();
    info!("worker stopped");
    Ok(())
}

/// The hub's `/metrics` route, counting every scrape.
fn build_router(hub: Arc<MetricsHub>, scrapes: Counter) -> Router {
    peermetrics::http::metrics_router(hub)
        .layer(middleware::from_fn_with_state(scrapes, count_scrapes))
}

async fn count_scrapes(State(scrapes): State<Counter>, request: Request, next: Next) -> Response {
    scrapes.inc();
    next.run(request).await
}

pub(crate) async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
