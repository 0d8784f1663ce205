//! Restock Monitor
//!
//! Single-binary Rust service that:
//! 1. Loads the tracked products and retailer sites
//! 2. Starts the shared credential pool and its background refresh
//! 3. Spawns one polling task per (product, site) pair
//! 4. Dispatches restock notifications as variants come back in stock
//! 5. Optionally serves /health and /metrics

mod config;
mod diff;
mod error;
mod latency;
mod metrics;
mod notify;
mod runner;
mod source_impl;
mod task;
mod transport;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use credential_pool::{Pool, SystemClock, spawn_refresh_task};
use metrics_exporter_prometheus::PrometheusHandle;
use site::{JsonAdapter, SiteAdapter};

use crate::config::{Config, CredentialsConfig};
use crate::notify::Dispatcher;
use crate::runner::{Runner, Shared, SitePolicy};
use crate::source_impl::ChallengeSource;
use crate::transport::ProxyPool;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    started_at: Instant,
    tasks: usize,
    pool: Option<Arc<Pool>>,
    prometheus: PrometheusHandle,
}

/// Build the axum router for the status listener.
fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting restock-monitor");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        sites = config.sites.len(),
        products = config.tasks.len(),
        credentials = config.credentials.is_some(),
        webhooks = config.notify.webhooks.len(),
        "configuration loaded"
    );

    let http = reqwest::Client::builder()
        .timeout(config.monitor.request_timeout())
        .build()
        .context("failed to build HTTP client")?;

    let pool = match &config.credentials {
        Some(credentials) => Some(start_pool(credentials, http.clone()).await?),
        None => {
            warn!("no [credentials] section, polling without credentials");
            None
        }
    };

    if config.notify.webhooks.is_empty() && config.notify.restock_server.is_none() {
        warn!("no notification targets configured, restocks will only be logged");
    }

    let shared = Shared {
        pool: pool.clone(),
        dispatcher: Arc::new(Dispatcher::new(http, &config.notify)),
        proxies: ProxyPool::new(config.proxies.clone()),
        monitor: config.monitor.clone(),
        latency: config.latency.clone(),
    };

    let adapters: HashMap<&str, Arc<dyn SiteAdapter>> = config
        .sites
        .iter()
        .map(|site| {
            let adapter: Arc<dyn SiteAdapter> = Arc::new(JsonAdapter::new(
                site.id.as_str(),
                site.name.as_str(),
                site.url_template.as_str(),
                site.json.clone(),
            ));
            (site.id.as_str(), adapter)
        })
        .collect();

    let mut tasks = JoinSet::new();
    for task in &config.tasks {
        for site_id in &task.sites {
            let (Some(site), Some(adapter)) = (config.site(site_id), adapters.get(site_id.as_str()))
            else {
                anyhow::bail!("task {} references unknown site {site_id}", task.product);
            };
            let runner = Runner::new(
                shared.clone(),
                adapter.clone(),
                SitePolicy::from(site),
                &task.product,
            )
            .with_context(|| format!("failed to start task {}@{site_id}", task.product))?;
            tasks.spawn(runner.run());
        }
    }
    let task_count = tasks.len();
    info!(
        tasks = task_count,
        proxies = shared.proxies.len(),
        "all polling tasks started"
    );

    let status_server = match config.status.listen_addr {
        Some(addr) => {
            let app = build_router(AppState {
                started_at: Instant::now(),
                tasks: task_count,
                pool,
                prometheus: prometheus_handle,
            });
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind status listener to {addr}"))?;
            info!(addr = %addr, "status endpoint listening");
            Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "status server failed");
                }
            }))
        }
        None => None,
    };

    // Tasks never finish in normal operation; this only returns on shutdown
    // or when every task has died.
    let all_tasks = async {
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(()) => error!("polling task exited unexpectedly"),
                Err(e) => error!(error = %e, "polling task panicked"),
            }
        }
    };

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = all_tasks => warn!("all polling tasks have stopped"),
    }

    tasks.shutdown().await;
    if let Some(server) = status_server {
        server.abort();
    }

    info!("shutdown complete");
    Ok(())
}

/// Build the credential pool, install configured seeds and start the
/// background refresh.
async fn start_pool(credentials: &CredentialsConfig, client: reqwest::Client) -> Result<Arc<Pool>> {
    if credentials.api_key.is_none() {
        warn!("no token service API key configured (TOKEN_API_KEY or api_key_file)");
    }

    let source = ChallengeSource::new(
        client,
        credentials.token_endpoint.clone(),
        credentials.challenge_url.clone(),
        credentials.api_key.clone(),
    );
    let keys = credentials.slot_keys();
    let pool = Arc::new(Pool::new(
        keys.clone(),
        Duration::from_secs(credentials.ttl_secs),
        Arc::new(source),
        Arc::new(SystemClock),
    ));

    for (key, seed) in keys.iter().zip(&credentials.seeds) {
        pool.seed(key, seed.clone())
            .await
            .with_context(|| format!("failed to seed credential slot {key}"))?;
    }
    info!(
        slots = keys.len(),
        seeded = credentials.seeds.len().min(keys.len()),
        "credential pool ready"
    );

    spawn_refresh_task(
        pool.clone(),
        Duration::from_secs(credentials.refresh_interval_secs),
        Duration::from_secs(credentials.refresh_threshold_secs),
    );
    Ok(pool)
}

/// Health endpoint: task count, uptime and credential pool state.
/// Returns 503 when a credential pool is configured but holds no fresh credential.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let credentials = state.pool.as_ref().map(|pool| pool.health());
    let unhealthy = credentials
        .as_ref()
        .is_some_and(|health| health["status"] == "unhealthy");

    let (status_code, status) = if unhealthy {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "degraded")
    } else {
        (axum::http::StatusCode::OK, "healthy")
    };

    let body = serde_json::json!({
        "status": status,
        "uptime_seconds": uptime,
        "tasks": state.tasks,
        "credentials": credentials,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT.
///
/// A handler that cannot be installed is logged and never fires; the other
/// signal still works.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
