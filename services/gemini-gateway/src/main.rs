//! Gemini Key-Pool Gateway
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of Gemini API keys into a key store
//! 2. Listens for incoming Gemini API requests
//! 3. Attaches a pool key (or the caller's own key) to each request
//! 4. Proxies to generativelanguage.googleapis.com, rotating or quarantining
//!    keys when upstream rejects them

mod admin;
mod body;
mod config;
mod metrics;
mod proxy;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    CONTENT_TYPE,
};
use axum::http::{Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use classifier::Policy;
use key_pool::KeyPool;
use keystore::{FileKeyStore, KeyStore, MemoryKeyStore};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::config::{Config, StoreBackend};
use crate::metrics::ServiceMetrics;
use crate::proxy::{ForwardSettings, ProxyState};

/// Maximum time to wait for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// OPTIONS preflights are answered before routing, so they never reach the
/// pool or upstream. A concurrency limit layer caps in-flight requests at
/// `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/keycount", get(keycount_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(middleware::from_fn(preflight))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
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

    info!("starting gemini-gateway");

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
        listen_addr = %config.gateway.listen_addr,
        upstream_url = %config.gateway.upstream_url,
        max_attempts = config.gateway.max_attempts,
        rotation = ?config.pool.rotation,
        store = ?config.store.backend,
        seed_keys = config.pool.seed_keys.len(),
        "configuration loaded"
    );

    let store: Arc<dyn KeyStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryKeyStore::new()),
        StoreBackend::File => {
            let path = config
                .store
                .path
                .clone()
                .context("store.path is required for the file backend")?;
            let store = FileKeyStore::load(path.clone())
                .await
                .with_context(|| format!("failed to load key store from {}", path.display()))?;
            Arc::new(store)
        }
    };

    let pool = Arc::new(KeyPool::new(store, config.pool.settings()));
    for key in &config.pool.seed_keys {
        pool.import(key.expose())
            .await
            .context("failed to import seed key")?;
    }
    let keys_alive = pool.count().await.context("failed to count pool keys")?;
    if keys_alive == 0 {
        warn!("key pool is empty; only requests carrying their own key will succeed");
    }
    info!(keys_alive, "key pool ready");

    let settings =
        ForwardSettings::from_config(&config.gateway).context("invalid gateway settings")?;
    let policy =
        Policy::default().with_overloaded(config.gateway.overloaded_directive.directive());
    let client = proxy::build_client().context("failed to build HTTP client")?;
    let service_metrics = ServiceMetrics::new();

    let proxy_state = ProxyState {
        client,
        pool: pool.clone(),
        policy: Arc::new(policy),
        settings: Arc::new(settings),
        metrics: service_metrics.clone(),
    };

    let app_state = AppState {
        proxy: proxy_state,
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.gateway.max_connections);

    let listen_addr = config.gateway.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // Admin API on its own listener, only when configured
    let admin_handle = match &config.admin {
        Some(admin) => {
            let admin_listener = TcpListener::bind(admin.listen_addr)
                .await
                .with_context(|| format!("failed to bind admin API to {}", admin.listen_addr))?;
            let admin_app = build_admin_router(AdminState::new(pool.clone()));
            info!(addr = %admin.listen_addr, "admin API listening");
            Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(admin_listener, admin_app).await {
                    error!(error = %e, "admin server error");
                }
            }))
        }
        None => None,
    };

    // Clone in_flight counter for drain observability after shutdown
    let in_flight = service_metrics.in_flight.clone();

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts: notify the server to drain, then race the drain against
    // the timeout.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    // Wait for the OS signal
    shutdown_signal().await;

    // Signal the server to begin draining
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    if let Some(handle) = admin_handle {
        handle.abort();
    }

    info!("shutdown complete");
    Ok(())
}

/// Answer CORS preflights on every path with a permissive 204.
async fn preflight(request: Request<Body>, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return (
            StatusCode::NO_CONTENT,
            [
                (ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                (ACCESS_CONTROL_ALLOW_METHODS, "*"),
                (ACCESS_CONTROL_ALLOW_HEADERS, "*"),
            ],
        )
            .into_response();
    }
    next.run(request).await
}

/// Number of alive keys in the pool.
async fn keycount_handler(State(state): State<AppState>) -> Response {
    match state.proxy.pool.count().await {
        Ok(count) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "application/json")],
            serde_json::json!({
                "keyCount": count,
                "message": "success",
            })
            .to_string(),
        )
            .into_response(),
        Err(e) => {
            let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
            error!(request_id = %request_id, error = %e, "failed to count keys");
            proxy::error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("failed to count keys: {e}"),
                &request_id,
            )
        }
    }
}

/// Health endpoint: JSON with status, alive keys, uptime, requests served.
/// Returns 200 while at least one key is alive, 503 when degraded.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = &state.proxy.metrics;
    let uptime = metrics.started_at.elapsed().as_secs();
    let requests = metrics.requests_total.load(Ordering::Relaxed);
    let errors = metrics.errors_total.load(Ordering::Relaxed);

    let keys_alive = match state.proxy.pool.count().await {
        Ok(count) => count,
        Err(e) => {
            warn!(error = %e, "health check could not read key store");
            0
        }
    };

    let (status_code, status) = if keys_alive > 0 {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status_code,
        [(CONTENT_TYPE, "application/json")],
        serde_json::json!({
            "status": status,
            "keys_alive": keys_alive,
            "uptime_seconds": uptime,
            "requests_served": requests,
            "errors_total": errors,
        })
        .to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

/// Catch-all handler that proxies all other requests to upstream.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
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
