//! Parley Session Gateway
//!
//! Hosts the session engine behind HTTP and WebSocket routes and runs the
//! billing scheduler in the same process, so billing events reach the
//! parties' live connections.

mod handlers;
mod middleware;
mod realtime;

use anyhow::Context;
use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use parley_common::{
    billing::{self, BillingScheduler, SchedulerSettings},
    cache::Cache,
    clock::{Clock, SystemClock},
    config::AppConfig,
    db::{DbPool, MemorySessionStore, PgSessionStore, SessionStore},
    engine::{EngineContext, SessionEngine},
    metrics,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::{signal, sync::watch};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    map_response_body::MapResponseBodyLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use middleware::rate_limit::{rate_limit_middleware, RateLimitState};
use realtime::{ConnectionRegistry, SessionGateway};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: Arc<SessionEngine>,
    pub store: Arc<dyn SessionStore>,
    pub cache: Option<Arc<Cache>>,
    pub connections: Arc<ConnectionRegistry>,
    pub gateway: SessionGateway,
}

impl AppState {
    /// Wire the engine to a store, with the connection registry as its event sink
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn SessionStore>,
        cache: Option<Arc<Cache>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let connections = Arc::new(ConnectionRegistry::new());
        let ctx = EngineContext::new(store.clone(), connections.clone(), clock, &config);
        let engine = Arc::new(SessionEngine::from_config(ctx, &config));

        Self {
            gateway: SessionGateway::new(engine.clone()),
            config,
            engine,
            store,
            cache,
            connections,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Arc::new(AppConfig::load().context("failed to load configuration")?);

    init_tracing(&config);
    info!(
        service = %config.observability.service_name,
        "Starting Parley Session Gateway v{}",
        parley_common::VERSION
    );

    if config.observability.metrics_port != 0 {
        install_metrics_exporter(config.observability.metrics_port)?;
    }
    metrics::register_metrics();

    // Session store
    let store: Arc<dyn SessionStore> = if config.uses_memory_store() {
        warn!("Using in-memory session store; sessions are lost on restart");
        Arc::new(MemorySessionStore::new())
    } else {
        info!("Connecting to database...");
        let pool = DbPool::new(&config.database).await?;
        Arc::new(PgSessionStore::new(pool))
    };

    // Optional rate cache
    let cache = Cache::connect(&config.redis).await?.map(Arc::new);

    let state = AppState::new(config.clone(), store, cache.clone(), Arc::new(SystemClock));

    // Billing scheduler
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = if config.billing.enabled {
        let scheduler = BillingScheduler::new(
            state.engine.context().clone(),
            state.engine.state_machine().clone(),
            billing::wallet_from_config(&config)?,
            billing::rates_from_config(&config, cache)?,
            SchedulerSettings::from_config(&config),
        );
        Some(tokio::spawn(async move { scheduler.run(shutdown_rx).await }))
    } else {
        info!("Billing scheduler disabled");
        None
    };

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let an in-flight tick finish its charges
    if let Some(task) = scheduler_task {
        let _ = shutdown_tx.send(true);
        match tokio::time::timeout(config.shutdown_timeout(), task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Billing scheduler task failed"),
            Err(_) => warn!("Billing scheduler did not stop within the shutdown timeout"),
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.observability.json_logging {
        builder.json().init();
    } else {
        builder.pretty().init();
    }
}

fn install_metrics_exporter(port: u16) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
        .set_buckets_for_metric(
            Matcher::Suffix("request_duration_seconds".to_string()),
            metrics::LATENCY_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Suffix("billing_tick_duration_seconds".to_string()),
            metrics::TICK_BUCKETS,
        )?
        .install()
        .context("failed to install Prometheus exporter")?;

    info!(port, "Prometheus exporter listening");
    Ok(())
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    let request_timeout = state.config.request_timeout();

    let mut api_routes: Router<AppState> = Router::new()
        // Health endpoints
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))

        // Session endpoints
        .route("/sessions", post(handlers::sessions::create_session))
        .route("/sessions/{id}", get(handlers::sessions::get_session))
        .route("/sessions/{id}/confirm", post(handlers::sessions::confirm_session))
        .route("/sessions/{id}/join", post(handlers::sessions::join_session))
        .route("/sessions/{id}/end", post(handlers::sessions::end_session))
        .route("/sessions/{id}/reject", post(handlers::sessions::reject_session))

        // Realtime transport
        .route("/ws", get(realtime::ws_handler))
        .route_layer(from_fn(middleware::track_requests));

    if state.config.rate_limit.enabled {
        api_routes = api_routes.layer(from_fn_with_state(
            RateLimitState::from_config(&state.config.rate_limit),
            rate_limit_middleware,
        ));
    }

    // Compose the app
    let app = Router::new().nest("/v1", api_routes).with_state(state);
    with_http_layers(app, request_timeout)
}

/// Wrap the router in the shared HTTP stack
///
/// The timeout covers the WebSocket upgrade handshake only; upgraded
/// connections run on their own task.
fn with_http_layers(router: Router, request_timeout: Duration) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    router.layer(
        ServiceBuilder::new()
            // Request ID propagation
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(cors)
            .layer(MapResponseBodyLayer::new(axum::body::Body::new))
            .layer(TraceLayer::new_for_http())
            // Request timeout
            .layer(TimeoutLayer::new(request_timeout)),
    )
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    fn app() -> Router {
        let mut config = AppConfig::default();
        config.rate_limit.enabled = false;
        let state = AppState::new(
            Arc::new(config),
            Arc::new(MemorySessionStore::new()),
            None,
            Arc::new(SystemClock),
        );
        create_router(state)
    }

    fn create_request(party: Option<&str>, provider: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/v1/sessions")
            .header("content-type", "application/json");
        if let Some(party) = party {
            builder = builder.header("x-party-id", party);
        }
        builder
            .body(Body::from(format!(r#"{{"providerId":"{}","kind":"audio"}}"#, provider)))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_create_session_returns_created() {
        let response = app().oneshot(create_request(Some("r-1"), "p-1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["status"], "pending");
        assert_eq!(body["requesterId"], "r-1");
    }

    #[tokio::test]
    async fn test_missing_party_header_is_bad_request() {
        let response = app().oneshot(create_request(None, "p-1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_busy_provider_conflicts() {
        let app = app();
        let first = app.clone().oneshot(create_request(Some("r-1"), "p-1")).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app.oneshot(create_request(Some("r-2"), "p-1")).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        let body = json_body(second).await;
        assert_eq!(body["error"]["code"], "PROVIDER_BUSY");
    }

    #[tokio::test]
    async fn test_stranger_cannot_read_session() {
        let app = app();
        let created = app.clone().oneshot(create_request(Some("r-1"), "p-1")).await.unwrap();
        let id = json_body(created).await["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/sessions/{}", id))
                    .header("x-party-id", "someone-else")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_slow_request_times_out() {
        let slow = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "done"
            }),
        );
        let app = with_http_layers(slow, Duration::from_millis(50));

        let response = app
            .oneshot(Request::builder().uri("/slow").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_response_carries_request_id() {
        let response = app()
            .oneshot(Request::builder().uri("/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::builder().uri("/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
    }
}
