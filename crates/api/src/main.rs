use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderName, Method, StatusCode};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spheroseg_api::config::{AppConfig, ServerConfig};
use spheroseg_api::{routes, state, ws};
use spheroseg_core::queue::TaskQueue;
use spheroseg_db::memory::MemorySegmentationStore;
use spheroseg_db::store::{PgSegmentationStore, SegmentationStore};
use spheroseg_events::{ProgressBroadcaster, RoomHub};
use spheroseg_inference::InferenceService;
use spheroseg_pipeline::SegmentationOrchestrator;

use state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "spheroseg_api=debug,spheroseg_pipeline=debug,spheroseg_core=info,tower_http=debug".into()
    });
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // --- Configuration ---
    let config = AppConfig::from_env().expect("Invalid configuration");
    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        ml_service = %config.inference.base_url,
        max_concurrent = config.queue.max_concurrent,
        "Loaded server configuration",
    );

    // --- Task store ---
    let (pool, store) = match &config.server.database_url {
        Some(database_url) => {
            let pool = spheroseg_db::create_pool(database_url)
                .await
                .expect("Failed to connect to database");
            tracing::info!("Database connection pool created");

            spheroseg_db::health_check(&pool)
                .await
                .expect("Database health check failed");
            tracing::info!("Database health check passed");

            spheroseg_db::run_migrations(&pool)
                .await
                .expect("Failed to run database migrations");
            tracing::info!("Database migrations applied");

            let store: Arc<dyn SegmentationStore> = Arc::new(PgSegmentationStore::new(pool.clone()));
            (Some(pool), store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, segmentation tasks are kept in memory only");
            let store: Arc<dyn SegmentationStore> = Arc::new(MemorySegmentationStore::new());
            (None, store)
        }
    };

    // --- Inference client ---
    let inference = Arc::new(InferenceService::new(
        config.inference.clone(),
        config.breaker.clone(),
    ));

    // --- WebSocket hub and progress broadcaster ---
    let hub = Arc::new(RoomHub::new());
    let broadcaster = ProgressBroadcaster::new(Arc::clone(&hub), config.broadcast.clone());
    let heartbeat_handle = ws::start_heartbeat(Arc::clone(&hub));

    // --- Segmentation orchestrator ---
    let queue = TaskQueue::new(config.queue.clone());
    let orchestrator = SegmentationOrchestrator::new(
        queue,
        store,
        inference.clone(),
        broadcaster,
        config.pipeline.clone(),
    );

    if orchestrator.setup().await {
        tracing::info!("Segmentation executor registered");
    } else {
        tracing::warn!("Segmentation executor not registered, tasks will fail until restart");
    }

    let breaker_forwarder = orchestrator.forward_breaker_transitions();
    let queue_watcher = orchestrator.watch_queue_events();

    match orchestrator.reconcile().await {
        Ok(report) => tracing::info!(
            requeued = report.requeued,
            failed = report.failed,
            restored = report.restored,
            "Startup reconciliation finished",
        ),
        Err(e) => tracing::error!(error = %e, "Startup reconciliation failed"),
    }

    orchestrator.queue().start();
    tracing::info!("Segmentation queue started");

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.server.clone()),
        pool,
        orchestrator: orchestrator.clone(),
        inference,
        hub: Arc::clone(&hub),
    };

    // --- CORS ---
    let cors = build_cors_layer(&config.server);

    // --- Request ID header name ---
    let request_id_header = HeaderName::from_static("x-request-id");

    // --- Router ---
    let app = Router::new()
        // Health check and WebSocket at root level (not under /api/v1).
        .merge(routes::root_routes())
        // API v1 routes.
        .nest("/api/v1", routes::api_routes())
        // -- Middleware stack (applied bottom-up) --
        // Panic recovery: catch panics and return 500 JSON.
        .layer(CatchPanicLayer::new())
        // Request timeout.
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.server.request_timeout_secs),
        ))
        // Propagate request ID to response.
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        // Structured request/response tracing.
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        // Set request ID on incoming requests.
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        // CORS.
        .layer(cors)
        // Shared state.
        .with_state(state);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.server.host.parse().expect("Invalid HOST address"),
        config.server.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    // Stop dispatching; in-flight attempts settle on their own and pending
    // rows are picked up by the next startup sweep.
    orchestrator.queue().stop();
    let snapshot = orchestrator.queue().snapshot();
    tracing::info!(
        pending = snapshot.queue_length,
        running = snapshot.running_count,
        "Segmentation queue stopped",
    );

    breaker_forwarder.abort();
    queue_watcher.abort();

    let ws_count = hub.connection_count().await;
    tracing::info!(ws_count, "Closing remaining WebSocket connections");
    hub.shutdown_all().await;

    heartbeat_handle.abort();
    tracing::info!("Heartbeat task stopped");

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Build the CORS middleware layer from server configuration.
///
/// Panics at startup if any configured origin is invalid.
fn build_cors_layer(config: &ServerConfig) -> CorsLayer {
    let origins: Vec<_> = config
        .cors_origins
        .iter()
        .map(|o| {
            o.parse()
                .unwrap_or_else(|e| panic!("Invalid CORS origin '{o}': {e}"))
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_credentials(true)
        .max_age(Duration::from_secs(3600))
}
