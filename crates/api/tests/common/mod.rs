#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderName, Method, Request, StatusCode};
use axum::response::Response;
use axum::routing::{get as get_route, post};
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use spheroseg_api::config::ServerConfig;
use spheroseg_api::routes;
use spheroseg_api::state::AppState;
use spheroseg_core::queue::{QueueConfig, TaskQueue};
use spheroseg_db::memory::MemorySegmentationStore;
use spheroseg_db::models::segmentation_task::ImageContext;
use spheroseg_events::{BroadcastConfig, ProgressBroadcaster, RoomHub};
use spheroseg_inference::{BreakerConfig, InferenceConfig, InferenceService};
use spheroseg_pipeline::{PipelineConfig, SegmentationOrchestrator};

pub const PROJECT: &str = "project-1";
pub const IMAGE: &str = "img-1";

/// Nothing listens here; connections are refused immediately.
pub const UNREACHABLE_ML: &str = "http://127.0.0.1:9";

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        database_url: None,
    }
}

/// Serve a stand-in inference service that reports healthy and returns
/// one polygon per image. Returns its base URL.
pub async fn spawn_ml_mock() -> String {
    let router = Router::new()
        .route(
            "/health",
            get_route(|| async { Json(json!({ "status": "ok", "model_loaded": true })) }),
        )
        .route(
            "/segment",
            post(|Json(body): Json<Value>| async move {
                Json(json!({
                    "success": true,
                    "results": {
                        "image_path": body["image_path"],
                        "polygons": [{ "type": "external", "points": [[0, 0], [4, 0], [4, 4]] }],
                    },
                }))
            }),
        )
        .route(
            "/extract_features",
            post(|| async { Json(json!({ "success": true, "features": { "count": 1 } })) }),
        );
    let addr = serve(router).await;
    format!("http://{addr}")
}

/// Bind `router` to an ephemeral local port and serve it in the background.
pub async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Application router plus handles on the state behind it.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<MemorySegmentationStore>,
}

/// Build the full application router with all middleware layers over an
/// in-memory store and a stopped queue.
///
/// This mirrors the router construction in `main.rs` so integration tests
/// exercise the same middleware stack that production uses.
pub fn build_test_app(ml_url: &str) -> TestApp {
    let store = Arc::new(MemorySegmentationStore::new().with_image(ImageContext {
        image_id: IMAGE.into(),
        image_name: Some("spheroid-01.png".into()),
        project_id: Some(PROJECT.into()),
        project_name: Some("Spheroids".into()),
    }));
    let inference = Arc::new(InferenceService::new(
        InferenceConfig {
            base_url: ml_url.to_string(),
            health_timeout: Duration::from_secs(2),
            ..InferenceConfig::default()
        },
        BreakerConfig::default(),
    ));
    let hub = Arc::new(RoomHub::new());
    let orchestrator = SegmentationOrchestrator::new(
        TaskQueue::new(QueueConfig {
            auto_start: false,
            ..QueueConfig::default()
        }),
        store.clone(),
        inference.clone(),
        ProgressBroadcaster::new(hub.clone(), BroadcastConfig::default()),
        PipelineConfig::default(),
    );

    let state = AppState {
        config: Arc::new(test_config()),
        pool: None,
        orchestrator,
        inference,
        hub,
    };

    let cors = CorsLayer::new()
        .allow_origin(["http://localhost:5173".parse().unwrap()])
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_credentials(true)
        .max_age(Duration::from_secs(3600));

    let request_id_header = HeaderName::from_static("x-request-id");

    let router = Router::new()
        .merge(routes::root_routes())
        .nest("/api/v1", routes::api_routes())
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .layer(cors)
        .with_state(state.clone());

    TestApp {
        router,
        state,
        store,
    }
}

/// Send a GET request through the router.
pub async fn get(app: Router, path: &str) -> Response {
    app.oneshot(
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .unwrap(),
    )
    .await
    .unwrap()
}

/// Collect a response body and parse it as JSON.
pub async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
