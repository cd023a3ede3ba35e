//! Integration tests for `GET /api/v1/segmentation/queue`.

mod common;

use axum::http::StatusCode;
use common::{body_json, get, IMAGE, UNREACHABLE_ML};
use spheroseg_pipeline::TriggerRequest;

#[tokio::test]
async fn empty_queue_reports_zero_counts() {
    let app = common::build_test_app(UNREACHABLE_ML);
    let response = get(app.router, "/api/v1/segmentation/queue").await;

    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["queueLength"], 0);
    assert_eq!(json["runningCount"], 0);
    assert_eq!(json["maxConcurrent"], 2);
    assert_eq!(json["serviceAvailable"], true);
    assert_eq!(json["running"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn triggered_task_is_listed_as_pending() {
    let app = common::build_test_app(UNREACHABLE_ML);
    let id = app
        .state
        .orchestrator
        .trigger(TriggerRequest {
            image_id: IMAGE.into(),
            image_path: "/data/uploads/img-1.png".into(),
            parameters: serde_json::Value::Null,
            priority: 0,
        })
        .await
        .unwrap();

    let json = body_json(get(app.router, "/api/v1/segmentation/queue").await).await;

    assert_eq!(json["queueLength"], 1);
    assert_eq!(json["pendingIds"][0], id.to_string());
    assert_eq!(app.store.all_tasks().len(), 1);
}

#[tokio::test]
async fn store_outage_does_not_break_the_status_route() {
    let app = common::build_test_app(UNREACHABLE_ML);
    app.store.set_failing(true);

    let response = get(app.router, "/api/v1/segmentation/queue").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["queueLength"], 0);
}
