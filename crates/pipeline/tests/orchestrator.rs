//! End-to-end orchestrator tests against the in-memory store and a scripted
//! inference service.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use serde_json::{json, Value};
use spheroseg_core::queue::{QueueConfig, TaskEvent, TaskQueue, TaskState};
use spheroseg_db::memory::MemorySegmentationStore;
use spheroseg_db::models::segmentation_task::{ImageContext, SegmentationTask};
use spheroseg_db::models::status::SegmentationStatus;
use spheroseg_db::store::SegmentationStore;
use spheroseg_events::messages::{EVENT_SEGMENTATION_UPDATE, EVENT_SERVICE_STATUS};
use spheroseg_events::{BroadcastConfig, OutboundMessage, ProgressBroadcaster, RoomHub};
use spheroseg_inference::{BreakerState, BreakerTransition, HealthStatus, InferenceError};
use spheroseg_pipeline::{
    PipelineConfig, PipelineError, ReconcilePolicy, ReconcileReport, SegmentationOrchestrator,
    SegmentationService, TriggerRequest, INTERRUPTED_MESSAGE,
};
use tempfile::NamedTempFile;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Scripted inference service
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Reply {
    Ok,
    Unavailable,
    Failure(&'static str),
    BreakerOpen,
    Hang,
}

struct FakeService {
    script: Mutex<VecDeque<Reply>>,
    default: Reply,
    features_fail: bool,
    healthy: bool,
    available: AtomicBool,
    calls: Mutex<Vec<(String, Value)>>,
    transitions: broadcast::Sender<BreakerTransition>,
}

impl FakeService {
    fn new(default: Reply) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default,
            features_fail: false,
            healthy: true,
            available: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            transitions: broadcast::channel(16).0,
        }
    }

    fn then(self, reply: Reply) -> Self {
        self.script.lock().unwrap().push_back(reply);
        self
    }

    fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SegmentationService for FakeService {
    async fn segment(&self, image_path: &str, parameters: &Value) -> Result<Value, InferenceError> {
        self.calls
            .lock()
            .unwrap()
            .push((image_path.to_string(), parameters.clone()));
        let reply = self.script.lock().unwrap().pop_front().unwrap_or(self.default);
        match reply {
            Reply::Ok => Ok(json!({
                "polygons": [{ "type": "external", "points": [[0, 0], [4, 0], [4, 4]] }],
                "result_path": "/results/img-1.json",
            })),
            Reply::Unavailable => Err(InferenceError::Api {
                status: 503,
                body: "model loading".into(),
            }),
            Reply::Failure(msg) => Err(InferenceError::Failure(msg.into())),
            Reply::BreakerOpen => Err(InferenceError::BreakerOpen("ml-segmentation".into())),
            Reply::Hang => std::future::pending().await,
        }
    }

    async fn extract_features(&self, polygons: &Value) -> Result<Value, InferenceError> {
        if self.features_fail {
            return Err(InferenceError::Api {
                status: 500,
                body: String::new(),
            });
        }
        Ok(json!({ "count": polygons.as_array().map_or(0, Vec::len) }))
    }

    async fn check_health(&self) -> Result<HealthStatus, InferenceError> {
        Ok(HealthStatus {
            healthy: self.healthy,
            details: json!({ "status": if self.healthy { "ok" } else { "degraded" } }),
        })
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn subscribe_transitions(&self) -> broadcast::Receiver<BreakerTransition> {
        self.transitions.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

const IMAGE: &str = "img-1";
const ROOM: &str = "proj-1";

struct Harness {
    orch: SegmentationOrchestrator,
    store: Arc<MemorySegmentationStore>,
    service: Arc<FakeService>,
    hub: Arc<RoomHub>,
    client: mpsc::UnboundedReceiver<OutboundMessage>,
    image: NamedTempFile,
}

impl Harness {
    fn image_path(&self) -> String {
        self.image.path().display().to_string()
    }

    fn request(&self) -> TriggerRequest {
        TriggerRequest {
            image_id: IMAGE.into(),
            image_path: self.image_path(),
            parameters: json!({ "threshold": 0.5 }),
            priority: 0,
        }
    }

    async fn row(&self, id: Uuid) -> SegmentationTask {
        self.store.find_by_id(id).await.unwrap().unwrap()
    }

    async fn wait_for_status(&self, id: Uuid, status: SegmentationStatus) -> SegmentationTask {
        for _ in 0..300 {
            let row = self.row(id).await;
            if row.has_status(status) {
                return row;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("row {id} never reached {status}");
    }

    /// Statuses of the rich updates the room client has received so far.
    fn room_statuses(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = self.client.try_recv() {
            if let OutboundMessage::Event { event, data } = msg {
                if event == EVENT_SEGMENTATION_UPDATE {
                    out.push(data["status"].as_str().unwrap_or_default().to_string());
                }
            }
        }
        out
    }
}

fn queue_config() -> QueueConfig {
    QueueConfig {
        max_concurrent: 2,
        default_retries: 2,
        default_retry_delay: Duration::from_millis(10),
        default_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

async fn harness_with(
    service: FakeService,
    queue: QueueConfig,
    config: PipelineConfig,
) -> Harness {
    let store = Arc::new(MemorySegmentationStore::new().with_image(ImageContext {
        image_id: IMAGE.into(),
        image_name: Some("spheroid-01.png".into()),
        project_id: Some(ROOM.into()),
        project_name: Some("Spheroids".into()),
    }));
    let service = Arc::new(service);
    let hub = Arc::new(RoomHub::new());
    let client = hub.add("client-1").await;
    hub.join("client-1", ROOM).await;

    let orch = SegmentationOrchestrator::new(
        TaskQueue::new(queue),
        store.clone(),
        service.clone(),
        ProgressBroadcaster::new(hub.clone(), BroadcastConfig::default()),
        config,
    );
    let mut image = NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut image, b"not really a png").unwrap();

    Harness {
        orch,
        store,
        service,
        hub,
        client,
        image,
    }
}

async fn harness(service: FakeService) -> Harness {
    let h = harness_with(service, queue_config(), PipelineConfig::default()).await;
    assert!(h.orch.setup().await);
    h
}

async fn wait_for_event(
    rx: &mut broadcast::Receiver<TaskEvent>,
    pred: impl Fn(&TaskEvent) -> bool,
) -> TaskEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("event not received in time")
}

fn seeded_row(image_id: &str, status: SegmentationStatus) -> SegmentationTask {
    let now = chrono::Utc::now();
    SegmentationTask {
        id: Uuid::now_v7(),
        image_id: image_id.into(),
        image_path: "/uploads/missing.png".into(),
        parameters: json!({}),
        priority: 0,
        status_id: status.id(),
        retries: 0,
        error: None,
        result: None,
        result_path: None,
        created_at: now,
        updated_at: now,
        started_at: None,
        completed_at: None,
    }
}

// ---------------------------------------------------------------------------
// Trigger and execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn trigger_runs_to_completion() {
    let mut h = harness(FakeService::new(Reply::Ok)).await;
    let mut events = h.orch.queue().subscribe();

    let id = h.orch.trigger(h.request()).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, TaskEvent::Completed(t) if t.id == id)).await;

    let row = h.row(id).await;
    assert!(row.has_status(SegmentationStatus::Completed));
    assert_eq!(row.result_path.as_deref(), Some("/results/img-1.json"));
    let result = row.result.unwrap();
    assert_eq!(result["polygons"].as_array().unwrap().len(), 1);
    assert_eq!(result["features"]["count"], 1);

    assert_eq!(h.service.calls(), vec![(h.image_path(), json!({ "threshold": 0.5 }))]);
    assert_eq!(h.room_statuses(), vec!["pending", "processing", "completed"]);
}

#[tokio::test]
async fn retrigger_while_pending_updates_in_place() {
    let h = harness_with(
        FakeService::new(Reply::Ok),
        QueueConfig {
            auto_start: false,
            ..queue_config()
        },
        PipelineConfig::default(),
    )
    .await;
    assert!(h.orch.setup().await);

    let first = h.orch.trigger(h.request()).await.unwrap();
    let second = h
        .orch
        .trigger(TriggerRequest {
            parameters: json!({ "threshold": 0.8 }),
            priority: 7,
            ..h.request()
        })
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(h.store.all_tasks().len(), 1);
    let row = h.row(first).await;
    assert_eq!(row.parameters, json!({ "threshold": 0.8 }));
    assert_eq!(row.priority, 7);

    let pending = h.orch.queue().pending_tasks();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].priority, 7);

    let mut events = h.orch.queue().subscribe();
    h.orch.queue().start();
    wait_for_event(&mut events, |e| matches!(e, TaskEvent::Completed(t) if t.id == first)).await;
    assert_eq!(h.service.calls()[0].1, json!({ "threshold": 0.8 }));
}

#[tokio::test]
async fn retrigger_while_processing_is_a_no_op() {
    let h = harness(FakeService::new(Reply::Hang)).await;

    let id = h.orch.trigger(h.request()).await.unwrap();
    h.wait_for_status(id, SegmentationStatus::Processing).await;

    let again = h
        .orch
        .trigger(TriggerRequest {
            priority: 9,
            ..h.request()
        })
        .await
        .unwrap();

    assert_eq!(again, id);
    assert_eq!(h.row(id).await.priority, 0);
    assert_eq!(h.store.all_tasks().len(), 1);
    assert_eq!(h.service.calls().len(), 1);
}

#[tokio::test]
async fn empty_image_path_is_rejected() {
    let h = harness(FakeService::new(Reply::Ok)).await;
    let err = h
        .orch
        .trigger(TriggerRequest {
            image_path: "  ".into(),
            ..h.request()
        })
        .await
        .unwrap_err();
    assert_matches!(err, PipelineError::Validation(_));
    assert!(h.store.all_tasks().is_empty());
}

#[tokio::test]
async fn missing_source_image_fails_without_calling_inference() {
    let mut h = harness(FakeService::new(Reply::Ok)).await;
    let mut events = h.orch.queue().subscribe();

    let id = h
        .orch
        .trigger(TriggerRequest {
            image_path: "/definitely/not/here.png".into(),
            ..h.request()
        })
        .await
        .unwrap();
    wait_for_event(&mut events, |e| matches!(e, TaskEvent::Failed(t) if t.id == id)).await;

    let row = h.row(id).await;
    assert!(row.has_status(SegmentationStatus::Failed));
    let error = row.error.unwrap();
    assert!(!error.contains("/definitely"), "{error}");
    assert!(h.service.calls().is_empty());
    assert_eq!(h.room_statuses(), vec!["pending", "failed"]);
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_failures_are_retried_then_failed() {
    let h = harness(FakeService::new(Reply::Unavailable)).await;
    let mut events = h.orch.queue().subscribe();

    let id = h.orch.trigger(h.request()).await.unwrap();
    let failed =
        wait_for_event(&mut events, |e| matches!(e, TaskEvent::Failed(t) if t.id == id)).await;

    assert_eq!(failed.task().unwrap().attempts, 3);
    assert_eq!(h.service.calls().len(), 3);
    let row = h.row(id).await;
    assert!(row.has_status(SegmentationStatus::Failed));
    assert_eq!(row.retries, 2);
    assert_eq!(
        row.error.as_deref(),
        Some("Segmentation service is temporarily unavailable")
    );
}

#[tokio::test]
async fn transient_failure_then_success_completes() {
    let mut h = harness(FakeService::new(Reply::Ok).then(Reply::Unavailable)).await;
    let mut events = h.orch.queue().subscribe();

    let id = h.orch.trigger(h.request()).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, TaskEvent::Completed(t) if t.id == id)).await;

    let row = h.row(id).await;
    assert!(row.has_status(SegmentationStatus::Completed));
    assert_eq!(row.retries, 1);
    assert_eq!(
        h.room_statuses(),
        vec!["pending", "processing", "pending", "processing", "completed"]
    );
}

#[tokio::test]
async fn model_failure_is_not_retried() {
    let h = harness(FakeService::new(Reply::Failure("no spheroids detected"))).await;
    let mut events = h.orch.queue().subscribe();

    let id = h.orch.trigger(h.request()).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, TaskEvent::Failed(t) if t.id == id)).await;

    assert_eq!(h.service.calls().len(), 1);
    assert_eq!(
        h.row(id).await.error.as_deref(),
        Some("Segmentation failed: no spheroids detected")
    );
}

#[tokio::test]
async fn open_breaker_fails_fast() {
    let h = harness(FakeService::new(Reply::BreakerOpen)).await;
    let mut events = h.orch.queue().subscribe();

    let id = h.orch.trigger(h.request()).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, TaskEvent::Failed(t) if t.id == id)).await;

    assert_eq!(h.service.calls().len(), 1);
    assert_eq!(
        h.row(id).await.error.as_deref(),
        Some("Segmentation service is unavailable")
    );
}

#[tokio::test]
async fn feature_extraction_failure_still_completes() {
    let mut service = FakeService::new(Reply::Ok);
    service.features_fail = true;
    let h = harness(service).await;
    let mut events = h.orch.queue().subscribe();

    let id = h.orch.trigger(h.request()).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, TaskEvent::Completed(t) if t.id == id)).await;

    let result = h.row(id).await.result.unwrap();
    assert!(result.get("features").is_none());
    assert_eq!(result["polygons"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn features_are_skipped_when_disabled() {
    let h = harness_with(
        FakeService::new(Reply::Ok),
        queue_config(),
        PipelineConfig {
            extract_features: false,
            ..Default::default()
        },
    )
    .await;
    assert!(h.orch.setup().await);
    let mut events = h.orch.queue().subscribe();

    let id = h.orch.trigger(h.request()).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, TaskEvent::Completed(t) if t.id == id)).await;
    assert!(h.row(id).await.result.unwrap().get("features").is_none());
}

#[tokio::test]
async fn queue_timeout_fails_the_row() {
    let h = harness_with(
        FakeService::new(Reply::Hang),
        QueueConfig {
            default_timeout: Duration::from_secs(1),
            ..queue_config()
        },
        PipelineConfig::default(),
    )
    .await;
    assert!(h.orch.setup().await);
    let _watcher = h.orch.watch_queue_events();
    let mut events = h.orch.queue().subscribe();

    let id = h.orch.trigger(h.request()).await.unwrap();
    let event =
        wait_for_event(&mut events, |e| matches!(e, TaskEvent::TimedOut(t) if t.id == id)).await;
    assert_eq!(event.task().unwrap().state, TaskState::TimedOut);

    let row = h.wait_for_status(id, SegmentationStatus::Failed).await;
    assert_eq!(row.error.as_deref(), Some("Segmentation timed out after 1s"));
    assert_eq!(h.service.calls().len(), 1);
}

#[tokio::test]
async fn queue_timeout_fails_the_row_when_event_subscribers_lag() {
    let h = harness_with(
        FakeService::new(Reply::Hang),
        QueueConfig {
            max_concurrent: 1,
            event_capacity: 2,
            default_timeout: Duration::from_secs(1),
            ..queue_config()
        },
        PipelineConfig::default(),
    )
    .await;
    assert!(h.orch.setup().await);
    let _watcher = h.orch.watch_queue_events();
    let _idle_subscriber = h.orch.queue().subscribe();

    let first = h.orch.trigger(h.request()).await.unwrap();
    for n in 2..=4 {
        h.orch
            .trigger(TriggerRequest {
                image_id: format!("img-{n}"),
                ..h.request()
            })
            .await
            .unwrap();
    }

    let row = h.wait_for_status(first, SegmentationStatus::Failed).await;
    assert_eq!(row.error.as_deref(), Some("Segmentation timed out after 1s"));
}

#[tokio::test]
async fn missing_executor_fails_the_row() {
    let h = harness_with(FakeService::new(Reply::Ok), queue_config(), PipelineConfig::default())
        .await;
    let _watcher = h.orch.watch_queue_events();

    let id = h.orch.trigger(h.request()).await.unwrap();
    let row = h.wait_for_status(id, SegmentationStatus::Failed).await;
    assert_eq!(
        row.error.as_deref(),
        Some("Segmentation is not available on this server")
    );
}

#[tokio::test]
async fn store_outage_does_not_change_the_outcome() {
    let h = harness(FakeService::new(Reply::Ok)).await;
    let mut events = h.orch.queue().subscribe();

    let id = h.orch.trigger(h.request()).await.unwrap();
    h.store.set_failing(true);
    // The executor may already be done; either way the task completes.
    let event = wait_for_event(&mut events, |e| {
        matches!(e, TaskEvent::Completed(t) | TaskEvent::Failed(t) if t.id == id)
    })
    .await;
    assert_matches!(event, TaskEvent::Completed(_));
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_running_task_keeps_row_cancelled() {
    let mut h = harness(FakeService::new(Reply::Hang)).await;

    let id = h.orch.trigger(h.request()).await.unwrap();
    h.wait_for_status(id, SegmentationStatus::Processing).await;

    assert!(h.orch.cancel(IMAGE).await.unwrap());
    assert!(h.orch.queue().get_task(id).is_none());
    assert!(h.row(id).await.has_status(SegmentationStatus::Cancelled));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.row(id).await.has_status(SegmentationStatus::Cancelled));
    assert_eq!(h.room_statuses(), vec!["pending", "processing", "cancelled"]);
}

#[tokio::test]
async fn cancel_leaves_queued_task_alone_when_store_write_fails() {
    let h = harness(FakeService::new(Reply::Hang)).await;

    let id = h.orch.trigger(h.request()).await.unwrap();
    h.wait_for_status(id, SegmentationStatus::Processing).await;

    h.store.set_failing_writes(true);
    assert_matches!(h.orch.cancel(IMAGE).await, Err(PipelineError::Store(_)));
    assert_eq!(h.orch.queue().get_task(id).unwrap().state, TaskState::Running);
    assert!(h.row(id).await.has_status(SegmentationStatus::Processing));

    h.store.set_failing_writes(false);
    assert!(h.orch.cancel(IMAGE).await.unwrap());
    assert!(h.orch.queue().get_task(id).is_none());
    assert!(h.row(id).await.has_status(SegmentationStatus::Cancelled));
}

#[tokio::test]
async fn cancel_without_in_memory_task_still_cancels_row() {
    let h = harness(FakeService::new(Reply::Ok)).await;
    let row = seeded_row(IMAGE, SegmentationStatus::Pending);
    let id = row.id;
    h.store.seed_task(row);

    assert!(h.orch.cancel(IMAGE).await.unwrap());
    assert!(h.row(id).await.has_status(SegmentationStatus::Cancelled));
}

#[tokio::test]
async fn cancel_unknown_image_returns_false() {
    let h = harness(FakeService::new(Reply::Ok)).await;
    assert!(!h.orch.cancel("nope").await.unwrap());
}

#[tokio::test]
async fn trigger_after_cancel_creates_a_new_row() {
    let h = harness_with(
        FakeService::new(Reply::Ok),
        QueueConfig {
            auto_start: false,
            ..queue_config()
        },
        PipelineConfig::default(),
    )
    .await;
    assert!(h.orch.setup().await);

    let first = h.orch.trigger(h.request()).await.unwrap();
    assert!(h.orch.cancel(IMAGE).await.unwrap());
    let second = h.orch.trigger(h.request()).await.unwrap();

    assert_ne!(first, second);
    assert_eq!(h.store.all_tasks().len(), 2);
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_enriches_running_tasks_and_degrades_on_lookup_failure() {
    let h = harness(FakeService::new(Reply::Hang)).await;
    let id = h.orch.trigger(h.request()).await.unwrap();
    h.wait_for_status(id, SegmentationStatus::Processing).await;

    let status = h.orch.status().await;
    assert_eq!(status.running_count, 1);
    assert_eq!(status.running_ids, vec![id]);
    assert!(status.service_available);
    let running = &status.running[0];
    assert_eq!(running.image_name.as_deref(), Some("spheroid-01.png"));
    assert_eq!(running.project_name.as_deref(), Some("Spheroids"));

    h.store.set_failing(true);
    let status = h.orch.status().await;
    assert_eq!(status.running_count, 1);
    assert_eq!(status.running[0].image_id.as_deref(), Some(IMAGE));
    assert!(status.running[0].image_name.is_none());
}

#[tokio::test]
async fn status_reports_service_unavailable() {
    let h = harness(FakeService::new(Reply::Ok)).await;
    h.service.available.store(false, Ordering::SeqCst);
    assert!(!h.orch.status().await.service_available);
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn setup_fails_without_model_artifact() {
    let h = harness_with(
        FakeService::new(Reply::Ok),
        queue_config(),
        PipelineConfig {
            model_path: Some(PathBuf::from("/nonexistent/model.pth")),
            ..Default::default()
        },
    )
    .await;

    assert!(!h.orch.setup().await);
    assert!(!h.orch.queue().has_executor(&SegmentationOrchestrator::kind()));
}

#[tokio::test]
async fn setup_requires_health_only_when_configured() {
    let mut unhealthy = FakeService::new(Reply::Ok);
    unhealthy.healthy = false;
    let strict = harness_with(
        unhealthy,
        queue_config(),
        PipelineConfig {
            require_healthy: true,
            ..Default::default()
        },
    )
    .await;
    assert!(!strict.orch.setup().await);

    let mut unhealthy = FakeService::new(Reply::Ok);
    unhealthy.healthy = false;
    let lenient = harness_with(unhealthy, queue_config(), PipelineConfig::default()).await;
    assert!(lenient.orch.setup().await);
}

#[tokio::test]
async fn setup_is_idempotent_and_accepts_existing_artifact() {
    let model = NamedTempFile::new().unwrap();
    let h = harness_with(
        FakeService::new(Reply::Ok),
        queue_config(),
        PipelineConfig {
            model_path: Some(model.path().to_path_buf()),
            ..Default::default()
        },
    )
    .await;

    assert!(h.orch.setup().await);
    assert!(h.orch.setup().await);
    assert!(h
        .orch
        .queue()
        .ensure_executors(&[SegmentationOrchestrator::kind()])
        .is_ok());
}

// ---------------------------------------------------------------------------
// Reconcile
// ---------------------------------------------------------------------------

async fn reconcile_harness(policy: ReconcilePolicy) -> (Harness, Uuid, Uuid) {
    let h = harness_with(
        FakeService::new(Reply::Ok),
        QueueConfig {
            auto_start: false,
            ..queue_config()
        },
        PipelineConfig {
            reconcile_policy: policy,
            ..Default::default()
        },
    )
    .await;
    let pending = seeded_row("img-a", SegmentationStatus::Pending);
    let orphaned = seeded_row("img-b", SegmentationStatus::Processing);
    let ids = (pending.id, orphaned.id);
    h.store.seed_task(pending);
    h.store.seed_task(orphaned);
    (h, ids.0, ids.1)
}

#[tokio::test]
async fn reconcile_requeues_orphaned_rows() {
    let (h, pending, orphaned) = reconcile_harness(ReconcilePolicy::Requeue).await;

    let report = h.orch.reconcile().await.unwrap();
    assert_eq!(
        report,
        ReconcileReport {
            requeued: 1,
            failed: 0,
            restored: 1,
        }
    );
    assert!(h.row(orphaned).await.has_status(SegmentationStatus::Pending));
    let queued: Vec<Uuid> = h.orch.queue().pending_tasks().iter().map(|t| t.id).collect();
    assert!(queued.contains(&pending));
    assert!(queued.contains(&orphaned));

    // A second sweep finds nothing new to do.
    let again = h.orch.reconcile().await.unwrap();
    assert_eq!(again, ReconcileReport::default());
}

#[tokio::test]
async fn reconcile_can_fail_orphaned_rows() {
    let (h, pending, orphaned) = reconcile_harness(ReconcilePolicy::Fail).await;

    let report = h.orch.reconcile().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.restored, 1);
    let row = h.row(orphaned).await;
    assert!(row.has_status(SegmentationStatus::Failed));
    assert_eq!(row.error.as_deref(), Some(INTERRUPTED_MESSAGE));
    assert!(h.orch.queue().get_task(pending).is_some());
    assert!(h.orch.queue().get_task(orphaned).is_none());
}

// ---------------------------------------------------------------------------
// Breaker transitions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn breaker_transitions_reach_every_client() {
    let mut h = harness(FakeService::new(Reply::Ok)).await;
    let mut other = h.hub.add("client-2").await;
    let _forwarder = h.orch.forward_breaker_transitions();

    h.service
        .transitions
        .send(BreakerTransition {
            name: "ml-segmentation".into(),
            from: BreakerState::Closed,
            to: BreakerState::Open,
            at: chrono::Utc::now(),
        })
        .unwrap();

    for rx in [&mut h.client, &mut other] {
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match msg {
            OutboundMessage::Event { event, data } => {
                assert_eq!(event, EVENT_SERVICE_STATUS);
                assert_eq!(data["service"], "ml-segmentation");
                assert_eq!(data["available"], false);
                assert_eq!(data["state"], "open");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
