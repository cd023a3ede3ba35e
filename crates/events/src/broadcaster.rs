//! Progress fan-out to project rooms.
//!
//! Every update is delivered twice: as `segmentation:update` and in the
//! legacy shape as `segmentation_update`. Repeated `processing` updates for a
//! room are throttled to one emission per interval, with the latest one held
//! back and flushed on the trailing edge. Any other status, and the move into
//! `processing`, is emitted immediately after flushing whatever the room had
//! pending.
//!
//! Every throttle decision and the sends that follow it happen under one
//! async send lock, so a flush timer can never deliver a stale `processing`
//! update after the terminal update that superseded it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use spheroseg_db::models::status::SegmentationStatus;
use tokio::time::Instant;

use crate::messages::{
    OutboundMessage, ProgressUpdate, ServiceStatus, EVENT_SEGMENTATION_UPDATE,
    EVENT_SEGMENTATION_UPDATE_LEGACY, EVENT_SERVICE_STATUS,
};
use crate::rooms::RoomHub;
use crate::throttle::{Flush, Offer, ThrottleCache};

/// Throttle settings.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Minimum spacing between `processing` emissions per room.
    pub throttle_interval: Duration,
    /// Rooms tracked before idle ones are evicted.
    pub cache_capacity: usize,
    /// Idle rooms are forgotten after this long.
    pub cache_ttl: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            throttle_interval: Duration::from_millis(500),
            cache_capacity: 1024,
            cache_ttl: Duration::from_secs(600),
        }
    }
}

#[derive(Clone)]
pub struct ProgressBroadcaster {
    hub: Arc<RoomHub>,
    throttle: Arc<Mutex<ThrottleCache<ProgressUpdate>>>,
    send_lock: Arc<tokio::sync::Mutex<()>>,
    config: BroadcastConfig,
}

impl ProgressBroadcaster {
    pub fn new(hub: Arc<RoomHub>, config: BroadcastConfig) -> Self {
        let throttle = ThrottleCache::new(
            config.throttle_interval,
            config.cache_capacity,
            config.cache_ttl,
        );
        Self {
            hub,
            throttle: Arc::new(Mutex::new(throttle)),
            send_lock: Arc::new(tokio::sync::Mutex::new(())),
            config,
        }
    }

    pub fn hub(&self) -> &Arc<RoomHub> {
        &self.hub
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    /// Publish an update to `room`, throttling `processing` ticks.
    pub async fn publish(&self, room: &str, update: ProgressUpdate) {
        if update.status != SegmentationStatus::Processing {
            return self.publish_immediate(room, update).await;
        }

        let _sending = self.send_lock.lock().await;
        let offer = self.throttle().offer(room, update, Instant::now());
        match offer {
            Offer::EmitNow(update) => self.emit(room, &update).await,
            Offer::Deferred { flush_at, schedule } => {
                if schedule {
                    self.schedule_flush(room.to_string(), flush_at);
                }
            }
        }
    }

    /// Publish without throttling. Any update the room still holds back is
    /// sent first so ordering is preserved.
    pub async fn publish_immediate(&self, room: &str, update: ProgressUpdate) {
        let _sending = self.send_lock.lock().await;
        let trailing = self.throttle().flush_now(room, Instant::now());
        if let Some(trailing) = trailing {
            self.emit(room, &trailing).await;
        }
        self.emit(room, &update).await;
    }

    /// Tell every connection about the inference service's availability.
    pub async fn publish_service_status(&self, status: ServiceStatus) -> usize {
        let data = serde_json::to_value(&status).unwrap_or(serde_json::Value::Null);
        let delivered = self
            .hub
            .emit_all(OutboundMessage::event(EVENT_SERVICE_STATUS, data))
            .await;
        tracing::info!(
            service = %status.service,
            available = status.available,
            state = %status.state,
            delivered,
            "Broadcast service status",
        );
        delivered
    }

    fn schedule_flush(&self, room: String, mut at: Instant) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep_until(at).await;
                let _sending = this.send_lock.lock().await;
                let due = this.throttle().take_due(&room, Instant::now());
                match due {
                    Flush::Emit(update) => {
                        this.emit(&room, &update).await;
                        break;
                    }
                    Flush::Rearm(next) => at = next,
                    Flush::Nothing => break,
                }
            }
        });
    }

    async fn emit(&self, room: &str, update: &ProgressUpdate) {
        let rich = OutboundMessage::event(EVENT_SEGMENTATION_UPDATE, update.to_payload());
        let legacy =
            OutboundMessage::event(EVENT_SEGMENTATION_UPDATE_LEGACY, update.to_legacy_payload());

        let delivered = self.hub.emit_to_room(room, rich).await;
        self.hub.emit_to_room(room, legacy).await;

        tracing::debug!(
            room,
            image_id = %update.image_id,
            status = %update.status,
            delivered,
            "Broadcast segmentation update",
        );
    }

    fn throttle(&self) -> MutexGuard<'_, ThrottleCache<ProgressUpdate>> {
        self.throttle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use tokio::sync::mpsc;

    use super::*;

    const ROOM: &str = "proj-1";

    async fn setup() -> (ProgressBroadcaster, mpsc::UnboundedReceiver<OutboundMessage>) {
        let hub = Arc::new(RoomHub::new());
        let rx = hub.add("conn-1").await;
        hub.join("conn-1", ROOM).await;
        (ProgressBroadcaster::new(hub, BroadcastConfig::default()), rx)
    }

    /// Rich events received so far, as `(imageId, status)`.
    fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> Vec<(String, String)> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let OutboundMessage::Event { event, data } = msg {
                if event == EVENT_SEGMENTATION_UPDATE {
                    out.push((str_field(&data, "imageId"), str_field(&data, "status")));
                }
            }
        }
        out
    }

    fn str_field(data: &Value, key: &str) -> String {
        data[key].as_str().unwrap_or_default().to_string()
    }

    fn processing(i: usize) -> ProgressUpdate {
        ProgressUpdate::new(format!("img-{i}"), SegmentationStatus::Processing)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_coalesced_to_one_emission_per_interval() {
        let (b, mut rx) = setup().await;

        for i in 0..100 {
            b.publish(ROOM, processing(i)).await;
        }
        assert_eq!(drain(&mut rx), vec![("img-0".into(), "processing".into())]);

        tokio::time::sleep(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        assert_eq!(drain(&mut rx), vec![("img-99".into(), "processing".into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_update_precedes_terminal_event() {
        let (b, mut rx) = setup().await;

        for i in 0..100 {
            b.publish(ROOM, processing(i)).await;
        }
        b.publish(ROOM, ProgressUpdate::new("img-99", SegmentationStatus::Completed))
            .await;

        assert_eq!(
            drain(&mut rx),
            vec![
                ("img-0".into(), "processing".into()),
                ("img-99".into(), "processing".into()),
                ("img-99".into(), "completed".into()),
            ]
        );

        // The armed timer has nothing left to send.
        tokio::time::sleep(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_and_pending_updates_are_never_throttled() {
        let (b, mut rx) = setup().await;

        b.publish(ROOM, ProgressUpdate::new("a", SegmentationStatus::Pending))
            .await;
        b.publish(ROOM, ProgressUpdate::new("a", SegmentationStatus::Failed))
            .await;
        b.publish(ROOM, ProgressUpdate::new("b", SegmentationStatus::Cancelled))
            .await;

        assert_eq!(drain(&mut rx).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn each_update_is_also_sent_in_legacy_shape() {
        let (b, mut rx) = setup().await;
        b.publish_immediate(ROOM, ProgressUpdate::new("a", SegmentationStatus::Pending))
            .await;

        let rich = rx.try_recv().unwrap();
        let legacy = rx.try_recv().unwrap();
        match rich {
            OutboundMessage::Event { event, data } => {
                assert_eq!(event, EVENT_SEGMENTATION_UPDATE);
                assert_eq!(data["status"], "pending");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        match legacy {
            OutboundMessage::Event { event, data } => {
                assert_eq!(event, EVENT_SEGMENTATION_UPDATE_LEGACY);
                assert_eq!(data["status"], "queued");
                assert_eq!(data["imageId"], "a");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn other_rooms_do_not_receive_updates() {
        let (b, mut rx) = setup().await;
        b.publish(ROOM, processing(0)).await;
        b.publish("proj-2", processing(1)).await;

        assert_eq!(drain(&mut rx), vec![("img-0".into(), "processing".into())]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn flush_timer_never_sends_after_terminal_update() {
        let hub = Arc::new(RoomHub::new());
        let mut rx = hub.add("conn-1").await;
        hub.join("conn-1", ROOM).await;
        let b = ProgressBroadcaster::new(
            hub,
            BroadcastConfig {
                throttle_interval: Duration::from_millis(2),
                ..BroadcastConfig::default()
            },
        );

        for round in 0..200 {
            let image = format!("img-{round}");
            let tick = || ProgressUpdate::new(image.as_str(), SegmentationStatus::Processing);
            b.publish(ROOM, tick()).await;
            b.publish(ROOM, tick()).await;
            // Land the terminal update around the moment the timer fires.
            tokio::time::sleep(Duration::from_micros(1_500 + (round % 10) * 100)).await;
            b.publish(ROOM, ProgressUpdate::new(image.as_str(), SegmentationStatus::Completed))
                .await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut finished = std::collections::HashSet::new();
        for (image, status) in drain(&mut rx) {
            if status == "completed" {
                finished.insert(image);
            } else {
                assert!(
                    !finished.contains(&image),
                    "{image} sent {status} after completed"
                );
            }
        }
        assert_eq!(finished.len(), 200);
    }

    #[tokio::test]
    async fn service_status_goes_to_every_connection() {
        let (b, mut rx) = setup().await;
        let mut other = b.hub().add("conn-2").await;

        let delivered = b
            .publish_service_status(ServiceStatus {
                service: "ml-segmentation".into(),
                available: false,
                state: "open".into(),
                timestamp: chrono::Utc::now(),
            })
            .await;

        assert_eq!(delivered, 2);
        for rx in [&mut rx, &mut other] {
            match rx.try_recv().unwrap() {
                OutboundMessage::Event { event, data } => {
                    assert_eq!(event, EVENT_SERVICE_STATUS);
                    assert_eq!(data["available"], false);
                    assert_eq!(data["state"], "open");
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }
}
