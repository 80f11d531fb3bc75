use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use acs_notify::{
    DeliveryStatus, Event, EventId, EventStore, FailureReason, ManualClock, ManualScheduler, NewEvent, NewWebhook,
    Notifier, OutboundRequest, PushChannel, PushError, PushFrame, RequestContext, StoreError, Subscriber, Transport,
    TransportResponse,
};

#[derive(Default)]
struct RecordingTransport {
    requests: Mutex<Vec<OutboundRequest>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn post(&self, request: OutboundRequest) -> Result<TransportResponse, FailureReason> {
        self.requests.lock().unwrap().push(request);
        Ok(TransportResponse { status: 200, body: String::new() })
    }
}

#[derive(Default)]
struct RecordingChannel {
    frames: Mutex<Vec<PushFrame>>,
    broken: AtomicBool,
}

impl PushChannel for RecordingChannel {
    fn send(&self, frame: &PushFrame) -> Result<(), PushError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(PushError::Closed);
        }
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }

    fn close(&self) {}
}

struct BrokenEventStore;

#[async_trait]
impl EventStore for BrokenEventStore {
    async fn append_event(&self, _event: NewEvent, _created_at: DateTime<Utc>) -> Result<Event, StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }

    async fn get_event(&self, _id: EventId) -> Result<Option<Event>, StoreError> {
        Ok(None)
    }

    async fn recent_events(&self, _limit: usize) -> Result<Vec<Event>, StoreError> {
        Ok(Vec::new())
    }
}

fn notifier(transport: Arc<RecordingTransport>, scheduler: &ManualScheduler) -> Notifier {
    Notifier::builder()
        .transport(transport)
        .scheduler(Arc::new(scheduler.clone()))
        .clock(Arc::new(scheduler.clock().clone()))
        .build()
        .unwrap()
}

fn admin() -> Subscriber {
    Subscriber::new("1", "admin", true)
}

fn door_offline() -> NewEvent {
    NewEvent::new("door", "offline", "door")
        .with_entity("5", "Front door")
        .with_details(json!({ "reason": "heartbeat lost" }))
}

#[tokio::test]
async fn test_log_event_persists_and_fans_out() {
    let transport = Arc::new(RecordingTransport::default());
    let scheduler = ManualScheduler::new(ManualClock::default());
    let notifier = notifier(transport.clone(), &scheduler);

    let webhook = notifier
        .registry()
        .create(NewWebhook::new("alerts", "http://alerts.test/hook", ["door.offline"]))
        .await
        .unwrap();
    let channel = Arc::new(RecordingChannel::default());
    notifier.hub().open(admin(), channel.clone()).unwrap();

    let ctx = RequestContext::new()
        .with_ip("10.0.0.7")
        .with_user_agent("admin-ui")
        .with_user("u-1", "Alice");
    let event = notifier.events().log_event(&ctx, door_offline()).await.unwrap();
    assert_eq!(event.id, EventId(1));
    assert_eq!(event.webhook_event_name(), "door.offline");
    assert_eq!(event.ip_address.as_deref(), Some("10.0.0.7"));
    assert_eq!(event.user_name.as_deref(), Some("Alice"));

    // Both fan-outs are queued, neither has run yet.
    assert_eq!(scheduler.pending(), 2);
    assert_eq!(channel.frames.lock().unwrap().len(), 1);
    assert!(transport.requests.lock().unwrap().is_empty());

    scheduler.run_due().await;

    let frames = channel.frames.lock().unwrap().clone();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].kind, "event");
    let pushed: Value = serde_json::from_str(&frames[1].data).unwrap();
    assert_eq!(pushed["type"], "door");
    assert_eq!(pushed["entityName"], "Front door");

    let requests = transport.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["event"], "door.offline");
    assert_eq!(body["data"]["id"], 1);
    assert_eq!(body["data"]["details"]["reason"], "heartbeat lost");

    let history = notifier.webhooks().deliveries(&webhook.id, 10).await.unwrap();
    assert_eq!(history[0].status, DeliveryStatus::Delivered);

    assert_eq!(notifier.events().get(EventId(1)).await.unwrap(), Some(event));
    assert_eq!(notifier.events().recent(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_explicit_event_fields_win_over_context() {
    let transport = Arc::new(RecordingTransport::default());
    let scheduler = ManualScheduler::new(ManualClock::default());
    let notifier = notifier(transport, &scheduler);

    let ctx = RequestContext::new().with_user("u-1", "Alice").with_ip("10.0.0.7");
    let event = notifier
        .events()
        .log_event(&ctx, door_offline().with_user("system", "Scheduler"))
        .await
        .unwrap();
    assert_eq!(event.user_id.as_deref(), Some("system"));
    assert_eq!(event.ip_address.as_deref(), Some("10.0.0.7"));
}

#[tokio::test]
async fn test_persistence_failure_is_swallowed() {
    let transport = Arc::new(RecordingTransport::default());
    let scheduler = ManualScheduler::new(ManualClock::default());
    let notifier = Notifier::builder()
        .transport(transport.clone())
        .event_store(Arc::new(BrokenEventStore))
        .scheduler(Arc::new(scheduler.clone()))
        .build()
        .unwrap();

    let result = notifier.events().log_event(&RequestContext::new(), door_offline()).await;
    assert!(result.is_none());
    assert_eq!(scheduler.pending(), 0);
}

#[tokio::test]
async fn test_broken_push_connection_does_not_affect_webhooks() {
    let transport = Arc::new(RecordingTransport::default());
    let scheduler = ManualScheduler::new(ManualClock::default());
    let notifier = notifier(transport.clone(), &scheduler);

    notifier
        .registry()
        .create(NewWebhook::new("alerts", "http://alerts.test/hook", ["door.offline"]))
        .await
        .unwrap();
    let healthy = Arc::new(RecordingChannel::default());
    let broken = Arc::new(RecordingChannel::default());
    notifier.hub().open(admin(), healthy.clone()).unwrap();
    notifier.hub().open(admin(), broken.clone()).unwrap();
    broken.broken.store(true, Ordering::SeqCst);

    notifier.events().log_event(&RequestContext::new(), door_offline()).await.unwrap();
    scheduler.run_due().await;

    assert_eq!(notifier.hub().connection_count(), 1);
    assert_eq!(healthy.frames.lock().unwrap().len(), 2);
    assert_eq!(transport.requests.lock().unwrap().len(), 1);
}
