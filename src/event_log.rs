//! Producer entry point: persist an event, then fan it out.

use std::sync::Arc;

use crate::broadcast::BroadcastHub;
use crate::dispatcher::WebhookDispatcher;
use crate::error::StoreError;
use crate::scheduler::{Clock, Scheduler};
use crate::storage::EventStore;
use crate::types::{Event, EventId, NewEvent, RequestContext};

/// Handle given to business code for recording events.
///
/// Logging never fails towards the caller. Live feed and webhook fan-out run
/// as separate scheduled jobs after the event is persisted.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn EventStore>,
    hub: BroadcastHub,
    dispatcher: WebhookDispatcher,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
}

impl EventLog {
    pub fn new(
        store: Arc<dyn EventStore>,
        hub: BroadcastHub,
        dispatcher: WebhookDispatcher,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            hub,
            dispatcher,
            scheduler,
            clock,
        }
    }

    /// Record `data`, filling request metadata from `ctx`.
    ///
    /// Returns `None` when the event could not be persisted; the failure is
    /// logged and nothing is fanned out.
    pub async fn log_event(&self, ctx: &RequestContext, data: NewEvent) -> Option<Event> {
        let data = data.merge_context(ctx);
        let event = match self.store.append_event(data, self.clock.now()).await {
            Ok(event) => event,
            Err(err) => {
                crate::trace_event!(error, target: "event_log", error = %err, "Failed to persist event");
                return None;
            }
        };

        crate::trace_event!(
            debug,
            target: "event_log",
            event_id = %event.id,
            event_type = %event.event_type,
            action = %event.action,
            "Event persisted"
        );

        let hub = self.hub.clone();
        let pushed = event.clone();
        self.scheduler.spawn(Box::pin(async move {
            hub.publish(&pushed);
        }));

        let dispatcher = self.dispatcher.clone();
        let triggered = event.clone();
        self.scheduler.spawn(Box::pin(async move {
            match serde_json::to_value(&triggered) {
                Ok(payload) => {
                    dispatcher
                        .trigger_webhook(&triggered.webhook_event_name(), payload)
                        .await;
                }
                Err(err) => {
                    crate::trace_event!(
                        error,
                        target: "event_log",
                        event_id = %triggered.id,
                        error = %err,
                        "Failed to encode webhook payload"
                    );
                }
            }
        }));

        Some(event)
    }

    pub async fn get(&self, id: EventId) -> Result<Option<Event>, StoreError> {
        self.store.get_event(id).await
    }

    /// Newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<Event>, StoreError> {
        self.store.recent_events(limit).await
    }
}
