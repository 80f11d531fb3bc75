//! Webhook delivery engine.
//!
//! Matches triggered events against active webhooks, snapshots a signed
//! envelope per match and drives each delivery through its attempt sequence
//! until it is `delivered` or `failed`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::dedup::{dedup_key, DedupFallback, DedupWindow, DEFAULT_DEDUP_CAPACITY};
use crate::error::{FailureReason, RegistryError, StoreError};
use crate::registry::{WebhookRegistry, TEST_EVENT};
use crate::scheduler::{add_delay, Clock, Job, Scheduler};
use crate::signing::{signature_header_value, DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER};
use crate::storage::DeliveryStore;
use crate::types::{DeliveryId, DeliveryStatus, WebhookConfig, WebhookDelivery, WebhookEnvelope, WebhookId};
use crate::worker::{deliver, retry_delay, OutboundRequest, Transport};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::counter!(name).increment(1);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

pub const DEFAULT_RETRY_BASE_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Backoff base; the n-th retry waits `base * 2^(n-1)`.
    pub retry_base_ms: u64,
    /// Upper bound on HTTP attempts in flight across all webhooks.
    pub max_in_flight: usize,
    /// Deliveries kept per webhook in history.
    pub history_limit: usize,
    pub dedup_capacity: usize,
    pub dedup_fallback: DedupFallback,
    pub user_agent: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
            max_in_flight: 100,
            history_limit: 100,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            dedup_fallback: DedupFallback::ContentHash,
            user_agent: "ACS-Webhook/1.0".to_string(),
        }
    }
}

/// What a call to [`WebhookDispatcher::trigger_webhook`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Same dedup key seen recently; nothing happened.
    DuplicateSuppressed,
    /// No active webhook subscribes to the event.
    NoSubscribers,
    /// The registry could not be read.
    RegistryUnavailable,
    /// One delivery was created per matching webhook.
    Dispatched(Vec<DeliveryId>),
}

/// Diagnostic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStats {
    pub triggered: u64,
    pub suppressed: u64,
    pub created: u64,
    pub attempts: u64,
    pub delivered: u64,
    pub failed: u64,
    pub retries_scheduled: u64,
    pub aborted: u64,
}

#[derive(Debug, Default)]
struct Counters {
    triggered: AtomicU64,
    suppressed: AtomicU64,
    created: AtomicU64,
    attempts: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    retries_scheduled: AtomicU64,
    aborted: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, metric: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        metric_inc(metric);
    }

    fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            triggered: self.triggered.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    registry: WebhookRegistry,
    deliveries: Arc<dyn DeliveryStore>,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    dedup: DedupWindow,
    in_flight: Semaphore,
    config: DispatcherConfig,
    counters: Counters,
}

/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct WebhookDispatcher {
    inner: Arc<Inner>,
}

impl WebhookDispatcher {
    pub fn new(
        config: DispatcherConfig,
        registry: WebhookRegistry,
        deliveries: Arc<dyn DeliveryStore>,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let inner = Inner {
            registry,
            deliveries,
            transport,
            scheduler,
            clock,
            dedup: DedupWindow::new(config.dedup_capacity),
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            config,
            counters: Counters::default(),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn registry(&self) -> &WebhookRegistry {
        &self.inner.registry
    }

    pub fn dedup_window(&self) -> &DedupWindow {
        &self.inner.dedup
    }

    pub fn stats(&self) -> DeliveryStats {
        self.inner.counters.snapshot()
    }

    /// Fan `payload` out to every active webhook subscribed to `event_name`.
    ///
    /// Returns once deliveries are recorded; attempts run on the scheduler.
    pub async fn trigger_webhook(&self, event_name: &str, payload: Value) -> TriggerOutcome {
        let inner = &self.inner;
        let key = dedup_key(event_name, &payload, inner.config.dedup_fallback, inner.clock.now());
        if !inner.dedup.add(&key) {
            Counters::bump(&inner.counters.suppressed, "webhook.trigger.suppressed");
            crate::trace_event!(
                debug,
                target: "webhook_delivery",
                event = %event_name,
                dedup_key = %key,
                "Duplicate trigger suppressed"
            );
            return TriggerOutcome::DuplicateSuppressed;
        }
        Counters::bump(&inner.counters.triggered, "webhook.trigger.accepted");

        let webhooks = match inner.registry.active_for_event(event_name).await {
            Ok(webhooks) => webhooks,
            Err(err) => {
                crate::trace_event!(
                    error,
                    target: "webhook_delivery",
                    event = %event_name,
                    error = %err,
                    "Failed to load matching webhooks"
                );
                return TriggerOutcome::RegistryUnavailable;
            }
        };

        if webhooks.is_empty() {
            crate::trace_event!(debug, target: "webhook_delivery", event = %event_name, "No active webhooks match event");
            return TriggerOutcome::NoSubscribers;
        }

        let mut ids = Vec::with_capacity(webhooks.len());
        for webhook in &webhooks {
            if let Some(id) = self.start_delivery(webhook, event_name, &payload).await {
                ids.push(id);
            }
        }
        TriggerOutcome::Dispatched(ids)
    }

    /// Send a `webhook.test` delivery to one webhook, bypassing dedup and
    /// subscription matching.
    pub async fn send_test(&self, webhook_id: &WebhookId) -> Result<DeliveryId, RegistryError> {
        let webhook = self.inner.registry.require(webhook_id).await?;
        let payload = json!({
            "message": "Test delivery",
            "webhookId": webhook.id,
            "webhookName": webhook.name,
        });
        self.start_delivery(&webhook, TEST_EVENT, &payload)
            .await
            .ok_or(RegistryError::Storage(StoreError::Unavailable(
                "could not record test delivery".to_string(),
            )))
    }

    /// Delivery history of a webhook, newest first.
    pub async fn deliveries(&self, webhook_id: &WebhookId, limit: usize) -> Result<Vec<WebhookDelivery>, StoreError> {
        self.inner.deliveries.list_deliveries(webhook_id, limit).await
    }

    pub async fn delivery(&self, id: &DeliveryId) -> Result<Option<WebhookDelivery>, StoreError> {
        self.inner.deliveries.get_delivery(id).await
    }

    async fn start_delivery(&self, webhook: &WebhookConfig, event_name: &str, payload: &Value) -> Option<DeliveryId> {
        let inner = &self.inner;
        let id = DeliveryId::generate();
        let now = inner.clock.now();

        let envelope = WebhookEnvelope {
            event: event_name,
            timestamp: now,
            delivery_id: &id,
            data: payload,
        };
        let snapshot = match serde_json::to_value(&envelope) {
            Ok(value) => value,
            Err(err) => {
                crate::trace_event!(
                    error,
                    target: "webhook_delivery",
                    webhook_id = %webhook.id,
                    error = %err,
                    "Failed to serialize webhook envelope"
                );
                return None;
            }
        };

        let delivery = WebhookDelivery {
            id: id.clone(),
            webhook_id: webhook.id.clone(),
            event: event_name.to_string(),
            payload: snapshot,
            attempts: 0,
            max_attempts: webhook.retry_attempts.max(1),
            status: DeliveryStatus::Pending,
            response: None,
            error: None,
            created_at: now,
            last_attempt_at: None,
            next_retry_at: None,
        };

        if let Err(err) = inner.deliveries.save_delivery(&delivery).await {
            crate::trace_event!(
                error,
                target: "webhook_delivery",
                delivery_id = %id,
                error = %err,
                "Failed to record delivery"
            );
            return None;
        }
        if let Err(err) = inner.deliveries.trim_deliveries(&webhook.id, inner.config.history_limit).await {
            crate::trace_event!(warn, target: "webhook_delivery", webhook_id = %webhook.id, error = %err, "Failed to trim delivery history");
        }
        Counters::bump(&inner.counters.created, "webhook.delivery.created");

        inner.scheduler.spawn(attempt_job(self.inner.clone(), delivery));
        Some(id)
    }
}

fn attempt_job(inner: Arc<Inner>, delivery: WebhookDelivery) -> Job {
    Box::pin(async move { run_attempt(inner, delivery).await })
}

async fn persist(inner: &Inner, delivery: &WebhookDelivery) {
    match inner.deliveries.update_delivery(delivery).await {
        Ok(true) => {}
        // Trimmed out of history; the attempt chain carries on unrecorded.
        Ok(false) => {
            crate::trace_event!(
                debug,
                target: "webhook_delivery",
                delivery_id = %delivery.id,
                status = ?delivery.status,
                "Delivery no longer in history, update dropped"
            );
        }
        Err(err) => {
            crate::trace_event!(
                error,
                target: "webhook_delivery",
                delivery_id = %delivery.id,
                status = ?delivery.status,
                error = %err,
                "Failed to update delivery record"
            );
        }
    }
}

/// Run one attempt of `delivery` and settle or reschedule it.
async fn run_attempt(inner: Arc<Inner>, mut delivery: WebhookDelivery) {
    let webhook = match inner.registry.get(&delivery.webhook_id).await {
        Ok(Some(webhook)) if webhook.active => Ok(webhook),
        Ok(_) => {
            abort(&inner, delivery).await;
            return;
        }
        Err(err) => Err(FailureReason::Network(format!("webhook store unavailable: {err}"))),
    };

    delivery.attempts += 1;
    delivery.last_attempt_at = Some(inner.clock.now());
    delivery.next_retry_at = None;
    Counters::bump(&inner.counters.attempts, "webhook.delivery.attempt");

    let result = match webhook {
        Ok(webhook) => {
            let request = build_request(&inner, &webhook, &delivery);
            // Held only for the HTTP call, never across backoff.
            let _permit = inner.in_flight.acquire().await;
            deliver(inner.transport.as_ref(), request).await
        }
        Err(reason) => Err(reason),
    };

    match result {
        Ok(summary) => {
            delivery.status = DeliveryStatus::Delivered;
            delivery.response = Some(summary);
            delivery.error = None;
            persist(&inner, &delivery).await;
            Counters::bump(&inner.counters.delivered, "webhook.delivery.delivered");
            crate::trace_event!(
                info,
                target: "webhook_delivery",
                delivery_id = %delivery.id,
                webhook_id = %delivery.webhook_id,
                event = %delivery.event,
                attempt = delivery.attempts,
                "Webhook delivery succeeded"
            );
        }
        Err(reason) => settle_failure(&inner, delivery, reason).await,
    }
}

async fn settle_failure(inner: &Arc<Inner>, mut delivery: WebhookDelivery, reason: FailureReason) {
    delivery.error = Some(reason.to_string());

    if reason.is_transient() && delivery.attempts < delivery.max_attempts {
        let delay = retry_delay(inner.config.retry_base_ms, delivery.attempts);
        delivery.status = DeliveryStatus::Retrying;
        delivery.next_retry_at = Some(add_delay(inner.clock.now(), delay));
        persist(inner, &delivery).await;
        Counters::bump(&inner.counters.retries_scheduled, "webhook.delivery.retry_scheduled");
        crate::trace_event!(
            warn,
            target: "webhook_delivery",
            delivery_id = %delivery.id,
            webhook_id = %delivery.webhook_id,
            event = %delivery.event,
            attempt = delivery.attempts,
            max_attempts = delivery.max_attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %reason,
            "Webhook delivery failed, retry scheduled"
        );
        inner.scheduler.schedule(delay, attempt_job(inner.clone(), delivery));
        return;
    }

    delivery.status = DeliveryStatus::Failed;
    persist(inner, &delivery).await;
    Counters::bump(&inner.counters.failed, "webhook.delivery.failed");
    // Terminal: recorded and logged only, never re-triggered.
    crate::trace_event!(
        error,
        target: "webhook_delivery",
        delivery_id = %delivery.id,
        webhook_id = %delivery.webhook_id,
        event = %delivery.event,
        attempts = delivery.attempts,
        error = %reason,
        "{}",
        FailureReason::MaxAttemptsExceeded { attempts: delivery.attempts }
    );
}

async fn abort(inner: &Inner, mut delivery: WebhookDelivery) {
    delivery.status = DeliveryStatus::Failed;
    delivery.next_retry_at = None;
    delivery.error = Some(FailureReason::WebhookUnavailable.to_string());
    persist(inner, &delivery).await;
    Counters::bump(&inner.counters.aborted, "webhook.delivery.aborted");
    crate::trace_event!(
        warn,
        target: "webhook_delivery",
        delivery_id = %delivery.id,
        webhook_id = %delivery.webhook_id,
        attempts = delivery.attempts,
        "Pending delivery aborted, webhook no longer active"
    );
}

fn build_request(inner: &Inner, webhook: &WebhookConfig, delivery: &WebhookDelivery) -> OutboundRequest {
    // Value serialization cannot fail; these bytes are both signed and sent.
    let body = serde_json::to_vec(&delivery.payload).unwrap_or_default();
    let signature = signature_header_value(&body, webhook.secret.as_bytes());

    OutboundRequest {
        url: webhook.url.clone(),
        headers: vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            (SIGNATURE_HEADER.to_string(), signature),
            (EVENT_HEADER.to_string(), delivery.event.clone()),
            (DELIVERY_HEADER.to_string(), delivery.id.0.clone()),
            ("User-Agent".to_string(), inner.config.user_agent.clone()),
        ],
        body,
        timeout: webhook.timeout(),
    }
}
