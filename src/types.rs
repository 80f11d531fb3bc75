use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::signing::WebhookSecret;

/// Identifier assigned to an [`Event`] by the event store.
///
/// Ids are strictly increasing in append order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a webhook configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WebhookId(pub String);

impl WebhookId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for WebhookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for one delivery attempt sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub String);

impl DeliveryId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable record of a domain occurrence.
///
/// Events are created exactly once by the event log and never mutated
/// afterwards. The serialized form is what both the webhook payload and the
/// live feed frame carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub entity_name: Option<String>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    #[serde(default)]
    pub details: Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Name under which webhooks subscribe to this event, e.g. `door.offline`.
    pub fn webhook_event_name(&self) -> String {
        format!("{}.{}", self.event_type, self.action)
    }
}

/// Data supplied by a producer when logging an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub entity_name: Option<String>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    #[serde(default)]
    pub details: Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl NewEvent {
    pub fn new(
        event_type: impl Into<String>,
        action: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            action: action.into(),
            entity_type: entity_type.into(),
            ..Default::default()
        }
    }

    pub fn with_entity(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.entity_id = Some(id.into());
        self.entity_name = Some(name.into());
        self
    }

    pub fn with_user(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self.user_name = Some(name.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Fill request metadata the producer did not set explicitly.
    pub(crate) fn merge_context(mut self, ctx: &RequestContext) -> Self {
        if self.ip_address.is_none() {
            self.ip_address = ctx.ip_address.clone();
        }
        if self.user_agent.is_none() {
            self.user_agent = ctx.user_agent.clone();
        }
        if self.user_id.is_none() {
            self.user_id = ctx.user_id.clone();
        }
        if self.user_name.is_none() {
            self.user_name = ctx.user_name.clone();
        }
        self
    }
}

/// Request metadata of the business operation that produced an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_user(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self.user_name = Some(name.into());
        self
    }
}

/// Registered HTTP endpoint subscribed to one or more event names.
///
/// Not `Serialize`; API responses use [`WebhookView`], which omits the secret.
#[derive(Clone)]
pub struct WebhookConfig {
    pub id: WebhookId,
    pub name: String,
    pub url: String,
    pub events: BTreeSet<String>,
    pub secret: WebhookSecret,
    pub active: bool,
    /// Total number of attempts per delivery, including the first one.
    pub retry_attempts: u32,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn subscribes_to(&self, event_name: &str) -> bool {
        self.events.contains(event_name)
    }

    pub fn view(&self) -> WebhookView {
        WebhookView::from(self)
    }
}

impl fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("events", &self.events)
            .field("secret", &self.secret)
            .field("active", &self.active)
            .field("retry_attempts", &self.retry_attempts)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

/// Externally visible representation of a [`WebhookConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookView {
    pub id: WebhookId,
    pub name: String,
    pub url: String,
    pub events: BTreeSet<String>,
    pub active: bool,
    pub retry_attempts: u32,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&WebhookConfig> for WebhookView {
    fn from(config: &WebhookConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            url: config.url.clone(),
            events: config.events.clone(),
            active: config.active,
            retry_attempts: config.retry_attempts,
            timeout_ms: config.timeout_ms,
            created_at: config.created_at,
            updated_at: config.updated_at,
        }
    }
}

/// Persisted form of a webhook, secret included. Only storage backends use it.
#[cfg(any(feature = "redis", feature = "postgres"))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WebhookRecord {
    pub id: WebhookId,
    pub name: String,
    pub url: String,
    pub events: BTreeSet<String>,
    pub secret: String,
    pub active: bool,
    pub retry_attempts: u32,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(any(feature = "redis", feature = "postgres"))]
impl From<&WebhookConfig> for WebhookRecord {
    fn from(config: &WebhookConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            url: config.url.clone(),
            events: config.events.clone(),
            secret: config.secret.expose().to_string(),
            active: config.active,
            retry_attempts: config.retry_attempts,
            timeout_ms: config.timeout_ms,
            created_at: config.created_at,
            updated_at: config.updated_at,
        }
    }
}

#[cfg(any(feature = "redis", feature = "postgres"))]
impl From<WebhookRecord> for WebhookConfig {
    fn from(record: WebhookRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            url: record.url,
            events: record.events,
            secret: WebhookSecret::new(record.secret),
            active: record.active,
            retry_attempts: record.retry_attempts,
            timeout_ms: record.timeout_ms,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Admin request to register a webhook.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewWebhook {
    pub name: String,
    pub url: String,
    pub events: Vec<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub retry_attempts: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl NewWebhook {
    pub fn new<I, S>(name: impl Into<String>, url: impl Into<String>, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            url: url.into(),
            events: events.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = Some(attempts);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = Some(false);
        self
    }
}

/// Partial update of a webhook. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub events: Option<Vec<String>>,
    pub secret: Option<String>,
    pub active: Option<bool>,
    pub retry_attempts: Option<u32>,
    pub timeout_ms: Option<u64>,
}

/// Delivery lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Retrying,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }
}

/// One attempt sequence of sending a triggered event to one webhook.
///
/// `payload` is the envelope snapshot taken at creation time; every attempt
/// transmits exactly its serialized bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDelivery {
    pub id: DeliveryId,
    pub webhook_id: WebhookId,
    pub event: String,
    pub payload: Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: DeliveryStatus,
    pub response: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Canonical JSON body posted to webhook receivers.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEnvelope<'a> {
    pub event: &'a str,
    pub timestamp: DateTime<Utc>,
    pub delivery_id: &'a DeliveryId,
    pub data: &'a Value,
}
