//! Event log with signed webhook delivery and a live push feed.
//!
//! Business code records immutable events through an [`EventLog`]. Each
//! persisted event is fanned out on two independent paths:
//!
//! - the [`WebhookDispatcher`], which posts a signed JSON envelope to every
//!   active webhook subscribed to the event and retries with exponential
//!   backoff;
//! - the [`BroadcastHub`], which pushes the event to connected live feed
//!   clients (SSE over the optional axum `server` surface).
//!
//! ## Guarantees
//! - Logging never fails back into the caller
//! - At-least-once, best-effort webhook delivery
//! - Bounded dedup window and bounded concurrent HTTP attempts
//! - A slow or broken push connection never holds up the others
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Durability of pending retries across restarts
//! - Replay of events to late push subscribers

#[cfg(feature = "tracing")]
macro_rules! trace_event {
    ($level:ident, $($arg:tt)+) => {
        tracing::$level!($($arg)+)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_event {
    ($level:ident, $($arg:tt)+) => {};
}

pub(crate) use trace_event;

mod auth;
mod broadcast;
mod config;
mod dedup;
mod dispatcher;
mod error;
mod event_log;
mod notifier;
mod registry;
mod scheduler;
mod signing;
mod storage;
mod types;
mod worker;

#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "redis")]
mod storage_redis;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use auth::{StaticTokenAuthenticator, StreamAuthenticator, Subscriber};
pub use broadcast::{BroadcastHub, ConnectionGuard, ConnectionId, PushChannel, PushFrame, QueuedChannel};
pub use config::{NotifierConfig, MAX_RETRY_BASE_MS};
pub use dedup::{dedup_key, DedupFallback, DedupWindow, DEFAULT_DEDUP_CAPACITY};
pub use dispatcher::{DeliveryStats, DispatcherConfig, TriggerOutcome, WebhookDispatcher, DEFAULT_RETRY_BASE_MS};
pub use error::{BuildError, ConfigError, FailureReason, PushError, RegistryError, StoreError};
pub use event_log::EventLog;
pub use notifier::{Notifier, NotifierBuilder};
pub use registry::{
    EventCatalog, WebhookRegistry, DEFAULT_RETRY_ATTEMPTS, DEFAULT_TIMEOUT_MS, MAX_RETRY_ATTEMPTS, MAX_TIMEOUT_MS,
    TEST_EVENT,
};
pub use scheduler::{Clock, Job, ManualClock, ManualScheduler, Scheduler, SystemClock, TokioScheduler};
pub use signing::{
    parse_signature_header, sign, signature_header_value, verify, verify_webhook_request, VerificationError,
    WebhookSecret, DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER,
};
pub use storage::{DeliveryStore, EventStore, InMemoryStorage, WebhookStore};
pub use types::{
    DeliveryId, DeliveryStatus, Event, EventId, NewEvent, NewWebhook, RequestContext, WebhookConfig, WebhookDelivery,
    WebhookEnvelope, WebhookId, WebhookUpdate, WebhookView,
};
pub use worker::{deliver, retry_delay, OutboundRequest, Transport, TransportResponse};

#[cfg(feature = "http")]
pub use worker::HttpTransport;

#[cfg(feature = "redis")]
pub use storage_redis::RedisStorage;

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStorage;
