use std::fmt;
use std::time::Duration;

use crate::types::WebhookId;

/// Errors returned by the webhook registry.
///
/// These are configuration errors: they are raised synchronously to the
/// admin caller and never reach the delivery engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// URL is not an absolute http(s) URL.
    InvalidUrl { url: String },

    /// Another active webhook already targets this URL.
    DuplicateUrl { url: String, existing: WebhookId },

    /// Event name is not in the event catalog.
    UnknownEvent { event: String },

    /// A webhook must subscribe to at least one event.
    EmptyEvents,

    /// `retry_attempts` outside the accepted range.
    InvalidRetryAttempts { value: u32 },

    /// `timeout_ms` outside the accepted range.
    InvalidTimeout { value: u64 },

    /// No webhook with this id.
    NotFound { id: WebhookId },

    /// Backing store failed.
    Storage(StoreError),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::InvalidUrl { url } =>
                write!(f, "invalid webhook url: {url}"),
            RegistryError::DuplicateUrl { url, existing } =>
                write!(f, "url {url} is already used by active webhook {existing}"),
            RegistryError::UnknownEvent { event } =>
                write!(f, "unknown event name: {event}"),
            RegistryError::EmptyEvents =>
                write!(f, "webhook must subscribe to at least one event"),
            RegistryError::InvalidRetryAttempts { value } =>
                write!(f, "retry attempts must be between 1 and 10, got {value}"),
            RegistryError::InvalidTimeout { value } =>
                write!(f, "timeout must be between 1 and 60000 ms, got {value}"),
            RegistryError::NotFound { id } =>
                write!(f, "webhook not found: {id}"),
            RegistryError::Storage(err) =>
                write!(f, "webhook store error: {err}"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        RegistryError::Storage(err)
    }
}

/// Failure of an injectable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend could not be reached.
    Unavailable(String),

    /// Stored value could not be encoded or decoded.
    Codec(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
            StoreError::Codec(msg) => write!(f, "store codec error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

/// Reasons why a delivery attempt, or a whole delivery, failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Attempt exceeded the webhook's per-attempt timeout.
    Timeout(Duration),

    /// Connection or protocol failure before a response was received.
    Network(String),

    /// Receiver answered outside the 2xx range.
    HttpStatus { status: u16, body: String },

    /// All attempts were used up.
    MaxAttemptsExceeded { attempts: u32 },

    /// Webhook was deleted or deactivated while a retry was pending.
    WebhookUnavailable,
}

impl FailureReason {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureReason::Timeout(_) | FailureReason::Network(_) | FailureReason::HttpStatus { .. }
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout(after) =>
                write!(f, "request timed out after {}ms", after.as_millis()),
            FailureReason::Network(msg) =>
                write!(f, "network error: {msg}"),
            FailureReason::HttpStatus { status, body } if body.is_empty() =>
                write!(f, "HTTP {status}"),
            FailureReason::HttpStatus { status, body } =>
                write!(f, "HTTP {status}: {body}"),
            FailureReason::MaxAttemptsExceeded { attempts } =>
                write!(f, "maximum attempts exceeded ({attempts})"),
            FailureReason::WebhookUnavailable =>
                write!(f, "webhook was deleted or deactivated"),
        }
    }
}

/// Write failure on a single push connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    /// The peer went away.
    Closed,

    /// The peer is not draining its buffer.
    Lagging,
}

impl fmt::Display for PushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Closed => write!(f, "push connection closed"),
            PushError::Lagging => write!(f, "push connection buffer full"),
        }
    }
}

impl std::error::Error for PushError {}

/// Invalid environment configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: String,
    pub reason: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.var, self.reason)
    }
}

impl std::error::Error for ConfigError {}

/// Failure to assemble a [`Notifier`](crate::Notifier).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// No transport supplied and the `http` feature is off.
    MissingTransport,

    /// The default HTTP client could not be created.
    Transport(String),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::MissingTransport => write!(f, "no webhook transport configured"),
            BuildError::Transport(msg) => write!(f, "failed to create HTTP transport: {msg}"),
        }
    }
}

impl std::error::Error for BuildError {}
