//! Runtime configuration.

use std::str::FromStr;
use std::time::Duration;

use crate::dedup::{DedupFallback, DEFAULT_DEDUP_CAPACITY};
use crate::dispatcher::{DispatcherConfig, DEFAULT_RETRY_BASE_MS};
use crate::error::ConfigError;
use crate::registry::EventCatalog;

const ENV_PREFIX: &str = "ACS_NOTIFY_";

/// One hour.
pub const MAX_RETRY_BASE_MS: u64 = 3_600_000;

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Recent trigger keys remembered for duplicate suppression.
    pub dedup_capacity: usize,
    pub dedup_fallback: DedupFallback,
    pub retry_base_ms: u64,
    /// Concurrent webhook HTTP attempts across all webhooks.
    pub max_in_flight: usize,
    /// Deliveries kept per webhook.
    pub history_limit: usize,
    /// Used in `User-Agent: <product>-Webhook/1.0`.
    pub product_name: String,
    /// Frames buffered per live feed connection before it is pruned.
    pub push_buffer: usize,
    pub keep_alive_secs: u64,
    pub bind_address: String,
    pub known_events: Vec<String>,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            dedup_fallback: DedupFallback::ContentHash,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
            max_in_flight: 100,
            history_limit: 100,
            product_name: "ACS".to_string(),
            push_buffer: 64,
            keep_alive_secs: 15,
            bind_address: "127.0.0.1:8080".to_string(),
            known_events: EventCatalog::default().names().map(str::to_string).collect(),
        }
    }
}

impl NotifierConfig {
    /// Load overrides from `ACS_NOTIFY_*` environment variables.
    ///
    /// Unset variables keep their default:
    /// - `ACS_NOTIFY_DEDUP_CAPACITY`
    /// - `ACS_NOTIFY_DEDUP_FALLBACK`: `content` or `time:<secs>`
    /// - `ACS_NOTIFY_RETRY_BASE_MS`: at most [`MAX_RETRY_BASE_MS`]
    /// - `ACS_NOTIFY_MAX_IN_FLIGHT`
    /// - `ACS_NOTIFY_HISTORY_LIMIT`
    /// - `ACS_NOTIFY_PRODUCT_NAME`
    /// - `ACS_NOTIFY_PUSH_BUFFER`
    /// - `ACS_NOTIFY_KEEP_ALIVE_SECS`
    /// - `ACS_NOTIFY_BIND_ADDRESS`
    /// - `ACS_NOTIFY_KNOWN_EVENTS`: comma-separated event names
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| -> Option<(String, String)> {
            let var = format!("{ENV_PREFIX}{key}");
            lookup(&var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (var, v))
        };

        let mut config = Self::default();

        if let Some((var, v)) = get("DEDUP_CAPACITY") {
            config.dedup_capacity = parse_positive(&var, &v)?;
        }
        if let Some((var, v)) = get("DEDUP_FALLBACK") {
            config.dedup_fallback = DedupFallback::parse(&v).ok_or_else(|| ConfigError {
                var,
                reason: format!("expected `content` or `time:<secs>`, got `{v}`"),
            })?;
        }
        if let Some((var, v)) = get("RETRY_BASE_MS") {
            let base: u64 = parse_positive(&var, &v)?;
            if base > MAX_RETRY_BASE_MS {
                return Err(ConfigError {
                    var,
                    reason: format!("must be at most {MAX_RETRY_BASE_MS}"),
                });
            }
            config.retry_base_ms = base;
        }
        if let Some((var, v)) = get("MAX_IN_FLIGHT") {
            config.max_in_flight = parse_positive(&var, &v)?;
        }
        if let Some((var, v)) = get("HISTORY_LIMIT") {
            config.history_limit = parse_positive(&var, &v)?;
        }
        if let Some((_, v)) = get("PRODUCT_NAME") {
            config.product_name = v;
        }
        if let Some((var, v)) = get("PUSH_BUFFER") {
            config.push_buffer = parse_positive(&var, &v)?;
        }
        if let Some((var, v)) = get("KEEP_ALIVE_SECS") {
            config.keep_alive_secs = parse_positive(&var, &v)?;
        }
        if let Some((_, v)) = get("BIND_ADDRESS") {
            config.bind_address = v;
        }
        if let Some((var, v)) = get("KNOWN_EVENTS") {
            let events: Vec<String> = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if events.is_empty() {
                return Err(ConfigError {
                    var,
                    reason: "no event names given".to_string(),
                });
            }
            config.known_events = events;
        }

        Ok(config)
    }

    pub fn user_agent(&self) -> String {
        format!("{}-Webhook/1.0", self.product_name)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn catalog(&self) -> EventCatalog {
        EventCatalog::new(self.known_events.iter().cloned())
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            retry_base_ms: self.retry_base_ms,
            max_in_flight: self.max_in_flight,
            history_limit: self.history_limit,
            dedup_capacity: self.dedup_capacity,
            dedup_fallback: self.dedup_fallback,
            user_agent: self.user_agent(),
        }
    }
}

fn parse_positive<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
{
    match value.parse::<T>() {
        Ok(parsed) if parsed != T::default() => Ok(parsed),
        Ok(_) => Err(ConfigError {
            var: var.to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        Err(_) => Err(ConfigError {
            var: var.to_string(),
            reason: format!("not a positive integer: `{value}`"),
        }),
    }
}
