use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use url::Url;

use crate::error::RegistryError;
use crate::scheduler::Clock;
use crate::signing::WebhookSecret;
use crate::storage::WebhookStore;
use crate::types::{NewWebhook, WebhookConfig, WebhookId, WebhookUpdate};

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const MAX_RETRY_ATTEMPTS: u32 = 10;
pub const MAX_TIMEOUT_MS: u64 = 60_000;

/// Event name reserved for admin-triggered test deliveries.
pub const TEST_EVENT: &str = "webhook.test";

const DEFAULT_EVENTS: &[&str] = &[
    "access.granted",
    "access.denied",
    "door.online",
    "door.offline",
    "door.unlocked",
    "door.locked",
    "door.forced",
    "door.held_open",
    "user.created",
    "user.updated",
    "user.deleted",
    "group.created",
    "group.updated",
    "group.deleted",
    "site.created",
    "site.updated",
    "site.deleted",
    "visitor.checked_in",
    "visitor.checked_out",
    "system.alert",
];

/// Event names a webhook may subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCatalog {
    names: BTreeSet<String>,
}

impl EventCatalog {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl Default for EventCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENTS.iter().copied())
    }
}

/// CRUD over webhook configurations.
///
/// Writes are serialized so the "one active webhook per URL" rule cannot be
/// raced; reads go straight to the store.
#[derive(Clone)]
pub struct WebhookRegistry {
    store: Arc<dyn WebhookStore>,
    catalog: Arc<EventCatalog>,
    clock: Arc<dyn Clock>,
    write_lock: Arc<Mutex<()>>,
}

impl WebhookRegistry {
    pub fn new(store: Arc<dyn WebhookStore>, catalog: EventCatalog, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            catalog: Arc::new(catalog),
            clock,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn catalog(&self) -> &EventCatalog {
        &self.catalog
    }

    pub async fn create(&self, request: NewWebhook) -> Result<WebhookConfig, RegistryError> {
        let url = normalize_url(&request.url)?;
        let events = self.validate_events(request.events)?;
        let retry_attempts = validate_retry_attempts(request.retry_attempts.unwrap_or(DEFAULT_RETRY_ATTEMPTS))?;
        let timeout_ms = validate_timeout(request.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))?;
        let active = request.active.unwrap_or(true);
        let secret = match request.secret {
            Some(secret) if !secret.is_empty() => WebhookSecret::new(secret),
            _ => WebhookSecret::generate(),
        };

        let _guard = self.write_lock.lock().await;
        let id = WebhookId::generate();
        if active {
            self.ensure_url_free(&url, &id).await?;
        }

        let now = self.clock.now();
        let name = match request.name.trim() {
            "" => url.clone(),
            name => name.to_string(),
        };
        let webhook = WebhookConfig {
            id,
            name,
            url,
            events,
            secret,
            active,
            retry_attempts,
            timeout_ms,
            created_at: now,
            updated_at: now,
        };
        self.store.put_webhook(&webhook).await?;

        crate::trace_event!(
            info,
            target: "webhook_registry",
            webhook_id = %webhook.id,
            url = %webhook.url,
            events = webhook.events.len(),
            "Webhook created"
        );
        Ok(webhook)
    }

    pub async fn list(&self) -> Result<Vec<WebhookConfig>, RegistryError> {
        Ok(self.store.list_webhooks().await?)
    }

    pub async fn get(&self, id: &WebhookId) -> Result<Option<WebhookConfig>, RegistryError> {
        Ok(self.store.get_webhook(id).await?)
    }

    pub async fn require(&self, id: &WebhookId) -> Result<WebhookConfig, RegistryError> {
        self.get(id)
            .await?
            .ok_or_else(|| RegistryError::NotFound { id: id.clone() })
    }

    /// Merge the fields present in `update` and bump `updated_at`.
    pub async fn update(&self, id: &WebhookId, update: WebhookUpdate) -> Result<WebhookConfig, RegistryError> {
        let _guard = self.write_lock.lock().await;
        let mut webhook = self.require(id).await?;

        if let Some(name) = update.name {
            let name = name.trim();
            if !name.is_empty() {
                webhook.name = name.to_string();
            }
        }
        if let Some(url) = update.url {
            webhook.url = normalize_url(&url)?;
        }
        if let Some(events) = update.events {
            webhook.events = self.validate_events(events)?;
        }
        if let Some(secret) = update.secret.filter(|s| !s.is_empty()) {
            webhook.secret = WebhookSecret::new(secret);
        }
        if let Some(active) = update.active {
            webhook.active = active;
        }
        if let Some(attempts) = update.retry_attempts {
            webhook.retry_attempts = validate_retry_attempts(attempts)?;
        }
        if let Some(timeout_ms) = update.timeout_ms {
            webhook.timeout_ms = validate_timeout(timeout_ms)?;
        }

        if webhook.active {
            self.ensure_url_free(&webhook.url, &webhook.id).await?;
        }

        webhook.updated_at = self.clock.now();
        self.store.put_webhook(&webhook).await?;

        crate::trace_event!(
            info,
            target: "webhook_registry",
            webhook_id = %webhook.id,
            active = webhook.active,
            "Webhook updated"
        );
        Ok(webhook)
    }

    pub async fn delete(&self, id: &WebhookId) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().await;
        if !self.store.delete_webhook(id).await? {
            return Err(RegistryError::NotFound { id: id.clone() });
        }
        crate::trace_event!(info, target: "webhook_registry", webhook_id = %id, "Webhook deleted");
        Ok(())
    }

    /// Active webhooks subscribed to `event_name`.
    pub async fn active_for_event(&self, event_name: &str) -> Result<Vec<WebhookConfig>, RegistryError> {
        Ok(self
            .store
            .list_webhooks()
            .await?
            .into_iter()
            .filter(|w| w.active && w.subscribes_to(event_name))
            .collect())
    }

    /// Signing secret of a webhook. In-process use only; never exposed over the API.
    pub async fn secret_for(&self, id: &WebhookId) -> Result<Option<WebhookSecret>, RegistryError> {
        Ok(self.get(id).await?.map(|w| w.secret))
    }

    fn validate_events(&self, events: Vec<String>) -> Result<BTreeSet<String>, RegistryError> {
        let mut seen = HashSet::new();
        let mut out = BTreeSet::new();
        for event in events {
            let event = event.trim().to_string();
            if !seen.insert(event.clone()) {
                continue;
            }
            if !self.catalog.contains(&event) {
                return Err(RegistryError::UnknownEvent { event });
            }
            out.insert(event);
        }
        if out.is_empty() {
            return Err(RegistryError::EmptyEvents);
        }
        Ok(out)
    }

    async fn ensure_url_free(&self, url: &str, own_id: &WebhookId) -> Result<(), RegistryError> {
        let existing = self.store.list_webhooks().await?;
        match existing
            .into_iter()
            .find(|w| w.active && w.url == url && &w.id != own_id)
        {
            Some(other) => Err(RegistryError::DuplicateUrl {
                url: url.to_string(),
                existing: other.id,
            }),
            None => Ok(()),
        }
    }
}

fn normalize_url(raw: &str) -> Result<String, RegistryError> {
    let invalid = || RegistryError::InvalidUrl { url: raw.to_string() };
    let url = Url::parse(raw.trim()).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(invalid());
    }
    Ok(url.to_string())
}

fn validate_retry_attempts(value: u32) -> Result<u32, RegistryError> {
    if (1..=MAX_RETRY_ATTEMPTS).contains(&value) {
        Ok(value)
    } else {
        Err(RegistryError::InvalidRetryAttempts { value })
    }
}

fn validate_timeout(value: u64) -> Result<u64, RegistryError> {
    if (1..=MAX_TIMEOUT_MS).contains(&value) {
        Ok(value)
    } else {
        Err(RegistryError::InvalidTimeout { value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualClock;
    use crate::storage::InMemoryStorage;

    fn registry() -> (WebhookRegistry, ManualClock) {
        let clock = ManualClock::default();
        let registry = WebhookRegistry::new(
            Arc::new(InMemoryStorage::new()),
            EventCatalog::default(),
            Arc::new(clock.clone()),
        );
        (registry, clock)
    }

    #[tokio::test]
    async fn create_applies_defaults() {
        let (registry, _) = registry();
        let webhook = registry
            .create(NewWebhook::new("ops", "https://hooks.example.com/acs", ["door.offline"]))
            .await
            .unwrap();

        assert!(webhook.active);
        assert_eq!(webhook.retry_attempts, DEFAULT_RETRY_ATTEMPTS);
        assert_eq!(webhook.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert!(webhook.secret.expose().starts_with("whsec_"));
        assert_eq!(webhook.created_at, webhook.updated_at);
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn supplied_secret_is_kept() {
        let (registry, _) = registry();
        let webhook = registry
            .create(NewWebhook::new("ops", "https://a.example.com/", ["door.offline"]).with_secret("mine"))
            .await
            .unwrap();
        let secret = registry.secret_for(&webhook.id).await.unwrap().unwrap();
        assert_eq!(secret.expose(), "mine");
    }

    #[tokio::test]
    async fn rejects_invalid_configs() {
        let (registry, _) = registry();
        let bad_url = registry
            .create(NewWebhook::new("x", "ftp://example.com", ["door.offline"]))
            .await;
        assert!(matches!(bad_url, Err(RegistryError::InvalidUrl { .. })));

        let not_a_url = registry.create(NewWebhook::new("x", "not a url", ["door.offline"])).await;
        assert!(matches!(not_a_url, Err(RegistryError::InvalidUrl { .. })));

        let unknown = registry
            .create(NewWebhook::new("x", "https://example.com/", ["door.exploded"]))
            .await;
        assert_eq!(
            unknown.unwrap_err(),
            RegistryError::UnknownEvent { event: "door.exploded".into() }
        );

        let empty = registry.create(NewWebhook::new("x", "https://example.com/", Vec::<String>::new())).await;
        assert_eq!(empty.unwrap_err(), RegistryError::EmptyEvents);

        let attempts = registry
            .create(NewWebhook::new("x", "https://example.com/", ["door.offline"]).with_retry_attempts(0))
            .await;
        assert_eq!(attempts.unwrap_err(), RegistryError::InvalidRetryAttempts { value: 0 });

        let timeout = registry
            .create(NewWebhook::new("x", "https://example.com/", ["door.offline"]).with_timeout_ms(120_000))
            .await;
        assert_eq!(timeout.unwrap_err(), RegistryError::InvalidTimeout { value: 120_000 });
    }

    #[tokio::test]
    async fn duplicate_active_url_is_rejected() {
        let (registry, _) = registry();
        let first = registry
            .create(NewWebhook::new("a", "https://example.com/hook", ["door.offline"]))
            .await
            .unwrap();

        let dup = registry
            .create(NewWebhook::new("b", "https://example.com/hook", ["door.online"]))
            .await;
        assert_eq!(
            dup.unwrap_err(),
            RegistryError::DuplicateUrl { url: "https://example.com/hook".into(), existing: first.id.clone() }
        );

        // An inactive config may share the URL.
        let inactive = registry
            .create(NewWebhook::new("c", "https://example.com/hook", ["door.online"]).inactive())
            .await
            .unwrap();

        // Re-activating it collides again.
        let reactivate = registry
            .update(&inactive.id, WebhookUpdate { active: Some(true), ..Default::default() })
            .await;
        assert!(matches!(reactivate, Err(RegistryError::DuplicateUrl { .. })));

        // Once the first is deactivated, the second may take the URL.
        registry
            .update(&first.id, WebhookUpdate { active: Some(false), ..Default::default() })
            .await
            .unwrap();
        registry
            .update(&inactive.id, WebhookUpdate { active: Some(true), ..Default::default() })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn update_merges_fields_and_bumps_timestamp() {
        let (registry, clock) = registry();
        let webhook = registry
            .create(NewWebhook::new("a", "https://example.com/hook", ["door.offline"]))
            .await
            .unwrap();
        let secret_before = webhook.secret.clone();

        clock.advance(std::time::Duration::from_secs(60));
        let updated = registry
            .update(
                &webhook.id,
                WebhookUpdate {
                    name: Some("renamed".into()),
                    events: Some(vec!["door.online".into(), "door.offline".into()]),
                    retry_attempts: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.url, webhook.url);
        assert_eq!(updated.events.len(), 2);
        assert_eq!(updated.retry_attempts, 5);
        assert_eq!(updated.secret, secret_before);
        assert!(updated.updated_at > webhook.updated_at);
        assert_eq!(updated.created_at, webhook.created_at);
    }

    #[tokio::test]
    async fn delete_and_missing_ids() {
        let (registry, _) = registry();
        let webhook = registry
            .create(NewWebhook::new("a", "https://example.com/hook", ["door.offline"]))
            .await
            .unwrap();
        registry.delete(&webhook.id).await.unwrap();
        assert!(registry.get(&webhook.id).await.unwrap().is_none());
        assert_eq!(
            registry.delete(&webhook.id).await.unwrap_err(),
            RegistryError::NotFound { id: webhook.id.clone() }
        );
        assert!(matches!(
            registry.update(&webhook.id, WebhookUpdate::default()).await,
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn active_for_event_filters() {
        let (registry, _) = registry();
        registry
            .create(NewWebhook::new("a", "https://a.example.com/", ["door.offline"]))
            .await
            .unwrap();
        registry
            .create(NewWebhook::new("b", "https://b.example.com/", ["door.online"]))
            .await
            .unwrap();
        registry
            .create(NewWebhook::new("c", "https://c.example.com/", ["door.offline"]).inactive())
            .await
            .unwrap();

        let matched = registry.active_for_event("door.offline").await.unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "a");
    }
}
