use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::error::StoreError;
use crate::types::{DeliveryId, Event, EventId, NewEvent, WebhookConfig, WebhookDelivery, WebhookId};

/// Append-only log of events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist a new event, assigning its id.
    async fn append_event(&self, event: NewEvent, created_at: DateTime<Utc>) -> Result<Event, StoreError>;
    async fn get_event(&self, id: EventId) -> Result<Option<Event>, StoreError>;
    /// Newest first.
    async fn recent_events(&self, limit: usize) -> Result<Vec<Event>, StoreError>;
}

/// Keyed store of webhook configurations.
#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn put_webhook(&self, webhook: &WebhookConfig) -> Result<(), StoreError>;
    async fn get_webhook(&self, id: &WebhookId) -> Result<Option<WebhookConfig>, StoreError>;
    /// Returns whether a webhook was removed.
    async fn delete_webhook(&self, id: &WebhookId) -> Result<bool, StoreError>;
    /// Ordered by creation time.
    async fn list_webhooks(&self) -> Result<Vec<WebhookConfig>, StoreError>;
}

/// Delivery history, grouped per webhook.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Record a delivery at the newest end of its webhook's history.
    async fn save_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError>;
    /// Replace a retained delivery by id. Returns `false` without writing
    /// when the delivery has already been trimmed out of history.
    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<bool, StoreError>;
    async fn get_delivery(&self, id: &DeliveryId) -> Result<Option<WebhookDelivery>, StoreError>;
    /// Newest first.
    async fn list_deliveries(&self, webhook_id: &WebhookId, limit: usize) -> Result<Vec<WebhookDelivery>, StoreError>;
    /// Drop the oldest deliveries of a webhook so that at most `keep` remain.
    async fn trim_deliveries(&self, webhook_id: &WebhookId, keep: usize) -> Result<usize, StoreError>;
}

/// In-memory storage for lightweight deployments and tests.
///
/// Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryStorage {
    events: RwLock<Vec<Event>>,
    webhooks: RwLock<HashMap<WebhookId, WebhookConfig>>,
    deliveries: Mutex<HashMap<WebhookId, VecDeque<WebhookDelivery>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryStorage {
    async fn append_event(&self, event: NewEvent, created_at: DateTime<Utc>) -> Result<Event, StoreError> {
        let mut events = self.events.write().await;
        let record = Event {
            id: EventId(events.len() as u64 + 1),
            event_type: event.event_type,
            action: event.action,
            entity_type: event.entity_type,
            entity_id: event.entity_id,
            entity_name: event.entity_name,
            user_id: event.user_id,
            user_name: event.user_name,
            details: event.details,
            ip_address: event.ip_address,
            user_agent: event.user_agent,
            created_at,
        };
        events.push(record.clone());
        Ok(record)
    }

    async fn get_event(&self, id: EventId) -> Result<Option<Event>, StoreError> {
        let events = self.events.read().await;
        let index = (id.0 as usize).checked_sub(1);
        Ok(index.and_then(|i| events.get(i)).cloned())
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<Event>, StoreError> {
        let events = self.events.read().await;
        Ok(events.iter().rev().take(limit).cloned().collect())
    }
}

#[async_trait]
impl WebhookStore for InMemoryStorage {
    async fn put_webhook(&self, webhook: &WebhookConfig) -> Result<(), StoreError> {
        self.webhooks.write().await.insert(webhook.id.clone(), webhook.clone());
        Ok(())
    }

    async fn get_webhook(&self, id: &WebhookId) -> Result<Option<WebhookConfig>, StoreError> {
        Ok(self.webhooks.read().await.get(id).cloned())
    }

    async fn delete_webhook(&self, id: &WebhookId) -> Result<bool, StoreError> {
        Ok(self.webhooks.write().await.remove(id).is_some())
    }

    async fn list_webhooks(&self) -> Result<Vec<WebhookConfig>, StoreError> {
        let mut items: Vec<WebhookConfig> = self.webhooks.read().await.values().cloned().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }
}

#[async_trait]
impl DeliveryStore for InMemoryStorage {
    async fn save_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        let mut guard = self.deliveries.lock().await;
        let queue = guard.entry(delivery.webhook_id.clone()).or_default();
        match queue.iter_mut().find(|d| d.id == delivery.id) {
            Some(existing) => *existing = delivery.clone(),
            None => queue.push_back(delivery.clone()),
        }
        Ok(())
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<bool, StoreError> {
        let mut guard = self.deliveries.lock().await;
        let existing = guard
            .get_mut(&delivery.webhook_id)
            .and_then(|queue| queue.iter_mut().find(|d| d.id == delivery.id));
        match existing {
            Some(existing) => {
                *existing = delivery.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_delivery(&self, id: &DeliveryId) -> Result<Option<WebhookDelivery>, StoreError> {
        let guard = self.deliveries.lock().await;
        Ok(guard
            .values()
            .flat_map(|queue| queue.iter())
            .find(|d| &d.id == id)
            .cloned())
    }

    async fn list_deliveries(&self, webhook_id: &WebhookId, limit: usize) -> Result<Vec<WebhookDelivery>, StoreError> {
        let guard = self.deliveries.lock().await;
        Ok(guard
            .get(webhook_id)
            .map(|queue| queue.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn trim_deliveries(&self, webhook_id: &WebhookId, keep: usize) -> Result<usize, StoreError> {
        let mut guard = self.deliveries.lock().await;
        let Some(queue) = guard.get_mut(webhook_id) else {
            return Ok(0);
        };
        let mut evicted = 0;
        while queue.len() > keep {
            queue.pop_front();
            evicted += 1;
        }
        Ok(evicted)
    }
}
