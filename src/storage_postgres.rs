use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::Client;

use crate::error::StoreError;
use crate::storage::{DeliveryStore, EventStore, WebhookStore};
use crate::types::{DeliveryId, Event, EventId, NewEvent, WebhookConfig, WebhookDelivery, WebhookId, WebhookRecord};

impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Event, webhook and delivery store on PostgreSQL. Rows hold JSONB payloads.
pub struct PostgresStorage {
    client: Client,
}

impl PostgresStorage {
    /// Create the tables if missing.
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS notify_events (
                    id BIGSERIAL PRIMARY KEY,
                    data JSONB NOT NULL,
                    created_at TEXT NOT NULL
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS notify_webhooks (
                    id TEXT PRIMARY KEY,
                    payload JSONB NOT NULL
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS notify_deliveries (
                    id TEXT PRIMARY KEY,
                    webhook_id TEXT NOT NULL,
                    seq BIGSERIAL,
                    payload JSONB NOT NULL
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE INDEX IF NOT EXISTS notify_deliveries_webhook
                 ON notify_deliveries (webhook_id, seq)",
                &[],
            )
            .await?;

        Ok(Self { client })
    }
}

fn event_from_row(id: i64, data: serde_json::Value, created_at: &str) -> Result<Event, StoreError> {
    let data: NewEvent = serde_json::from_value(data)?;
    let created_at = DateTime::parse_from_rfc3339(created_at)
        .map_err(|e| StoreError::Codec(e.to_string()))?
        .with_timezone(&Utc);
    Ok(assemble_event(EventId(id as u64), data, created_at))
}

fn assemble_event(id: EventId, data: NewEvent, created_at: DateTime<Utc>) -> Event {
    Event {
        id,
        event_type: data.event_type,
        action: data.action,
        entity_type: data.entity_type,
        entity_id: data.entity_id,
        entity_name: data.entity_name,
        user_id: data.user_id,
        user_name: data.user_name,
        details: data.details,
        ip_address: data.ip_address,
        user_agent: data.user_agent,
        created_at,
    }
}

fn as_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl EventStore for PostgresStorage {
    async fn append_event(&self, event: NewEvent, created_at: DateTime<Utc>) -> Result<Event, StoreError> {
        let data = serde_json::to_value(&event)?;
        let row = self
            .client
            .query_one(
                "INSERT INTO notify_events (data, created_at) VALUES ($1, $2) RETURNING id",
                &[&data, &created_at.to_rfc3339()],
            )
            .await?;
        let id: i64 = row.try_get(0)?;
        Ok(assemble_event(EventId(id as u64), event, created_at))
    }

    async fn get_event(&self, id: EventId) -> Result<Option<Event>, StoreError> {
        let Ok(id) = i64::try_from(id.0) else {
            return Ok(None);
        };
        let row = self
            .client
            .query_opt("SELECT id, data, created_at FROM notify_events WHERE id = $1", &[&id])
            .await?;
        match row {
            Some(row) => {
                let created_at: String = row.try_get(2)?;
                Ok(Some(event_from_row(row.try_get(0)?, row.try_get(1)?, &created_at)?))
            }
            None => Ok(None),
        }
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<Event>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT id, data, created_at FROM notify_events ORDER BY id DESC LIMIT $1",
                &[&as_limit(limit)],
            )
            .await?;

        rows.into_iter()
            .map(|row| {
                let created_at: String = row.try_get(2)?;
                event_from_row(row.try_get(0)?, row.try_get(1)?, &created_at)
            })
            .collect()
    }
}

#[async_trait]
impl WebhookStore for PostgresStorage {
    async fn put_webhook(&self, webhook: &WebhookConfig) -> Result<(), StoreError> {
        let payload = serde_json::to_value(WebhookRecord::from(webhook))?;
        self.client
            .execute(
                "INSERT INTO notify_webhooks (id, payload)
                 VALUES ($1, $2)
                 ON CONFLICT (id) DO UPDATE SET payload = EXCLUDED.payload",
                &[&webhook.id.0, &payload],
            )
            .await?;
        Ok(())
    }

    async fn get_webhook(&self, id: &WebhookId) -> Result<Option<WebhookConfig>, StoreError> {
        let row = self
            .client
            .query_opt("SELECT payload FROM notify_webhooks WHERE id = $1", &[&id.0])
            .await?;
        match row {
            Some(row) => {
                let payload: serde_json::Value = row.try_get(0)?;
                Ok(Some(serde_json::from_value::<WebhookRecord>(payload)?.into()))
            }
            None => Ok(None),
        }
    }

    async fn delete_webhook(&self, id: &WebhookId) -> Result<bool, StoreError> {
        let removed = self
            .client
            .execute("DELETE FROM notify_webhooks WHERE id = $1", &[&id.0])
            .await?;
        Ok(removed > 0)
    }

    async fn list_webhooks(&self) -> Result<Vec<WebhookConfig>, StoreError> {
        let rows = self.client.query("SELECT payload FROM notify_webhooks", &[]).await?;
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: serde_json::Value = row.try_get(0)?;
            items.push(WebhookConfig::from(serde_json::from_value::<WebhookRecord>(payload)?));
        }
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }
}

#[async_trait]
impl DeliveryStore for PostgresStorage {
    async fn save_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        let payload = serde_json::to_value(delivery)?;
        self.client
            .execute(
                "INSERT INTO notify_deliveries (id, webhook_id, payload)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (id) DO UPDATE SET payload = EXCLUDED.payload",
                &[&delivery.id.0, &delivery.webhook_id.0, &payload],
            )
            .await?;
        Ok(())
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<bool, StoreError> {
        let payload = serde_json::to_value(delivery)?;
        let updated = self
            .client
            .execute(
                "UPDATE notify_deliveries SET payload = $2 WHERE id = $1",
                &[&delivery.id.0, &payload],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn get_delivery(&self, id: &DeliveryId) -> Result<Option<WebhookDelivery>, StoreError> {
        let row = self
            .client
            .query_opt("SELECT payload FROM notify_deliveries WHERE id = $1", &[&id.0])
            .await?;
        match row {
            Some(row) => {
                let payload: serde_json::Value = row.try_get(0)?;
                Ok(Some(serde_json::from_value(payload)?))
            }
            None => Ok(None),
        }
    }

    async fn list_deliveries(&self, webhook_id: &WebhookId, limit: usize) -> Result<Vec<WebhookDelivery>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT payload FROM notify_deliveries
                 WHERE webhook_id = $1
                 ORDER BY seq DESC
                 LIMIT $2",
                &[&webhook_id.0, &as_limit(limit)],
            )
            .await?;

        let mut deliveries = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: serde_json::Value = row.try_get(0)?;
            deliveries.push(serde_json::from_value(payload)?);
        }
        Ok(deliveries)
    }

    async fn trim_deliveries(&self, webhook_id: &WebhookId, keep: usize) -> Result<usize, StoreError> {
        let removed = self
            .client
            .execute(
                "DELETE FROM notify_deliveries
                 WHERE webhook_id = $1
                   AND id NOT IN (
                       SELECT id FROM notify_deliveries
                       WHERE webhook_id = $1
                       ORDER BY seq DESC
                       LIMIT $2
                   )",
                &[&webhook_id.0, &as_limit(keep)],
            )
            .await?;
        Ok(removed as usize)
    }
}
