use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::error::StoreError;
use crate::storage::{DeliveryStore, WebhookStore};
use crate::types::{DeliveryId, WebhookConfig, WebhookDelivery, WebhookId, WebhookRecord};

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

const UPDATE_IF_PRESENT: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 1 then
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
    return 1
end
return 0
"#;

/// Webhook and delivery store on Redis.
///
/// Layout under `prefix`:
/// - `{prefix}:webhooks`: hash of webhook id to JSON record
/// - `{prefix}:deliveries`: hash of delivery id to JSON delivery
/// - `{prefix}:history:{webhook_id}`: list of delivery ids, oldest first
pub struct RedisStorage {
    client: redis::Client,
    prefix: String,
}

impl RedisStorage {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    async fn conn(&self) -> Result<MultiplexedConnection, StoreError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn webhooks_key(&self) -> String {
        format!("{}:webhooks", self.prefix)
    }

    fn deliveries_key(&self) -> String {
        format!("{}:deliveries", self.prefix)
    }

    fn history_key(&self, webhook_id: &WebhookId) -> String {
        format!("{}:history:{}", self.prefix, webhook_id.0)
    }
}

#[async_trait]
impl WebhookStore for RedisStorage {
    async fn put_webhook(&self, webhook: &WebhookConfig) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(&WebhookRecord::from(webhook))?;
        let _: i64 = conn.hset(self.webhooks_key(), &webhook.id.0, payload).await?;
        Ok(())
    }

    async fn get_webhook(&self, id: &WebhookId) -> Result<Option<WebhookConfig>, StoreError> {
        let mut conn = self.conn().await?;
        let payload: Option<String> = conn.hget(self.webhooks_key(), &id.0).await?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str::<WebhookRecord>(&payload)?.into())),
            None => Ok(None),
        }
    }

    async fn delete_webhook(&self, id: &WebhookId) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.hdel(self.webhooks_key(), &id.0).await?;
        Ok(removed > 0)
    }

    async fn list_webhooks(&self) -> Result<Vec<WebhookConfig>, StoreError> {
        let mut conn = self.conn().await?;
        let map: HashMap<String, String> = conn.hgetall(self.webhooks_key()).await?;
        let mut items = map
            .values()
            .map(|payload| serde_json::from_str::<WebhookRecord>(payload).map(WebhookConfig::from))
            .collect::<Result<Vec<_>, _>>()?;
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }
}

#[async_trait]
impl DeliveryStore for RedisStorage {
    async fn save_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(delivery)?;
        let added: i64 = conn.hset(self.deliveries_key(), &delivery.id.0, payload).await?;
        if added > 0 {
            let _: i64 = conn.rpush(self.history_key(&delivery.webhook_id), &delivery.id.0).await?;
        }
        Ok(())
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(delivery)?;
        // Trimmed ids are gone from the hash; never recreate them.
        let written: i64 = redis::Script::new(UPDATE_IF_PRESENT)
            .key(self.deliveries_key())
            .arg(&delivery.id.0)
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn get_delivery(&self, id: &DeliveryId) -> Result<Option<WebhookDelivery>, StoreError> {
        let mut conn = self.conn().await?;
        let payload: Option<String> = conn.hget(self.deliveries_key(), &id.0).await?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn list_deliveries(&self, webhook_id: &WebhookId, limit: usize) -> Result<Vec<WebhookDelivery>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let start = -(limit.min(isize::MAX as usize) as isize);
        let ids: Vec<String> = conn.lrange(self.history_key(webhook_id), start, -1).await?;

        let mut deliveries = Vec::with_capacity(ids.len());
        for id in ids.iter().rev() {
            let payload: Option<String> = conn.hget(self.deliveries_key(), id).await?;
            if let Some(payload) = payload {
                deliveries.push(serde_json::from_str(&payload)?);
            }
        }
        Ok(deliveries)
    }

    async fn trim_deliveries(&self, webhook_id: &WebhookId, keep: usize) -> Result<usize, StoreError> {
        let mut conn = self.conn().await?;
        let key = self.history_key(webhook_id);
        let len: usize = conn.llen(&key).await?;
        if len <= keep {
            return Ok(0);
        }

        let excess = len - keep;
        let evicted: Vec<String> = conn.lrange(&key, 0, excess as isize - 1).await?;
        let _: () = conn.ltrim(&key, excess as isize, -1).await?;
        if !evicted.is_empty() {
            let _: i64 = conn.hdel(self.deliveries_key(), &evicted).await?;
        }
        Ok(evicted.len())
    }
}
