use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::error::{ApiError, ApiJson};
use crate::notifier::Notifier;
use crate::registry::TEST_EVENT;
use crate::types::{NewWebhook, WebhookDelivery, WebhookId, WebhookUpdate, WebhookView};

pub async fn create_webhook(
    State(notifier): State<Notifier>,
    ApiJson(request): ApiJson<NewWebhook>,
) -> Result<impl IntoResponse, ApiError> {
    let webhook = notifier.registry().create(request).await?;
    Ok((StatusCode::CREATED, Json(webhook.view())))
}

pub async fn list_webhooks(State(notifier): State<Notifier>) -> Result<Json<Vec<WebhookView>>, ApiError> {
    let webhooks = notifier.registry().list().await?;
    Ok(Json(webhooks.iter().map(WebhookView::from).collect()))
}

pub async fn get_webhook(
    State(notifier): State<Notifier>,
    Path(id): Path<String>,
) -> Result<Json<WebhookView>, ApiError> {
    let webhook = notifier.registry().require(&WebhookId(id)).await?;
    Ok(Json(webhook.view()))
}

pub async fn update_webhook(
    State(notifier): State<Notifier>,
    Path(id): Path<String>,
    ApiJson(update): ApiJson<WebhookUpdate>,
) -> Result<Json<WebhookView>, ApiError> {
    let webhook = notifier.registry().update(&WebhookId(id), update).await?;
    Ok(Json(webhook.view()))
}

pub async fn delete_webhook(
    State(notifier): State<Notifier>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    notifier.registry().delete(&WebhookId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn test_webhook(
    State(notifier): State<Notifier>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let delivery_id = notifier.webhooks().send_test(&WebhookId(id)).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "deliveryId": delivery_id }))))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// History survives webhook deletion, so an unknown id yields an empty list.
pub async fn list_deliveries(
    State(notifier): State<Notifier>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<WebhookDelivery>>, ApiError> {
    let max = notifier.config().history_limit;
    let limit = query.limit.unwrap_or(max).min(max);
    let deliveries = notifier.webhooks().deliveries(&WebhookId(id), limit).await?;
    Ok(Json(deliveries))
}

pub async fn list_events(State(notifier): State<Notifier>) -> Json<serde_json::Value> {
    let events: Vec<&str> = notifier.registry().catalog().names().collect();
    Json(json!({ "events": events, "testEvent": TEST_EVENT }))
}
