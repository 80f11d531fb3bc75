#![cfg(feature = "http")]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use acs_notify::{
    verify_webhook_request, DeliveryId, DeliveryStatus, HttpTransport, NewWebhook, Notifier, NotifierConfig,
    TriggerOutcome, WebhookDelivery,
};

fn notifier(retry_base_ms: u64) -> Notifier {
    let config = NotifierConfig {
        retry_base_ms,
        ..Default::default()
    };
    Notifier::builder()
        .config(config)
        .transport(Arc::new(HttpTransport::new().unwrap()))
        .build()
        .unwrap()
}

async fn wait_terminal(notifier: &Notifier, id: &DeliveryId) -> WebhookDelivery {
    for _ in 0..250 {
        if let Some(delivery) = notifier.webhooks().delivery(id).await.unwrap() {
            if delivery.status.is_terminal() {
                return delivery;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("delivery {id} did not finish");
}

async fn trigger_one(notifier: &Notifier, payload: Value) -> DeliveryId {
    match notifier.webhooks().trigger_webhook("door.offline", payload).await {
        TriggerOutcome::Dispatched(mut ids) => ids.remove(0),
        other => panic!("expected a delivery, got {other:?}"),
    }
}

#[tokio::test]
async fn test_delivers_signed_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("content-type", "application/json"))
        .and(header("x-webhook-event", "door.offline"))
        .and(header_exists("x-webhook-signature"))
        .respond_with(ResponseTemplate::new(200).set_body_string("thanks"))
        .expect(1)
        .mount(&server)
        .await;

    let notifier = notifier(1_000);
    notifier
        .registry()
        .create(NewWebhook::new("receiver", format!("{}/hook", server.uri()), ["door.offline"]).with_secret("whsec_e2e"))
        .await
        .unwrap();

    let id = trigger_one(&notifier, json!({ "id": 99, "doorId": 5 })).await;
    let delivery = wait_terminal(&notifier, &id).await;
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.response.as_deref(), Some("HTTP 200: thanks"));

    let received = server.received_requests().await.unwrap();
    let request = &received[0];
    let headers: Vec<(String, String)> = request
        .headers
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();
    let pairs = headers.iter().map(|(k, v)| (k.as_str(), v.as_str()));
    assert_eq!(verify_webhook_request(pairs, &request.body, b"whsec_e2e"), Ok(()));

    let body: Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["deliveryId"], id.0.as_str());
    assert_eq!(body["data"]["doorId"], 5);
}

#[tokio::test]
async fn test_server_errors_are_retried_until_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .expect(2)
        .mount(&server)
        .await;

    let notifier = notifier(10);
    notifier
        .registry()
        .create(NewWebhook::new("receiver", server.uri(), ["door.offline"]).with_retry_attempts(2))
        .await
        .unwrap();

    let id = trigger_one(&notifier, json!({ "id": 1 })).await;
    let delivery = wait_terminal(&notifier, &id).await;
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempts, 2);
    assert_eq!(delivery.error.as_deref(), Some("HTTP 503: maintenance"));
}

#[tokio::test]
async fn test_slow_receiver_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let notifier = notifier(10);
    notifier
        .registry()
        .create(
            NewWebhook::new("receiver", server.uri(), ["door.offline"])
                .with_retry_attempts(1)
                .with_timeout_ms(50),
        )
        .await
        .unwrap();

    let id = trigger_one(&notifier, json!({ "id": 2 })).await;
    let delivery = wait_terminal(&notifier, &id).await;
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempts, 1);
    assert!(delivery.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_redirects_are_not_followed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", "/new"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/new"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let notifier = notifier(10);
    notifier
        .registry()
        .create(NewWebhook::new("receiver", format!("{}/old", server.uri()), ["door.offline"]).with_retry_attempts(1))
        .await
        .unwrap();

    let id = trigger_one(&notifier, json!({ "id": 3 })).await;
    let delivery = wait_terminal(&notifier, &id).await;
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert!(delivery.error.unwrap().starts_with("HTTP 301"));
}
