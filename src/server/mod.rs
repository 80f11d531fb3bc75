//! HTTP surface: webhook admin routes and the live event stream.
//!
//! Admin routes carry no authorization of their own; mount the router behind
//! the embedding application's auth layer.

mod error;
mod stream;
mod webhooks;

use axum::routing::{get, post};
use axum::Router;

pub use error::{ApiError, ApiJson};

use crate::notifier::Notifier;

pub fn router(notifier: Notifier) -> Router {
    Router::new()
        .route("/events/stream", get(stream::stream_events))
        .route("/webhooks", post(webhooks::create_webhook).get(webhooks::list_webhooks))
        .route("/webhooks/events", get(webhooks::list_events))
        .route(
            "/webhooks/{id}",
            get(webhooks::get_webhook)
                .patch(webhooks::update_webhook)
                .delete(webhooks::delete_webhook),
        )
        .route("/webhooks/{id}/test", post(webhooks::test_webhook))
        .route("/webhooks/{id}/deliveries", get(webhooks::list_deliveries))
        .with_state(notifier)
}
