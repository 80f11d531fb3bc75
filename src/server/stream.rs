use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::{self, Stream};
use serde::Deserialize;

use super::error::ApiError;
use crate::broadcast::{ConnectionGuard, PushFrame, QueuedChannel};
use crate::notifier::Notifier;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// `GET /events/stream?token=...`
///
/// `EventSource` cannot send headers, so the credential rides in the query.
pub async fn stream_events(
    State(notifier): State<Notifier>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let token = query.token.unwrap_or_default();
    let subscriber = notifier
        .authenticator()
        .authenticate(&token)
        .await
        .ok_or_else(ApiError::unauthorized)?;
    if !subscriber.privileged {
        return Err(ApiError::forbidden());
    }

    let (channel, rx) = QueuedChannel::new(notifier.config().push_buffer);
    let id = notifier
        .hub()
        .open(subscriber, Arc::new(channel))
        .map_err(|err| ApiError::unavailable(err.to_string()))?;
    let guard = ConnectionGuard::new(notifier.hub().clone(), id);

    // The guard lives inside the stream state; dropping the response body
    // removes the connection from the hub.
    let frames = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let frame = rx.recv().await?;
        Some((Ok::<_, Infallible>(to_sse(frame)), (rx, guard)))
    });

    Ok(Sse::new(frames).keep_alive(KeepAlive::new().interval(notifier.config().keep_alive())))
}

fn to_sse(frame: PushFrame) -> SseEvent {
    let event = SseEvent::default().event(frame.kind).data(frame.data);
    match frame.id {
        Some(id) => event.id(id),
        None => event,
    }
}
