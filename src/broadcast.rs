//! Live push fan-out.
//!
//! The hub keeps one [`PushChannel`] per open connection and writes each
//! published event to all of them. A channel whose write fails is dropped
//! from the set; the remaining channels still receive the frame.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::mpsc;

use crate::auth::Subscriber;
use crate::error::PushError;
use crate::types::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One message on the wire, transport agnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushFrame {
    /// Frame kind, e.g. `event` or `connected`.
    pub kind: String,
    pub id: Option<String>,
    /// JSON text.
    pub data: String,
}

impl PushFrame {
    pub fn event(event: &Event) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: "event".to_string(),
            id: Some(event.id.to_string()),
            data: serde_json::to_string(event)?,
        })
    }

    pub fn connected(id: ConnectionId) -> Self {
        Self {
            kind: "connected".to_string(),
            id: None,
            data: json!({ "connectionId": id.0 }).to_string(),
        }
    }
}

/// Output side of one push connection.
///
/// `send` must not block: the hub calls it for every connection in turn.
pub trait PushChannel: Send + Sync {
    fn send(&self, frame: &PushFrame) -> Result<(), PushError>;
    fn close(&self);
}

/// Bounded in-process channel; the receiving half feeds the network writer.
///
/// A full buffer is reported as [`PushError::Lagging`].
pub struct QueuedChannel {
    tx: Mutex<Option<mpsc::Sender<PushFrame>>>,
}

impl QueuedChannel {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PushFrame>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx: Mutex::new(Some(tx)) }, rx)
    }
}

impl PushChannel for QueuedChannel {
    fn send(&self, frame: &PushFrame) -> Result<(), PushError> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(PushError::Closed);
        };
        tx.try_send(frame.clone()).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => PushError::Lagging,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

struct Connection {
    subscriber: Subscriber,
    channel: Arc<dyn PushChannel>,
}

#[derive(Default)]
struct HubInner {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    next_id: AtomicU64,
}

/// Cheap to clone; all clones share the connection set.
#[derive(Clone, Default)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated connection and greet it with a
    /// `connected` frame.
    pub fn open(&self, subscriber: Subscriber, channel: Arc<dyn PushChannel>) -> Result<ConnectionId, PushError> {
        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        channel.send(&PushFrame::connected(id))?;

        crate::trace_event!(
            info,
            target: "live_feed",
            connection_id = %id,
            subscriber = %subscriber.id,
            "Push connection opened"
        );
        self.inner
            .connections
            .write()
            .insert(id, Connection { subscriber, channel });
        Ok(id)
    }

    /// Returns whether the connection was open.
    pub fn close(&self, id: ConnectionId) -> bool {
        let removed = self.inner.connections.write().remove(&id);
        match removed {
            Some(connection) => {
                connection.channel.close();
                crate::trace_event!(debug, target: "live_feed", connection_id = %id, "Push connection closed");
                true
            }
            None => false,
        }
    }

    /// Write `event` to every open connection. Returns how many received it.
    pub fn publish(&self, event: &Event) -> usize {
        let frame = match PushFrame::event(event) {
            Ok(frame) => frame,
            Err(err) => {
                crate::trace_event!(error, target: "live_feed", event_id = %event.id, error = %err, "Failed to encode push frame");
                return 0;
            }
        };
        self.publish_frame(&frame)
    }

    pub fn publish_frame(&self, frame: &PushFrame) -> usize {
        let targets: Vec<(ConnectionId, Arc<dyn PushChannel>)> = self
            .inner
            .connections
            .read()
            .iter()
            .map(|(id, c)| (*id, c.channel.clone()))
            .collect();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, channel) in targets {
            match channel.send(frame) {
                Ok(()) => delivered += 1,
                Err(err) => failed.push((id, err)),
            }
        }

        if !failed.is_empty() {
            let mut connections = self.inner.connections.write();
            for (id, err) in failed {
                if let Some(connection) = connections.remove(&id) {
                    connection.channel.close();
                    crate::trace_event!(
                        info,
                        target: "live_feed",
                        connection_id = %id,
                        subscriber = %connection.subscriber.id,
                        error = %err,
                        "Pruned push connection"
                    );
                }
            }
        }
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    pub fn subscribers(&self) -> Vec<(ConnectionId, Subscriber)> {
        let mut items: Vec<_> = self
            .inner
            .connections
            .read()
            .iter()
            .map(|(id, c)| (*id, c.subscriber.clone()))
            .collect();
        items.sort_by_key(|(id, _)| *id);
        items
    }

    /// Close every connection.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.inner.connections.write().drain().collect();
        for (_, connection) in &drained {
            connection.channel.close();
        }
        crate::trace_event!(info, target: "live_feed", closed = drained.len(), "Live feed shut down");
    }
}

/// Closes its connection when dropped, tying the hub entry to the lifetime
/// of the network stream that owns the guard.
pub struct ConnectionGuard {
    hub: BroadcastHub,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn new(hub: BroadcastHub, id: ConnectionId) -> Self {
        Self { hub, id }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.hub.close(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventId;
    use chrono::Utc;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Recording {
        frames: Mutex<Vec<PushFrame>>,
        broken: AtomicBool,
        closed: AtomicBool,
    }

    impl PushChannel for Recording {
        fn send(&self, frame: &PushFrame) -> Result<(), PushError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(PushError::Closed);
            }
            self.frames.lock().push(frame.clone());
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn event(id: u64) -> Event {
        Event {
            id: EventId(id),
            event_type: "door".into(),
            action: "offline".into(),
            entity_type: "door".into(),
            entity_id: Some("5".into()),
            entity_name: Some("Front".into()),
            user_id: None,
            user_name: None,
            details: serde_json::Value::Null,
            ip_address: None,
            user_agent: None,
            created_at: Utc::now(),
        }
    }

    fn admin() -> Subscriber {
        Subscriber::new("1", "admin", true)
    }

    #[test]
    fn open_sends_connected_frame() {
        let hub = BroadcastHub::new();
        let channel = Arc::new(Recording::default());
        let id = hub.open(admin(), channel.clone()).unwrap();

        let frames = channel.frames.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, "connected");
        assert!(frames[0].data.contains(&id.0.to_string()));
        assert_eq!(hub.connection_count(), 1);
    }

    #[test]
    fn failing_connection_is_pruned_others_still_receive() {
        let hub = BroadcastHub::new();
        let channels: Vec<Arc<Recording>> = (0..4).map(|_| Arc::new(Recording::default())).collect();
        let ids: Vec<ConnectionId> = channels
            .iter()
            .map(|c| hub.open(admin(), c.clone()).unwrap())
            .collect();

        channels[2].broken.store(true, Ordering::SeqCst);
        assert_eq!(hub.publish(&event(7)), 3);

        assert_eq!(hub.connection_count(), 3);
        assert!(channels[2].closed.load(Ordering::SeqCst));
        assert!(!hub.subscribers().iter().any(|(id, _)| *id == ids[2]));
        for (i, channel) in channels.iter().enumerate() {
            let frames = channel.frames.lock();
            if i == 2 {
                assert_eq!(frames.len(), 1);
            } else {
                assert_eq!(frames.len(), 2);
                assert_eq!(frames[1].kind, "event");
                assert_eq!(frames[1].id.as_deref(), Some("7"));
            }
        }
    }

    #[test]
    fn no_replay_for_late_connections() {
        let hub = BroadcastHub::new();
        assert_eq!(hub.publish(&event(1)), 0);

        let channel = Arc::new(Recording::default());
        hub.open(admin(), channel.clone()).unwrap();
        assert_eq!(channel.frames.lock().len(), 1);
    }

    #[test]
    fn full_queue_counts_as_write_failure() {
        let hub = BroadcastHub::new();
        let (channel, mut rx) = QueuedChannel::new(2);
        hub.open(admin(), Arc::new(channel)).unwrap();

        assert_eq!(hub.publish(&event(1)), 1);
        // Buffer holds `connected` and event 1; this one overflows.
        assert_eq!(hub.publish(&event(2)), 0);
        assert_eq!(hub.connection_count(), 0);

        assert_eq!(rx.try_recv().unwrap().kind, "connected");
        assert_eq!(rx.try_recv().unwrap().id.as_deref(), Some("1"));
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }

    #[test]
    fn guard_and_shutdown_close_connections() {
        let hub = BroadcastHub::new();
        let a = Arc::new(Recording::default());
        let id = hub.open(admin(), a.clone()).unwrap();
        drop(ConnectionGuard::new(hub.clone(), id));
        assert_eq!(hub.connection_count(), 0);
        assert!(a.closed.load(Ordering::SeqCst));
        assert!(!hub.close(id));

        let b = Arc::new(Recording::default());
        hub.open(admin(), b.clone()).unwrap();
        hub.shutdown();
        assert_eq!(hub.connection_count(), 0);
        assert!(b.closed.load(Ordering::SeqCst));
    }
}
