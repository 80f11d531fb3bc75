use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const DEFAULT_DEDUP_CAPACITY: usize = 1_000;

/// How to identify a payload that carries no explicit `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupFallback {
    /// Hash of the serialized payload. Identical payloads collapse.
    ContentHash,
    /// Payload hash plus a coarse time bucket of `secs` seconds, so an
    /// identical payload is accepted again once the bucket rolls over.
    TimeBucket { secs: u64 },
}

impl DedupFallback {
    /// Parse `content` or `time:<secs>`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "content" => Some(DedupFallback::ContentHash),
            other => {
                let secs = other.strip_prefix("time:")?.parse::<u64>().ok()?;
                Some(DedupFallback::TimeBucket { secs: secs.max(1) })
            }
        }
    }
}

/// Derive the dedup key for a trigger of `event_name` with `payload`.
pub fn dedup_key(
    event_name: &str,
    payload: &Value,
    fallback: DedupFallback,
    now: DateTime<Utc>,
) -> String {
    match payload.get("id") {
        Some(Value::String(id)) => return format!("{event_name}:id:{id}"),
        Some(Value::Number(id)) => return format!("{event_name}:id:{id}"),
        _ => {}
    }

    let digest = Sha256::digest(payload.to_string().as_bytes());
    let content = hex::encode(&digest[..8]);
    match fallback {
        DedupFallback::ContentHash => format!("{event_name}:content:{content}"),
        DedupFallback::TimeBucket { secs } => {
            let bucket = now.timestamp().max(0) as u64 / secs.max(1);
            format!("{event_name}:content:{content}:{bucket}")
        }
    }
}

#[derive(Debug, Default)]
struct Window {
    order: VecDeque<String>,
    keys: HashSet<String>,
}

/// Bounded, insertion-ordered set of recently seen trigger keys.
///
/// Holds at most `capacity` keys; the oldest key is evicted first.
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    inner: Mutex<Window>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Window::default()),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.lock().keys.contains(key)
    }

    /// Insert `key`, evicting the oldest entries while over capacity.
    ///
    /// Returns `false` when the key was already present.
    pub fn add(&self, key: &str) -> bool {
        let mut window = self.inner.lock();
        if !window.keys.insert(key.to_string()) {
            return false;
        }
        window.order.push_back(key.to_string());
        while window.order.len() > self.capacity {
            if let Some(oldest) = window.order.pop_front() {
                window.keys.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn add_reports_duplicates() {
        let window = DedupWindow::new(4);
        assert!(window.add("a"));
        assert!(!window.add("a"));
        assert!(window.has("a"));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let window = DedupWindow::new(1_000);
        for i in 0..=1_000 {
            window.add(&format!("key-{i}"));
        }
        assert_eq!(window.len(), 1_000);
        assert!(!window.has("key-0"));
        assert!(window.has("key-1"));
        assert!(window.has("key-1000"));
    }

    #[test]
    fn evicted_key_is_accepted_again() {
        let window = DedupWindow::new(2);
        window.add("a");
        window.add("b");
        window.add("c");
        assert!(window.add("a"));
        assert!(!window.has("b"));
    }

    #[test]
    fn explicit_id_wins_over_content() {
        let now = Utc::now();
        let a = dedup_key("door.offline", &json!({"id": 7, "x": 1}), DedupFallback::ContentHash, now);
        let b = dedup_key("door.offline", &json!({"id": 7, "x": 2}), DedupFallback::ContentHash, now);
        assert_eq!(a, b);
        assert_eq!(a, "door.offline:id:7");

        let other_event = dedup_key("door.online", &json!({"id": 7}), DedupFallback::ContentHash, now);
        assert_ne!(a, other_event);
    }

    #[test]
    fn content_fallback_distinguishes_payloads() {
        let now = Utc::now();
        let a = dedup_key("door.offline", &json!({"doorId": 5}), DedupFallback::ContentHash, now);
        let b = dedup_key("door.offline", &json!({"doorId": 6}), DedupFallback::ContentHash, now);
        let c = dedup_key("door.offline", &json!({"doorId": 5}), DedupFallback::ContentHash, now);
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn time_bucket_fallback_rolls_over() {
        let fallback = DedupFallback::TimeBucket { secs: 60 };
        let payload = json!({"doorId": 5});
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 5).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 55).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 1, 1, 12, 1, 5).unwrap();
        assert_eq!(dedup_key("x", &payload, fallback, t0), dedup_key("x", &payload, fallback, t1));
        assert_ne!(dedup_key("x", &payload, fallback, t0), dedup_key("x", &payload, fallback, t2));
    }

    #[test]
    fn parses_fallback_setting() {
        assert_eq!(DedupFallback::parse("content"), Some(DedupFallback::ContentHash));
        assert_eq!(DedupFallback::parse("time:30"), Some(DedupFallback::TimeBucket { secs: 30 }));
        assert_eq!(DedupFallback::parse("time:x"), None);
        assert_eq!(DedupFallback::parse("nope"), None);
    }
}
