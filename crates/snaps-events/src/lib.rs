use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

pub use snaps_topics as topics;

/// Lifecycle event envelope (RFC3339 time).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

impl Envelope {
    /// Convenience accessor for the `snapId` field every lifecycle payload carries.
    pub fn snap_id(&self) -> Option<&str> {
        self.payload.get("snapId").and_then(Value::as_str)
    }
}

/// Broadcast bus the controller publishes lifecycle events on.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let val =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}));
        tracing::trace!(target: "snaps::events", kind, "publish");
        // No subscribers is fine.
        let _ = self.tx.send(Envelope {
            time: now,
            kind: kind.to_string(),
            payload: val,
        });
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Drains whatever has been published so far without waiting. Lagged receivers skip ahead.
pub fn drain(rx: &mut broadcast::Receiver<Envelope>) -> Vec<Envelope> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(env) => out.push(env),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!(target: "snaps::events", skipped, "event receiver lagged");
            }
            Err(_) => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(topics::TOPIC_SNAP_INSTALLED, &json!({"snapId": "npm:a"}));
        let env = rx.recv().await.expect("event");
        assert_eq!(env.kind, topics::TOPIC_SNAP_INSTALLED);
        assert_eq!(env.snap_id(), Some("npm:a"));
        assert!(env.time.ends_with('Z'));
    }

    #[test]
    fn drain_collects_pending_events() {
        let bus = Bus::default();
        let mut rx = bus.subscribe();
        bus.publish(topics::TOPIC_SNAP_STARTED, &json!({"snapId": "npm:a"}));
        bus.publish(topics::TOPIC_SNAP_TERMINATED, &json!({"snapId": "npm:a"}));
        let kinds: Vec<_> = drain(&mut rx).into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![topics::TOPIC_SNAP_STARTED, topics::TOPIC_SNAP_TERMINATED]
        );
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let bus = Bus::new(1);
        assert_eq!(bus.receiver_count(), 0);
        bus.publish(topics::TOPIC_SNAP_REMOVED, &json!({}));
    }
}
