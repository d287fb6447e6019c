//! In-process group fan-out.

use super::events::RealtimeEvent;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl Default for ConnectionId {
    fn default() -> Self {
        Self(format!("conn_{}", Uuid::new_v4()))
    }
}

impl ConnectionId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("broadcast backend unavailable: {0}")]
    Unavailable(String),
}

pub fn thread_group(thread_id: i64) -> String {
    format!("thread:{thread_id}")
}

pub fn user_group(user_id: i64) -> String {
    format!("user:{user_id}")
}

/// Publish/subscribe keyed by group name. Delivery is best-effort and
/// at-most-once per connection; per-group publish order is preserved for
/// every subscriber.
pub trait EventBus: Send + Sync {
    fn subscribe(&self, group: &str, conn: &ConnectionId, tx: mpsc::Sender<RealtimeEvent>);
    fn unsubscribe(&self, group: &str, conn: &ConnectionId);
    /// Returns how many subscribers accepted the event.
    fn publish(&self, group: &str, event: RealtimeEvent) -> Result<usize, BroadcastError>;
}

#[derive(Default)]
pub struct GroupHub {
    groups: DashMap<String, DashMap<ConnectionId, mpsc::Sender<RealtimeEvent>>>,
}

impl GroupHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, group: &str) -> usize {
        self.groups.get(group).map(|members| members.len()).unwrap_or(0)
    }

    fn prune(&self, group: &str) {
        self.groups.remove_if(group, |_, members| members.is_empty());
    }
}

impl EventBus for GroupHub {
    fn subscribe(&self, group: &str, conn: &ConnectionId, tx: mpsc::Sender<RealtimeEvent>) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(conn.clone(), tx);
        tracing::debug!(%group, conn = %conn, "subscribed");
    }

    fn unsubscribe(&self, group: &str, conn: &ConnectionId) {
        if let Some(members) = self.groups.get(group) {
            members.remove(conn);
        }
        self.prune(group);
    }

    fn publish(&self, group: &str, event: RealtimeEvent) -> Result<usize, BroadcastError> {
        let mut delivered = 0;
        let mut closed = Vec::new();
        if let Some(members) = self.groups.get(group) {
            for member in members.iter() {
                match member.value().try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            %group,
                            conn = %member.key(),
                            kind = event.kind(),
                            "send queue full, dropping event"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(member.key().clone()),
                }
            }
            for conn in &closed {
                members.remove(conn);
            }
        }
        if !closed.is_empty() {
            self.prune(group);
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn removed(chat_id: i64) -> RealtimeEvent {
        RealtimeEvent::ThreadRemoved { chat_id }
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_in_order() {
        let hub = GroupHub::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        hub.subscribe("thread:1", &ConnectionId::new(), tx_a);
        hub.subscribe("thread:1", &ConnectionId::new(), tx_b);

        assert_eq!(hub.publish("thread:1", removed(1)).unwrap(), 2);
        assert_eq!(hub.publish("thread:1", removed(2)).unwrap(), 2);
        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(rx.recv().await, Some(removed(1)));
            assert_eq!(rx.recv().await, Some(removed(2)));
        }
    }

    #[test]
    fn publish_to_empty_group_is_noop() {
        let hub = GroupHub::new();
        assert_eq!(hub.publish("user:404", removed(1)).unwrap(), 0);
    }

    #[test]
    fn closed_subscribers_are_pruned() {
        let hub = GroupHub::new();
        let (tx, rx) = mpsc::channel(1);
        hub.subscribe("user:1", &ConnectionId::new(), tx);
        drop(rx);
        assert_eq!(hub.publish("user:1", removed(1)).unwrap(), 0);
        assert_eq!(hub.subscriber_count("user:1"), 0);
    }

    #[test]
    fn full_queue_drops_only_for_that_subscriber() {
        let hub = GroupHub::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        hub.subscribe("thread:2", &ConnectionId::new(), slow_tx);
        hub.subscribe("thread:2", &ConnectionId::new(), fast_tx);

        assert_eq!(hub.publish("thread:2", removed(1)).unwrap(), 2);
        assert_eq!(hub.publish("thread:2", removed(2)).unwrap(), 1);
        assert_eq!(hub.subscriber_count("thread:2"), 2);
        assert_eq!(fast_rx.try_recv().ok(), Some(removed(1)));
        assert_eq!(fast_rx.try_recv().ok(), Some(removed(2)));
    }

    #[test]
    fn unsubscribe_leaves_other_groups_and_connections() {
        let hub = GroupHub::new();
        let conn = ConnectionId::new();
        let other = ConnectionId::new();
        let (tx, _rx) = mpsc::channel(4);
        hub.subscribe("thread:1", &conn, tx.clone());
        hub.subscribe("user:1", &conn, tx.clone());
        hub.subscribe("thread:1", &other, tx);

        hub.unsubscribe("thread:1", &conn);
        assert_eq!(hub.subscriber_count("thread:1"), 1);
        assert_eq!(hub.subscriber_count("user:1"), 1);
        hub.unsubscribe("thread:1", &other);
        assert_eq!(hub.subscriber_count("thread:1"), 0);
    }
}
