//! Session listener that logs every cluster notification.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use pulse_transport::{MemberId, MessageType, RequestEnvelope, SessionId, SessionListener};

/// Counters kept by [`LoggingListener`].
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Sessions opened.
    pub connects: AtomicU64,
    /// Sessions lost.
    pub disconnects: AtomicU64,
    /// Leader change notifications.
    pub leader_changes: AtomicU64,
    /// Inbound messages.
    pub messages: AtomicU64,
    /// Inbound messages too short to carry an envelope.
    pub undecodable: AtomicU64,
    /// Transport error notifications.
    pub errors: AtomicU64,
}

impl ListenerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> ListenerSnapshot {
        ListenerSnapshot {
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            leader_changes: self.leader_changes.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            undecodable: self.undecodable.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`ListenerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerSnapshot {
    /// Sessions opened.
    pub connects: u64,
    /// Sessions lost.
    pub disconnects: u64,
    /// Leader change notifications.
    pub leader_changes: u64,
    /// Inbound messages.
    pub messages: u64,
    /// Inbound messages too short to carry an envelope.
    pub undecodable: u64,
    /// Transport error notifications.
    pub errors: u64,
}

/// Logs cluster notifications through `tracing`. Never touches the session.
#[derive(Debug, Clone, Default)]
pub struct LoggingListener {
    stats: Arc<ListenerStats>,
}

impl LoggingListener {
    /// Creates a listener with fresh counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared counters; clones of this listener report into the same stats.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }
}

impl SessionListener for LoggingListener {
    fn on_connect(&mut self, session_id: SessionId, leader_member_id: MemberId) {
        ListenerStats::bump(&self.stats.connects);
        tracing::info!(session_id, leader_member_id, "cluster session opened");
    }

    fn on_disconnect(&mut self, details: &str) {
        ListenerStats::bump(&self.stats.disconnects);
        tracing::warn!(details, "cluster session closed");
    }

    fn on_new_leader(
        &mut self,
        session_id: SessionId,
        leadership_term_id: u64,
        leader_member_id: MemberId,
    ) {
        ListenerStats::bump(&self.stats.leader_changes);
        tracing::info!(session_id, leadership_term_id, leader_member_id, "new leader");
    }

    fn on_message(&mut self, session_id: SessionId, payload: &[u8]) {
        ListenerStats::bump(&self.stats.messages);
        match RequestEnvelope::decode(payload) {
            Ok(envelope) if envelope.msg_type.is_response() => {
                tracing::info!(
                    session_id,
                    msg_type = %envelope.msg_type,
                    tx_id = envelope.tx_id,
                    "response received"
                );
            }
            Ok(envelope) => {
                let tag = envelope.msg_type.tag();
                if matches!(envelope.msg_type, MessageType::Unknown(_)) {
                    tracing::warn!(session_id, tag, tx_id = envelope.tx_id, "unknown message type");
                } else {
                    tracing::debug!(
                        session_id,
                        msg_type = %envelope.msg_type,
                        tx_id = envelope.tx_id,
                        "message received"
                    );
                }
            }
            Err(err) => {
                ListenerStats::bump(&self.stats.undecodable);
                tracing::debug!(session_id, len = payload.len(), error = %err, "undecodable message");
            }
        }
    }

    fn on_error(&mut self, details: &str) {
        ListenerStats::bump(&self.stats.errors);
        tracing::error!(details, "cluster error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_transport::codec;

    #[test]
    fn test_counts_each_notification() {
        let mut listener = LoggingListener::new();
        let stats = listener.stats();

        listener.on_connect(1, 0);
        listener.on_new_leader(1, 2, 1);
        listener.on_disconnect("leader changed");
        listener.on_connect(2, 1);
        listener.on_error("slow follower");

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connects, 2);
        assert_eq!(snapshot.disconnects, 1);
        assert_eq!(snapshot.leader_changes, 1);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.messages, 0);
    }

    #[test]
    fn test_messages_decoded_or_counted_undecodable() {
        let mut listener = LoggingListener::new();

        listener.on_message(1, &codec::encode(0x01, 42));
        listener.on_message(1, &codec::encode(0x7E, 43));
        listener.on_message(1, &[0x00, 0x01]);

        let snapshot = listener.stats().snapshot();
        assert_eq!(snapshot.messages, 3);
        assert_eq!(snapshot.undecodable, 1);
    }

    #[test]
    fn test_clones_share_counters() {
        let listener = LoggingListener::new();
        let mut boxed: Box<dyn SessionListener> = Box::new(listener.clone());
        boxed.on_connect(5, 2);
        assert_eq!(listener.stats().snapshot().connects, 1);
    }
}
