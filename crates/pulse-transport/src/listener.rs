//! Session event notifications.
//!
//! A `SessionListener` is handed to a transport when it is constructed and is
//! called back synchronously from inside the transport's `poll`. Callbacks get
//! no handle to the transport, so they cannot poll or offer re-entrantly.

use std::sync::{Arc, Mutex};

use crate::transport::{MemberId, SessionId};

/// Observer of transport-driven session events.
///
/// Every method defaults to a no-op. Implementations must not block.
pub trait SessionListener: Send {
    /// A session was opened with the given leader.
    fn on_connect(&mut self, _session_id: SessionId, _leader_member_id: MemberId) {}

    /// The session was lost.
    fn on_disconnect(&mut self, _details: &str) {}

    /// A new leader was elected.
    fn on_new_leader(
        &mut self,
        _session_id: SessionId,
        _leadership_term_id: u64,
        _leader_member_id: MemberId,
    ) {
    }

    /// An inbound message arrived on the egress channel.
    fn on_message(&mut self, _session_id: SessionId, _payload: &[u8]) {}

    /// The transport reported an error.
    fn on_error(&mut self, _details: &str) {}
}

/// Listener that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl SessionListener for NoopListener {}

/// A single recorded session event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// `on_connect`.
    Connected {
        /// Session id.
        session_id: SessionId,
        /// Leader at connect time.
        leader_member_id: MemberId,
    },
    /// `on_disconnect`.
    Disconnected {
        /// Transport-supplied reason.
        details: String,
    },
    /// `on_new_leader`.
    NewLeader {
        /// Session id.
        session_id: SessionId,
        /// Leadership term.
        leadership_term_id: u64,
        /// New leader.
        leader_member_id: MemberId,
    },
    /// `on_message`.
    Message {
        /// Session id.
        session_id: SessionId,
        /// Raw payload.
        payload: Vec<u8>,
    },
    /// `on_error`.
    Error {
        /// Transport-supplied error text.
        details: String,
    },
}

/// Listener that records every event into a shared log.
///
/// Clones share the same log, so a test can keep one clone and hand the other
/// to the transport.
#[derive(Debug, Default, Clone)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl RecordingListener {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the events recorded so far.
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Number of events matching `pred`.
    pub fn count(&self, pred: impl Fn(&SessionEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    fn push(&self, event: SessionEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl SessionListener for RecordingListener {
    fn on_connect(&mut self, session_id: SessionId, leader_member_id: MemberId) {
        self.push(SessionEvent::Connected {
            session_id,
            leader_member_id,
        });
    }

    fn on_disconnect(&mut self, details: &str) {
        self.push(SessionEvent::Disconnected {
            details: details.to_string(),
        });
    }

    fn on_new_leader(
        &mut self,
        session_id: SessionId,
        leadership_term_id: u64,
        leader_member_id: MemberId,
    ) {
        self.push(SessionEvent::NewLeader {
            session_id,
            leadership_term_id,
            leader_member_id,
        });
    }

    fn on_message(&mut self, session_id: SessionId, payload: &[u8]) {
        self.push(SessionEvent::Message {
            session_id,
            payload: payload.to_vec(),
        });
    }

    fn on_error(&mut self, details: &str) {
        self.push(SessionEvent::Error {
            details: details.to_string(),
        });
    }
}
