//! Abstract cluster transport.
//!
//! This module defines the `ClusterTransport` trait: the capability set a session
//! client needs from whatever actually moves bytes to the cluster. The simulated
//! and TCP backends both implement it.

/// Index of a cluster member as listed in the ingress endpoints.
pub type MemberId = u32;

/// Cluster-assigned session identifier.
pub type SessionId = u64;

/// Result of a single non-blocking offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// The buffer was enqueued for replication.
    Accepted {
        /// Stream position after the buffer.
        position: u64,
    },
    /// The transport cannot take more data right now.
    BackPressured,
    /// No session is established.
    NotConnected,
    /// The transport has been shut down.
    Closed,
}

impl OfferOutcome {
    /// Returns true when the buffer was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, OfferOutcome::Accepted { .. })
    }
}

impl std::fmt::Display for OfferOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OfferOutcome::Accepted { position } => write!(f, "Accepted(position={})", position),
            OfferOutcome::BackPressured => write!(f, "BackPressured"),
            OfferOutcome::NotConnected => write!(f, "NotConnected"),
            OfferOutcome::Closed => write!(f, "Closed"),
        }
    }
}

/// Non-blocking transport for a single cluster session.
///
/// No method may suspend the caller. Connection establishment and re-establishment
/// after a disconnect or leader change are driven by `poll`; the transport's
/// `SessionListener` is invoked synchronously from inside `poll`.
pub trait ClusterTransport: Send {
    /// Performs pending session bookkeeping and dispatches events.
    ///
    /// Returns the amount of work done, used to drive idle strategies.
    fn poll(&mut self) -> usize;

    /// Returns true while a session with the current leader is established.
    fn is_connected(&self) -> bool;

    /// Leader as of the most recent poll, if one has been seen.
    fn leader_member_id(&self) -> Option<MemberId>;

    /// Session id as of the most recent poll, if a session has been opened.
    fn cluster_session_id(&self) -> Option<SessionId>;

    /// Attempts to send a session keep-alive. Returns whether it was accepted.
    fn send_keep_alive(&mut self) -> bool;

    /// Attempts once to enqueue `buffer` for replication.
    fn offer(&mut self, buffer: &[u8]) -> OfferOutcome;
}

impl<T: ClusterTransport + ?Sized> ClusterTransport for Box<T> {
    fn poll(&mut self) -> usize {
        (**self).poll()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn leader_member_id(&self) -> Option<MemberId> {
        (**self).leader_member_id()
    }

    fn cluster_session_id(&self) -> Option<SessionId> {
        (**self).cluster_session_id()
    }

    fn send_keep_alive(&mut self) -> bool {
        (**self).send_keep_alive()
    }

    fn offer(&mut self, buffer: &[u8]) -> OfferOutcome {
        (**self).offer(buffer)
    }
}
