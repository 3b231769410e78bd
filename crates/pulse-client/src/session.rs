//! Session client: owns the cluster session lifecycle.
//!
//! `SessionClient` wraps a `ClusterTransport` and mirrors what each poll observed
//! into a `Session`. The only waiting it ever does is in `connect`, which polls
//! and idles until the transport reports a session, and which can be cancelled
//! or bounded by a timeout.

use std::time::Duration;

use pulse_transport::{ClusterTransport, IdleStrategy, MemberId, OfferOutcome, SessionId};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, Result};

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session and no attempt under way.
    Disconnected,
    /// Waiting for the transport to open a session.
    Connecting,
    /// A session with the current leader is open.
    Connected,
}

/// One logical, re-establishable connection to the cluster.
#[derive(Debug, Clone)]
pub struct Session {
    /// Connection state.
    pub state: ConnectionState,
    /// Leader as of the last poll.
    pub leader_member_id: Option<MemberId>,
    /// Session id assigned on the last connect.
    pub session_id: Option<SessionId>,
    /// When a keep-alive was last accepted.
    pub last_keep_alive: Option<Instant>,
    /// Times the session was re-established after being lost.
    pub reconnects: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            leader_member_id: None,
            session_id: None,
            last_keep_alive: None,
            reconnects: 0,
        }
    }
}

/// Session lifecycle on top of a non-blocking transport.
pub struct SessionClient<T: ClusterTransport> {
    transport: T,
    idle: Box<dyn IdleStrategy>,
    session: Session,
    connect_timeout: Option<Duration>,
}

impl<T: ClusterTransport> SessionClient<T> {
    /// Creates a client; nothing happens until the first poll or connect.
    pub fn new(transport: T, idle: Box<dyn IdleStrategy>) -> Self {
        Self {
            transport,
            idle,
            session: Session::default(),
            connect_timeout: None,
        }
    }

    /// Bounds every connect wait. `None` waits until connected or cancelled.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Polls and idles until a session is open.
    ///
    /// Returns immediately after one poll if the session is already open.
    pub async fn connect(&mut self, cancel: &CancellationToken) -> Result<&Session> {
        match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.await_connected(cancel))
                .await
                .map_err(|_| ClientError::ConnectTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })??,
            None => self.await_connected(cancel).await?,
        }
        Ok(&self.session)
    }

    async fn await_connected(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.poll();
        if self.is_connected() {
            return Ok(());
        }
        tracing::info!("connecting to cluster");

        self.idle.reset();
        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            let work = self.poll();
            if self.is_connected() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = self.idle.idle(work) => {}
            }
        }
    }

    /// Drives the transport and records what it observed. Never waits.
    ///
    /// Polling is itself a connect attempt, so the first poll moves a
    /// `Disconnected` session to `Connecting` before looking at the transport;
    /// a session that opens within that poll still passes through `Connecting`.
    pub fn poll(&mut self) -> usize {
        if self.session.state == ConnectionState::Disconnected {
            self.session.state = ConnectionState::Connecting;
        }
        let work = self.transport.poll();
        self.refresh();
        work
    }

    /// Sends a keep-alive at tick time `now`. Returns whether the transport
    /// accepted it.
    pub fn send_keep_alive(&mut self, now: Instant) -> bool {
        let accepted = self.transport.send_keep_alive();
        if accepted {
            self.session.last_keep_alive = Some(now);
        }
        accepted
    }

    /// Offers `buffer` once. Retrying is up to the caller.
    pub fn offer(&mut self, buffer: &[u8]) -> OfferOutcome {
        self.transport.offer(buffer)
    }

    /// True while the last poll saw an open session.
    pub fn is_connected(&self) -> bool {
        self.session.state == ConnectionState::Connected
    }

    /// Leader as of the last poll.
    pub fn leader_id(&self) -> Option<MemberId> {
        self.session.leader_member_id
    }

    /// Current session snapshot.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn refresh(&mut self) {
        let leader = self.transport.leader_member_id();
        if leader != self.session.leader_member_id {
            tracing::info!(
                previous = ?self.session.leader_member_id,
                leader_member_id = ?leader,
                "leader changed"
            );
            self.session.leader_member_id = leader;
        }

        let connected = self.transport.is_connected();
        let session_id = self.transport.cluster_session_id();
        match (self.session.state, connected) {
            (ConnectionState::Connected, false) => {
                tracing::warn!(session_id = ?self.session.session_id, "session lost, reconnecting");
                self.session.state = ConnectionState::Connecting;
            }
            (ConnectionState::Connected, true) if session_id != self.session.session_id => {
                tracing::info!(
                    previous = ?self.session.session_id,
                    session_id = ?session_id,
                    "session re-established"
                );
                self.session.session_id = session_id;
                self.session.reconnects += 1;
            }
            (ConnectionState::Connecting, true) => {
                if self.session.session_id.is_some() {
                    self.session.reconnects += 1;
                }
                self.session.state = ConnectionState::Connected;
                self.session.session_id = session_id;
                tracing::info!(
                    session_id = ?session_id,
                    leader_member_id = ?leader,
                    "session established"
                );
            }
            _ => {}
        }
    }
}

impl<T: ClusterTransport> std::fmt::Debug for SessionClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("session", &self.session)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}
