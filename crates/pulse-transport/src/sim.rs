//! In-process cluster simulation for testing without a running cluster.
//!
//! `SimCluster` is a shared handle to the simulated cluster state; tests keep a
//! clone to inject faults (leader changes, disconnects, backpressure, rejected
//! keep-alives, transport errors, inbound messages) and to inspect what the
//! client actually sent. `SimTransport` is the client-side `ClusterTransport`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use crate::listener::SessionListener;
use crate::transport::{ClusterTransport, MemberId, OfferOutcome, SessionId};

/// Configuration for a simulated cluster.
#[derive(Debug, Clone)]
pub struct SimClusterConfig {
    /// Number of members (default: 3).
    pub members: u32,
    /// Leader at startup (default: 0).
    pub initial_leader: MemberId,
    /// Polls needed to open a session once connecting (default: 1).
    pub connect_polls: u32,
    /// First session id handed out (default: 1).
    pub first_session_id: SessionId,
    /// Most recent accepted payloads kept for inspection (default: 1024).
    /// Older payloads are discarded; 0 keeps none.
    pub payload_history: usize,
}

impl Default for SimClusterConfig {
    fn default() -> Self {
        Self {
            members: 3,
            initial_leader: 0,
            connect_polls: 1,
            first_session_id: 1,
            payload_history: 1024,
        }
    }
}

/// Counters describing what the client did against the simulated cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Calls to `poll`.
    pub polls: u64,
    /// Offers made while a session was established.
    pub offer_attempts: u64,
    /// Offers accepted.
    pub offers_accepted: u64,
    /// Offers rejected with backpressure.
    pub offers_rejected: u64,
    /// Offers made while no session was established.
    pub offers_while_disconnected: u64,
    /// Keep-alive attempts, connected or not.
    pub keep_alive_attempts: u64,
    /// Keep-alives accepted.
    pub keep_alives_accepted: u64,
    /// Sessions opened.
    pub sessions_opened: u64,
    /// Current leadership term.
    pub leadership_term_id: u64,
}

#[derive(Debug)]
struct SimState {
    members: u32,
    leader: MemberId,
    term: u64,
    reachable: bool,
    connect_polls: u32,
    next_session_id: SessionId,
    disconnect_epoch: u64,
    reject_offers: u32,
    backpressure: bool,
    reject_keep_alives: u32,
    position: u64,
    accepted: VecDeque<Bytes>,
    payload_history: usize,
    errors: VecDeque<String>,
    egress: VecDeque<Vec<u8>>,
    stats: SimStats,
}

/// Shared handle to a simulated cluster.
#[derive(Debug, Clone)]
pub struct SimCluster {
    state: Arc<Mutex<SimState>>,
}

impl SimCluster {
    /// Creates a cluster with the given configuration.
    pub fn new(config: SimClusterConfig) -> Self {
        let state = SimState {
            members: config.members.max(1),
            leader: config.initial_leader,
            term: 0,
            reachable: true,
            connect_polls: config.connect_polls.max(1),
            next_session_id: config.first_session_id,
            disconnect_epoch: 0,
            reject_offers: 0,
            backpressure: false,
            reject_keep_alives: 0,
            position: 0,
            accepted: VecDeque::new(),
            payload_history: config.payload_history,
            errors: VecDeque::new(),
            egress: VecDeque::new(),
            stats: SimStats::default(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates a client transport attached to this cluster.
    pub fn transport(&self, listener: Box<dyn SessionListener>) -> SimTransport {
        SimTransport::new(self.clone(), listener)
    }

    /// Elects `member` as leader in a new term. Established sessions become stale.
    pub fn elect_leader(&self, member: MemberId) {
        let mut state = self.lock();
        state.leader = member % state.members;
        state.term += 1;
        state.stats.leadership_term_id = state.term;
    }

    /// Current leader.
    pub fn leader(&self) -> MemberId {
        self.lock().leader
    }

    /// Closes every established session.
    pub fn disconnect(&self) {
        self.lock().disconnect_epoch += 1;
    }

    /// Makes the cluster reachable or unreachable. An unreachable cluster drops
    /// established sessions and refuses new ones.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Sets how many polls a new session takes to open.
    pub fn set_connect_polls(&self, polls: u32) {
        self.lock().connect_polls = polls.max(1);
    }

    /// Rejects the next `count` offers with backpressure.
    pub fn reject_next_offers(&self, count: u32) {
        self.lock().reject_offers = count;
    }

    /// Rejects every offer with backpressure while enabled.
    pub fn set_backpressure(&self, enabled: bool) {
        self.lock().backpressure = enabled;
    }

    /// Rejects the next `count` keep-alives.
    pub fn reject_next_keep_alives(&self, count: u32) {
        self.lock().reject_keep_alives = count;
    }

    /// Queues an inbound message for the client.
    pub fn push_egress(&self, payload: impl Into<Vec<u8>>) {
        self.lock().egress.push_back(payload.into());
    }

    /// Queues a transport error for the client.
    pub fn inject_error(&self, details: impl Into<String>) {
        self.lock().errors.push_back(details.into());
    }

    /// Most recent accepted payloads, oldest first, bounded by
    /// `SimClusterConfig::payload_history`.
    pub fn accepted_payloads(&self) -> Vec<Bytes> {
        self.lock().accepted.iter().cloned().collect()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> SimStats {
        self.lock().stats.clone()
    }
}

impl Default for SimCluster {
    fn default() -> Self {
        Self::new(SimClusterConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Disconnected,
    Connecting { remaining: u32 },
    Connected,
}

enum Event {
    Connected(SessionId, MemberId),
    Disconnected(&'static str),
    NewLeader(SessionId, u64, MemberId),
    Message(SessionId, Vec<u8>),
    Error(String),
}

/// Client transport bound to a `SimCluster`.
pub struct SimTransport {
    cluster: SimCluster,
    listener: Box<dyn SessionListener>,
    link: Link,
    leader: Option<MemberId>,
    session_id: Option<SessionId>,
    seen_term: u64,
    seen_epoch: u64,
}

impl SimTransport {
    /// Creates a transport; the session is opened by subsequent polls.
    pub fn new(cluster: SimCluster, listener: Box<dyn SessionListener>) -> Self {
        Self {
            cluster,
            listener,
            link: Link::Disconnected,
            leader: None,
            session_id: None,
            seen_term: 0,
            seen_epoch: 0,
        }
    }

    /// The cluster this transport talks to.
    pub fn cluster(&self) -> &SimCluster {
        &self.cluster
    }

    fn dispatch(&mut self, events: Vec<Event>) {
        for event in events {
            match event {
                Event::Connected(session_id, leader) => self.listener.on_connect(session_id, leader),
                Event::Disconnected(details) => self.listener.on_disconnect(details),
                Event::NewLeader(session_id, term, leader) => {
                    self.listener.on_new_leader(session_id, term, leader)
                }
                Event::Message(session_id, payload) => {
                    self.listener.on_message(session_id, &payload)
                }
                Event::Error(details) => self.listener.on_error(&details),
            }
        }
    }
}

impl ClusterTransport for SimTransport {
    fn poll(&mut self) -> usize {
        let mut events = Vec::new();
        let mut work = 0;
        {
            let mut state = self.cluster.lock();
            state.stats.polls += 1;
            let session_id = self.session_id.unwrap_or_default();

            if self.link == Link::Connected {
                let dropped = if state.disconnect_epoch != self.seen_epoch {
                    Some("session closed by cluster")
                } else if state.term != self.seen_term {
                    self.seen_term = state.term;
                    self.leader = Some(state.leader);
                    events.push(Event::NewLeader(session_id, state.term, state.leader));
                    Some("leader changed")
                } else if !state.reachable {
                    Some("cluster unreachable")
                } else {
                    None
                };
                if let Some(details) = dropped {
                    self.link = Link::Connecting {
                        remaining: state.connect_polls,
                    };
                    events.push(Event::Disconnected(details));
                    work += 1;
                }
            }

            if self.link == Link::Disconnected {
                self.link = Link::Connecting {
                    remaining: state.connect_polls,
                };
                work += 1;
            }

            if let Link::Connecting { remaining } = self.link {
                if state.reachable {
                    if remaining <= 1 {
                        let session_id = state.next_session_id;
                        state.next_session_id += 1;
                        state.stats.sessions_opened += 1;
                        self.session_id = Some(session_id);
                        self.leader = Some(state.leader);
                        self.seen_term = state.term;
                        self.seen_epoch = state.disconnect_epoch;
                        self.link = Link::Connected;
                        events.push(Event::Connected(session_id, state.leader));
                    } else {
                        self.link = Link::Connecting {
                            remaining: remaining - 1,
                        };
                    }
                    work += 1;
                }
            }

            if self.link == Link::Connected {
                let session_id = self.session_id.unwrap_or_default();
                while let Some(payload) = state.egress.pop_front() {
                    events.push(Event::Message(session_id, payload));
                    work += 1;
                }
            }

            while let Some(details) = state.errors.pop_front() {
                events.push(Event::Error(details));
                work += 1;
            }
        }

        self.dispatch(events);
        work
    }

    fn is_connected(&self) -> bool {
        self.link == Link::Connected
    }

    fn leader_member_id(&self) -> Option<MemberId> {
        self.leader
    }

    fn cluster_session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    fn send_keep_alive(&mut self) -> bool {
        let mut state = self.cluster.lock();
        state.stats.keep_alive_attempts += 1;
        if self.link != Link::Connected {
            return false;
        }
        if state.reject_keep_alives > 0 {
            state.reject_keep_alives -= 1;
            return false;
        }
        state.stats.keep_alives_accepted += 1;
        true
    }

    fn offer(&mut self, buffer: &[u8]) -> OfferOutcome {
        let mut state = self.cluster.lock();
        if self.link != Link::Connected {
            state.stats.offers_while_disconnected += 1;
            return OfferOutcome::NotConnected;
        }
        state.stats.offer_attempts += 1;
        if state.backpressure || state.reject_offers > 0 {
            state.reject_offers = state.reject_offers.saturating_sub(1);
            state.stats.offers_rejected += 1;
            return OfferOutcome::BackPressured;
        }
        state.position += buffer.len() as u64;
        if state.payload_history > 0 {
            if state.accepted.len() == state.payload_history {
                state.accepted.pop_front();
            }
            state.accepted.push_back(Bytes::copy_from_slice(buffer));
        }
        state.stats.offers_accepted += 1;
        OfferOutcome::Accepted {
            position: state.position,
        }
    }
}
