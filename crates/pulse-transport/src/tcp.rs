//! TCP cluster transport.
//!
//! A background driver task owns the socket: it walks the ingress endpoints,
//! follows leader redirects, keeps the session open and reconnects with backoff.
//! `TcpTransport` itself never awaits. Offers and keep-alives go to the driver
//! through a bounded channel (a full channel is backpressure), and driver events
//! come back through an unbounded channel drained by `poll`.

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::endpoints::IngressEndpoints;
use crate::error::{Result, TransportError};
use crate::listener::SessionListener;
use crate::protocol::{Frame, FrameCodec, NewLeaderBody, Opcode, SessionEventBody, SessionEventCode};
use crate::transport::{ClusterTransport, MemberId, OfferOutcome, SessionId};

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// How long to wait for a member to answer a session connect.
    pub response_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
    /// First delay before retrying after a failed connect.
    pub reconnect_delay_ms: u64,
    /// Reconnect delay cap.
    pub max_reconnect_delay_ms: u64,
    /// Offers and keep-alives that may be queued for the driver.
    pub send_queue_capacity: usize,
    /// Events dispatched per `poll` at most.
    pub max_events_per_poll: usize,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            response_timeout_ms: 5000,
            nodelay: true,
            reconnect_delay_ms: 100,
            max_reconnect_delay_ms: 5000,
            send_queue_capacity: 1024,
            max_events_per_poll: 64,
        }
    }
}

#[derive(Debug)]
enum Command {
    Offer(Bytes),
    KeepAlive,
}

#[derive(Debug)]
enum DriverEvent {
    Connected {
        session_id: SessionId,
        leader_member_id: MemberId,
    },
    NewLeader {
        session_id: SessionId,
        leadership_term_id: u64,
        leader_member_id: MemberId,
    },
    Disconnected {
        details: String,
    },
    Message {
        session_id: SessionId,
        payload: Bytes,
    },
    Error {
        details: String,
    },
}

/// Client transport speaking the framed session protocol over TCP.
pub struct TcpTransport {
    commands: mpsc::Sender<Command>,
    events: mpsc::UnboundedReceiver<DriverEvent>,
    listener: Box<dyn SessionListener>,
    connected: bool,
    session_id: Option<SessionId>,
    leader: Option<MemberId>,
    position: u64,
    max_events_per_poll: usize,
    driver: JoinHandle<()>,
}

impl TcpTransport {
    /// Starts the driver task on the current tokio runtime.
    pub fn spawn(
        endpoints: IngressEndpoints,
        config: TcpTransportConfig,
        listener: Box<dyn SessionListener>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::IoError(std::io::Error::other(e.to_string())))?;
        let (command_tx, command_rx) = mpsc::channel(config.send_queue_capacity.max(1));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let max_events_per_poll = config.max_events_per_poll.max(1);

        let driver = Driver {
            endpoints,
            config,
            commands: command_rx,
            events: event_tx,
            session_id: None,
            leader_hint: None,
            cursor: 0,
        };
        let driver = runtime.spawn(driver.run());

        Ok(Self {
            commands: command_tx,
            events: event_rx,
            listener,
            connected: false,
            session_id: None,
            leader: None,
            position: 0,
            max_events_per_poll,
            driver,
        })
    }

    fn apply(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Connected {
                session_id,
                leader_member_id,
            } => {
                self.connected = true;
                self.session_id = Some(session_id);
                self.leader = Some(leader_member_id);
                self.listener.on_connect(session_id, leader_member_id);
            }
            DriverEvent::NewLeader {
                session_id,
                leadership_term_id,
                leader_member_id,
            } => {
                self.leader = Some(leader_member_id);
                self.listener
                    .on_new_leader(session_id, leadership_term_id, leader_member_id);
            }
            DriverEvent::Disconnected { details } => {
                self.connected = false;
                self.listener.on_disconnect(&details);
            }
            DriverEvent::Message {
                session_id,
                payload,
            } => self.listener.on_message(session_id, &payload),
            DriverEvent::Error { details } => self.listener.on_error(&details),
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl ClusterTransport for TcpTransport {
    fn poll(&mut self) -> usize {
        let mut work = 0;
        while work < self.max_events_per_poll {
            match self.events.try_recv() {
                Ok(event) => {
                    self.apply(event);
                    work += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.connected {
                        self.connected = false;
                        self.listener.on_disconnect("transport driver stopped");
                        work += 1;
                    }
                    break;
                }
            }
        }
        work
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn leader_member_id(&self) -> Option<MemberId> {
        self.leader
    }

    fn cluster_session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    fn send_keep_alive(&mut self) -> bool {
        self.connected && self.commands.try_send(Command::KeepAlive).is_ok()
    }

    fn offer(&mut self, buffer: &[u8]) -> OfferOutcome {
        if !self.connected {
            return OfferOutcome::NotConnected;
        }
        match self
            .commands
            .try_send(Command::Offer(Bytes::copy_from_slice(buffer)))
        {
            Ok(()) => {
                self.position += buffer.len() as u64;
                OfferOutcome::Accepted {
                    position: self.position,
                }
            }
            Err(TrySendError::Full(_)) => OfferOutcome::BackPressured,
            Err(TrySendError::Closed(_)) => OfferOutcome::Closed,
        }
    }
}

struct Link {
    framed: Framed<TcpStream, FrameCodec>,
    member_id: MemberId,
    session_id: SessionId,
}

enum ServeExit {
    Shutdown,
    NewLeader(NewLeaderBody),
    Lost(String),
}

struct Driver {
    endpoints: IngressEndpoints,
    config: TcpTransportConfig,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<DriverEvent>,
    session_id: Option<SessionId>,
    leader_hint: Option<MemberId>,
    cursor: usize,
}

impl Driver {
    async fn run(mut self) {
        let initial_delay = Duration::from_millis(self.config.reconnect_delay_ms);
        let mut delay = initial_delay;
        let mut redirects = 0usize;

        loop {
            let member_id = self.next_member();
            match self.establish(member_id).await {
                Ok(mut link) => {
                    delay = initial_delay;
                    redirects = 0;
                    match self.serve(&mut link).await {
                        ServeExit::Shutdown => {
                            let _ = link.framed.send(Frame::close(link.session_id)).await;
                            tracing::debug!(session_id = link.session_id, "transport driver shut down");
                            return;
                        }
                        ServeExit::NewLeader(body) => {
                            tracing::info!(
                                leader_member_id = body.leader_member_id,
                                leadership_term_id = body.leadership_term_id,
                                "leader changed, moving session"
                            );
                            self.leader_hint = Some(body.leader_member_id);
                            self.emit(DriverEvent::NewLeader {
                                session_id: link.session_id,
                                leadership_term_id: body.leadership_term_id,
                                leader_member_id: body.leader_member_id,
                            });
                            self.emit(DriverEvent::Disconnected {
                                details: "leader changed".to_string(),
                            });
                        }
                        ServeExit::Lost(details) => {
                            tracing::warn!(member_id = link.member_id, %details, "session lost");
                            self.emit(DriverEvent::Disconnected { details });
                        }
                    }
                }
                Err(TransportError::Redirected {
                    member_id,
                    leader_member_id,
                }) if redirects < self.endpoints.len() => {
                    tracing::debug!(member_id, leader_member_id, "redirected to leader");
                    redirects += 1;
                    self.leader_hint = Some(leader_member_id);
                }
                Err(err) => {
                    tracing::debug!(member_id, error = %err, "session connect failed");
                    self.emit(DriverEvent::Error {
                        details: err.to_string(),
                    });
                    redirects = 0;
                    if self.pause(delay).await {
                        return;
                    }
                    delay = next_delay(delay, self.config.max_reconnect_delay_ms);
                }
            }
        }
    }

    fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }

    fn next_member(&mut self) -> MemberId {
        if let Some(hint) = self.leader_hint.take() {
            if self.endpoints.get(hint).is_some() {
                return hint;
            }
        }
        let ids = self.endpoints.member_ids();
        let member_id = ids[self.cursor % ids.len()];
        self.cursor = self.cursor.wrapping_add(1);
        member_id
    }

    /// Sleeps `delay`, discarding commands queued while disconnected.
    /// Returns true if the transport was dropped meanwhile.
    async fn pause(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                command = self.commands.recv() => match command {
                    None => return true,
                    Some(command) => {
                        tracing::debug!(?command, "dropping command queued while disconnected");
                    }
                },
            }
        }
    }

    async fn establish(&mut self, member_id: MemberId) -> Result<Link> {
        let addr = self
            .endpoints
            .get(member_id)
            .ok_or_else(|| TransportError::InvalidEndpoints {
                reason: format!("no endpoint for member {}", member_id),
            })?
            .to_string();

        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: addr.clone(),
                timeout_ms: self.config.connect_timeout_ms,
            })?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused {
                    addr: addr.clone(),
                },
                _ => TransportError::IoError(e),
            })?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        tracing::debug!(member_id, addr = %addr, "TCP connected");

        let mut framed = Framed::new(stream, FrameCodec::new());
        framed.send(Frame::session_connect(self.session_id)).await?;

        let response_timeout = Duration::from_millis(self.config.response_timeout_ms);
        let response = tokio::time::timeout(response_timeout, framed.next())
            .await
            .map_err(|_| TransportError::ResponseTimeout {
                addr: addr.clone(),
                timeout_ms: self.config.response_timeout_ms,
            })?
            .ok_or(TransportError::ConnectionReset)??;

        if response.opcode() != Opcode::SessionEvent {
            return Err(TransportError::InvalidFrame {
                reason: format!("expected SessionEvent, got {:?}", response.opcode()),
            });
        }
        let body = SessionEventBody::decode(&response.payload)?;
        match body.code {
            SessionEventCode::Ok => {
                let session_id = response.session_id();
                self.session_id = Some(session_id);
                tracing::info!(
                    member_id,
                    session_id,
                    leader_member_id = body.leader_member_id,
                    "session established"
                );
                self.emit(DriverEvent::Connected {
                    session_id,
                    leader_member_id: body.leader_member_id,
                });
                Ok(Link {
                    framed,
                    member_id,
                    session_id,
                })
            }
            SessionEventCode::Redirect => Err(TransportError::Redirected {
                member_id,
                leader_member_id: body.leader_member_id,
            }),
            SessionEventCode::Error => Err(TransportError::SessionRejected {
                member_id,
                detail: body.detail,
            }),
        }
    }

    async fn serve(&mut self, link: &mut Link) -> ServeExit {
        loop {
            tokio::select! {
                frame = link.framed.next() => {
                    let frame = match frame {
                        None => return ServeExit::Lost("connection closed by member".to_string()),
                        Some(Err(err)) => return ServeExit::Lost(err.to_string()),
                        Some(Ok(frame)) => frame,
                    };
                    match frame.opcode() {
                        Opcode::Message => self.emit(DriverEvent::Message {
                            session_id: link.session_id,
                            payload: frame.payload,
                        }),
                        Opcode::NewLeader => match NewLeaderBody::decode(&frame.payload) {
                            Ok(body) if body.leader_member_id != link.member_id => {
                                return ServeExit::NewLeader(body);
                            }
                            Ok(body) => self.emit(DriverEvent::NewLeader {
                                session_id: link.session_id,
                                leadership_term_id: body.leadership_term_id,
                                leader_member_id: body.leader_member_id,
                            }),
                            Err(err) => self.emit(DriverEvent::Error {
                                details: err.to_string(),
                            }),
                        },
                        Opcode::Error => self.emit(DriverEvent::Error {
                            details: frame.text(),
                        }),
                        Opcode::Close => {
                            return ServeExit::Lost("session closed by cluster".to_string());
                        }
                        Opcode::KeepAlive => {}
                        Opcode::SessionConnect | Opcode::SessionEvent => {
                            self.emit(DriverEvent::Error {
                                details: format!("unexpected {:?} frame", frame.opcode()),
                            });
                        }
                    }
                }
                command = self.commands.recv() => {
                    let frame = match command {
                        None => return ServeExit::Shutdown,
                        Some(Command::Offer(payload)) => Frame::message(link.session_id, payload),
                        Some(Command::KeepAlive) => Frame::keep_alive(link.session_id),
                    };
                    if let Err(err) = link.framed.send(frame).await {
                        return ServeExit::Lost(err.to_string());
                    }
                }
            }
        }
    }
}

fn next_delay(current: Duration, max_ms: u64) -> Duration {
    let doubled = (current.as_millis() as u64).saturating_mul(2).min(max_ms);
    let jitter = if doubled >= 4 {
        rand::thread_rng().gen_range(0..=doubled / 4)
    } else {
        0
    };
    Duration::from_millis(doubled.saturating_add(jitter).min(max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_delay_grows_and_caps() {
        let d = next_delay(Duration::from_millis(100), 5000);
        assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(250));

        let capped = next_delay(Duration::from_millis(4000), 5000);
        assert_eq!(capped, Duration::from_millis(5000));
    }

    #[test]
    fn test_default_config() {
        let config = TcpTransportConfig::default();
        assert_eq!(config.connect_timeout_ms, 5000);
        assert!(config.nodelay);
        assert_eq!(config.send_queue_capacity, 1024);
    }

    #[tokio::test]
    async fn test_offer_before_connect_is_rejected() {
        let endpoints: IngressEndpoints = "0=127.0.0.1:1".parse().unwrap();
        let mut transport = TcpTransport::spawn(
            endpoints,
            TcpTransportConfig::default(),
            Box::new(crate::listener::NoopListener),
        )
        .unwrap();
        assert!(!transport.is_connected());
        assert_eq!(transport.offer(b"x"), OfferOutcome::NotConnected);
        assert!(!transport.send_keep_alive());
    }
}
