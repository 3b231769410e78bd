#![warn(missing_docs)]

//! Pulse transport subsystem: cluster session capability, request envelope codec, simulated and TCP transports

pub mod codec;
pub mod endpoints;
pub mod error;
pub mod idle;
pub mod listener;
pub mod protocol;
pub mod sim;
pub mod tcp;
pub mod transport;

pub use codec::{MessageType, RequestEnvelope, REQUEST_ENVELOPE_SIZE, TX_REQUEST_TAG};
pub use endpoints::IngressEndpoints;
pub use error::{Result, TransportError};
pub use idle::{BackoffIdleConfig, BackoffIdleStrategy, IdleStrategy, SleepingIdleStrategy};
pub use listener::{NoopListener, RecordingListener, SessionEvent, SessionListener};
pub use sim::{SimCluster, SimClusterConfig, SimStats, SimTransport};
pub use tcp::{TcpTransport, TcpTransportConfig};
pub use transport::{ClusterTransport, MemberId, OfferOutcome, SessionId};
