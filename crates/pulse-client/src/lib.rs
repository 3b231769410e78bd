#![warn(missing_docs)]

//! Pulse client: cluster session management, keep-alives and sequenced request delivery

pub mod cli;
pub mod config;
pub mod delivery;
pub mod error;
pub mod listener;
pub mod session;

pub use cli::Cli;
pub use config::{ClientConfig, FailedOfferPolicyKind, TransportKind};
pub use delivery::{
    DeliveryConfig, DeliveryLoop, DeliveryStats, FailedOfferPolicy, KeepAliveAction,
    MessageReport, SendOutcome, TickReport, TickTimers,
};
pub use error::{ClientError, Result};
pub use listener::{ListenerSnapshot, ListenerStats, LoggingListener};
pub use session::{ConnectionState, Session, SessionClient};
