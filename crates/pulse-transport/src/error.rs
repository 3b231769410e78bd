use thiserror::Error;

use crate::transport::MemberId;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection refused to {addr}")]
    ConnectionRefused { addr: String },

    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout { addr: String, timeout_ms: u64 },

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge { size: u32, max_size: u32 },

    #[error("unknown opcode: 0x{0:02X}")]
    UnknownOpcode(u8),

    #[error("envelope too short: {len} bytes (need {needed})")]
    EnvelopeTooShort { len: usize, needed: usize },

    #[error("invalid ingress endpoints: {reason}")]
    InvalidEndpoints { reason: String },

    #[error("member {member_id} redirected to leader {leader_member_id}")]
    Redirected {
        member_id: MemberId,
        leader_member_id: MemberId,
    },

    #[error("session rejected by member {member_id}: {detail}")]
    SessionRejected { member_id: MemberId, detail: String },

    #[error("no response from {addr} within {timeout_ms}ms")]
    ResponseTimeout { addr: String, timeout_ms: u64 },

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
