//! Request envelope codec.
//!
//! Every application message sent into the cluster's request stream is a fixed
//! 9-byte envelope: one type tag byte followed by a big-endian `u64` sequence id.
//! The cluster services answer with the same layout, using one response tag per
//! service.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};

/// Size of an encoded envelope in bytes (tag:1 + tx_id:8).
pub const REQUEST_ENVELOPE_SIZE: usize = 9;

/// Tag of a client transaction request.
pub const TX_REQUEST_TAG: u8 = 0x0F;

/// Envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Client transaction request.
    TxRequest,
    /// Response produced by cluster service 0.
    TxResponse0,
    /// Response produced by cluster service 1.
    TxResponse1,
    /// Response produced by cluster service 2.
    TxResponse2,
    /// Any tag this client does not know about.
    Unknown(u8),
}

impl MessageType {
    /// Raw wire tag.
    pub fn tag(self) -> u8 {
        match self {
            MessageType::TxRequest => TX_REQUEST_TAG,
            MessageType::TxResponse0 => 0x00,
            MessageType::TxResponse1 => 0x01,
            MessageType::TxResponse2 => 0x02,
            MessageType::Unknown(tag) => tag,
        }
    }

    /// Returns true for the per-service response tags.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageType::TxResponse0 | MessageType::TxResponse1 | MessageType::TxResponse2
        )
    }
}

impl From<u8> for MessageType {
    fn from(tag: u8) -> Self {
        match tag {
            TX_REQUEST_TAG => MessageType::TxRequest,
            0x00 => MessageType::TxResponse0,
            0x01 => MessageType::TxResponse1,
            0x02 => MessageType::TxResponse2,
            other => MessageType::Unknown(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(msg_type: MessageType) -> Self {
        msg_type.tag()
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::TxRequest => write!(f, "TxRequest"),
            MessageType::TxResponse0 => write!(f, "TxResponse0"),
            MessageType::TxResponse1 => write!(f, "TxResponse1"),
            MessageType::TxResponse2 => write!(f, "TxResponse2"),
            MessageType::Unknown(tag) => write!(f, "Unknown(0x{:02X})", tag),
        }
    }
}

/// A typed, identified message bound for (or received from) the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestEnvelope {
    /// Type tag.
    pub msg_type: MessageType,
    /// Sequence id.
    pub tx_id: u64,
}

impl RequestEnvelope {
    /// Creates a transaction request envelope.
    pub fn tx_request(tx_id: u64) -> Self {
        Self {
            msg_type: MessageType::TxRequest,
            tx_id,
        }
    }

    /// Encodes the envelope into its 9-byte wire form.
    pub fn encode(&self) -> Bytes {
        encode(self.msg_type.tag(), self.tx_id)
    }

    /// Decodes an envelope from the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (tag, tx_id) = decode(buf)?;
        Ok(Self {
            msg_type: MessageType::from(tag),
            tx_id,
        })
    }
}

/// Encodes a type tag and sequence id.
pub fn encode(tag: u8, tx_id: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(REQUEST_ENVELOPE_SIZE);
    buf.put_u8(tag);
    buf.put_u64(tx_id);
    buf.freeze()
}

/// Decodes the tag and sequence id from the first 9 bytes of `buf`.
///
/// Trailing bytes are ignored.
pub fn decode(mut buf: &[u8]) -> Result<(u8, u64)> {
    if buf.len() < REQUEST_ENVELOPE_SIZE {
        return Err(TransportError::EnvelopeTooShort {
            len: buf.len(),
            needed: REQUEST_ENVELOPE_SIZE,
        });
    }
    let tag = buf.get_u8();
    let tx_id = buf.get_u64();
    Ok((tag, tx_id))
}
