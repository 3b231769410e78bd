//! Framed session protocol for the TCP transport.
//!
//! Every frame carries a fixed 20-byte header followed by an opcode-specific
//! payload. All integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Result, TransportError};
use crate::transport::{MemberId, SessionId};

/// Frame header size in bytes (magic:4 + version:1 + opcode:1 + flags:2 + session_id:8 + payload_length:4)
pub const FRAME_HEADER_SIZE: usize = 20;

/// Protocol magic number for frame validation
pub const MAGIC: u32 = 0x504C_5345;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest payload a frame may carry.
pub const MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

/// Session protocol operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Client asks a member to open (or resume) a session
    SessionConnect = 0x01,
    /// Member answers a connect: ok, redirect to leader, or error
    SessionEvent = 0x02,
    /// Member announces a new leader
    NewLeader = 0x03,
    /// Client liveness signal
    KeepAlive = 0x04,
    /// Application message, either direction
    Message = 0x05,
    /// Either side closes the session
    Close = 0x06,
    /// Member reports an error
    Error = 0x07,
}

impl TryFrom<u8> for Opcode {
    type Error = TransportError;

    fn try_from(raw: u8) -> Result<Self> {
        match raw {
            0x01 => Ok(Opcode::SessionConnect),
            0x02 => Ok(Opcode::SessionEvent),
            0x03 => Ok(Opcode::NewLeader),
            0x04 => Ok(Opcode::KeepAlive),
            0x05 => Ok(Opcode::Message),
            0x06 => Ok(Opcode::Close),
            0x07 => Ok(Opcode::Error),
            other => Err(TransportError::UnknownOpcode(other)),
        }
    }
}

/// Frame header containing metadata about the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Operation code
    pub opcode: Opcode,
    /// Session the frame belongs to, 0 before a session exists
    pub session_id: SessionId,
    /// Payload length in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    /// Decodes and validates a header from the first `FRAME_HEADER_SIZE` bytes.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(TransportError::InvalidFrame {
                reason: format!("header needs {} bytes, got {}", FRAME_HEADER_SIZE, buf.len()),
            });
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(TransportError::InvalidMagic {
                expected: MAGIC,
                got: magic,
            });
        }
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(TransportError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        let opcode = Opcode::try_from(buf.get_u8())?;
        let _flags = buf.get_u16();
        let session_id = buf.get_u64();
        let payload_length = buf.get_u32();
        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: payload_length,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            opcode,
            session_id,
            payload_length,
        })
    }

    fn encode_into(&self, dst: &mut BytesMut) {
        dst.put_u32(MAGIC);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(self.opcode as u8);
        dst.put_u16(0);
        dst.put_u64(self.session_id);
        dst.put_u32(self.payload_length);
    }
}

/// A single frame in the session protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(opcode: Opcode, session_id: SessionId, payload: Bytes) -> Self {
        let header = FrameHeader {
            opcode,
            session_id,
            payload_length: payload.len() as u32,
        };
        Self { header, payload }
    }

    /// Returns the frame's opcode
    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    /// Returns the frame's session id
    pub fn session_id(&self) -> SessionId {
        self.header.session_id
    }

    /// Connect request; `resume` carries the previous session id, if any.
    pub fn session_connect(resume: Option<SessionId>) -> Self {
        Self::new(Opcode::SessionConnect, resume.unwrap_or(0), Bytes::new())
    }

    /// Connect response.
    pub fn session_event(session_id: SessionId, body: &SessionEventBody) -> Self {
        Self::new(Opcode::SessionEvent, session_id, body.encode())
    }

    /// New leader announcement.
    pub fn new_leader(session_id: SessionId, body: &NewLeaderBody) -> Self {
        Self::new(Opcode::NewLeader, session_id, body.encode())
    }

    /// Keep-alive.
    pub fn keep_alive(session_id: SessionId) -> Self {
        Self::new(Opcode::KeepAlive, session_id, Bytes::new())
    }

    /// Application message.
    pub fn message(session_id: SessionId, payload: Bytes) -> Self {
        Self::new(Opcode::Message, session_id, payload)
    }

    /// Session close.
    pub fn close(session_id: SessionId) -> Self {
        Self::new(Opcode::Close, session_id, Bytes::new())
    }

    /// Error report carrying UTF-8 text.
    pub fn error(session_id: SessionId, details: &str) -> Self {
        Self::new(
            Opcode::Error,
            session_id,
            Bytes::copy_from_slice(details.as_bytes()),
        )
    }

    /// Payload interpreted as UTF-8 text, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Outcome code of a `SessionEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionEventCode {
    /// Session opened with this member as leader.
    Ok = 0,
    /// This member is not the leader; retry against `leader_member_id`.
    Redirect = 1,
    /// Session refused.
    Error = 2,
}

/// Payload of a `SessionEvent` frame: code:1 + leader:4 + term:8 + detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEventBody {
    /// Outcome.
    pub code: SessionEventCode,
    /// Current leader as known by the answering member.
    pub leader_member_id: MemberId,
    /// Current leadership term.
    pub leadership_term_id: u64,
    /// Free-form detail, used with `Error`.
    pub detail: String,
}

impl SessionEventBody {
    const FIXED_SIZE: usize = 13;

    /// Encodes the body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::FIXED_SIZE + self.detail.len());
        buf.put_u8(self.code as u8);
        buf.put_u32(self.leader_member_id);
        buf.put_u64(self.leadership_term_id);
        buf.put_slice(self.detail.as_bytes());
        buf.freeze()
    }

    /// Decodes a body.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::FIXED_SIZE {
            return Err(TransportError::InvalidFrame {
                reason: format!("session event body too short: {} bytes", buf.len()),
            });
        }
        let code = match buf.get_u8() {
            0 => SessionEventCode::Ok,
            1 => SessionEventCode::Redirect,
            2 => SessionEventCode::Error,
            other => {
                return Err(TransportError::InvalidFrame {
                    reason: format!("unknown session event code {}", other),
                })
            }
        };
        let leader_member_id = buf.get_u32();
        let leadership_term_id = buf.get_u64();
        let detail = String::from_utf8_lossy(buf).into_owned();
        Ok(Self {
            code,
            leader_member_id,
            leadership_term_id,
            detail,
        })
    }
}

/// Payload of a `NewLeader` frame: term:8 + leader:4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewLeaderBody {
    /// New leadership term.
    pub leadership_term_id: u64,
    /// New leader.
    pub leader_member_id: MemberId,
}

impl NewLeaderBody {
    const SIZE: usize = 12;

    /// Encodes the body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64(self.leadership_term_id);
        buf.put_u32(self.leader_member_id);
        buf.freeze()
    }

    /// Decodes a body.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(TransportError::InvalidFrame {
                reason: format!("new leader body too short: {} bytes", buf.len()),
            });
        }
        Ok(Self {
            leadership_term_id: buf.get_u64(),
            leader_member_id: buf.get_u32(),
        })
    }
}

/// `tokio_util` codec for `Frame`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Creates a codec.
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let header = FrameHeader::decode(&src[..FRAME_HEADER_SIZE])?;
        let total = FRAME_HEADER_SIZE + header.payload_length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(FRAME_HEADER_SIZE);
        let payload = src.split_to(header.payload_length as usize).freeze();
        Ok(Some(Frame { header, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(TransportError::PayloadTooLarge {
                size: frame.payload.len() as u32,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        dst.reserve(FRAME_HEADER_SIZE + frame.payload.len());
        let header = FrameHeader {
            payload_length: frame.payload.len() as u32,
            ..frame.header
        };
        header.encode_into(dst);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
