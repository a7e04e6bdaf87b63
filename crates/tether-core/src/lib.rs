//! Core Tether protocol types, framing, and constants.
//!
//! This crate provides:
//! - The message envelope carried over the radio link
//! - Message kind tags for the connection, Noise and contact phases
//! - Protocol-wide size limits
//!
//! # Envelope Wire Format
//!
//! All integers are big-endian.
//!
//! ```text
//! [Magic (2B)][Version (2B)][Kind (1B)][Timestamp ms (8B)]
//! [PeerIdLen (1B)][PeerId (1..=255B, UTF-8)]
//! [PayloadLen (4B)][Payload][Csum (2B)]
//! ```
//!
//! The checksum is CRC-16/KERMIT over every preceding byte. It catches link
//! corruption early; integrity against an attacker comes from the Noise layer.

#![forbid(unsafe_code)]

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const TETHER_VERSION: u16 = 1;

pub const TETHER_MAGIC: [u8; 2] = [0x54, 0x4c]; // 'TL'

/// Fixed bytes before the peer id: magic, version, kind, timestamp, peer id length.
pub const ENVELOPE_FIXED_HEADER_SIZE: usize = 14;

/// Payload length prefix plus trailing checksum.
pub const ENVELOPE_TRAILER_SIZE: usize = 6;

/// Smallest valid envelope: one-byte peer id and an empty payload.
pub const MIN_ENVELOPE_SIZE: usize = ENVELOPE_FIXED_HEADER_SIZE + 1 + ENVELOPE_TRAILER_SIZE;

/// Maximum peer id length in bytes.
pub const MAX_PEER_ID_LEN: usize = u8::MAX as usize;

/// Maximum payload accepted from the link (256 KiB).
/// Bounds allocation for a hostile length prefix.
pub const MAX_ENVELOPE_PAYLOAD: usize = 256 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope too short: {0}")]
    TooShort(usize),
    #[error("invalid magic: {0:?}")]
    InvalidMagic([u8; 2]),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u16),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("unknown message kind: {0:#04x}")]
    UnknownKind(u8),
    #[error("peer id must not be empty")]
    EmptyPeerId,
    #[error("peer id too long: {0} bytes")]
    PeerIdTooLong(usize),
    #[error("peer id is not valid UTF-8")]
    InvalidPeerId,
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("envelope truncated")]
    Truncated,
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// Type tag of a protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Transport is up and the sender is ready to negotiate.
    ConnectionReady = 0x01,
    /// Noise XX message A (-> e).
    NoiseHandshake1 = 0x10,
    /// Noise XX message B (<- e, ee, s, es).
    NoiseHandshake2 = 0x11,
    /// Noise XX message C (-> s, se).
    NoiseHandshake3 = 0x12,
    /// Encrypted contact card exchanged after the Noise handshake.
    Contact = 0x20,
    /// Encrypted application data.
    Data = 0x30,
}

impl MessageKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether the payload carries raw Noise handshake bytes.
    pub fn is_noise_handshake(self) -> bool {
        matches!(
            self,
            MessageKind::NoiseHandshake1 | MessageKind::NoiseHandshake2 | MessageKind::NoiseHandshake3
        )
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = EnvelopeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageKind::ConnectionReady),
            0x10 => Ok(MessageKind::NoiseHandshake1),
            0x11 => Ok(MessageKind::NoiseHandshake2),
            0x12 => Ok(MessageKind::NoiseHandshake3),
            0x20 => Ok(MessageKind::Contact),
            0x30 => Ok(MessageKind::Data),
            other => Err(EnvelopeError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::ConnectionReady => "connection_ready",
            MessageKind::NoiseHandshake1 => "noise_handshake_1",
            MessageKind::NoiseHandshake2 => "noise_handshake_2",
            MessageKind::NoiseHandshake3 => "noise_handshake_3",
            MessageKind::Contact => "contact",
            MessageKind::Data => "data",
        };
        f.write_str(name)
    }
}

/// A protocol message as carried by the transport.
///
/// `peer_id` always names the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub version: u16,
    pub kind: MessageKind,
    pub timestamp_ms: u64,
    pub peer_id: String,
    pub payload: Bytes,
}

impl Envelope {
    /// Build an envelope at the current protocol version.
    pub fn new(
        kind: MessageKind,
        peer_id: impl Into<String>,
        payload: impl Into<Bytes>,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            version: TETHER_VERSION,
            kind,
            timestamp_ms,
            peer_id: peer_id.into(),
            payload: payload.into(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        ENVELOPE_FIXED_HEADER_SIZE + self.peer_id.len() + ENVELOPE_TRAILER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Result<Bytes, EnvelopeError> {
        if self.peer_id.is_empty() {
            return Err(EnvelopeError::EmptyPeerId);
        }
        if self.peer_id.len() > MAX_PEER_ID_LEN {
            return Err(EnvelopeError::PeerIdTooLong(self.peer_id.len()));
        }
        if self.payload.len() > MAX_ENVELOPE_PAYLOAD {
            return Err(EnvelopeError::PayloadTooLarge(self.payload.len()));
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&TETHER_MAGIC);
        buf.put_u16(self.version);
        buf.put_u8(self.kind.as_u8());
        buf.put_u64(self.timestamp_ms);
        buf.put_u8(self.peer_id.len() as u8);
        buf.put_slice(self.peer_id.as_bytes());
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        let csum = checksum(&buf);
        buf.put_u16(csum);

        Ok(buf.freeze())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() < MIN_ENVELOPE_SIZE {
            return Err(EnvelopeError::TooShort(bytes.len()));
        }

        if bytes[0..2] != TETHER_MAGIC {
            return Err(EnvelopeError::InvalidMagic([bytes[0], bytes[1]]));
        }

        let version = u16::from_be_bytes([bytes[2], bytes[3]]);
        if version != TETHER_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(version));
        }

        let (body, csum_bytes) = bytes.split_at(bytes.len() - 2);
        let csum = u16::from_be_bytes([csum_bytes[0], csum_bytes[1]]);
        if checksum(body) != csum {
            return Err(EnvelopeError::ChecksumMismatch);
        }

        let mut buf = &body[4..];
        let kind = MessageKind::try_from(buf.get_u8())?;
        let timestamp_ms = buf.get_u64();

        let peer_len = buf.get_u8() as usize;
        if peer_len == 0 {
            return Err(EnvelopeError::EmptyPeerId);
        }
        if buf.remaining() < peer_len {
            return Err(EnvelopeError::Truncated);
        }
        let peer_id = std::str::from_utf8(&buf[..peer_len])
            .map_err(|_| EnvelopeError::InvalidPeerId)?
            .to_owned();
        buf.advance(peer_len);

        if buf.remaining() < 4 {
            return Err(EnvelopeError::Truncated);
        }
        let payload_len = buf.get_u32() as usize;
        if payload_len > MAX_ENVELOPE_PAYLOAD {
            return Err(EnvelopeError::PayloadTooLarge(payload_len));
        }
        if buf.remaining() < payload_len {
            return Err(EnvelopeError::Truncated);
        }
        if buf.remaining() > payload_len {
            return Err(EnvelopeError::TrailingBytes(buf.remaining() - payload_len));
        }

        Ok(Self {
            version,
            kind,
            timestamp_ms,
            peer_id,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}

fn checksum(data: &[u8]) -> u16 {
    let mut state = crc16::State::<crc16::KERMIT>::new();
    state.update(data);
    state.get()
}
