//! Chunk encoding and decoding (RFC 4960 3.2).
//!
//! Every chunk shares a 4-byte header:
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Chunk Type  | Chunk  Flags  |        Chunk Length           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! \                          Chunk Value                          \
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The length covers header and value but not the zero padding that aligns
//! the next chunk on a 4-byte boundary.

mod control;
mod data;
mod forward_tsn;
mod init;
mod reconfig;
mod sack;

pub use control::*;
pub use data::*;
pub use forward_tsn::*;
pub use init::*;
pub use reconfig::*;
pub use sack::*;

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::core::{CHUNK_HEADER_SIZE, PADDING_MULTIPLE};

/// Chunk type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChunkType {
    /// Payload data.
    Data = 0,
    /// Initiation.
    Init = 1,
    /// Initiation acknowledgement.
    InitAck = 2,
    /// Selective acknowledgement.
    Sack = 3,
    /// Heartbeat request.
    Heartbeat = 4,
    /// Heartbeat acknowledgement.
    HeartbeatAck = 5,
    /// Abort.
    Abort = 6,
    /// Shutdown.
    Shutdown = 7,
    /// Shutdown acknowledgement.
    ShutdownAck = 8,
    /// Operation error.
    Error = 9,
    /// State cookie.
    CookieEcho = 10,
    /// Cookie acknowledgement.
    CookieAck = 11,
    /// Shutdown complete.
    ShutdownComplete = 14,
    /// Re-configuration (RFC 6525).
    Reconfig = 130,
    /// Forward cumulative TSN (RFC 3758).
    ForwardTsn = 192,
}

impl ChunkType {
    /// Parse a chunk type from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Data),
            1 => Some(Self::Init),
            2 => Some(Self::InitAck),
            3 => Some(Self::Sack),
            4 => Some(Self::Heartbeat),
            5 => Some(Self::HeartbeatAck),
            6 => Some(Self::Abort),
            7 => Some(Self::Shutdown),
            8 => Some(Self::ShutdownAck),
            9 => Some(Self::Error),
            10 => Some(Self::CookieEcho),
            11 => Some(Self::CookieAck),
            14 => Some(Self::ShutdownComplete),
            130 => Some(Self::Reconfig),
            192 => Some(Self::ForwardTsn),
            _ => None,
        }
    }

    /// Convert the chunk type to its byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Data => "DATA",
            Self::Init => "INIT",
            Self::InitAck => "INIT-ACK",
            Self::Sack => "SACK",
            Self::Heartbeat => "HEARTBEAT",
            Self::HeartbeatAck => "HEARTBEAT-ACK",
            Self::Abort => "ABORT",
            Self::Shutdown => "SHUTDOWN",
            Self::ShutdownAck => "SHUTDOWN-ACK",
            Self::Error => "ERROR",
            Self::CookieEcho => "COOKIE-ECHO",
            Self::CookieAck => "COOKIE-ACK",
            Self::ShutdownComplete => "SHUTDOWN-COMPLETE",
            Self::Reconfig => "RECONFIG",
            Self::ForwardTsn => "FORWARD-TSN",
        };
        f.write_str(name)
    }
}

/// What a receiver does with a chunk whose type it does not recognize,
/// taken from the two highest bits of the type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnrecognizedAction {
    /// `00`: stop processing the packet.
    Stop,
    /// `01`: stop processing and report in an ERROR chunk.
    StopAndReport,
    /// `10`: skip the chunk and continue.
    Skip,
    /// `11`: skip the chunk, continue, and report in an ERROR chunk.
    SkipAndReport,
}

impl UnrecognizedAction {
    /// Decode the action bits of a chunk type byte.
    pub fn from_type_byte(typ: u8) -> Self {
        match typ >> 6 {
            0b00 => Self::Stop,
            0b01 => Self::StopAndReport,
            0b10 => Self::Skip,
            _ => Self::SkipAndReport,
        }
    }

    /// Whether processing of the packet continues after this chunk.
    pub fn skips(self) -> bool {
        matches!(self, Self::Skip | Self::SkipAndReport)
    }

    /// Whether the chunk is reported back to the peer.
    pub fn reports(self) -> bool {
        matches!(self, Self::StopAndReport | Self::SkipAndReport)
    }
}

/// Errors from chunk, parameter and packet decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChunkError {
    /// Input shorter than the fixed part of the structure.
    #[error("too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum number of bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Declared length disagrees with the bytes available.
    #[error("length mismatch: declared {declared} bytes, {available} available")]
    LengthMismatch {
        /// Length field value.
        declared: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// Type byte does not name a known chunk.
    #[error("unrecognized chunk type: {0}")]
    UnrecognizedType(u8),

    /// A mandatory parameter is absent.
    #[error("missing mandatory parameter: {0}")]
    MissingParam(&'static str),

    /// A parameter of an unexpected type was found.
    #[error("unexpected parameter type {param_type:#06x} in {chunk}")]
    UnexpectedParam {
        /// Chunk being decoded.
        chunk: ChunkType,
        /// Offending parameter type.
        param_type: u16,
    },

    /// Unknown reconfiguration result code.
    #[error("invalid reconfig result: {0}")]
    InvalidReconfigResult(u32),

    /// Packet checksum does not match its content.
    #[error("checksum mismatch: header {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the header.
        expected: u32,
        /// Checksum computed over the packet.
        actual: u32,
    },

    /// INIT bundled with other chunks.
    #[error("INIT chunk must not be bundled with other chunks")]
    InitNotAlone,

    /// INIT carried in a packet with a non-zero verification tag.
    #[error("INIT chunk expects a zero verification tag, got {0:#010x}")]
    InitNonZeroTag(u32),
}

/// Decoded chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Raw type byte.
    pub typ: u8,
    /// Raw flags byte.
    pub flags: u8,
    /// Length of header plus value, excluding padding.
    pub length: u16,
}

impl ChunkHeader {
    /// Parse and validate the header at the start of `raw`.
    pub fn parse(raw: &[u8]) -> Result<Self, ChunkError> {
        if raw.len() < CHUNK_HEADER_SIZE {
            return Err(ChunkError::TooShort {
                expected: CHUNK_HEADER_SIZE,
                actual: raw.len(),
            });
        }

        let length = u16::from_be_bytes([raw[2], raw[3]]);
        if (length as usize) < CHUNK_HEADER_SIZE || length as usize > raw.len() {
            return Err(ChunkError::LengthMismatch {
                declared: length as usize,
                available: raw.len(),
            });
        }

        Ok(Self {
            typ: raw[0],
            flags: raw[1],
            length,
        })
    }

    /// Length of the chunk value.
    pub fn value_length(&self) -> usize {
        self.length as usize - CHUNK_HEADER_SIZE
    }
}

/// Number of zero bytes needed to align `len` on a 4-byte boundary.
pub(crate) fn padding_len(len: usize) -> usize {
    (PADDING_MULTIPLE - len % PADDING_MULTIPLE) % PADDING_MULTIPLE
}

/// `len` rounded up to a 4-byte boundary.
pub(crate) fn padded(len: usize) -> usize {
    len + padding_len(len)
}

/// Ensure `value` holds at least `expected` bytes.
pub(crate) fn require_len(value: &[u8], expected: usize) -> Result<(), ChunkError> {
    if value.len() < expected {
        return Err(ChunkError::TooShort {
            expected,
            actual: value.len(),
        });
    }
    Ok(())
}

/// A chunk whose type byte is not recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownChunk {
    /// Raw type byte.
    pub typ: u8,
    /// Raw flags byte.
    pub flags: u8,
    /// Chunk value, unpadded.
    pub value: Bytes,
}

impl UnknownChunk {
    /// Action requested by the type byte's high bits.
    pub fn action(&self) -> UnrecognizedAction {
        UnrecognizedAction::from_type_byte(self.typ)
    }
}

/// Every chunk this engine understands, plus an explicit `Unknown` variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// DATA.
    Data(DataChunk),
    /// INIT.
    Init(InitChunk),
    /// INIT-ACK.
    InitAck(InitChunk),
    /// SACK.
    Sack(SackChunk),
    /// HEARTBEAT.
    Heartbeat(HeartbeatChunk),
    /// HEARTBEAT-ACK.
    HeartbeatAck(HeartbeatChunk),
    /// ABORT.
    Abort(AbortChunk),
    /// SHUTDOWN.
    Shutdown(ShutdownChunk),
    /// SHUTDOWN-ACK.
    ShutdownAck,
    /// ERROR.
    Error(ErrorChunk),
    /// COOKIE-ECHO.
    CookieEcho(CookieEchoChunk),
    /// COOKIE-ACK.
    CookieAck,
    /// SHUTDOWN-COMPLETE.
    ShutdownComplete(ShutdownCompleteChunk),
    /// RE-CONFIG.
    Reconfig(ReconfigChunk),
    /// FORWARD-TSN.
    ForwardTsn(ForwardTsnChunk),
    /// Unrecognized chunk type, kept so dispatch can honour its action bits.
    Unknown(UnknownChunk),
}

impl Chunk {
    /// Decode one chunk from the start of `raw`.
    ///
    /// `raw` may extend past the chunk (padding, following chunks); only the
    /// declared length is consumed.
    pub fn unmarshal(raw: &Bytes) -> Result<Self, ChunkError> {
        let header = ChunkHeader::parse(raw)?;
        let value = raw.slice(CHUNK_HEADER_SIZE..header.length as usize);
        let typ =
            ChunkType::from_byte(header.typ).ok_or(ChunkError::UnrecognizedType(header.typ))?;

        let chunk = match typ {
            ChunkType::Data => Self::Data(DataChunk::unmarshal(header.flags, value)?),
            ChunkType::Init => Self::Init(InitChunk::unmarshal(typ, value)?),
            ChunkType::InitAck => Self::InitAck(InitChunk::unmarshal(typ, value)?),
            ChunkType::Sack => Self::Sack(SackChunk::unmarshal(value)?),
            ChunkType::Heartbeat => Self::Heartbeat(HeartbeatChunk::unmarshal(typ, value)?),
            ChunkType::HeartbeatAck => {
                Self::HeartbeatAck(HeartbeatChunk::unmarshal(typ, value)?)
            }
            ChunkType::Abort => Self::Abort(AbortChunk::unmarshal(header.flags, value)?),
            ChunkType::Shutdown => Self::Shutdown(ShutdownChunk::unmarshal(value)?),
            ChunkType::ShutdownAck => Self::ShutdownAck,
            ChunkType::Error => Self::Error(ErrorChunk::unmarshal(value)?),
            ChunkType::CookieEcho => Self::CookieEcho(CookieEchoChunk::unmarshal(value)?),
            ChunkType::CookieAck => Self::CookieAck,
            ChunkType::ShutdownComplete => {
                Self::ShutdownComplete(ShutdownCompleteChunk::from_flags(header.flags))
            }
            ChunkType::Reconfig => Self::Reconfig(ReconfigChunk::unmarshal(value)?),
            ChunkType::ForwardTsn => Self::ForwardTsn(ForwardTsnChunk::unmarshal(value)?),
        };
        Ok(chunk)
    }

    /// Encode the chunk, including trailing padding.
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.marshal_size());
        self.marshal_to(&mut buf);
        buf.freeze()
    }

    /// Append the encoded chunk, including trailing padding, to `buf`.
    pub fn marshal_to(&self, buf: &mut BytesMut) {
        let length = CHUNK_HEADER_SIZE + self.value_length();
        buf.put_u8(self.type_byte());
        buf.put_u8(self.flags());
        buf.put_u16(length as u16);

        match self {
            Self::Data(c) => c.write_value(buf),
            Self::Init(c) | Self::InitAck(c) => c.write_value(buf),
            Self::Sack(c) => c.write_value(buf),
            Self::Heartbeat(c) | Self::HeartbeatAck(c) => c.write_value(buf),
            Self::Abort(c) => c.write_value(buf),
            Self::Shutdown(c) => c.write_value(buf),
            Self::Error(c) => c.write_value(buf),
            Self::CookieEcho(c) => buf.put_slice(&c.cookie),
            Self::Reconfig(c) => c.write_value(buf),
            Self::ForwardTsn(c) => c.write_value(buf),
            Self::Unknown(c) => buf.put_slice(&c.value),
            Self::ShutdownAck | Self::CookieAck | Self::ShutdownComplete(_) => {}
        }

        buf.put_bytes(0, padding_len(length));
    }

    /// Size on the wire, including padding.
    pub fn marshal_size(&self) -> usize {
        padded(CHUNK_HEADER_SIZE + self.value_length())
    }

    /// Raw type byte.
    pub fn type_byte(&self) -> u8 {
        match self {
            Self::Unknown(c) => c.typ,
            _ => self.chunk_type().map_or(0, ChunkType::as_byte),
        }
    }

    /// Known chunk type, `None` for [`Chunk::Unknown`].
    pub fn chunk_type(&self) -> Option<ChunkType> {
        let typ = match self {
            Self::Data(_) => ChunkType::Data,
            Self::Init(_) => ChunkType::Init,
            Self::InitAck(_) => ChunkType::InitAck,
            Self::Sack(_) => ChunkType::Sack,
            Self::Heartbeat(_) => ChunkType::Heartbeat,
            Self::HeartbeatAck(_) => ChunkType::HeartbeatAck,
            Self::Abort(_) => ChunkType::Abort,
            Self::Shutdown(_) => ChunkType::Shutdown,
            Self::ShutdownAck => ChunkType::ShutdownAck,
            Self::Error(_) => ChunkType::Error,
            Self::CookieEcho(_) => ChunkType::CookieEcho,
            Self::CookieAck => ChunkType::CookieAck,
            Self::ShutdownComplete(_) => ChunkType::ShutdownComplete,
            Self::Reconfig(_) => ChunkType::Reconfig,
            Self::ForwardTsn(_) => ChunkType::ForwardTsn,
            Self::Unknown(_) => return None,
        };
        Some(typ)
    }

    fn flags(&self) -> u8 {
        match self {
            Self::Data(c) => c.flags(),
            Self::Abort(c) => c.flags(),
            Self::ShutdownComplete(c) => c.flags(),
            Self::Unknown(c) => c.flags,
            _ => 0,
        }
    }

    fn value_length(&self) -> usize {
        match self {
            Self::Data(c) => c.value_length(),
            Self::Init(c) | Self::InitAck(c) => c.value_length(),
            Self::Sack(c) => c.value_length(),
            Self::Heartbeat(c) | Self::HeartbeatAck(c) => c.value_length(),
            Self::Abort(c) => c.value_length(),
            Self::Shutdown(_) => ShutdownChunk::VALUE_LENGTH,
            Self::Error(c) => c.value_length(),
            Self::CookieEcho(c) => c.cookie.len(),
            Self::Reconfig(c) => c.value_length(),
            Self::ForwardTsn(c) => c.value_length(),
            Self::Unknown(c) => c.value.len(),
            Self::ShutdownAck | Self::CookieAck | Self::ShutdownComplete(_) => 0,
        }
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(c) => write!(
                f,
                "DATA tsn={} si={} ssn={} len={}",
                c.tsn,
                c.stream_id,
                c.ssn,
                c.user_data.len()
            ),
            Self::Sack(c) => write!(
                f,
                "SACK cum={} a_rwnd={} gaps={} dups={}",
                c.cumulative_tsn_ack,
                c.a_rwnd,
                c.gap_ack_blocks.len(),
                c.duplicate_tsns.len()
            ),
            Self::Unknown(c) => write!(f, "UNKNOWN({})", c.typ),
            _ => match self.chunk_type() {
                Some(typ) => write!(f, "{typ}"),
                None => f.write_str("UNKNOWN"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_type_roundtrip() {
        for byte in [0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 14, 130, 192] {
            let typ = ChunkType::from_byte(byte).unwrap();
            assert_eq!(typ.as_byte(), byte);
        }
        assert!(ChunkType::from_byte(12).is_none());
        assert!(ChunkType::from_byte(0xFF).is_none());
    }

    #[test]
    fn test_unrecognized_action_bits() {
        assert_eq!(UnrecognizedAction::from_type_byte(0x3F), UnrecognizedAction::Stop);
        assert_eq!(
            UnrecognizedAction::from_type_byte(0x40),
            UnrecognizedAction::StopAndReport
        );
        assert_eq!(UnrecognizedAction::from_type_byte(0x80), UnrecognizedAction::Skip);
        assert_eq!(
            UnrecognizedAction::from_type_byte(0xC1),
            UnrecognizedAction::SkipAndReport
        );
        assert!(UnrecognizedAction::Skip.skips());
        assert!(!UnrecognizedAction::Stop.skips());
        assert!(UnrecognizedAction::StopAndReport.reports());
    }

    #[test]
    fn test_header_length_mismatch() {
        // Declares 12 bytes, only 8 present.
        let raw = hex::decode("0b00000c00000000").unwrap();
        assert_eq!(
            ChunkHeader::parse(&raw),
            Err(ChunkError::LengthMismatch {
                declared: 12,
                available: 8
            })
        );

        // Length below the header size.
        let raw = hex::decode("0b000002").unwrap();
        assert!(matches!(
            ChunkHeader::parse(&raw),
            Err(ChunkError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_unmarshal_unknown_type() {
        let raw = Bytes::from(hex::decode("3f000004").unwrap());
        assert_eq!(Chunk::unmarshal(&raw), Err(ChunkError::UnrecognizedType(0x3f)));
    }

    #[test]
    fn test_cookie_ack_wire_format() {
        let chunk = Chunk::CookieAck;
        assert_eq!(hex::encode(chunk.marshal()), "0b000004");

        let raw = Bytes::from(hex::decode("0b000004").unwrap());
        assert_eq!(Chunk::unmarshal(&raw).unwrap(), Chunk::CookieAck);
    }

    #[test]
    fn test_padding_is_emitted() {
        let chunk = Chunk::CookieEcho(CookieEchoChunk {
            cookie: Bytes::from_static(b"abcde"),
        });
        let raw = chunk.marshal();
        // 4 header + 5 value + 3 padding
        assert_eq!(raw.len(), 12);
        assert_eq!(&raw[2..4], &[0, 9]);
        assert_eq!(&raw[9..], &[0, 0, 0]);
        assert_eq!(chunk.marshal_size(), 12);

        let decoded = Chunk::unmarshal(&raw).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn test_padding_helpers() {
        assert_eq!(padding_len(0), 0);
        assert_eq!(padding_len(5), 3);
        assert_eq!(padding_len(8), 0);
        assert_eq!(padded(13), 16);
    }
}
