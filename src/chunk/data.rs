//! DATA chunk (RFC 4960 3.3.1).
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Type = 0    | Reserved|I|U|B|E|         Length              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                              TSN                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      Stream Identifier S      |   Stream Sequence Number n    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  Payload Protocol Identifier                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! \                 User Data (seq n of Stream S)                 \
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{require_len, ChunkError};

/// DATA chunk flags.
pub mod flags {
    /// Last fragment of a message.
    pub const ENDING_FRAGMENT: u8 = 0x01;
    /// First fragment of a message.
    pub const BEGINNING_FRAGMENT: u8 = 0x02;
    /// Unordered delivery.
    pub const UNORDERED: u8 = 0x04;
    /// Receiver should acknowledge immediately (RFC 7053).
    pub const IMMEDIATE_SACK: u8 = 0x08;
}

const DATA_VALUE_HEADER_SIZE: usize = 12;

/// Payload protocol identifier, opaque to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PayloadProtocolIdentifier(pub u32);

impl PayloadProtocolIdentifier {
    /// Unspecified.
    pub const UNKNOWN: Self = Self(0);
    /// UTF-8 string message.
    pub const STRING: Self = Self(51);
    /// Binary message.
    pub const BINARY: Self = Self(53);
    /// Empty UTF-8 string message.
    pub const STRING_EMPTY: Self = Self(56);
    /// Empty binary message.
    pub const BINARY_EMPTY: Self = Self(57);
}

impl fmt::Display for PayloadProtocolIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::STRING => f.write_str("String"),
            Self::BINARY => f.write_str("Binary"),
            Self::STRING_EMPTY => f.write_str("StringEmpty"),
            Self::BINARY_EMPTY => f.write_str("BinaryEmpty"),
            Self(other) => write!(f, "PPI({other})"),
        }
    }
}

/// A DATA chunk as it appears on the wire.
///
/// Sender-side retransmission bookkeeping lives in the inflight queue, not
/// here.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataChunk {
    /// Transmission sequence number.
    pub tsn: u32,
    /// Stream identifier.
    pub stream_id: u16,
    /// Stream sequence number.
    pub ssn: u16,
    /// Payload protocol identifier.
    pub ppi: PayloadProtocolIdentifier,
    /// U flag.
    pub unordered: bool,
    /// B flag.
    pub beginning_fragment: bool,
    /// E flag.
    pub ending_fragment: bool,
    /// I flag.
    pub immediate_sack: bool,
    /// User payload.
    pub user_data: Bytes,
}

impl DataChunk {
    /// Decode a DATA chunk value.
    pub fn unmarshal(chunk_flags: u8, value: Bytes) -> Result<Self, ChunkError> {
        require_len(&value, DATA_VALUE_HEADER_SIZE)?;

        let mut reader = value.clone();
        let tsn = reader.get_u32();
        let stream_id = reader.get_u16();
        let ssn = reader.get_u16();
        let ppi = PayloadProtocolIdentifier(reader.get_u32());

        Ok(Self {
            tsn,
            stream_id,
            ssn,
            ppi,
            unordered: chunk_flags & flags::UNORDERED != 0,
            beginning_fragment: chunk_flags & flags::BEGINNING_FRAGMENT != 0,
            ending_fragment: chunk_flags & flags::ENDING_FRAGMENT != 0,
            immediate_sack: chunk_flags & flags::IMMEDIATE_SACK != 0,
            user_data: value.slice(DATA_VALUE_HEADER_SIZE..),
        })
    }

    pub(crate) fn write_value(&self, buf: &mut BytesMut) {
        buf.put_u32(self.tsn);
        buf.put_u16(self.stream_id);
        buf.put_u16(self.ssn);
        buf.put_u32(self.ppi.0);
        buf.put_slice(&self.user_data);
    }

    pub(crate) fn value_length(&self) -> usize {
        DATA_VALUE_HEADER_SIZE + self.user_data.len()
    }

    pub(crate) fn flags(&self) -> u8 {
        let mut out = 0;
        if self.ending_fragment {
            out |= flags::ENDING_FRAGMENT;
        }
        if self.beginning_fragment {
            out |= flags::BEGINNING_FRAGMENT;
        }
        if self.unordered {
            out |= flags::UNORDERED;
        }
        if self.immediate_sack {
            out |= flags::IMMEDIATE_SACK;
        }
        out
    }

    /// True unless the chunk carries a whole message (both B and E set).
    pub fn is_fragmented(&self) -> bool {
        !(self.beginning_fragment && self.ending_fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;

    #[test]
    fn test_data_wire_format() {
        let chunk = Chunk::Data(DataChunk {
            tsn: 0x0102_0304,
            stream_id: 777,
            ssn: 5,
            ppi: PayloadProtocolIdentifier::BINARY,
            unordered: true,
            beginning_fragment: true,
            ending_fragment: true,
            immediate_sack: false,
            user_data: Bytes::from_static(b"HELLO"),
        });

        let raw = chunk.marshal();
        assert_eq!(
            hex::encode(&raw),
            // type, flags U|B|E, length 21, tsn, si, ssn, ppi, "HELLO", pad
            "0007001501020304030900050000003548454c4c4f000000"
        );
        assert_eq!(Chunk::unmarshal(&raw).unwrap(), chunk);
    }

    #[test]
    fn test_data_too_short() {
        let raw = Bytes::from(hex::decode("0003000c0000000100010000").unwrap());
        assert_eq!(
            Chunk::unmarshal(&raw),
            Err(ChunkError::TooShort {
                expected: 12,
                actual: 8
            })
        );
    }

    #[test]
    fn test_is_fragmented() {
        let mut chunk = DataChunk {
            beginning_fragment: true,
            ending_fragment: true,
            ..Default::default()
        };
        assert!(!chunk.is_fragmented());
        chunk.ending_fragment = false;
        assert!(chunk.is_fragmented());
        chunk.beginning_fragment = false;
        assert!(chunk.is_fragmented());
    }

    #[test]
    fn test_ppi_display() {
        assert_eq!(PayloadProtocolIdentifier::BINARY.to_string(), "Binary");
        assert_eq!(PayloadProtocolIdentifier(99).to_string(), "PPI(99)");
    }
}
