//! FORWARD-TSN chunk (RFC 3758 3.2).
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Type = 192  |  Flags = 0x00 |        Length = Variable      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      New Cumulative TSN                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Stream-1              |       Stream Sequence-1       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{require_len, ChunkError};

/// Largest SSN skipped on one ordered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardTsnStream {
    /// Stream identifier.
    pub stream_id: u16,
    /// Largest abandoned SSN on that stream.
    pub ssn: u16,
}

/// FORWARD-TSN body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ForwardTsnChunk {
    /// Receiver moves its cumulative TSN to this value.
    pub new_cumulative_tsn: u32,
    /// Ordered streams with abandoned messages.
    pub streams: Vec<ForwardTsnStream>,
}

impl ForwardTsnChunk {
    /// Decode a FORWARD-TSN value.
    pub fn unmarshal(value: Bytes) -> Result<Self, ChunkError> {
        require_len(&value, 4)?;
        if value.len() % 4 != 0 {
            return Err(ChunkError::LengthMismatch {
                declared: value.len(),
                available: value.len() - value.len() % 4,
            });
        }

        let mut reader = value;
        let new_cumulative_tsn = reader.get_u32();
        let mut streams = Vec::with_capacity(reader.remaining() / 4);
        while reader.remaining() >= 4 {
            streams.push(ForwardTsnStream {
                stream_id: reader.get_u16(),
                ssn: reader.get_u16(),
            });
        }

        Ok(Self {
            new_cumulative_tsn,
            streams,
        })
    }

    pub(crate) fn write_value(&self, buf: &mut BytesMut) {
        buf.put_u32(self.new_cumulative_tsn);
        for stream in &self.streams {
            buf.put_u16(stream.stream_id);
            buf.put_u16(stream.ssn);
        }
    }

    pub(crate) fn value_length(&self) -> usize {
        4 + 4 * self.streams.len()
    }
}
