//! SACK chunk (RFC 4960 3.3.4).
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Type = 3    |Chunk  Flags   |      Chunk Length             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Cumulative TSN Ack                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Advertised Receiver Window Credit (a_rwnd)           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Number of Gap Ack Blocks = N  |  Number of Duplicate TSNs = X |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Gap Ack Block #1 Start       |   Gap Ack Block #1 End        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Duplicate TSN 1                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Gap block offsets are relative to the cumulative TSN ack.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{require_len, ChunkError};

const SACK_FIXED_SIZE: usize = 12;

/// One gap ack block: TSNs `cum + start ..= cum + end` were received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GapAckBlock {
    /// Start offset from the cumulative TSN ack.
    pub start: u16,
    /// End offset from the cumulative TSN ack.
    pub end: u16,
}

/// SACK body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SackChunk {
    /// Highest TSN received in sequence.
    pub cumulative_tsn_ack: u32,
    /// Advertised receiver window credit.
    pub a_rwnd: u32,
    /// Blocks of TSNs received above the cumulative ack.
    pub gap_ack_blocks: Vec<GapAckBlock>,
    /// TSNs received more than once since the last SACK.
    pub duplicate_tsns: Vec<u32>,
}

impl SackChunk {
    /// Decode a SACK value.
    pub fn unmarshal(value: Bytes) -> Result<Self, ChunkError> {
        require_len(&value, SACK_FIXED_SIZE)?;

        let mut reader = value;
        let cumulative_tsn_ack = reader.get_u32();
        let a_rwnd = reader.get_u32();
        let num_gaps = reader.get_u16() as usize;
        let num_dups = reader.get_u16() as usize;

        let declared = SACK_FIXED_SIZE + 4 * num_gaps + 4 * num_dups;
        if reader.remaining() != declared - SACK_FIXED_SIZE {
            return Err(ChunkError::LengthMismatch {
                declared,
                available: SACK_FIXED_SIZE + reader.remaining(),
            });
        }

        let gap_ack_blocks = (0..num_gaps)
            .map(|_| GapAckBlock {
                start: reader.get_u16(),
                end: reader.get_u16(),
            })
            .collect();
        let duplicate_tsns = (0..num_dups).map(|_| reader.get_u32()).collect();

        Ok(Self {
            cumulative_tsn_ack,
            a_rwnd,
            gap_ack_blocks,
            duplicate_tsns,
        })
    }

    pub(crate) fn write_value(&self, buf: &mut BytesMut) {
        buf.put_u32(self.cumulative_tsn_ack);
        buf.put_u32(self.a_rwnd);
        buf.put_u16(self.gap_ack_blocks.len() as u16);
        buf.put_u16(self.duplicate_tsns.len() as u16);
        for block in &self.gap_ack_blocks {
            buf.put_u16(block.start);
            buf.put_u16(block.end);
        }
        for tsn in &self.duplicate_tsns {
            buf.put_u32(*tsn);
        }
    }

    pub(crate) fn value_length(&self) -> usize {
        SACK_FIXED_SIZE + 4 * self.gap_ack_blocks.len() + 4 * self.duplicate_tsns.len()
    }
}
