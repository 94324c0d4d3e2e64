//! Packet encoding and decoding (RFC 4960 3.1).
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Source Port Number        |     Destination Port Number   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Verification Tag                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Checksum                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The CRC32c checksum is computed over the whole packet with the checksum
//! field zeroed and stored little-endian.

use bytes::{BufMut, Bytes, BytesMut};

use crate::chunk::{padded, Chunk, ChunkError, ChunkHeader, UnknownChunk};
use crate::core::{CHUNK_HEADER_SIZE, COMMON_HEADER_SIZE};

const CHECKSUM_OFFSET: usize = 8;

/// A decoded SCTP packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    /// Source port.
    pub source_port: u16,
    /// Destination port.
    pub destination_port: u16,
    /// Verification tag.
    pub verification_tag: u32,
    /// Bundled chunks, in wire order.
    pub chunks: Vec<Chunk>,
}

impl Packet {
    /// Decode and validate a packet.
    ///
    /// Chunks with an unrecognized type are kept as [`Chunk::Unknown`] so the
    /// receiver can apply their action bits.
    pub fn unmarshal(raw: &Bytes) -> Result<Self, ChunkError> {
        if raw.len() < COMMON_HEADER_SIZE {
            return Err(ChunkError::TooShort {
                expected: COMMON_HEADER_SIZE,
                actual: raw.len(),
            });
        }

        let expected = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
        let actual = checksum(raw);
        if expected != actual {
            return Err(ChunkError::ChecksumMismatch { expected, actual });
        }

        let mut chunks = Vec::new();
        let mut offset = COMMON_HEADER_SIZE;
        while offset < raw.len() {
            let remaining = raw.slice(offset..);
            let header = ChunkHeader::parse(&remaining)?;
            let chunk = match Chunk::unmarshal(&remaining) {
                Ok(chunk) => chunk,
                Err(ChunkError::UnrecognizedType(typ)) => Chunk::Unknown(UnknownChunk {
                    typ,
                    flags: header.flags,
                    value: remaining.slice(CHUNK_HEADER_SIZE..header.length as usize),
                }),
                Err(e) => return Err(e),
            };
            chunks.push(chunk);
            offset += padded(header.length as usize);
        }

        let packet = Self {
            source_port: u16::from_be_bytes([raw[0], raw[1]]),
            destination_port: u16::from_be_bytes([raw[2], raw[3]]),
            verification_tag: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
            chunks,
        };
        packet.check()?;
        Ok(packet)
    }

    /// Enforce the bundling rules for INIT (RFC 4960 6.10, 8.5.1).
    fn check(&self) -> Result<(), ChunkError> {
        if self.chunks.iter().any(|c| matches!(c, Chunk::Init(_))) {
            if self.chunks.len() != 1 {
                return Err(ChunkError::InitNotAlone);
            }
            if self.verification_tag != 0 {
                return Err(ChunkError::InitNonZeroTag(self.verification_tag));
            }
        }
        Ok(())
    }

    /// Append the encoded packet, with checksum, to `buf`.
    pub fn marshal_to(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u16(self.source_port);
        buf.put_u16(self.destination_port);
        buf.put_u32(self.verification_tag);
        buf.put_u32(0);
        for chunk in &self.chunks {
            chunk.marshal_to(buf);
        }

        let sum = checksum(&buf[start..]);
        buf[start + CHECKSUM_OFFSET..start + COMMON_HEADER_SIZE]
            .copy_from_slice(&sum.to_le_bytes());
    }

    /// Encode the packet.
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.marshal_size());
        self.marshal_to(&mut buf);
        buf.freeze()
    }

    /// Size on the wire.
    pub fn marshal_size(&self) -> usize {
        COMMON_HEADER_SIZE + self.chunks.iter().map(Chunk::marshal_size).sum::<usize>()
    }
}

/// CRC32c of `raw` with the checksum field treated as zero.
fn checksum(raw: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&raw[..CHECKSUM_OFFSET]);
    let crc = crc32c::crc32c_append(crc, &[0u8; 4]);
    crc32c::crc32c_append(crc, &raw[COMMON_HEADER_SIZE..])
}
