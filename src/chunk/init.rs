//! INIT and INIT-ACK chunks (RFC 4960 3.3.2, 3.3.3).
//!
//! Both share one layout:
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Type = 1/2  |  Chunk Flags  |      Chunk Length             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Initiate Tag                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Advertised Receiver Window Credit (a_rwnd)          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Number of Outbound Streams   |  Number of Inbound Streams    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Initial TSN                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! \              Optional/Variable-Length Parameters              \
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{padded, require_len, ChunkError, ChunkType};
use crate::param::Param;

const INIT_FIXED_SIZE: usize = 16;

/// INIT or INIT-ACK body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InitChunk {
    /// Tag the receiver must place in every packet it sends back.
    pub initiate_tag: u32,
    /// Advertised receiver window credit.
    pub a_rwnd: u32,
    /// Streams the sender intends to open.
    pub num_outbound_streams: u16,
    /// Streams the sender accepts.
    pub num_inbound_streams: u16,
    /// First TSN the sender will use.
    pub initial_tsn: u32,
    /// Optional and variable-length parameters.
    pub params: Vec<Param>,
}

impl InitChunk {
    /// Decode an INIT/INIT-ACK value.
    pub fn unmarshal(typ: ChunkType, value: Bytes) -> Result<Self, ChunkError> {
        require_len(&value, INIT_FIXED_SIZE)?;

        let mut reader = value.clone();
        let initiate_tag = reader.get_u32();
        let a_rwnd = reader.get_u32();
        let num_outbound_streams = reader.get_u16();
        let num_inbound_streams = reader.get_u16();
        let initial_tsn = reader.get_u32();
        let params = Param::unmarshal_all(&value.slice(INIT_FIXED_SIZE..))?;

        if typ == ChunkType::InitAck && !params.iter().any(|p| matches!(p, Param::StateCookie(_)))
        {
            return Err(ChunkError::MissingParam("state cookie"));
        }

        Ok(Self {
            initiate_tag,
            a_rwnd,
            num_outbound_streams,
            num_inbound_streams,
            initial_tsn,
            params,
        })
    }

    pub(crate) fn write_value(&self, buf: &mut BytesMut) {
        buf.put_u32(self.initiate_tag);
        buf.put_u32(self.a_rwnd);
        buf.put_u16(self.num_outbound_streams);
        buf.put_u16(self.num_inbound_streams);
        buf.put_u32(self.initial_tsn);

        // The last parameter is left unpadded; the chunk adds its own padding.
        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            if i == last {
                let start = buf.len();
                param.marshal_to(buf);
                buf.truncate(start + param.unpadded_size());
            } else {
                param.marshal_to(buf);
            }
        }
    }

    pub(crate) fn value_length(&self) -> usize {
        let last = self.params.len().saturating_sub(1);
        INIT_FIXED_SIZE
            + self
                .params
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    if i == last {
                        p.unpadded_size()
                    } else {
                        padded(p.unpadded_size())
                    }
                })
                .sum::<usize>()
    }

    /// State cookie parameter, if present.
    pub fn state_cookie(&self) -> Option<&Bytes> {
        self.params.iter().find_map(|p| match p {
            Param::StateCookie(cookie) => Some(cookie),
            _ => None,
        })
    }

    /// Whether the sender advertised FORWARD-TSN support.
    pub fn supports_forward_tsn(&self) -> bool {
        self.params.iter().any(|p| match p {
            Param::ForwardTsnSupported => true,
            Param::SupportedExtensions(types) => types.contains(&ChunkType::ForwardTsn.as_byte()),
            _ => false,
        })
    }

    /// Whether the sender advertised RE-CONFIG support.
    pub fn supports_reconfig(&self) -> bool {
        self.params.iter().any(|p| match p {
            Param::SupportedExtensions(types) => types.contains(&ChunkType::Reconfig.as_byte()),
            _ => false,
        })
    }

    /// Unknown parameters the receiver must report back (type bit `0x4000`).
    pub fn unrecognized_params_to_report(&self) -> Vec<Param> {
        self.params
            .iter()
            .filter(|p| matches!(p, Param::Unknown { .. }) && p.reports_when_unknown())
            .cloned()
            .collect()
    }
}
