//! RE-CONFIG chunk (RFC 6525 3.1).
//!
//! Carries one or two re-configuration parameters: a request, a response,
//! or one of each.

use bytes::{Bytes, BytesMut};

use super::{ChunkError, ChunkType};
use crate::param::Param;

/// RE-CONFIG body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconfigChunk {
    /// First parameter (mandatory).
    pub param_a: Param,
    /// Second parameter (optional).
    pub param_b: Option<Param>,
}

impl ReconfigChunk {
    /// Decode a RE-CONFIG value.
    pub fn unmarshal(value: Bytes) -> Result<Self, ChunkError> {
        let mut params = Param::unmarshal_all(&value)?.into_iter();
        let param_a = params
            .next()
            .ok_or(ChunkError::MissingParam("re-configuration parameter"))?;
        let param_b = params.next();

        for param in std::iter::once(&param_a).chain(param_b.as_ref()) {
            if !matches!(
                param,
                Param::OutgoingResetRequest(_) | Param::ReconfigResponse(_)
            ) {
                return Err(ChunkError::UnexpectedParam {
                    chunk: ChunkType::Reconfig,
                    param_type: param.param_type(),
                });
            }
        }

        Ok(Self { param_a, param_b })
    }

    pub(crate) fn write_value(&self, buf: &mut BytesMut) {
        match &self.param_b {
            Some(b) => {
                self.param_a.marshal_to(buf);
                let start = buf.len();
                b.marshal_to(buf);
                buf.truncate(start + b.unpadded_size());
            }
            None => {
                let start = buf.len();
                self.param_a.marshal_to(buf);
                buf.truncate(start + self.param_a.unpadded_size());
            }
        }
    }

    pub(crate) fn value_length(&self) -> usize {
        match &self.param_b {
            Some(b) => self.param_a.marshal_size() + b.unpadded_size(),
            None => self.param_a.unpadded_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::param::{OutgoingResetRequest, ReconfigResponse, ReconfigResult};

    #[test]
    fn test_reconfig_request_and_response() {
        let chunk = Chunk::Reconfig(ReconfigChunk {
            param_a: Param::OutgoingResetRequest(OutgoingResetRequest {
                request_sn: 10,
                response_sn: 9,
                sender_last_tsn: 1000,
                stream_ids: vec![777],
            }),
            param_b: Some(Param::ReconfigResponse(ReconfigResponse {
                response_sn: 20,
                result: ReconfigResult::SuccessPerformed,
            })),
        });
        let raw = chunk.marshal();
        // header 4 + request 18 (+2 pad) + response 12
        assert_eq!(&raw[..4], &[130, 0, 0, 36]);
        assert_eq!(raw.len(), 36);
        assert_eq!(Chunk::unmarshal(&raw).unwrap(), chunk);
    }

    #[test]
    fn test_reconfig_rejects_foreign_param() {
        let mut buf = BytesMut::new();
        Param::HeartbeatInfo(Bytes::from_static(b"hb!!")).marshal_to(&mut buf);
        assert_eq!(
            ReconfigChunk::unmarshal(buf.freeze()),
            Err(ChunkError::UnexpectedParam {
                chunk: ChunkType::Reconfig,
                param_type: 1
            })
        );
        assert_eq!(
            ReconfigChunk::unmarshal(Bytes::new()),
            Err(ChunkError::MissingParam("re-configuration parameter"))
        );
    }
}
