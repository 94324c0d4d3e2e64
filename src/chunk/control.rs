//! Small control chunks: HEARTBEAT(-ACK), ABORT, ERROR, SHUTDOWN,
//! SHUTDOWN-COMPLETE and COOKIE-ECHO.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{require_len, ChunkError, ChunkType};
use crate::error_cause::ErrorCause;
use crate::param::Param;

/// T bit: the verification tag is the one the receiver of this chunk
/// expects from its peer, reflected back.
const FLAG_T: u8 = 0x01;

/// HEARTBEAT / HEARTBEAT-ACK body (RFC 4960 3.3.5, 3.3.6).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeartbeatChunk {
    /// Opaque sender-specific information, echoed by the acknowledgement.
    pub info: Bytes,
}

impl HeartbeatChunk {
    /// Decode a HEARTBEAT/HEARTBEAT-ACK value.
    pub fn unmarshal(typ: ChunkType, value: Bytes) -> Result<Self, ChunkError> {
        let params = Param::unmarshal_all(&value)?;
        match params.into_iter().next() {
            Some(Param::HeartbeatInfo(info)) => Ok(Self { info }),
            Some(other) => Err(ChunkError::UnexpectedParam {
                chunk: typ,
                param_type: other.param_type(),
            }),
            None => Err(ChunkError::MissingParam("heartbeat info")),
        }
    }

    pub(crate) fn write_value(&self, buf: &mut BytesMut) {
        let param = Param::HeartbeatInfo(self.info.clone());
        let start = buf.len();
        param.marshal_to(buf);
        buf.truncate(start + param.unpadded_size());
    }

    pub(crate) fn value_length(&self) -> usize {
        Param::HeartbeatInfo(self.info.clone()).unpadded_size()
    }
}

fn write_causes(causes: &[ErrorCause], buf: &mut BytesMut) {
    for cause in causes {
        cause.marshal_to(buf);
    }
    // The chunk pads itself; drop the last cause's padding.
    if let Some(last) = causes.last() {
        buf.truncate(buf.len() - (last.marshal_size() - last.unpadded_size()));
    }
}

fn causes_length(causes: &[ErrorCause]) -> usize {
    let total: usize = causes.iter().map(ErrorCause::marshal_size).sum();
    causes
        .last()
        .map_or(0, |last| total - (last.marshal_size() - last.unpadded_size()))
}

/// ABORT body (RFC 4960 3.3.7).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AbortChunk {
    /// T bit.
    pub reflected_tag: bool,
    /// Reasons for the abort.
    pub causes: Vec<ErrorCause>,
}

impl AbortChunk {
    /// Abort with a single cause.
    pub fn with_cause(cause: ErrorCause) -> Self {
        Self {
            reflected_tag: false,
            causes: vec![cause],
        }
    }

    /// Decode an ABORT value.
    pub fn unmarshal(flags: u8, value: Bytes) -> Result<Self, ChunkError> {
        Ok(Self {
            reflected_tag: flags & FLAG_T != 0,
            causes: ErrorCause::unmarshal_all(&value)?,
        })
    }

    pub(crate) fn flags(&self) -> u8 {
        if self.reflected_tag { FLAG_T } else { 0 }
    }

    pub(crate) fn write_value(&self, buf: &mut BytesMut) {
        write_causes(&self.causes, buf);
    }

    pub(crate) fn value_length(&self) -> usize {
        causes_length(&self.causes)
    }
}

/// ERROR body (RFC 4960 3.3.10).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorChunk {
    /// Reported errors.
    pub causes: Vec<ErrorCause>,
}

impl ErrorChunk {
    /// Decode an ERROR value.
    pub fn unmarshal(value: Bytes) -> Result<Self, ChunkError> {
        Ok(Self {
            causes: ErrorCause::unmarshal_all(&value)?,
        })
    }

    pub(crate) fn write_value(&self, buf: &mut BytesMut) {
        write_causes(&self.causes, buf);
    }

    pub(crate) fn value_length(&self) -> usize {
        causes_length(&self.causes)
    }
}

/// SHUTDOWN body (RFC 4960 3.3.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownChunk {
    /// Last TSN received in sequence by the sender of the SHUTDOWN.
    pub cumulative_tsn_ack: u32,
}

impl ShutdownChunk {
    pub(crate) const VALUE_LENGTH: usize = 4;

    /// Decode a SHUTDOWN value.
    pub fn unmarshal(value: Bytes) -> Result<Self, ChunkError> {
        if value.len() != Self::VALUE_LENGTH {
            return Err(ChunkError::LengthMismatch {
                declared: Self::VALUE_LENGTH,
                available: value.len(),
            });
        }
        let mut reader = value;
        Ok(Self {
            cumulative_tsn_ack: reader.get_u32(),
        })
    }

    pub(crate) fn write_value(&self, buf: &mut BytesMut) {
        buf.put_u32(self.cumulative_tsn_ack);
    }
}

/// SHUTDOWN-COMPLETE body (RFC 4960 3.3.13).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownCompleteChunk {
    /// T bit.
    pub reflected_tag: bool,
}

impl ShutdownCompleteChunk {
    pub(crate) fn from_flags(flags: u8) -> Self {
        Self {
            reflected_tag: flags & FLAG_T != 0,
        }
    }

    pub(crate) fn flags(&self) -> u8 {
        if self.reflected_tag { FLAG_T } else { 0 }
    }
}

/// COOKIE-ECHO body (RFC 4960 3.3.11).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CookieEchoChunk {
    /// State cookie copied from the INIT-ACK.
    pub cookie: Bytes,
}

impl CookieEchoChunk {
    /// Validate a COOKIE-ECHO value.
    pub fn unmarshal(value: Bytes) -> Result<Self, ChunkError> {
        require_len(&value, 1)?;
        Ok(Self { cookie: value })
    }
}
