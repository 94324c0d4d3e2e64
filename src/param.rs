//! Chunk parameters (RFC 4960 3.2.1, RFC 6525 4, RFC 3758 3.1).
//!
//! Parameters are TLVs with a 16-bit type and a 16-bit length covering the
//! 4-byte header and the value, padded to a 4-byte boundary.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::chunk::{padded, padding_len, require_len, ChunkError};
use crate::core::PARAM_HEADER_SIZE;

/// Parameter type codes.
pub mod types {
    /// Heartbeat info.
    pub const HEARTBEAT_INFO: u16 = 1;
    /// State cookie.
    pub const STATE_COOKIE: u16 = 7;
    /// Unrecognized parameter.
    pub const UNRECOGNIZED_PARAM: u16 = 8;
    /// Outgoing SSN reset request.
    pub const OUTGOING_RESET_REQUEST: u16 = 13;
    /// Re-configuration response.
    pub const RECONFIG_RESPONSE: u16 = 16;
    /// Supported extensions.
    pub const SUPPORTED_EXTENSIONS: u16 = 0x8008;
    /// Forward-TSN supported.
    pub const FORWARD_TSN_SUPPORTED: u16 = 0xC000;
}

/// Result of a re-configuration request (RFC 6525 4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ReconfigResult {
    /// Success, nothing to do.
    SuccessNop = 0,
    /// Success, performed.
    SuccessPerformed = 1,
    /// Denied.
    Denied = 2,
    /// Error, wrong SSN.
    ErrorWrongSsn = 3,
    /// Error, request already in progress.
    ErrorRequestAlreadyInProgress = 4,
    /// Error, bad sequence number.
    ErrorBadSequenceNumber = 5,
    /// In progress.
    InProgress = 6,
}

impl ReconfigResult {
    /// Parse a result code.
    pub fn from_u32(value: u32) -> Result<Self, ChunkError> {
        match value {
            0 => Ok(Self::SuccessNop),
            1 => Ok(Self::SuccessPerformed),
            2 => Ok(Self::Denied),
            3 => Ok(Self::ErrorWrongSsn),
            4 => Ok(Self::ErrorRequestAlreadyInProgress),
            5 => Ok(Self::ErrorBadSequenceNumber),
            6 => Ok(Self::InProgress),
            other => Err(ChunkError::InvalidReconfigResult(other)),
        }
    }
}

impl fmt::Display for ReconfigResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SuccessNop => "Success - Nothing to do",
            Self::SuccessPerformed => "Success - Performed",
            Self::Denied => "Denied",
            Self::ErrorWrongSsn => "Error - Wrong SSN",
            Self::ErrorRequestAlreadyInProgress => "Error - Request already in progress",
            Self::ErrorBadSequenceNumber => "Error - Bad Sequence Number",
            Self::InProgress => "In progress",
        };
        f.write_str(s)
    }
}

/// Outgoing SSN reset request parameter.
///
/// ```text
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Parameter Type = 13       | Parameter Length = 16 + 2 * N |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           Re-configuration Request Sequence Number            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           Re-configuration Response Sequence Number           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                Sender's Last Assigned TSN                     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Stream Number 1 (optional)   |    Stream Number 2 (optional) |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutgoingResetRequest {
    /// Sequence number identifying this request.
    pub request_sn: u32,
    /// Sequence number of the last response the sender received.
    pub response_sn: u32,
    /// Last TSN the sender assigned before the reset.
    pub sender_last_tsn: u32,
    /// Streams to reset; empty means all streams.
    pub stream_ids: Vec<u16>,
}

const OUTGOING_RESET_FIXED_SIZE: usize = 12;

/// Re-configuration response parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconfigResponse {
    /// Request sequence number being answered.
    pub response_sn: u32,
    /// Outcome.
    pub result: ReconfigResult,
}

const RECONFIG_RESPONSE_SIZE: usize = 8;

/// A chunk parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    /// Opaque heartbeat info echoed back by the peer.
    HeartbeatInfo(Bytes),
    /// State cookie carried in INIT-ACK.
    StateCookie(Bytes),
    /// Parameter the sender did not recognize, reflected verbatim.
    Unrecognized(Bytes),
    /// Outgoing SSN reset request.
    OutgoingResetRequest(OutgoingResetRequest),
    /// Re-configuration response.
    ReconfigResponse(ReconfigResponse),
    /// Chunk types the sender supports beyond the base protocol.
    SupportedExtensions(Vec<u8>),
    /// Sender supports FORWARD-TSN.
    ForwardTsnSupported,
    /// Parameter type this engine does not know.
    Unknown {
        /// Raw parameter type.
        typ: u16,
        /// Unpadded value.
        value: Bytes,
    },
}

impl Param {
    /// Decode one parameter from the start of `raw`.
    ///
    /// Returns the parameter and the number of bytes consumed including
    /// padding.
    pub fn unmarshal(raw: &Bytes) -> Result<(Self, usize), ChunkError> {
        require_len(raw, PARAM_HEADER_SIZE)?;
        let typ = u16::from_be_bytes([raw[0], raw[1]]);
        let length = u16::from_be_bytes([raw[2], raw[3]]) as usize;
        if length < PARAM_HEADER_SIZE || length > raw.len() {
            return Err(ChunkError::LengthMismatch {
                declared: length,
                available: raw.len(),
            });
        }
        let value = raw.slice(PARAM_HEADER_SIZE..length);

        let param = match typ {
            types::HEARTBEAT_INFO => Self::HeartbeatInfo(value),
            types::STATE_COOKIE => Self::StateCookie(value),
            types::UNRECOGNIZED_PARAM => Self::Unrecognized(value),
            types::OUTGOING_RESET_REQUEST => {
                require_len(&value, OUTGOING_RESET_FIXED_SIZE)?;
                let mut reader = value;
                let request_sn = reader.get_u32();
                let response_sn = reader.get_u32();
                let sender_last_tsn = reader.get_u32();
                let mut stream_ids = Vec::with_capacity(reader.remaining() / 2);
                while reader.remaining() >= 2 {
                    stream_ids.push(reader.get_u16());
                }
                Self::OutgoingResetRequest(OutgoingResetRequest {
                    request_sn,
                    response_sn,
                    sender_last_tsn,
                    stream_ids,
                })
            }
            types::RECONFIG_RESPONSE => {
                require_len(&value, RECONFIG_RESPONSE_SIZE)?;
                let mut reader = value;
                let response_sn = reader.get_u32();
                let result = ReconfigResult::from_u32(reader.get_u32())?;
                Self::ReconfigResponse(ReconfigResponse {
                    response_sn,
                    result,
                })
            }
            types::SUPPORTED_EXTENSIONS => Self::SupportedExtensions(value.to_vec()),
            types::FORWARD_TSN_SUPPORTED => Self::ForwardTsnSupported,
            _ => Self::Unknown { typ, value },
        };

        let consumed = padded(length).min(raw.len());
        Ok((param, consumed))
    }

    /// Decode a sequence of parameters filling `raw`.
    pub fn unmarshal_all(raw: &Bytes) -> Result<Vec<Self>, ChunkError> {
        let mut params = Vec::new();
        let mut offset = 0;
        while offset < raw.len() {
            let (param, consumed) = Self::unmarshal(&raw.slice(offset..))?;
            params.push(param);
            offset += consumed;
        }
        Ok(params)
    }

    /// Append the encoded parameter, including padding, to `buf`.
    pub fn marshal_to(&self, buf: &mut BytesMut) {
        let length = PARAM_HEADER_SIZE + self.value_length();
        buf.put_u16(self.param_type());
        buf.put_u16(length as u16);

        match self {
            Self::HeartbeatInfo(v) | Self::StateCookie(v) | Self::Unrecognized(v) => {
                buf.put_slice(v)
            }
            Self::OutgoingResetRequest(req) => {
                buf.put_u32(req.request_sn);
                buf.put_u32(req.response_sn);
                buf.put_u32(req.sender_last_tsn);
                for id in &req.stream_ids {
                    buf.put_u16(*id);
                }
            }
            Self::ReconfigResponse(resp) => {
                buf.put_u32(resp.response_sn);
                buf.put_u32(resp.result as u32);
            }
            Self::SupportedExtensions(types) => buf.put_slice(types),
            Self::ForwardTsnSupported => {}
            Self::Unknown { value, .. } => buf.put_slice(value),
        }

        buf.put_bytes(0, padding_len(length));
    }

    /// Encode the parameter, including padding.
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.marshal_size());
        self.marshal_to(&mut buf);
        buf.freeze()
    }

    /// Size on the wire, including padding.
    pub fn marshal_size(&self) -> usize {
        padded(PARAM_HEADER_SIZE + self.value_length())
    }

    /// Size without trailing padding.
    pub(crate) fn unpadded_size(&self) -> usize {
        PARAM_HEADER_SIZE + self.value_length()
    }

    /// Raw parameter type.
    pub fn param_type(&self) -> u16 {
        match self {
            Self::HeartbeatInfo(_) => types::HEARTBEAT_INFO,
            Self::StateCookie(_) => types::STATE_COOKIE,
            Self::Unrecognized(_) => types::UNRECOGNIZED_PARAM,
            Self::OutgoingResetRequest(_) => types::OUTGOING_RESET_REQUEST,
            Self::ReconfigResponse(_) => types::RECONFIG_RESPONSE,
            Self::SupportedExtensions(_) => types::SUPPORTED_EXTENSIONS,
            Self::ForwardTsnSupported => types::FORWARD_TSN_SUPPORTED,
            Self::Unknown { typ, .. } => *typ,
        }
    }

    fn value_length(&self) -> usize {
        match self {
            Self::HeartbeatInfo(v) | Self::StateCookie(v) | Self::Unrecognized(v) => v.len(),
            Self::OutgoingResetRequest(req) => {
                OUTGOING_RESET_FIXED_SIZE + 2 * req.stream_ids.len()
            }
            Self::ReconfigResponse(_) => RECONFIG_RESPONSE_SIZE,
            Self::SupportedExtensions(types) => types.len(),
            Self::ForwardTsnSupported => 0,
            Self::Unknown { value, .. } => value.len(),
        }
    }

    /// For an unknown parameter, whether processing of the enclosing chunk
    /// continues (`0x8000` bit of the type).
    pub fn skips_when_unknown(&self) -> bool {
        self.param_type() & 0x8000 != 0
    }

    /// For an unknown parameter, whether it is reported back to the sender
    /// (`0x4000` bit of the type).
    pub fn reports_when_unknown(&self) -> bool {
        self.param_type() & 0x4000 != 0
    }
}
