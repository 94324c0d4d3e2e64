//! Error causes carried in ABORT and ERROR chunks (RFC 4960 3.3.10).
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Cause Code          |       Cause Length            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! /                    Cause-Specific Information                 /
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::chunk::{padded, padding_len, require_len, ChunkError};
use crate::core::PARAM_HEADER_SIZE;

/// Error cause code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCauseCode {
    /// 1
    InvalidStreamIdentifier,
    /// 2
    MissingMandatoryParameter,
    /// 3
    StaleCookieError,
    /// 4
    OutOfResource,
    /// 5
    UnresolvableAddress,
    /// 6
    UnrecognizedChunkType,
    /// 7
    InvalidMandatoryParameter,
    /// 8
    UnrecognizedParameters,
    /// 9
    NoUserData,
    /// 10
    CookieReceivedWhileShuttingDown,
    /// 11
    RestartOfAnAssociationWithNewAddresses,
    /// 12
    UserInitiatedAbort,
    /// 13
    ProtocolViolation,
    /// Any code outside 1..=13.
    Unknown(u16),
}

impl ErrorCauseCode {
    /// Parse a cause code.
    pub fn from_u16(code: u16) -> Self {
        match code {
            1 => Self::InvalidStreamIdentifier,
            2 => Self::MissingMandatoryParameter,
            3 => Self::StaleCookieError,
            4 => Self::OutOfResource,
            5 => Self::UnresolvableAddress,
            6 => Self::UnrecognizedChunkType,
            7 => Self::InvalidMandatoryParameter,
            8 => Self::UnrecognizedParameters,
            9 => Self::NoUserData,
            10 => Self::CookieReceivedWhileShuttingDown,
            11 => Self::RestartOfAnAssociationWithNewAddresses,
            12 => Self::UserInitiatedAbort,
            13 => Self::ProtocolViolation,
            other => Self::Unknown(other),
        }
    }

    /// Numeric cause code.
    pub fn as_u16(self) -> u16 {
        match self {
            Self::InvalidStreamIdentifier => 1,
            Self::MissingMandatoryParameter => 2,
            Self::StaleCookieError => 3,
            Self::OutOfResource => 4,
            Self::UnresolvableAddress => 5,
            Self::UnrecognizedChunkType => 6,
            Self::InvalidMandatoryParameter => 7,
            Self::UnrecognizedParameters => 8,
            Self::NoUserData => 9,
            Self::CookieReceivedWhileShuttingDown => 10,
            Self::RestartOfAnAssociationWithNewAddresses => 11,
            Self::UserInitiatedAbort => 12,
            Self::ProtocolViolation => 13,
            Self::Unknown(code) => code,
        }
    }
}

impl fmt::Display for ErrorCauseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidStreamIdentifier => "Invalid Stream Identifier",
            Self::MissingMandatoryParameter => "Missing Mandatory Parameter",
            Self::StaleCookieError => "Stale Cookie Error",
            Self::OutOfResource => "Out Of Resource",
            Self::UnresolvableAddress => "Unresolvable IP",
            Self::UnrecognizedChunkType => "Unrecognized Chunk Type",
            Self::InvalidMandatoryParameter => "Invalid Mandatory Parameter",
            Self::UnrecognizedParameters => "Unrecognized Parameters",
            Self::NoUserData => "No User Data",
            Self::CookieReceivedWhileShuttingDown => "Cookie Received While Shutting Down",
            Self::RestartOfAnAssociationWithNewAddresses => {
                "Restart Of An Association With New Addresses"
            }
            Self::UserInitiatedAbort => "User Initiated Abort",
            Self::ProtocolViolation => "Protocol Violation",
            Self::Unknown(code) => return write!(f, "Unknown CauseCode: {code}"),
        };
        f.write_str(s)
    }
}

/// One error cause record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCause {
    /// Cause code.
    pub code: ErrorCauseCode,
    /// Cause-specific information, unpadded.
    pub value: Bytes,
}

impl ErrorCause {
    /// Build a cause with arbitrary information.
    pub fn new(code: ErrorCauseCode, value: Bytes) -> Self {
        Self { code, value }
    }

    /// Invalid stream identifier (the offending id followed by 2 reserved bytes).
    pub fn invalid_stream_identifier(stream_id: u16) -> Self {
        let mut value = BytesMut::with_capacity(4);
        value.put_u16(stream_id);
        value.put_u16(0);
        Self::new(ErrorCauseCode::InvalidStreamIdentifier, value.freeze())
    }

    /// Stale cookie, carrying the measure of staleness in microseconds.
    pub fn stale_cookie(staleness_us: u32) -> Self {
        Self::new(
            ErrorCauseCode::StaleCookieError,
            Bytes::copy_from_slice(&staleness_us.to_be_bytes()),
        )
    }

    /// Unrecognized chunk type, carrying the offending chunk.
    pub fn unrecognized_chunk_type(chunk: Bytes) -> Self {
        Self::new(ErrorCauseCode::UnrecognizedChunkType, chunk)
    }

    /// Unrecognized parameters, carrying the offending parameters.
    pub fn unrecognized_parameters(params: Bytes) -> Self {
        Self::new(ErrorCauseCode::UnrecognizedParameters, params)
    }

    /// Invalid mandatory parameter.
    pub fn invalid_mandatory_parameter() -> Self {
        Self::new(ErrorCauseCode::InvalidMandatoryParameter, Bytes::new())
    }

    /// Missing mandatory parameter of the given type.
    pub fn missing_mandatory_parameter(param_type: u16) -> Self {
        let mut value = BytesMut::with_capacity(6);
        value.put_u32(1);
        value.put_u16(param_type);
        Self::new(ErrorCauseCode::MissingMandatoryParameter, value.freeze())
    }

    /// DATA chunk without payload.
    pub fn no_user_data(tsn: u32) -> Self {
        Self::new(
            ErrorCauseCode::NoUserData,
            Bytes::copy_from_slice(&tsn.to_be_bytes()),
        )
    }

    /// User-initiated abort with a free-form reason.
    pub fn user_initiated_abort(reason: &str) -> Self {
        Self::new(
            ErrorCauseCode::UserInitiatedAbort,
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    /// Protocol violation with free-form additional information.
    pub fn protocol_violation(info: &str) -> Self {
        Self::new(
            ErrorCauseCode::ProtocolViolation,
            Bytes::copy_from_slice(info.as_bytes()),
        )
    }

    /// Decode one cause from the start of `raw`.
    ///
    /// Returns the cause and the bytes consumed including padding.
    pub fn unmarshal(raw: &Bytes) -> Result<(Self, usize), ChunkError> {
        require_len(raw, PARAM_HEADER_SIZE)?;
        let code = ErrorCauseCode::from_u16(u16::from_be_bytes([raw[0], raw[1]]));
        let length = u16::from_be_bytes([raw[2], raw[3]]) as usize;
        if length < PARAM_HEADER_SIZE || length > raw.len() {
            return Err(ChunkError::LengthMismatch {
                declared: length,
                available: raw.len(),
            });
        }

        let cause = Self {
            code,
            value: raw.slice(PARAM_HEADER_SIZE..length),
        };
        Ok((cause, padded(length).min(raw.len())))
    }

    /// Decode the causes filling `raw`.
    pub fn unmarshal_all(raw: &Bytes) -> Result<Vec<Self>, ChunkError> {
        let mut causes = Vec::new();
        let mut offset = 0;
        while offset < raw.len() {
            let (cause, consumed) = Self::unmarshal(&raw.slice(offset..))?;
            causes.push(cause);
            offset += consumed;
        }
        Ok(causes)
    }

    /// Append the encoded cause, including padding, to `buf`.
    pub fn marshal_to(&self, buf: &mut BytesMut) {
        let length = PARAM_HEADER_SIZE + self.value.len();
        buf.put_u16(self.code.as_u16());
        buf.put_u16(length as u16);
        buf.put_slice(&self.value);
        buf.put_bytes(0, padding_len(length));
    }

    /// Size on the wire, including padding.
    pub fn marshal_size(&self) -> usize {
        padded(self.unpadded_size())
    }

    pub(crate) fn unpadded_size(&self) -> usize {
        PARAM_HEADER_SIZE + self.value.len()
    }
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            ErrorCauseCode::UserInitiatedAbort | ErrorCauseCode::ProtocolViolation
                if !self.value.is_empty() =>
            {
                write!(f, "{}: {}", self.code, String::from_utf8_lossy(&self.value))
            }
            _ => write!(f, "{}", self.code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_code_strings() {
        let expected = [
            (1, "Invalid Stream Identifier"),
            (2, "Missing Mandatory Parameter"),
            (3, "Stale Cookie Error"),
            (4, "Out Of Resource"),
            (5, "Unresolvable IP"),
            (6, "Unrecognized Chunk Type"),
            (7, "Invalid Mandatory Parameter"),
            (8, "Unrecognized Parameters"),
            (9, "No User Data"),
            (10, "Cookie Received While Shutting Down"),
            (11, "Restart Of An Association With New Addresses"),
            (12, "User Initiated Abort"),
            (13, "Protocol Violation"),
        ];
        for (code, text) in expected {
            let parsed = ErrorCauseCode::from_u16(code);
            assert_eq!(parsed.to_string(), text);
            assert_eq!(parsed.as_u16(), code);
        }
        assert_eq!(ErrorCauseCode::from_u16(42).to_string(), "Unknown CauseCode: 42");
    }

    #[test]
    fn test_cause_wire_format() {
        let cause = ErrorCause::protocol_violation("bad");
        let mut buf = BytesMut::new();
        cause.marshal_to(&mut buf);
        assert_eq!(hex::encode(&buf), "000d000762616400");

        let (decoded, consumed) = ErrorCause::unmarshal(&buf.freeze()).unwrap();
        assert_eq!(decoded, cause);
        assert_eq!(consumed, 8);
        assert_eq!(decoded.to_string(), "Protocol Violation: bad");
    }

    #[test]
    fn test_unmarshal_all_causes() {
        let mut buf = BytesMut::new();
        ErrorCause::invalid_stream_identifier(7).marshal_to(&mut buf);
        ErrorCause::no_user_data(99).marshal_to(&mut buf);
        let causes = ErrorCause::unmarshal_all(&buf.freeze()).unwrap();
        assert_eq!(causes.len(), 2);
        assert_eq!(causes[0].code, ErrorCauseCode::InvalidStreamIdentifier);
        assert_eq!(&causes[0].value[..], &[0, 7, 0, 0]);
        assert_eq!(causes[1].code, ErrorCauseCode::NoUserData);
    }
}
