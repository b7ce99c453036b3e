//! Error taxonomy: wire error codes, connection vs stream errors, and
//! application-level request errors.

use thiserror::Error;

/// HTTP/2 error codes (RFC 7540 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
}

/// Registry order from RFC 7540 Section 7; the index into this table is
/// the on-wire code.
const WIRE_ORDER: [ErrorCode; 14] = [
    ErrorCode::NoError,
    ErrorCode::ProtocolError,
    ErrorCode::InternalError,
    ErrorCode::FlowControlError,
    ErrorCode::SettingsTimeout,
    ErrorCode::StreamClosed,
    ErrorCode::FrameSizeError,
    ErrorCode::RefusedStream,
    ErrorCode::Cancel,
    ErrorCode::CompressionError,
    ErrorCode::ConnectError,
    ErrorCode::EnhanceYourCalm,
    ErrorCode::InadequateSecurity,
    ErrorCode::Http11Required,
];

/// A code outside the RFC 7540 Section 7 registry.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown error code {0:#x}")]
pub struct UnknownErrorCode(pub u32);

impl ErrorCode {
    /// On-wire value.
    pub fn wire(self) -> u32 {
        WIRE_ORDER
            .iter()
            .position(|&code| code == self)
            .expect("every code is in WIRE_ORDER") as u32
    }
}

impl TryFrom<u32> for ErrorCode {
    type Error = UnknownErrorCode;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        WIRE_ORDER
            .get(value as usize)
            .copied()
            .ok_or(UnknownErrorCode(value))
    }
}

/// A protocol violation, classified by blast radius (RFC 7540 Section 5.4).
///
/// Connection errors tear down the whole connection with a GOAWAY; stream
/// errors reset a single stream with RST_STREAM and leave the rest alone.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection error {code:?}: {reason}")]
    Connection { code: ErrorCode, reason: String },
    #[error("stream {id} error {code:?}")]
    Stream { id: u32, code: ErrorCode },
}

impl ProtocolError {
    pub(crate) fn connection(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::Connection {
            code,
            reason: reason.into(),
        }
    }

    pub(crate) fn stream(id: u32, code: ErrorCode) -> Self {
        Self::Stream { id, code }
    }
}

/// HPACK failures (RFC 7541). Every one of them is fatal to the connection,
/// surfacing as COMPRESSION_ERROR at the dispatch layer, because the shared
/// dynamic table may be out of sync afterwards.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HpackError {
    #[error("truncated header block")]
    Truncated,
    #[error("invalid header table index {0}")]
    BadIndex(usize),
    #[error("invalid huffman encoding")]
    Huffman,
    #[error("prefix integer overflow")]
    IntegerOverflow,
    #[error("header list exceeds SETTINGS_MAX_HEADER_LIST_SIZE")]
    ListTooLarge,
    #[error("dynamic table resized beyond the SETTINGS limit")]
    TableSizeUpdate,
}

/// Errors attributable to a single request, routed through the user error
/// handler so it can synthesize a response body.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The request was malformed (bad pseudo-headers, content-length
    /// mismatch, pseudo-headers in trailers). The stream is reset with
    /// PROTOCOL_ERROR once the error response has drained.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// The application failed; the stream finishes normally after the
    /// error response.
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl RequestError {
    /// Response status the default error handler answers with.
    pub fn status(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::InternalServerError(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_round_trip() {
        for v in 0x0..=0xd {
            assert_eq!(ErrorCode::try_from(v).unwrap().wire(), v);
        }
    }

    #[test]
    fn unregistered_wire_code_is_rejected() {
        assert_eq!(ErrorCode::try_from(0x5555), Err(UnknownErrorCode(0x5555)));
    }

    #[test]
    fn request_error_status() {
        assert_eq!(RequestError::BadRequest("x".into()).status(), 400);
        assert_eq!(
            RequestError::InternalServerError("x".into()).status(),
            500
        );
    }
}
