//! Reply decoding errors.

use thiserror::Error;

/// Ways a reply can fail to decode. Everything except
/// [`ProtocolError::Incomplete`] means the stream is out of sync and the
/// connection must be dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// More bytes are needed. Never escapes [`crate::parse_frame`].
    #[error("reply truncated")]
    Incomplete,

    #[error("unknown reply type byte {0:#04x}")]
    InvalidPrefix(u8),

    #[error("malformed integer in reply")]
    InvalidInteger,

    /// A length below `-1`, or a bulk payload not followed by CRLF.
    #[error("bad length {0} in reply")]
    InvalidFrameLength(i64),

    #[error("bulk reply of {0} bytes exceeds the 512 MB limit")]
    BulkStringTooLarge(usize),

    #[error("reply nested deeper than {0} levels")]
    NestingTooDeep(usize),

    #[error("aggregate reply declares {0} elements")]
    TooManyElements(usize),

    #[error("{0} is not valid utf-8")]
    InvalidUtf8(&'static str),
}
