use std::{error::Error, fmt};

use percent_encoding::{percent_decode, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::code::Code;

/// Alias for a type-erased error type.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Bytes of a `grpc-message` value that must be percent-encoded.
const GRPC_MESSAGE_ENCODE_SET: &AsciiSet = &CONTROLS.add(b' ').add(b'%');

/// The result of an RPC, as observed by a caller.
///
/// Carries the status code reported in `grpc-status` and the optional
/// human-readable details from `grpc-message`. Client calls return this
/// for every non-`OK` outcome, including transport-level failures.
#[derive(Clone, PartialEq, Eq)]
pub struct RpcError {
    code: Code,
    details: Option<String>,
}

impl RpcError {
    /// Create a new `RpcError` with the given code and details.
    pub fn new(code: Code, details: impl Into<String>) -> Self {
        RpcError {
            code,
            details: Some(details.into()),
        }
    }

    /// Create a new `RpcError` with no details.
    pub fn from_code(code: Code) -> Self {
        RpcError {
            code,
            details: None,
        }
    }

    /// The status code of this error.
    pub fn code(&self) -> Code {
        self.code
    }

    /// The details string of this error, if the peer supplied one.
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// `Code::Unknown` with the given details.
    pub fn unknown(details: impl Into<String>) -> Self {
        RpcError::new(Code::Unknown, details)
    }

    /// `Code::InvalidArgument` with the given details.
    pub fn invalid_argument(details: impl Into<String>) -> Self {
        RpcError::new(Code::InvalidArgument, details)
    }

    /// `Code::DeadlineExceeded` with the given details.
    pub fn deadline_exceeded(details: impl Into<String>) -> Self {
        RpcError::new(Code::DeadlineExceeded, details)
    }

    /// `Code::FailedPrecondition` with the given details.
    pub fn failed_precondition(details: impl Into<String>) -> Self {
        RpcError::new(Code::FailedPrecondition, details)
    }

    /// `Code::Aborted` with the given details.
    pub fn aborted(details: impl Into<String>) -> Self {
        RpcError::new(Code::Aborted, details)
    }

    /// `Code::Unimplemented` with the given details.
    pub fn unimplemented(details: impl Into<String>) -> Self {
        RpcError::new(Code::Unimplemented, details)
    }

    /// `Code::Internal` with the given details.
    pub fn internal(details: impl Into<String>) -> Self {
        RpcError::new(Code::Internal, details)
    }

    /// `Code::Unavailable` with the given details.
    pub fn unavailable(details: impl Into<String>) -> Self {
        RpcError::new(Code::Unavailable, details)
    }

    /// Build an error from the wire forms of `grpc-status` and `grpc-message`.
    pub(crate) fn from_wire(status: &[u8], message: Option<&[u8]>) -> Self {
        RpcError {
            code: Code::from_bytes(status),
            details: message.map(decode_grpc_message),
        }
    }
}

impl fmt::Debug for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("RpcError");
        builder.field("code", &self.code);
        if let Some(details) = &self.details {
            builder.field("details", details);
        }
        builder.finish()
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "grpc-status: {:?}, grpc-message: {:?}",
            self.code,
            self.details.as_deref().unwrap_or("")
        )
    }
}

impl Error for RpcError {}

/// Percent-encode a details string for the `grpc-message` wire form.
pub(crate) fn encode_grpc_message(message: &str) -> String {
    utf8_percent_encode(message, GRPC_MESSAGE_ENCODE_SET).to_string()
}

/// Percent-decode a `grpc-message` wire value.
pub(crate) fn decode_grpc_message(raw: &[u8]) -> String {
    percent_decode(raw).decode_utf8_lossy().into_owned()
}

/// A violation of the gRPC-Web wire protocol, raised while decoding.
///
/// The server answers these with HTTP 400 and `INVALID_ARGUMENT`; the
/// client folds them into an [`RpcError`] with `Code::Unknown` (or
/// `Code::Unavailable` for connection-level failures).
#[derive(Debug)]
pub enum ProtocolError {
    /// A frame header or payload was truncated or inconsistent.
    MalformedFrame,
    /// The byte source ended in the middle of a frame.
    IncompleteStream,
    /// A frame payload exceeded the 2^32 - 1 length limit.
    FrameTooLong(usize),
    /// A metadata key or value is not representable on the wire.
    InvalidMetadata(String),
    /// A `grpc-timeout` header could not be parsed.
    InvalidDeadline(String),
    /// The underlying byte source failed.
    Transport(BoxError),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::MalformedFrame => f.write_str("malformed frame"),
            ProtocolError::IncompleteStream => f.write_str("incomplete stream"),
            ProtocolError::FrameTooLong(len) => {
                write!(f, "frame payload of {} bytes exceeds the length prefix", len)
            }
            ProtocolError::InvalidMetadata(reason) => write!(f, "invalid metadata: {}", reason),
            ProtocolError::InvalidDeadline(value) => write!(f, "invalid grpc-timeout: {}", value),
            ProtocolError::Transport(err) => write!(f, "transport error: {}", err),
        }
    }
}

impl Error for ProtocolError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ProtocolError::Transport(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors() {
        let err = RpcError::new(Code::Aborted, "test aborting");
        assert_eq!(err.code(), Code::Aborted);
        assert_eq!(err.details(), Some("test aborting"));

        let bare = RpcError::from_code(Code::Unavailable);
        assert_eq!(bare.code(), Code::Unavailable);
        assert_eq!(bare.details(), None);
    }

    #[test]
    fn grpc_message_round_trip() {
        let cases = ["plain", "with space", "percent % sign", "snowman \u{2603}"];

        for message in cases {
            let encoded = encode_grpc_message(message);
            assert!(encoded.is_ascii(), "{:?}", encoded);
            assert!(!encoded.contains(' '));
            assert_eq!(decode_grpc_message(encoded.as_bytes()), message);
        }
    }

    #[test]
    fn from_wire_decodes_status_and_message() {
        let err = RpcError::from_wire(b"10", Some(b"test%20aborting"));
        assert_eq!(err.code(), Code::Aborted);
        assert_eq!(err.details(), Some("test aborting"));

        let err = RpcError::from_wire(b"bogus", None);
        assert_eq!(err.code(), Code::Unknown);
        assert_eq!(err.details(), None);
    }
}
