use std::io;
use std::str::Utf8Error;
use std::sync::Arc;

use thiserror::Error;

use crate::connection::ConnectionState;
use crate::signature::SignatureError;

/// Result alias using an [`Error`] as the error type by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised by this crate.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A malformed type signature.
    #[error(transparent)]
    Signature(#[from] SignatureError),
    /// A value does not inhabit the signature element it is encoded against.
    #[error("value of kind {kind} does not match signature element `{expected}`")]
    SignatureMismatch {
        expected: String,
        kind: &'static str,
    },
    /// Ran out of input while decoding.
    #[error("unexpected end of input")]
    Truncated,
    /// A padding byte that must be zero was not.
    #[error("non-zero padding byte at offset {0}")]
    AlignmentViolation(usize),
    #[error("string is not valid UTF-8")]
    InvalidUtf8(#[from] Utf8Error),
    /// Booleans are marshalled as 32-bit 0 or 1; everything else is invalid.
    #[error("boolean value {0} is not 0 or 1")]
    InvalidBool(u32),
    #[error("length {len} is out of range (max {max})")]
    LengthOutOfRange { len: u64, max: u64 },
    #[error("string is not null terminated")]
    NotNullTerminated,

    #[error("invalid endianness marker {0:#04x}")]
    InvalidEndianness(u8),
    #[error("invalid message type {0}")]
    InvalidMessageType(u8),
    #[error("unsupported protocol version {0}")]
    UnsupportedProtocolVersion(u8),
    /// Message serials and reply serials must not be zero.
    #[error("message serial must not be zero")]
    InvalidSerial,
    #[error("missing required {0} header field")]
    MissingRequiredField(&'static str),
    #[error("invalid value for header field {0}")]
    InvalidHeaderField(u8),
    #[error("message body does not match its signature")]
    BodySignatureMismatch,

    #[error("invalid object path `{0}`")]
    InvalidObjectPath(String),
    #[error("invalid d-bus address `{0}`")]
    InvalidAddress(String),
    #[error("transport not supported: {0}")]
    UnsupportedTransport(String),

    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("connection closed")]
    Closed,
    #[error("invalid connection state `{0}`")]
    InvalidState(ConnectionState),

    /// The server rejected every mechanism we offered.
    #[error("authentication rejected, server offers: {0}")]
    AuthRejected(String),
    #[error("unsupported authentication mechanism `{0}`")]
    UnsupportedMechanism(String),
    #[error("SASL protocol error: {0}")]
    SaslProtocol(String),

    /// The message cannot produce a reply, e.g. `NO_REPLY_EXPECTED` was set.
    #[error("method call does not expect a reply")]
    NoReply,
    #[error("method call timed out")]
    TimedOut,
    #[error("method call was cancelled")]
    Cancelled,
    /// An error reply received from the peer, name carried verbatim.
    #[error("{name}: {message}")]
    Remote { name: String, message: String },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// A failure that moved a connection into its error state, observed by
    /// every caller of that connection.
    #[error(transparent)]
    Shared(#[from] Arc<Error>),
}

impl Error {
    pub(crate) fn shared(self) -> Arc<Error> {
        Arc::new(self)
    }
}

/// Errors raised while dispatching an inbound method call to an exported
/// object.
///
/// Each variant maps onto a canonical `org.freedesktop.DBus.Error.*` name
/// when serialized into an error reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DispatchError {
    #[error("unknown object `{0}`")]
    UnknownObject(String),
    #[error("unknown interface `{0}`")]
    UnknownInterface(String),
    #[error("unknown method `{0}`")]
    UnknownMethod(String),
    #[error("unknown property `{0}`")]
    UnknownProperty(String),
    #[error("property `{0}` is read-only")]
    PropertyReadOnly(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("{0}")]
    Failed(String),
}

impl DispatchError {
    /// The canonical D-Bus error name for this dispatch failure.
    pub fn error_name(&self) -> &'static str {
        match self {
            DispatchError::UnknownObject(..) => "org.freedesktop.DBus.Error.UnknownObject",
            DispatchError::UnknownInterface(..) => "org.freedesktop.DBus.Error.UnknownInterface",
            DispatchError::UnknownMethod(..) => "org.freedesktop.DBus.Error.UnknownMethod",
            DispatchError::UnknownProperty(..) => "org.freedesktop.DBus.Error.UnknownProperty",
            DispatchError::PropertyReadOnly(..) => "org.freedesktop.DBus.Error.PropertyReadOnly",
            DispatchError::InvalidArgs(..) => "org.freedesktop.DBus.Error.InvalidArgs",
            DispatchError::Failed(..) => "org.freedesktop.DBus.Error.Failed",
        }
    }
}
