//! Construction, validation, serialization and parsing of D-Bus messages.

use std::num::NonZeroU32;

use bitflags::bitflags;

use crate::codec::{Deserializer, Endianness, Serializer, MAX_BODY_LENGTH};
use crate::error::{Error, Result};
use crate::object_path::ObjectPath;
use crate::signature::Signature;
use crate::value::Value;

pub(crate) use self::wire::{frame_remaining, FIXED_HEADER_LEN};
mod wire;

#[cfg(test)]
mod tests;

/// The only protocol version this crate speaks.
pub(crate) const PROTOCOL_VERSION: u8 = 1;

bitflags! {
    /// Flags in the fixed message header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u8 {
        /// No method return or error reply is expected for this message.
        const NO_REPLY_EXPECTED = 0x1;
        /// The bus must not launch an owner for the destination name.
        const NO_AUTO_START = 0x2;
        /// The caller is prepared to wait for interactive authorization.
        const ALLOW_INTERACTIVE_AUTHORIZATION = 0x4;
    }
}

/// The kind of a message together with its kind-specific required fields.
///
/// Carrying the required header fields in the kind makes messages that are
/// missing them unrepresentable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    /// A method call. May prompt a reply unless
    /// [`Flags::NO_REPLY_EXPECTED`] is set.
    MethodCall { path: ObjectPath, member: String },
    /// A successful reply to a method call.
    MethodReturn { reply_serial: NonZeroU32 },
    /// An error reply to a method call.
    Error {
        error_name: String,
        reply_serial: NonZeroU32,
    },
    /// A signal emission.
    Signal {
        path: ObjectPath,
        interface: String,
        member: String,
    },
}

/// An immutable D-Bus message: fixed header, header fields, and body.
///
/// Messages are built through the per-kind factories and `with_*`
/// combinators, serialized on demand and parsed from byte buffers.
///
/// # Examples
///
/// ```
/// use minibus::Message;
///
/// let m = Message::method_call("/org/freedesktop/DBus", "Hello")?
///     .with_interface("org.freedesktop.DBus")
///     .with_destination("org.freedesktop.DBus");
///
/// assert!(m.serial().is_none());
/// # Ok::<_, minibus::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub(crate) kind: MessageKind,
    pub(crate) endianness: Endianness,
    pub(crate) flags: Flags,
    /// Assigned by the connection when the message is sent.
    pub(crate) serial: Option<NonZeroU32>,
    /// Interface of a method call; signals carry theirs in the kind.
    pub(crate) interface: Option<String>,
    pub(crate) destination: Option<String>,
    pub(crate) sender: Option<String>,
    pub(crate) unix_fds: Option<u32>,
    pub(crate) signature: Signature,
    pub(crate) body: Vec<u8>,
}

impl Message {
    fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            endianness: Endianness::NATIVE,
            flags: Flags::default(),
            serial: None,
            interface: None,
            destination: None,
            sender: None,
            unix_fds: None,
            signature: Signature::empty(),
            body: Vec::new(),
        }
    }

    /// Construct a method call.
    pub fn method_call(path: impl AsRef<str>, member: impl Into<String>) -> Result<Self> {
        Ok(Self::new(MessageKind::MethodCall {
            path: ObjectPath::new(path)?,
            member: member.into(),
        }))
    }

    /// Construct a method return replying to `reply_serial`.
    pub fn method_return(reply_serial: NonZeroU32) -> Self {
        Self::new(MessageKind::MethodReturn { reply_serial })
    }

    /// Construct an error reply to `reply_serial`.
    pub fn error(error_name: impl Into<String>, reply_serial: NonZeroU32) -> Self {
        Self::new(MessageKind::Error {
            error_name: error_name.into(),
            reply_serial,
        })
    }

    /// Construct a signal.
    pub fn signal(
        path: impl AsRef<str>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self::new(MessageKind::Signal {
            path: ObjectPath::new(path)?,
            interface: interface.into(),
            member: member.into(),
        }))
    }

    /// Construct a method return replying to this message, addressed back to
    /// its sender.
    pub fn reply(&self) -> Result<Self> {
        let serial = self.serial.ok_or(Error::InvalidSerial)?;
        let mut m = Self::method_return(serial);
        m.endianness = self.endianness;
        m.destination = self.sender.clone();
        Ok(m)
    }

    /// Construct an error replying to this message, with the conventional
    /// string body.
    pub fn error_reply(
        &self,
        error_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<Self> {
        let serial = self.serial.ok_or(Error::InvalidSerial)?;
        let mut m = Self::error(error_name, serial);
        m.endianness = self.endianness;
        m.destination = self.sender.clone();
        m.with_body(
            Signature::parse("s").expect("`s` is a valid signature"),
            &[Value::String(text.into())],
        )
    }

    /// Modify the endianness of the message.
    ///
    /// Endianness must be chosen before a body is attached, since the body
    /// is encoded eagerly.
    pub fn with_endianness(self, endianness: Endianness) -> Self {
        Self { endianness, ..self }
    }

    /// Modify the flags of the message.
    pub fn with_flags(self, flags: Flags) -> Self {
        Self { flags, ..self }
    }

    /// Modify the serial of the message.
    pub fn with_serial(self, serial: NonZeroU32) -> Self {
        Self {
            serial: Some(serial),
            ..self
        }
    }

    /// Modify the interface of a method call.
    pub fn with_interface(self, interface: impl Into<String>) -> Self {
        Self {
            interface: Some(interface.into()),
            ..self
        }
    }

    /// Modify the destination of the message.
    pub fn with_destination(self, destination: impl Into<String>) -> Self {
        Self {
            destination: Some(destination.into()),
            ..self
        }
    }

    /// Modify the sender of the message.
    pub fn with_sender(self, sender: impl Into<String>) -> Self {
        Self {
            sender: Some(sender.into()),
            ..self
        }
    }

    /// Attach a body described exactly by `signature`, encoded with the
    /// message endianness.
    pub fn with_body(self, signature: Signature, values: &[Value]) -> Result<Self> {
        let mut ser = Serializer::new(self.endianness);
        ser.write_values(&signature, values)?;
        let body = ser.finish();

        if body.len() > MAX_BODY_LENGTH as usize {
            return Err(Error::LengthOutOfRange {
                len: body.len() as u64,
                max: MAX_BODY_LENGTH as u64,
            });
        }

        Ok(Self {
            signature,
            body,
            ..self
        })
    }

    /// The kind of the message.
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn serial(&self) -> Option<NonZeroU32> {
        self.serial
    }

    /// The object path, for kinds that carry one.
    pub fn path(&self) -> Option<&ObjectPath> {
        match &self.kind {
            MessageKind::MethodCall { path, .. } => Some(path),
            MessageKind::Signal { path, .. } => Some(path),
            _ => None,
        }
    }

    /// The interface, from the kind for signals and the optional header
    /// field otherwise.
    pub fn interface(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Signal { interface, .. } => Some(interface),
            _ => self.interface.as_deref(),
        }
    }

    /// The member, for method calls and signals.
    pub fn member(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::MethodCall { member, .. } => Some(member),
            MessageKind::Signal { member, .. } => Some(member),
            _ => None,
        }
    }

    /// The serial this message replies to, for replies and errors.
    pub fn reply_serial(&self) -> Option<NonZeroU32> {
        match self.kind {
            MessageKind::MethodReturn { reply_serial } => Some(reply_serial),
            MessageKind::Error { reply_serial, .. } => Some(reply_serial),
            _ => None,
        }
    }

    /// The error name, for error replies.
    pub fn error_name(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Error { error_name, .. } => Some(error_name),
            _ => None,
        }
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// The signature of the body.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The raw body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Decode the body against its signature.
    ///
    /// Fails with [`Error::BodySignatureMismatch`] if the signature does not
    /// describe the body exactly.
    pub fn arguments(&self) -> Result<Vec<Value>> {
        let mut de = Deserializer::new(&self.body, self.endianness);
        let values = de.read_values(&self.signature)?;

        if !de.is_empty() {
            return Err(Error::BodySignatureMismatch);
        }

        Ok(values)
    }

    /// Check the invariants `serialize` relies on beyond what the types
    /// already enforce.
    pub fn validate(&self) -> Result<()> {
        if !self.body.is_empty() && self.signature.is_empty() {
            return Err(Error::MissingRequiredField("SIGNATURE"));
        }

        if self.body.len() > MAX_BODY_LENGTH as usize {
            return Err(Error::LengthOutOfRange {
                len: self.body.len() as u64,
                max: MAX_BODY_LENGTH as u64,
            });
        }

        Ok(())
    }

    pub(crate) fn message_type(&self) -> u8 {
        match self.kind {
            MessageKind::MethodCall { .. } => 1,
            MessageKind::MethodReturn { .. } => 2,
            MessageKind::Error { .. } => 3,
            MessageKind::Signal { .. } => 4,
        }
    }

    /// Whether the sender expects a reply to this message.
    pub(crate) fn expects_reply(&self) -> bool {
        matches!(self.kind, MessageKind::MethodCall { .. })
            && !self.flags.contains(Flags::NO_REPLY_EXPECTED)
    }
}

/// A decoded message payload: a signature and the values it describes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Body {
    pub signature: Signature,
    pub values: Vec<Value>,
}

impl Body {
    /// The empty payload.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(signature: Signature, values: Vec<Value>) -> Self {
        Self { signature, values }
    }

    pub fn is_empty(&self) -> bool {
        self.signature.is_empty() && self.values.is_empty()
    }
}
