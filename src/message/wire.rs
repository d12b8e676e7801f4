//! The wire form of [`Message`]: fixed header, `a(yv)` header-field array,
//! 8-aligned body.

use std::num::NonZeroU32;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::debug;

use crate::codec::{
    padding_to, Deserializer, Endianness, Serializer, MAX_ARRAY_LENGTH, MAX_BODY_LENGTH,
};
use crate::error::{Error, Result};
use crate::object_path::ObjectPath;
use crate::signature::{Element, Signature};
use crate::value::Value;

use super::{Flags, Message, MessageKind, PROTOCOL_VERSION};

/// Length of the fixed header plus the header-field array length.
pub(crate) const FIXED_HEADER_LEN: usize = 16;

/// Header field codes.
mod field {
    pub(super) const PATH: u8 = 1;
    pub(super) const INTERFACE: u8 = 2;
    pub(super) const MEMBER: u8 = 3;
    pub(super) const ERROR_NAME: u8 = 4;
    pub(super) const REPLY_SERIAL: u8 = 5;
    pub(super) const DESTINATION: u8 = 6;
    pub(super) const SENDER: u8 = 7;
    pub(super) const SIGNATURE: u8 = 8;
    pub(super) const UNIX_FDS: u8 = 9;
}

/// The element describing the header-field array, `a(yv)`.
fn header_array_element() -> Element {
    Element::Array(Box::new(Element::Struct(vec![
        Element::Byte,
        Element::Variant,
    ])))
}

/// Given the first sixteen bytes of a message, the number of bytes left in
/// its frame: the header-field array, its padding, and the body.
pub(crate) fn frame_remaining(head: &[u8]) -> Result<usize> {
    debug_assert!(head.len() >= FIXED_HEADER_LEN);

    let endianness =
        Endianness::from_marker(head[0]).ok_or(Error::InvalidEndianness(head[0]))?;

    let (body_len, fields_len) = match endianness {
        Endianness::Little => (
            LittleEndian::read_u32(&head[4..8]),
            LittleEndian::read_u32(&head[12..16]),
        ),
        Endianness::Big => (
            BigEndian::read_u32(&head[4..8]),
            BigEndian::read_u32(&head[12..16]),
        ),
    };

    if body_len > MAX_BODY_LENGTH {
        return Err(Error::LengthOutOfRange {
            len: body_len as u64,
            max: MAX_BODY_LENGTH as u64,
        });
    }

    if fields_len > MAX_ARRAY_LENGTH {
        return Err(Error::LengthOutOfRange {
            len: fields_len as u64,
            max: MAX_ARRAY_LENGTH as u64,
        });
    }

    let fields_len = fields_len as usize;
    let header_end = FIXED_HEADER_LEN + fields_len;

    Ok(fields_len + padding_to(8, header_end) + body_len as usize)
}

impl Message {
    /// Serialize the message into wire bytes.
    ///
    /// Fails with [`Error::InvalidSerial`] when no serial has been assigned.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let serial = self.serial.ok_or(Error::InvalidSerial)?;
        self.validate()?;

        let mut ser = Serializer::new(self.endianness);
        ser.write_u8(self.endianness.marker());
        ser.write_u8(self.message_type());
        ser.write_u8(self.flags.bits());
        ser.write_u8(PROTOCOL_VERSION);
        ser.write_u32(self.body.len() as u32);
        ser.write_u32(serial.get());

        ser.write_value(&header_array_element(), &self.header_fields())?;

        ser.align(8);
        ser.extend_from_slice(&self.body);
        Ok(ser.finish())
    }

    /// The header-field array, fields ordered ascending by code.
    fn header_fields(&self) -> Value {
        let mut fields = Vec::new();

        let mut push = |code: u8, signature: &str, value: Value| {
            let signature = Signature::parse(signature).expect("valid field signature");
            fields.push(Value::Struct(vec![
                Value::Byte(code),
                Value::variant(signature, value),
            ]));
        };

        match &self.kind {
            MessageKind::MethodCall { path, member } => {
                push(field::PATH, "o", Value::ObjectPath(path.clone()));

                if let Some(interface) = &self.interface {
                    push(field::INTERFACE, "s", Value::String(interface.clone()));
                }

                push(field::MEMBER, "s", Value::String(member.clone()));
            }
            MessageKind::MethodReturn { reply_serial } => {
                push(field::REPLY_SERIAL, "u", Value::Uint32(reply_serial.get()));
            }
            MessageKind::Error {
                error_name,
                reply_serial,
            } => {
                push(field::ERROR_NAME, "s", Value::String(error_name.clone()));
                push(field::REPLY_SERIAL, "u", Value::Uint32(reply_serial.get()));
            }
            MessageKind::Signal {
                path,
                interface,
                member,
            } => {
                push(field::PATH, "o", Value::ObjectPath(path.clone()));
                push(field::INTERFACE, "s", Value::String(interface.clone()));
                push(field::MEMBER, "s", Value::String(member.clone()));
            }
        }

        if let Some(destination) = &self.destination {
            push(field::DESTINATION, "s", Value::String(destination.clone()));
        }

        if let Some(sender) = &self.sender {
            push(field::SENDER, "s", Value::String(sender.clone()));
        }

        if !self.signature.is_empty() {
            push(
                field::SIGNATURE,
                "g",
                Value::Signature(self.signature.clone()),
            );
        }

        if let Some(unix_fds) = self.unix_fds {
            push(field::UNIX_FDS, "u", Value::Uint32(unix_fds));
        }

        fields.sort_by_key(|entry| match entry {
            Value::Struct(fields) => match fields[0] {
                Value::Byte(code) => code,
                _ => u8::MAX,
            },
            _ => u8::MAX,
        });

        Value::Array(fields)
    }

    /// Parse a complete message frame.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FIXED_HEADER_LEN {
            return Err(Error::Truncated);
        }

        let endianness =
            Endianness::from_marker(bytes[0]).ok_or(Error::InvalidEndianness(bytes[0]))?;

        let message_type = bytes[1];

        if !(1..=4).contains(&message_type) {
            return Err(Error::InvalidMessageType(message_type));
        }

        // Unknown flag bits must be ignored.
        let flags = Flags::from_bits_truncate(bytes[2]);

        if bytes[3] != PROTOCOL_VERSION {
            return Err(Error::UnsupportedProtocolVersion(bytes[3]));
        }

        let (body_len, serial) = match endianness {
            Endianness::Little => (
                LittleEndian::read_u32(&bytes[4..8]),
                LittleEndian::read_u32(&bytes[8..12]),
            ),
            Endianness::Big => (
                BigEndian::read_u32(&bytes[4..8]),
                BigEndian::read_u32(&bytes[8..12]),
            ),
        };

        let serial = NonZeroU32::new(serial).ok_or(Error::InvalidSerial)?;

        // The field array starts at offset 12, so decoding with the message
        // origin keeps every nested alignment correct.
        let mut de = Deserializer::with_offset(bytes, 12, endianness);
        let fields = de.read_value(&header_array_element())?;
        de.align(8)?;

        let body = &bytes[de.pos()..];

        if (body.len() as u64) != body_len as u64 {
            return Err(Error::Truncated);
        }

        let mut header = HeaderFields::default();
        header.collect(fields)?;

        let kind = header.take_kind(message_type)?;

        if !body.is_empty() && header.signature.is_none() {
            return Err(Error::MissingRequiredField("SIGNATURE"));
        }

        Ok(Message {
            kind,
            endianness,
            flags,
            serial: Some(serial),
            interface: match message_type {
                // Signals carry the interface in their kind.
                4 => None,
                _ => header.interface,
            },
            destination: header.destination,
            sender: header.sender,
            unix_fds: header.unix_fds,
            signature: header.signature.unwrap_or_default(),
            body: body.to_vec(),
        })
    }
}

/// Header fields recovered while parsing, prior to kind assembly.
#[derive(Default)]
struct HeaderFields {
    path: Option<ObjectPath>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    reply_serial: Option<NonZeroU32>,
    destination: Option<String>,
    sender: Option<String>,
    signature: Option<Signature>,
    unix_fds: Option<u32>,
}

impl HeaderFields {
    fn collect(&mut self, fields: Value) -> Result<()> {
        let Value::Array(entries) = fields else {
            return Err(Error::BodySignatureMismatch);
        };

        for entry in entries {
            let Value::Struct(entry) = entry else {
                return Err(Error::BodySignatureMismatch);
            };

            let [Value::Byte(code), variant] = &entry[..] else {
                return Err(Error::BodySignatureMismatch);
            };

            let value = variant.clone().unwrap_variant();

            match (*code, value) {
                (field::PATH, Value::ObjectPath(path)) => self.path = Some(path),
                (field::INTERFACE, Value::String(s)) => self.interface = Some(s),
                (field::MEMBER, Value::String(s)) => self.member = Some(s),
                (field::ERROR_NAME, Value::String(s)) => self.error_name = Some(s),
                (field::REPLY_SERIAL, Value::Uint32(n)) => {
                    self.reply_serial = Some(NonZeroU32::new(n).ok_or(Error::InvalidSerial)?);
                }
                (field::DESTINATION, Value::String(s)) => self.destination = Some(s),
                (field::SENDER, Value::String(s)) => self.sender = Some(s),
                (field::SIGNATURE, Value::Signature(s)) => self.signature = Some(s),
                (field::UNIX_FDS, Value::Uint32(n)) => self.unix_fds = Some(n),
                (code @ field::PATH..=field::UNIX_FDS, ..) => {
                    return Err(Error::InvalidHeaderField(code));
                }
                (code, ..) => {
                    // Receivers must ignore fields they do not know about.
                    debug!("ignoring unknown header field {code}");
                }
            }
        }

        Ok(())
    }

    fn take_kind(&mut self, message_type: u8) -> Result<MessageKind> {
        let kind = match message_type {
            1 => MessageKind::MethodCall {
                path: self
                    .path
                    .take()
                    .ok_or(Error::MissingRequiredField("PATH"))?,
                member: self
                    .member
                    .take()
                    .ok_or(Error::MissingRequiredField("MEMBER"))?,
            },
            2 => MessageKind::MethodReturn {
                reply_serial: self
                    .reply_serial
                    .ok_or(Error::MissingRequiredField("REPLY_SERIAL"))?,
            },
            3 => MessageKind::Error {
                error_name: self
                    .error_name
                    .take()
                    .ok_or(Error::MissingRequiredField("ERROR_NAME"))?,
                reply_serial: self
                    .reply_serial
                    .ok_or(Error::MissingRequiredField("REPLY_SERIAL"))?,
            },
            4 => MessageKind::Signal {
                path: self
                    .path
                    .take()
                    .ok_or(Error::MissingRequiredField("PATH"))?,
                interface: self
                    .interface
                    .take()
                    .ok_or(Error::MissingRequiredField("INTERFACE"))?,
                member: self
                    .member
                    .take()
                    .ok_or(Error::MissingRequiredField("MEMBER"))?,
            },
            n => return Err(Error::InvalidMessageType(n)),
        };

        Ok(kind)
    }
}
