use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::signature::{Element, Signature, MAX_SIGNATURE_LEN};
use crate::value::Value;

use super::{padding_to, Endianness, MAX_ARRAY_LENGTH, MAX_STRING_LENGTH};

/// Encodes [`Value`]s against a [`Signature`] into wire bytes.
///
/// # Examples
///
/// ```
/// use minibus::{Endianness, Serializer, Signature, Value};
///
/// let mut ser = Serializer::new(Endianness::Little);
/// ser.write_values(&Signature::parse("s")?, &[Value::String("a".into())])?;
/// assert_eq!(ser.finish(), [1, 0, 0, 0, b'a', 0]);
/// # Ok::<_, minibus::Error>(())
/// ```
pub struct Serializer {
    endianness: Endianness,
    buf: Vec<u8>,
}

impl Serializer {
    /// Construct an empty serializer with the given endianness.
    pub fn new(endianness: Endianness) -> Self {
        Self {
            endianness,
            buf: Vec::new(),
        }
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Current length of the output, which is also the alignment position.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take the encoded bytes.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    /// Encode a sequence of values against a signature describing them
    /// exactly.
    pub fn write_values(&mut self, signature: &Signature, values: &[Value]) -> Result<()> {
        if signature.elements().len() != values.len() {
            return Err(Error::SignatureMismatch {
                expected: signature.to_string(),
                kind: "value sequence",
            });
        }

        for (element, value) in signature.elements().iter().zip(values) {
            self.write_value(element, value)?;
        }

        Ok(())
    }

    /// Encode one value against one signature element.
    pub fn write_value(&mut self, element: &Element, value: &Value) -> Result<()> {
        match (element, value) {
            (Element::Byte, Value::Byte(v)) => self.buf.push(*v),
            (Element::Bool, Value::Bool(v)) => self.write_u32(*v as u32),
            (Element::Int16, Value::Int16(v)) => self.write_u16(*v as u16),
            (Element::Uint16, Value::Uint16(v)) => self.write_u16(*v),
            (Element::Int32, Value::Int32(v)) => self.write_u32(*v as u32),
            (Element::Uint32, Value::Uint32(v)) => self.write_u32(*v),
            (Element::Int64, Value::Int64(v)) => self.write_u64(*v as u64),
            (Element::Uint64, Value::Uint64(v)) => self.write_u64(*v),
            (Element::Double, Value::Double(v)) => self.write_u64(v.to_bits()),
            (Element::String, Value::String(v)) => self.write_string(v)?,
            (Element::ObjectPath, Value::ObjectPath(v)) => self.write_string(v.as_str())?,
            (Element::Signature, Value::Signature(v)) => self.write_signature(v),
            (Element::UnixFd, Value::UnixFd(v)) => self.write_u32(*v),
            (Element::Array(inner), Value::Array(values)) => {
                self.write_array(inner, values.len(), |ser, i| {
                    ser.write_value(inner, &values[i])
                })?;
            }
            (Element::Array(inner), Value::Dict(entries)) => {
                let Element::Dict(key, val) = &**inner else {
                    return Err(mismatch(element, value));
                };

                self.write_array(inner, entries.len(), |ser, i| {
                    let (k, v) = &entries[i];
                    ser.align(8);
                    ser.write_value(key, k)?;
                    ser.write_value(val, v)
                })?;
            }
            (Element::Struct(fields), Value::Struct(values)) => {
                if fields.len() != values.len() {
                    return Err(mismatch(element, value));
                }

                self.align(8);

                for (field, v) in fields.iter().zip(values) {
                    self.write_value(field, v)?;
                }
            }
            (Element::Variant, Value::Variant(signature, inner)) => {
                let Some(sole) = signature.sole_element() else {
                    return Err(mismatch(element, value));
                };

                self.write_signature(signature);
                self.write_value(sole, inner)?;
            }
            _ => return Err(mismatch(element, value)),
        }

        Ok(())
    }

    /// Append raw bytes without alignment. Used for message body splicing.
    pub(crate) fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pad with zero bytes to the given alignment.
    pub(crate) fn align(&mut self, align: usize) {
        let padding = padding_to(align, self.buf.len());
        self.buf.resize(self.buf.len() + padding, 0);
    }

    pub(crate) fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub(crate) fn write_u16(&mut self, value: u16) {
        self.align(2);
        let mut bytes = [0; 2];
        match self.endianness {
            Endianness::Little => LittleEndian::write_u16(&mut bytes, value),
            Endianness::Big => BigEndian::write_u16(&mut bytes, value),
        }
        self.buf.extend_from_slice(&bytes);
    }

    pub(crate) fn write_u32(&mut self, value: u32) {
        self.align(4);
        let mut bytes = [0; 4];
        match self.endianness {
            Endianness::Little => LittleEndian::write_u32(&mut bytes, value),
            Endianness::Big => BigEndian::write_u32(&mut bytes, value),
        }
        self.buf.extend_from_slice(&bytes);
    }

    pub(crate) fn write_u64(&mut self, value: u64) {
        self.align(8);
        let mut bytes = [0; 8];
        match self.endianness {
            Endianness::Little => LittleEndian::write_u64(&mut bytes, value),
            Endianness::Big => BigEndian::write_u64(&mut bytes, value),
        }
        self.buf.extend_from_slice(&bytes);
    }

    /// uint32 length, UTF-8 bytes, NUL.
    fn write_string(&mut self, value: &str) -> Result<()> {
        if value.len() > MAX_STRING_LENGTH as usize {
            return Err(Error::LengthOutOfRange {
                len: value.len() as u64,
                max: MAX_STRING_LENGTH as u64,
            });
        }

        self.write_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    /// uint8 length, type codes, NUL. Parsed signatures never exceed 255.
    fn write_signature(&mut self, value: &Signature) {
        debug_assert!(value.as_str().len() <= MAX_SIGNATURE_LEN);
        self.buf.push(value.as_str().len() as u8);
        self.buf.extend_from_slice(value.as_str().as_bytes());
        self.buf.push(0);
    }

    /// uint32 content length, first-element alignment pad (also for empty
    /// arrays), then the content. The length excludes the pad and is patched
    /// in once the content is written.
    fn write_array(
        &mut self,
        element: &Element,
        len: usize,
        mut write: impl FnMut(&mut Self, usize) -> Result<()>,
    ) -> Result<()> {
        self.write_u32(0);
        let length_at = self.buf.len() - 4;

        self.align(element.alignment());
        let content_at = self.buf.len();

        for i in 0..len {
            write(self, i)?;
        }

        let content_len = self.buf.len() - content_at;

        if content_len > MAX_ARRAY_LENGTH as usize {
            return Err(Error::LengthOutOfRange {
                len: content_len as u64,
                max: MAX_ARRAY_LENGTH as u64,
            });
        }

        let slot = &mut self.buf[length_at..length_at + 4];
        match self.endianness {
            Endianness::Little => LittleEndian::write_u32(slot, content_len as u32),
            Endianness::Big => BigEndian::write_u32(slot, content_len as u32),
        }

        Ok(())
    }
}

fn mismatch(element: &Element, value: &Value) -> Error {
    Error::SignatureMismatch {
        expected: element.to_string(),
        kind: value.kind(),
    }
}
