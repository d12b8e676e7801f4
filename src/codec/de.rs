use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::object_path::ObjectPath;
use crate::signature::{Element, Signature};
use crate::value::Value;

use super::{padding_to, Endianness, MAX_ARRAY_LENGTH, MAX_STRING_LENGTH};

/// Decodes wire bytes into [`Value`]s as described by a [`Signature`].
///
/// The deserializer walks the signature, skipping and verifying padding,
/// and fails on any malformed input: truncation, non-zero padding, invalid
/// UTF-8, missing NUL terminators, out-of-range lengths, and booleans other
/// than 0 or 1.
///
/// # Examples
///
/// ```
/// use minibus::{Deserializer, Endianness, Signature, Value};
///
/// let mut de = Deserializer::new(&[1, 0, 0, 0, b'a', 0], Endianness::Little);
/// let values = de.read_values(&Signature::parse("s")?)?;
/// assert_eq!(values, [Value::String("a".into())]);
/// # Ok::<_, minibus::Error>(())
/// ```
pub struct Deserializer<'de> {
    buf: &'de [u8],
    pos: usize,
    endianness: Endianness,
}

impl<'de> Deserializer<'de> {
    /// Construct a deserializer over a buffer whose start is the alignment
    /// origin.
    pub fn new(buf: &'de [u8], endianness: Endianness) -> Self {
        Self {
            buf,
            pos: 0,
            endianness,
        }
    }

    /// Construct a deserializer positioned mid-buffer. Alignment stays
    /// relative to the buffer start.
    pub(crate) fn with_offset(buf: &'de [u8], pos: usize, endianness: Endianness) -> Self {
        Self {
            buf,
            pos,
            endianness,
        }
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Current read position, relative to the buffer start.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Whether all input has been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    /// Decode a sequence of values described by the signature.
    pub fn read_values(&mut self, signature: &Signature) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(signature.elements().len());

        for element in signature.elements() {
            values.push(self.read_value(element)?);
        }

        Ok(values)
    }

    /// Decode one value described by one signature element.
    pub fn read_value(&mut self, element: &Element) -> Result<Value> {
        let value = match element {
            Element::Byte => Value::Byte(self.read_u8()?),
            Element::Bool => match self.read_u32()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => return Err(Error::InvalidBool(other)),
            },
            Element::Int16 => Value::Int16(self.read_u16()? as i16),
            Element::Uint16 => Value::Uint16(self.read_u16()?),
            Element::Int32 => Value::Int32(self.read_u32()? as i32),
            Element::Uint32 => Value::Uint32(self.read_u32()?),
            Element::Int64 => Value::Int64(self.read_u64()? as i64),
            Element::Uint64 => Value::Uint64(self.read_u64()?),
            Element::Double => Value::Double(f64::from_bits(self.read_u64()?)),
            Element::String => Value::String(self.read_string()?.to_owned()),
            Element::ObjectPath => Value::ObjectPath(ObjectPath::new(self.read_string()?)?),
            Element::Signature => Value::Signature(self.read_signature()?),
            Element::UnixFd => Value::UnixFd(self.read_u32()?),
            Element::Array(inner) => match &**inner {
                Element::Dict(key, value) => {
                    let mut entries = Vec::new();

                    self.read_array(inner, |de| {
                        de.align(8)?;
                        let k = de.read_value(key)?;
                        let v = de.read_value(value)?;
                        entries.push((k, v));
                        Ok(())
                    })?;

                    Value::Dict(entries)
                }
                _ => {
                    let mut values = Vec::new();

                    self.read_array(inner, |de| {
                        values.push(de.read_value(inner)?);
                        Ok(())
                    })?;

                    Value::Array(values)
                }
            },
            Element::Struct(fields) => {
                self.align(8)?;

                let mut values = Vec::with_capacity(fields.len());

                for field in fields {
                    values.push(self.read_value(field)?);
                }

                Value::Struct(values)
            }
            Element::Dict(..) => {
                // Dict entries only occur under an array, enforced at parse.
                return Err(Error::BodySignatureMismatch);
            }
            Element::Variant => {
                let signature = self.read_signature()?;

                let Some(sole) = signature.sole_element() else {
                    return Err(Error::SignatureMismatch {
                        expected: "single complete type".to_owned(),
                        kind: "variant signature",
                    });
                };

                let value = self.read_value(&sole.clone())?;
                Value::Variant(signature, Box::new(value))
            }
        };

        Ok(value)
    }

    /// Skip padding to the given alignment, verifying the bytes are zero.
    pub(crate) fn align(&mut self, align: usize) -> Result<()> {
        let padding = padding_to(align, self.pos);

        if self.pos + padding > self.buf.len() {
            return Err(Error::Truncated);
        }

        for _ in 0..padding {
            if self.buf[self.pos] != 0 {
                return Err(Error::AlignmentViolation(self.pos));
            }

            self.pos += 1;
        }

        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'de [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::Truncated);
        }

        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        self.align(2)?;
        let bytes = self.take(2)?;
        Ok(match self.endianness {
            Endianness::Little => LittleEndian::read_u16(bytes),
            Endianness::Big => BigEndian::read_u16(bytes),
        })
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        let bytes = self.take(4)?;
        Ok(match self.endianness {
            Endianness::Little => LittleEndian::read_u32(bytes),
            Endianness::Big => BigEndian::read_u32(bytes),
        })
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        self.align(8)?;
        let bytes = self.take(8)?;
        Ok(match self.endianness {
            Endianness::Little => LittleEndian::read_u64(bytes),
            Endianness::Big => BigEndian::read_u64(bytes),
        })
    }

    fn read_string(&mut self) -> Result<&'de str> {
        let len = self.read_u32()?;

        if len > MAX_STRING_LENGTH {
            return Err(Error::LengthOutOfRange {
                len: len as u64,
                max: MAX_STRING_LENGTH as u64,
            });
        }

        let bytes = self.take(len as usize + 1)?;

        let Some((&0, content)) = bytes.split_last() else {
            return Err(Error::NotNullTerminated);
        };

        Ok(std::str::from_utf8(content)?)
    }

    fn read_signature(&mut self) -> Result<Signature> {
        let len = self.read_u8()? as usize;
        let bytes = self.take(len + 1)?;

        let Some((&0, content)) = bytes.split_last() else {
            return Err(Error::NotNullTerminated);
        };

        Ok(Signature::parse(std::str::from_utf8(content)?)?)
    }

    /// Read the array framing and invoke `read` per element until the
    /// declared content region is consumed. The element count is never
    /// inferred from the length.
    fn read_array(
        &mut self,
        element: &Element,
        mut read: impl FnMut(&mut Self) -> Result<()>,
    ) -> Result<()> {
        let len = self.read_u32()?;

        if len > MAX_ARRAY_LENGTH {
            return Err(Error::LengthOutOfRange {
                len: len as u64,
                max: MAX_ARRAY_LENGTH as u64,
            });
        }

        // The first-element pad is present even for empty arrays and is not
        // counted by the length.
        self.align(element.alignment())?;

        let end = self.pos + len as usize;

        if end > self.buf.len() {
            return Err(Error::LengthOutOfRange {
                len: len as u64,
                max: (self.buf.len() - self.pos) as u64,
            });
        }

        while self.pos < end {
            read(self)?;
        }

        if self.pos != end {
            // The last element overran the declared content region.
            return Err(Error::Truncated);
        }

        Ok(())
    }
}
