//! The D-Bus type signature grammar.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;


/// Maximum length of a signature in bytes.
pub(crate) const MAX_SIGNATURE_LEN: usize = 255;
/// Maximum nesting of arrays and of structs, per the D-Bus specification.
pub(crate) const MAX_CONTAINER_DEPTH: usize = 32;

/// Detailed errors raised when parsing a [`Signature`] fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SignatureError {
    #[error("unknown type code {0:#04x} in signature")]
    UnknownTypeCode(u8),
    #[error("signature exceeds {MAX_SIGNATURE_LEN} bytes")]
    SignatureTooLong,
    #[error("array is missing an element type")]
    MissingArrayElementType,
    #[error("struct ended but was not started")]
    StructEndedButNotStarted,
    #[error("struct started but was not ended")]
    StructStartedButNotEnded,
    #[error("dict entry ended but was not started")]
    DictEndedButNotStarted,
    #[error("dict entry started but was not ended")]
    DictStartedButNotEnded,
    #[error("dict entry key must be a basic type")]
    DictKeyMustBeBasicType,
    #[error("dict entry has no fields")]
    DictEntryHasNoFields,
    #[error("dict entry has only one field")]
    DictEntryHasOnlyOneField,
    #[error("dict entry has more than two fields")]
    DictEntryHasTooManyFields,
    #[error("dict entry must be the element type of an array")]
    DictEntryNotInsideArray,
    #[error("exceeded maximum array nesting depth")]
    ExceededMaximumArrayRecursion,
    #[error("exceeded maximum struct nesting depth")]
    ExceededMaximumStructRecursion,
}

/// A single complete type within a [`Signature`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Element {
    /// 8-bit unsigned integer (`y`).
    Byte,
    /// Boolean, marshalled as 32-bit 0 or 1 (`b`).
    Bool,
    /// 16-bit signed integer (`n`).
    Int16,
    /// 16-bit unsigned integer (`q`).
    Uint16,
    /// 32-bit signed integer (`i`).
    Int32,
    /// 32-bit unsigned integer (`u`).
    Uint32,
    /// 64-bit signed integer (`x`).
    Int64,
    /// 64-bit unsigned integer (`t`).
    Uint64,
    /// IEEE 754 double (`d`).
    Double,
    /// UTF-8 string (`s`).
    String,
    /// Object path (`o`).
    ObjectPath,
    /// Type signature (`g`).
    Signature,
    /// Value carrying its own signature (`v`).
    Variant,
    /// Index into an out-of-band array of file descriptors (`h`).
    UnixFd,
    /// Array of a single element type (`aT`).
    Array(Box<Element>),
    /// Struct with zero or more fields (`(T1..Tn)`).
    Struct(Vec<Element>),
    /// Dict entry; only occurs as the element type of an array (`a{kv}`).
    Dict(Box<Element>, Box<Element>),
}

impl Element {
    /// Natural alignment of this element on the wire.
    pub fn alignment(&self) -> usize {
        match self {
            Element::Byte | Element::Signature | Element::Variant => 1,
            Element::Int16 | Element::Uint16 => 2,
            Element::Bool
            | Element::Int32
            | Element::Uint32
            | Element::UnixFd
            | Element::String
            | Element::ObjectPath
            | Element::Array(..) => 4,
            Element::Int64
            | Element::Uint64
            | Element::Double
            | Element::Struct(..)
            | Element::Dict(..) => 8,
        }
    }

    /// Whether this is a basic (non-container) type, permitted as dict key.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Element::Array(..) | Element::Struct(..) | Element::Dict(..) | Element::Variant
        )
    }

    /// Short kind name used in diagnostics.
    pub(crate) fn write_code(&self, out: &mut String) {
        match self {
            Element::Byte => out.push('y'),
            Element::Bool => out.push('b'),
            Element::Int16 => out.push('n'),
            Element::Uint16 => out.push('q'),
            Element::Int32 => out.push('i'),
            Element::Uint32 => out.push('u'),
            Element::Int64 => out.push('x'),
            Element::Uint64 => out.push('t'),
            Element::Double => out.push('d'),
            Element::String => out.push('s'),
            Element::ObjectPath => out.push('o'),
            Element::Signature => out.push('g'),
            Element::Variant => out.push('v'),
            Element::UnixFd => out.push('h'),
            Element::Array(inner) => {
                out.push('a');
                inner.write_code(out);
            }
            Element::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_code(out);
                }
                out.push(')');
            }
            Element::Dict(key, value) => {
                out.push('{');
                key.write_code(out);
                value.write_code(out);
                out.push('}');
            }
        }
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_code(&mut out);
        f.write_str(&out)
    }
}

/// A D-Bus type signature: an ordered sequence of [`Element`]s.
///
/// The empty signature is legal and describes zero values.
///
/// # Examples
///
/// ```
/// use minibus::Signature;
///
/// let sig = Signature::parse("a{sv}")?;
/// assert_eq!(sig.to_string(), "a{sv}");
/// assert_eq!(sig.elements().len(), 1);
/// # Ok::<_, minibus::SignatureError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    text: Box<str>,
    elements: Vec<Element>,
}

impl Signature {
    /// The empty signature.
    pub fn empty() -> Self {
        Self {
            text: Box::from(""),
            elements: Vec::new(),
        }
    }

    /// Parse a textual signature.
    pub fn parse(text: &str) -> Result<Self, SignatureError> {
        let bytes = text.as_bytes();

        if bytes.len() > MAX_SIGNATURE_LEN {
            return Err(SignatureError::SignatureTooLong);
        }

        let mut parser = Parser { bytes, pos: 0 };
        let mut elements = Vec::new();

        while !parser.is_done() {
            elements.push(parser.parse_one(0, 0)?);
        }

        Ok(Self {
            text: Box::from(text),
            elements,
        })
    }

    /// Build a signature from an element sequence.
    ///
    /// The rendered text is re-validated, so structurally invalid sequences
    /// (e.g. a bare dict entry) are rejected.
    pub fn from_elements(elements: Vec<Element>) -> Result<Self, SignatureError> {
        let mut text = String::new();

        for element in &elements {
            element.write_code(&mut text);
        }

        Self::parse(&text)
    }

    /// Build the signature of a single element.
    pub fn single(element: Element) -> Result<Self, SignatureError> {
        Self::from_elements(vec![element])
    }

    /// The canonical textual form.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The element sequence described by this signature.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// The sole element, when the signature holds exactly one.
    pub fn sole_element(&self) -> Option<&Element> {
        match &self.elements[..] {
            [element] => Some(element),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl Default for Signature {
    #[inline]
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for Signature {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Signature {
    type Err = SignatureError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for Signature {
    type Error = SignatureError;

    #[inline]
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn is_done(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn next(&mut self) -> Option<u8> {
        let b = self.bytes.get(self.pos).copied()?;
        self.pos += 1;
        Some(b)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    /// Parse one single complete type.
    fn parse_one(&mut self, arrays: usize, structs: usize) -> Result<Element, SignatureError> {
        let Some(b) = self.next() else {
            return Err(SignatureError::MissingArrayElementType);
        };

        let element = match b {
            b'y' => Element::Byte,
            b'b' => Element::Bool,
            b'n' => Element::Int16,
            b'q' => Element::Uint16,
            b'i' => Element::Int32,
            b'u' => Element::Uint32,
            b'x' => Element::Int64,
            b't' => Element::Uint64,
            b'd' => Element::Double,
            b's' => Element::String,
            b'o' => Element::ObjectPath,
            b'g' => Element::Signature,
            b'v' => Element::Variant,
            b'h' => Element::UnixFd,
            b'a' => {
                if arrays == MAX_CONTAINER_DEPTH {
                    return Err(SignatureError::ExceededMaximumArrayRecursion);
                }

                let inner = if self.peek() == Some(b'{') {
                    self.pos += 1;
                    self.parse_dict_entry(arrays + 1, structs)?
                } else {
                    self.parse_one(arrays + 1, structs)?
                };

                Element::Array(Box::new(inner))
            }
            b'(' => {
                if structs == MAX_CONTAINER_DEPTH {
                    return Err(SignatureError::ExceededMaximumStructRecursion);
                }

                let mut fields = Vec::new();

                loop {
                    match self.peek() {
                        Some(b')') => {
                            self.pos += 1;
                            break;
                        }
                        Some(..) => fields.push(self.parse_one(arrays, structs + 1)?),
                        None => return Err(SignatureError::StructStartedButNotEnded),
                    }
                }

                Element::Struct(fields)
            }
            b')' => return Err(SignatureError::StructEndedButNotStarted),
            b'{' => return Err(SignatureError::DictEntryNotInsideArray),
            b'}' => return Err(SignatureError::DictEndedButNotStarted),
            b => return Err(SignatureError::UnknownTypeCode(b)),
        };

        Ok(element)
    }

    /// Parse the interior of `a{`..`}`, positioned just past the brace.
    fn parse_dict_entry(&mut self, arrays: usize, structs: usize) -> Result<Element, SignatureError> {
        match self.peek() {
            Some(b'}') => return Err(SignatureError::DictEntryHasNoFields),
            None => return Err(SignatureError::DictStartedButNotEnded),
            Some(..) => {}
        }

        let key = self.parse_one(arrays, structs)?;

        if !key.is_basic() {
            return Err(SignatureError::DictKeyMustBeBasicType);
        }

        match self.peek() {
            Some(b'}') => return Err(SignatureError::DictEntryHasOnlyOneField),
            None => return Err(SignatureError::DictStartedButNotEnded),
            Some(..) => {}
        }

        let value = self.parse_one(arrays, structs)?;

        match self.next() {
            Some(b'}') => Ok(Element::Dict(Box::new(key), Box::new(value))),
            Some(..) => Err(SignatureError::DictEntryHasTooManyFields),
            None => Err(SignatureError::DictStartedButNotEnded),
        }
    }
}
