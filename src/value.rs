//! The tagged-variant value model encoded and decoded by the codec.

use std::collections::HashMap;

use crate::object_path::ObjectPath;
use crate::signature::{Element, Signature};

/// A single D-Bus value.
///
/// Values are typed against a [`Signature`] when encoded; the serializer
/// checks each value against the signature element it is consuming.
///
/// # Examples
///
/// ```
/// use minibus::{Signature, Value};
///
/// let sig = Signature::parse("a{sv}")?;
/// let value = Value::Dict(vec![(
///     Value::String("Volume".into()),
///     Value::Variant(Signature::parse("u")?, Box::new(Value::Uint32(75))),
/// )]);
/// assert!(value.matches(&sig.elements()[0]));
/// # Ok::<_, minibus::SignatureError>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    String(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    /// Index into the out-of-band file descriptor array.
    UnixFd(u32),
    Array(Vec<Value>),
    Struct(Vec<Value>),
    /// Dict entries in insertion order. Keys may be any basic value.
    Dict(Vec<(Value, Value)>),
    /// A value carrying its own single-element signature.
    Variant(Signature, Box<Value>),
}

impl Value {
    /// Short kind name used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Byte(..) => "byte",
            Value::Bool(..) => "bool",
            Value::Int16(..) => "int16",
            Value::Uint16(..) => "uint16",
            Value::Int32(..) => "int32",
            Value::Uint32(..) => "uint32",
            Value::Int64(..) => "int64",
            Value::Uint64(..) => "uint64",
            Value::Double(..) => "double",
            Value::String(..) => "string",
            Value::ObjectPath(..) => "object path",
            Value::Signature(..) => "signature",
            Value::UnixFd(..) => "unix fd",
            Value::Array(..) => "array",
            Value::Struct(..) => "struct",
            Value::Dict(..) => "dict",
            Value::Variant(..) => "variant",
        }
    }

    /// Whether this value inhabits the given signature element.
    pub fn matches(&self, element: &Element) -> bool {
        match (self, element) {
            (Value::Byte(..), Element::Byte) => true,
            (Value::Bool(..), Element::Bool) => true,
            (Value::Int16(..), Element::Int16) => true,
            (Value::Uint16(..), Element::Uint16) => true,
            (Value::Int32(..), Element::Int32) => true,
            (Value::Uint32(..), Element::Uint32) => true,
            (Value::Int64(..), Element::Int64) => true,
            (Value::Uint64(..), Element::Uint64) => true,
            (Value::Double(..), Element::Double) => true,
            (Value::String(..), Element::String) => true,
            (Value::ObjectPath(..), Element::ObjectPath) => true,
            (Value::Signature(..), Element::Signature) => true,
            (Value::UnixFd(..), Element::UnixFd) => true,
            (Value::Array(values), Element::Array(inner)) => {
                values.iter().all(|v| v.matches(inner))
            }
            (Value::Dict(entries), Element::Array(inner)) => match &**inner {
                Element::Dict(key, value) => entries
                    .iter()
                    .all(|(k, v)| k.matches(key) && v.matches(value)),
                _ => false,
            },
            (Value::Struct(values), Element::Struct(fields)) => {
                values.len() == fields.len()
                    && values.iter().zip(fields).all(|(v, e)| v.matches(e))
            }
            (Value::Variant(signature, value), Element::Variant) => signature
                .sole_element()
                .is_some_and(|element| value.matches(element)),
            _ => false,
        }
    }

    /// Wrap a value in a variant carrying the given signature.
    pub fn variant(signature: Signature, value: Value) -> Self {
        Value::Variant(signature, Box::new(value))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::ObjectPath(p) => Some(p.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Value::Uint32(n) => Some(n),
            _ => None,
        }
    }

    /// The inner value of a variant, or the value itself.
    pub fn unwrap_variant(self) -> Value {
        match self {
            Value::Variant(_, value) => *value,
            value => value,
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                #[inline]
                fn from(value: $ty) -> Self {
                    Value::$variant(value)
                }
            }
        )*
    }
}

impl_from! {
    u8 => Byte,
    bool => Bool,
    i16 => Int16,
    u16 => Uint16,
    i32 => Int32,
    u32 => Uint32,
    i64 => Int64,
    u64 => Uint64,
    f64 => Double,
    String => String,
    ObjectPath => ObjectPath,
    Signature => Signature,
}

impl From<&str> for Value {
    #[inline]
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<HashMap<String, Value>> for Value {
    fn from(map: HashMap<String, Value>) -> Self {
        let mut entries: Vec<_> = map.into_iter().collect();
        // Deterministic entry order for stable serialization.
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (Value::String(k), v))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::Value;
    use crate::signature::Signature;

    #[test]
    fn matches_containers() {
        let sig = Signature::parse("a(si)").unwrap();
        let value = Value::Array(vec![
            Value::Struct(vec![Value::String("a".into()), Value::Int32(1)]),
            Value::Struct(vec![Value::String("b".into()), Value::Int32(2)]),
        ]);
        assert!(value.matches(&sig.elements()[0]));

        let wrong = Value::Array(vec![Value::Struct(vec![Value::Int32(1)])]);
        assert!(!wrong.matches(&sig.elements()[0]));
    }

    #[test]
    fn matches_dict_as_array_element() {
        let sig = Signature::parse("a{su}").unwrap();
        let value = Value::Dict(vec![(Value::String("a".into()), Value::Uint32(1))]);
        assert!(value.matches(&sig.elements()[0]));

        let bad_key = Value::Dict(vec![(Value::Uint32(1), Value::Uint32(1))]);
        assert!(!bad_key.matches(&sig.elements()[0]));
    }

    #[test]
    fn variant_requires_single_element() {
        let sig = Signature::parse("v").unwrap();
        let ok = Value::variant(Signature::parse("y").unwrap(), Value::Byte(1));
        assert!(ok.matches(&sig.elements()[0]));

        let two = Value::variant(Signature::parse("yy").unwrap(), Value::Byte(1));
        assert!(!two.matches(&sig.elements()[0]));
    }
}
