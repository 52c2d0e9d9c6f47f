use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 fingerprint of a [`Key`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl Hash32 {
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        Hash32(blake3::Hasher::new().update(buffer.as_ref()).finalize().into())
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// One typed component of a [`Key`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyPart {
    Int(i64),
    Uint(u64),
    Str(String),
    Bool(bool),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Int(v) => write!(f, "{v}"),
            KeyPart::Uint(v) => write!(f, "{v}u"),
            KeyPart::Str(v) => write!(f, "{v:?}"),
            KeyPart::Bool(v) => write!(f, "{v}"),
        }
    }
}

macro_rules! impl_key_part {
    ($variant:ident as $target:ty: $($t:ty),+) => {
        $(
            impl From<$t> for KeyPart {
                fn from(value: $t) -> Self {
                    KeyPart::$variant(value as $target)
                }
            }
        )+
    };
}

impl_key_part!(Int as i64: i8, i16, i32, i64, isize);
impl_key_part!(Uint as u64: u8, u16, u32, u64, usize);

impl From<bool> for KeyPart {
    fn from(value: bool) -> Self {
        KeyPart::Bool(value)
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        KeyPart::Str(value.to_owned())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        KeyPart::Str(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
struct KeyInner {
    name: String,
    parts: Vec<KeyPart>,
}

/// Identifies a logical variable instance, or a publication version.
///
/// A key is a name followed by any number of typed parts, for example the
/// rank that owns a piece of data and the iteration it belongs to. Keys are
/// immutable and cheap to clone.
///
/// # Example
///
/// ```rust
/// use nagare::{Key, key};
///
/// let a = key!("temperature", 3, "west");
/// let b = Key::new("temperature").with(3).with("west");
/// assert_eq!(a, b);
/// ```
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Arc<KeyInner>);

impl Serialize for Key {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        KeyInner::deserialize(deserializer).map(|inner| Key(Arc::new(inner)))
    }
}

impl Key {
    pub fn new(name: impl Into<String>) -> Self {
        Key(Arc::new(KeyInner {
            name: name.into(),
            parts: Vec::new(),
        }))
    }

    /// The key used for the default publication version.
    pub fn empty() -> Self {
        Key::new("")
    }

    pub fn with(self, part: impl Into<KeyPart>) -> Self {
        let mut inner = Arc::unwrap_or_clone(self.0);
        inner.parts.push(part.into());
        Key(Arc::new(inner))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0.parts
    }

    pub fn is_empty(&self) -> bool {
        self.0.name.is_empty() && self.0.parts.is_empty()
    }

    /// Encodes the key as CBOR.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        // Writing into a Vec cannot fail and every part is serializable.
        if ciborium::into_writer(&*self.0, &mut buffer).is_err() {
            buffer.clear();
        }
        buffer
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ciborium::de::Error<std::io::Error>> {
        let inner: KeyInner = ciborium::from_reader(bytes)?;
        Ok(Key(Arc::new(inner)))
    }

    pub fn digest(&self) -> Hash32 {
        Hash32::hash(self.to_bytes())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "<empty>");
        }

        write!(f, "{}", self.0.name)?;
        if !self.0.parts.is_empty() {
            write!(f, "(")?;
            for (i, part) in self.0.parts.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{part}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({self})")
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::new(value)
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::new(value)
    }
}

/// Builds a [`Key`] from a name and any number of parts.
#[macro_export]
macro_rules! key {
    ($name:expr $(, $part:expr)* $(,)?) => {
        $crate::Key::new($name)$(.with($part))*
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_equality_and_order() {
        let a = key!("x", 1, "left");
        let b = Key::new("x").with(1).with("left");
        let c = key!("x", 2);

        assert_eq!(a, b);
        assert!(a < c);
        assert_ne!(a, key!("x", 1u32, "left"));
    }

    #[test]
    fn test_key_bytes() {
        let a = key!("field", 7, true, "north");
        let bytes = a.to_bytes();
        assert!(!bytes.is_empty());
        assert_eq!(Key::from_bytes(&bytes).unwrap(), a);
    }

    #[test]
    fn test_digest_distinguishes_parts() {
        let a = key!("field", 1);
        let b = key!("field", 2);
        assert_eq!(a.digest(), key!("field", 1).digest());
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest().to_hex().len(), 64);
    }

    #[test]
    fn test_display() {
        assert_eq!(key!("h", 0, "s").to_string(), "h(0, \"s\")");
        assert_eq!(Key::empty().to_string(), "<empty>");
        assert_eq!(Key::new("plain").to_string(), "plain");
    }
}
