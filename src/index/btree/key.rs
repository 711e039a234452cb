//! Index key types and their on-page encoding.
//!
//! A tree is created with a fixed [`KeyType`]; every key handed to it
//! must match. Keys are stored as raw bytes in the node key heap and
//! decoded back through the tree's declared type, so the encoding
//! carries no type tag of its own.

use std::cmp::Ordering;
use std::fmt;

use crate::common::{Error, Result};

/// The key type a tree is declared with at creation time.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// 32-bit signed integer keys.
    Int = 1,
    /// UTF-8 string keys.
    Str = 2,
}

impl KeyType {
    /// Convert from the persisted byte, or None for an unknown value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(KeyType::Int),
            2 => Some(KeyType::Str),
            _ => None,
        }
    }
}

/// An index key: either an integer or a string.
///
/// Ordering is only defined between keys of the same type; the tree
/// rejects mismatched keys at the API boundary, so `cmp` treats a
/// cross-type comparison as a logic error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    Int(i32),
    Str(String),
}

impl Key {
    /// The [`KeyType`] of this key.
    pub fn key_type(&self) -> KeyType {
        match self {
            Key::Int(_) => KeyType::Int,
            Key::Str(_) => KeyType::Str,
        }
    }

    /// Encoded size in bytes: 4 for integers, the UTF-8 byte length for
    /// strings.
    pub fn encoded_len(&self) -> usize {
        match self {
            Key::Int(_) => 4,
            Key::Str(s) => s.len(),
        }
    }

    /// Encode the key into its on-page byte form.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Key::Int(v) => v.to_le_bytes().to_vec(),
            Key::Str(s) => s.as_bytes().to_vec(),
        }
    }

    /// Decode a key of the given type from its on-page byte form.
    ///
    /// # Errors
    /// Returns `Error::KeyTypeMismatch` if the bytes cannot represent a
    /// key of `key_type` (wrong length for Int, invalid UTF-8 for Str).
    pub fn decode(key_type: KeyType, bytes: &[u8]) -> Result<Self> {
        match key_type {
            KeyType::Int => {
                let arr: [u8; 4] = bytes.try_into().map_err(|_| Error::KeyTypeMismatch)?;
                Ok(Key::Int(i32::from_le_bytes(arr)))
            }
            KeyType::Str => {
                let s = std::str::from_utf8(bytes).map_err(|_| Error::KeyTypeMismatch)?;
                Ok(Key::Str(s.to_owned()))
            }
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Int(a), Key::Int(b)) => a.cmp(b),
            (Key::Str(a), Key::Str(b)) => a.cmp(b),
            // The tree validates key types at its boundary.
            _ => panic!("cannot compare keys of different types"),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(v) => write!(f, "{v}"),
            Key::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i32> for Key {
    fn from(v: i32) -> Self {
        Key::Int(v)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_owned())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_roundtrip() {
        for v in [i32::MIN, -1, 0, 1, 42, i32::MAX] {
            let key = Key::Int(v);
            let bytes = key.encode();
            assert_eq!(bytes.len(), key.encoded_len());
            assert_eq!(Key::decode(KeyType::Int, &bytes).unwrap(), key);
        }
    }

    #[test]
    fn str_roundtrip() {
        for s in ["", "a", "hello world", "üñíçødé"] {
            let key = Key::from(s);
            let bytes = key.encode();
            assert_eq!(bytes.len(), key.encoded_len());
            assert_eq!(Key::decode(KeyType::Str, &bytes).unwrap(), key);
        }
    }

    #[test]
    fn decode_rejects_bad_input() {
        assert!(Key::decode(KeyType::Int, &[1, 2, 3]).is_err());
        assert!(Key::decode(KeyType::Str, &[0xFF, 0xFE]).is_err());
    }

    #[test]
    fn ordering() {
        assert!(Key::Int(-5) < Key::Int(3));
        assert!(Key::from("apple") < Key::from("banana"));
        assert!(Key::from("app") < Key::from("apple"));
    }

    #[test]
    #[should_panic(expected = "different types")]
    fn cross_type_comparison_panics() {
        let _ = Key::Int(1) < Key::from("one");
    }

    #[test]
    fn key_type_from_u8() {
        assert_eq!(KeyType::from_u8(1), Some(KeyType::Int));
        assert_eq!(KeyType::from_u8(2), Some(KeyType::Str));
        assert_eq!(KeyType::from_u8(0), None);
        assert_eq!(KeyType::from_u8(9), None);
    }
}
