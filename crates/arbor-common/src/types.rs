//! Attribute datatypes indexable by Arbor.

use serde::{Deserialize, Serialize};

/// Fixed length of STRING index keys, in bytes.
///
/// Longer attribute values are truncated to this prefix; shorter values are
/// NUL-padded. Comparison always covers the full ten bytes.
pub const STRING_KEY_SIZE: usize = 10;

/// Datatype of the attribute over which an index is built.
///
/// The discriminant is stored in the index meta page, so values must stay
/// stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Datatype {
    /// 32-bit signed integer.
    Int = 0,
    /// 64-bit IEEE-754 double.
    Double = 1,
    /// Fixed 10-byte string prefix.
    String = 2,
}

impl Datatype {
    /// Returns the on-page key size in bytes for this datatype.
    pub fn key_size(&self) -> usize {
        match self {
            Datatype::Int => 4,
            Datatype::Double => 8,
            Datatype::String => STRING_KEY_SIZE,
        }
    }

    /// Decodes a datatype from its stored discriminant.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Datatype::Int),
            1 => Some(Datatype::Double),
            2 => Some(Datatype::String),
            _ => None,
        }
    }
}

impl std::fmt::Display for Datatype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Datatype::Int => "INT",
            Datatype::Double => "DOUBLE",
            Datatype::String => "STRING",
        };
        write!(f, "{}", name)
    }
}
