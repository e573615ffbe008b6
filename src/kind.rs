use serde::{Deserialize, Serialize};

/// Buffer layout of a session, fixed at open time
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// Raw caller-formatted bytes, usually text lines
    #[default]
    Text,
    /// Three independent streams of integers, floats and raw bytes
    Binary,
}

/// Payload kinds carried by the binary variant.
///
/// The discriminant order is also the order kinds are laid out inside a chunk.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PayloadKind {
    Ints = 0,
    Floats = 1,
    Bytes = 2,
}

impl PayloadKind {
    pub const ALL: [PayloadKind; 3] = [PayloadKind::Ints, PayloadKind::Floats, PayloadKind::Bytes];

    /// Encoded width of one element
    pub fn width(self) -> usize {
        match self {
            PayloadKind::Ints => 8,
            PayloadKind::Floats => 8,
            PayloadKind::Bytes => 1,
        }
    }
}
