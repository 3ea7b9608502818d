//! Raw key helpers: ordered key ranges and hex rendering for logs and
//! persisted metadata.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Half-open key range `[start_key, end_key)`.
///
/// An empty `end_key` means the range is unbounded and runs to the end of
/// the key space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    #[serde(with = "hex_bytes")]
    pub start_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub end_key: Vec<u8>,
}

impl KeyRange {
    /// Creates a range from raw start and end keys.
    #[must_use]
    pub fn new(start_key: impl Into<Vec<u8>>, end_key: impl Into<Vec<u8>>) -> Self {
        Self {
            start_key: start_key.into(),
            end_key: end_key.into(),
        }
    }

    /// The whole key space.
    #[must_use]
    pub fn full() -> Self {
        Self::default()
    }

    /// Returns `true` when the range has no upper bound.
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.end_key.is_empty()
    }

    /// Returns `true` when a bounded range contains no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.is_unbounded() && self.start_key >= self.end_key
    }

    /// Returns `true` once `cursor` has walked past the end of this range.
    ///
    /// An empty cursor marks the end of the key space.
    #[must_use]
    pub fn is_exhausted_at(&self, cursor: &[u8]) -> bool {
        cursor.is_empty() || (!self.is_unbounded() && cursor >= self.end_key.as_slice())
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            KeyDisplay::from(self.start_key.as_slice()),
            KeyDisplay::from(self.end_key.as_slice())
        )
    }
}

/// Owned key rendered as upper-case hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDisplay(Vec<u8>);

impl KeyDisplay {
    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for KeyDisplay {
    fn from(key: &[u8]) -> Self {
        Self(key.to_vec())
    }
}

impl fmt::Display for KeyDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("\"\"")
        } else {
            f.write_str(&hex::encode_upper(&self.0))
        }
    }
}

/// Serde adapter storing byte keys as hex strings.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode_upper(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
