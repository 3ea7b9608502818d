//! Hybrid logical timestamps issued by the cluster's timing authority.
//!
//! A timestamp is a millisecond physical clock reading paired with a logical
//! counter that disambiguates timestamps issued inside the same tick. On the
//! wire the pair is packed into a single `u64`: the physical part occupies
//! the high bits and the logical part the low [`PHYSICAL_SHIFT_BITS`] bits.
//! Integer comparison of encoded values is therefore equivalent to comparing
//! the decoded pairs, which the safe point check relies on.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Number of low bits reserved for the logical counter.
pub const PHYSICAL_SHIFT_BITS: u32 = 18;

/// Largest logical value that survives an encode/decode round trip.
pub const MAX_LOGICAL: i64 = (1 << PHYSICAL_SHIFT_BITS) - 1;

/// Largest physical value whose high bits survive the shift.
pub const MAX_PHYSICAL: i64 = (1 << (64 - PHYSICAL_SHIFT_BITS)) - 1;

/// Packed single-integer form of a [`Timestamp`].
pub type EncodedTimestamp = u64;

/// Composite timestamp ordered by `(physical, logical)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Milliseconds since the Unix epoch, as assigned by the timing authority.
    pub physical: i64,
    /// Counter distinguishing timestamps within one physical tick.
    pub logical: i64,
}

impl Timestamp {
    /// The zero timestamp, ordered before every issued timestamp.
    pub const ZERO: Self = Self {
        physical: 0,
        logical: 0,
    };

    /// Creates a timestamp from its components.
    #[must_use]
    pub const fn new(physical: i64, logical: i64) -> Self {
        Self { physical, logical }
    }

    /// Packs the timestamp into its wire encoding.
    ///
    /// Only timestamps with a physical part within `0..=MAX_PHYSICAL` and a
    /// logical part within `0..=MAX_LOGICAL` encode losslessly; see
    /// [`Self::is_encodable`].
    #[must_use]
    pub const fn encode(&self) -> EncodedTimestamp {
        ((self.physical as u64) << PHYSICAL_SHIFT_BITS).wrapping_add(self.logical as u64)
    }

    /// Unpacks a wire-encoded timestamp.
    #[must_use]
    pub const fn decode(raw: EncodedTimestamp) -> Self {
        let physical = (raw >> PHYSICAL_SHIFT_BITS) as i64;
        let logical = raw - ((physical as u64) << PHYSICAL_SHIFT_BITS);
        Self {
            physical,
            logical: logical as i64,
        }
    }

    /// Returns `true` when the timestamp round-trips through [`Self::encode`].
    #[must_use]
    pub const fn is_encodable(&self) -> bool {
        self.physical >= 0
            && self.physical <= MAX_PHYSICAL
            && self.logical >= 0
            && self.logical <= MAX_LOGICAL
    }

    /// Moves the physical part back by `millis`, keeping the logical part.
    ///
    /// Saturates at physical zero.
    #[must_use]
    pub fn sub_millis(&self, millis: u64) -> Self {
        let millis = i64::try_from(millis).unwrap_or(i64::MAX);
        Self {
            physical: self.physical.saturating_sub(millis).max(0),
            logical: self.logical,
        }
    }

    /// Wall-clock rendering of the physical part, for logs.
    #[must_use]
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.physical).single()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.physical, self.logical)
    }
}

impl From<EncodedTimestamp> for Timestamp {
    fn from(raw: EncodedTimestamp) -> Self {
        Self::decode(raw)
    }
}

impl From<Timestamp> for EncodedTimestamp {
    fn from(ts: Timestamp) -> Self {
        ts.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_matches_shifted_layout() {
        let ts = Timestamp::new(1_571_234_567_890, 7);
        assert_eq!(ts.encode(), (1_571_234_567_890u64 << 18) + 7);
    }

    #[test]
    fn test_decode_inverts_encode() {
        let samples = [
            Timestamp::ZERO,
            Timestamp::new(0, MAX_LOGICAL),
            Timestamp::new(1, 0),
            Timestamp::new(1_571_234_567_890, 1),
            Timestamp::new(1_700_000_000_000, MAX_LOGICAL),
            Timestamp::new((1 << 45) - 1, 12_345),
        ];

        for ts in samples {
            assert!(ts.is_encodable());
            assert_eq!(Timestamp::decode(ts.encode()), ts, "round trip of {ts}");
        }
    }

    #[test]
    fn test_encoded_order_matches_timestamp_order() {
        let ordered = [
            Timestamp::ZERO,
            Timestamp::new(0, 1),
            Timestamp::new(0, MAX_LOGICAL),
            Timestamp::new(1, 0),
            Timestamp::new(1, 5),
            Timestamp::new(2, 0),
            Timestamp::new(1_700_000_000_000, 0),
        ];

        for a in &ordered {
            for b in &ordered {
                assert_eq!(a < b, a.encode() < b.encode(), "{a} vs {b}");
                assert_eq!(a == b, a.encode() == b.encode(), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_logical_overflow_is_not_encodable() {
        let ts = Timestamp::new(10, MAX_LOGICAL + 1);
        assert!(!ts.is_encodable());
        assert_ne!(Timestamp::decode(ts.encode()), ts);
    }

    #[test]
    fn test_physical_overflow_is_not_encodable() {
        let largest = Timestamp::new(MAX_PHYSICAL, MAX_LOGICAL);
        assert!(largest.is_encodable());
        assert_eq!(largest.encode(), u64::MAX);
        assert_eq!(Timestamp::decode(largest.encode()), largest);

        let ts = Timestamp::new(1 << 46, 0);
        assert!(!ts.is_encodable());
        assert_ne!(Timestamp::decode(ts.encode()), ts);

        assert!(!Timestamp::new(-1, 0).is_encodable());
    }

    #[test]
    fn test_sub_millis_saturates() {
        let ts = Timestamp::new(1_000, 3);
        assert_eq!(ts.sub_millis(400), Timestamp::new(600, 3));
        assert_eq!(ts.sub_millis(5_000), Timestamp::new(0, 3));
        assert_eq!(ts.sub_millis(u64::MAX), Timestamp::new(0, 3));
    }

    #[test]
    fn test_to_datetime_and_display() {
        let ts = Timestamp::new(1_571_234_567_890, 4);
        let dt = ts.to_datetime().unwrap();
        assert_eq!(dt.timestamp_millis(), 1_571_234_567_890);
        assert_eq!(ts.to_string(), "1571234567890.4");
    }
}
