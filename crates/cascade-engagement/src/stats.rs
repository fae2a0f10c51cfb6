//! Exact decimal rounding and modal counting shared by the aggregating stages.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// A non-negative number with one decimal digit, stored as tenths
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tenths(pub u64);

impl Tenths {
    /// Zero
    pub const ZERO: Tenths = Tenths(0);

    /// `numerator / denominator` rounded half-up to one decimal
    ///
    /// Integer arithmetic only, so `9 / 4` is exactly `2.25` and becomes `2.3`.
    /// Returns `None` for a zero denominator.
    #[must_use]
    pub fn ratio(numerator: u64, denominator: u64) -> Option<Self> {
        if denominator == 0 {
            return None;
        }
        let scaled = u128::from(numerator) * 20 + u128::from(denominator);
        let tenths = scaled / (u128::from(denominator) * 2);
        Some(Self(u64::try_from(tenths).unwrap_or(u64::MAX)))
    }

    /// Like [`Tenths::ratio`] but an empty denominator yields zero
    #[must_use]
    pub fn ratio_or_zero(numerator: u64, denominator: u64) -> Self {
        Self::ratio(numerator, denominator).unwrap_or(Self::ZERO)
    }

    /// Value as a float, for presentation
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 10.0
    }
}

impl fmt::Display for Tenths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0 / 10, self.0 % 10)
    }
}

impl Serialize for Tenths {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Tenths {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        if !value.is_finite() || value < 0.0 {
            return Err(serde::de::Error::custom("expected a non-negative number"));
        }
        Ok(Self((value * 10.0).round() as u64))
    }
}

/// Frequency counter returning the most common value
///
/// Ties go to the smallest value in `Ord` order, so the result does not
/// depend on the order values were added in.
#[derive(Debug, Clone)]
pub struct ModeCounter<K> {
    counts: BTreeMap<K, u64>,
}

impl<K: Ord> Default for ModeCounter<K> {
    fn default() -> Self {
        Self {
            counts: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone> ModeCounter<K> {
    /// Empty counter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one occurrence
    pub fn add(&mut self, value: K) {
        *self.counts.entry(value).or_insert(0) += 1;
    }

    /// Count an optional value; `None` is ignored
    pub fn add_opt(&mut self, value: Option<K>) {
        if let Some(value) = value {
            self.add(value);
        }
    }

    /// Most frequent value, `None` when nothing was counted
    #[must_use]
    pub fn mode(&self) -> Option<K> {
        let mut best: Option<(&K, u64)> = None;
        for (value, &count) in &self.counts {
            if best.map_or(true, |(_, top)| count > top) {
                best = Some((value, count));
            }
        }
        best.map(|(value, _)| value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_rounds_half_up() {
        assert_eq!(Tenths::ratio(9, 4), Some(Tenths(23)));
        assert_eq!(Tenths::ratio(9, 4).unwrap().to_string(), "2.3");
        assert_eq!(Tenths::ratio(1, 3), Some(Tenths(3)));
        assert_eq!(Tenths::ratio(2, 3), Some(Tenths(7)));
        assert_eq!(Tenths::ratio(1, 20), Some(Tenths(1)));
        assert_eq!(Tenths::ratio(1, 21), Some(Tenths(0)));
        assert_eq!(Tenths::ratio(5, 0), None);
        assert_eq!(Tenths::ratio_or_zero(5, 0), Tenths::ZERO);
    }

    #[test]
    fn tenths_serialize_as_decimals() {
        assert_eq!(serde_json::to_string(&Tenths(23)).unwrap(), "2.3");
        let back: Tenths = serde_json::from_str("2.3").unwrap();
        assert_eq!(back, Tenths(23));
    }

    #[test]
    fn mode_prefers_majority_then_smallest() {
        let mut topics = ModeCounter::new();
        for topic in ["focus", "focus", "reading"] {
            topics.add(topic.to_string());
        }
        assert_eq!(topics.mode().as_deref(), Some("focus"));

        let mut tied = ModeCounter::new();
        for topic in ["reading", "anxiety", "reading", "anxiety"] {
            tied.add(topic);
        }
        assert_eq!(tied.mode(), Some("anxiety"));
    }

    #[test]
    fn mode_ignores_missing_values() {
        let mut counter: ModeCounter<&str> = ModeCounter::new();
        counter.add_opt(None);
        assert_eq!(counter.mode(), None);
        counter.add_opt(Some("math"));
        counter.add_opt(None);
        counter.add_opt(None);
        assert_eq!(counter.mode(), Some("math"));
    }
}
