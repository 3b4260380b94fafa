//! Change-feed cursor.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque cursor into the public stash feed, e.g. `1234-5678-91011-1213-1415`.
///
/// The counters are only ever compared pairwise via [`ChangeId::delta`];
/// ordering between two ids is not defined.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidChangeId(pub String);

impl fmt::Display for InvalidChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid change id '{}'", self.0)
    }
}

impl std::error::Error for InvalidChangeId {}

impl ChangeId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidChangeId> {
        let id = id.into();
        if is_well_formed(&id) {
            Ok(Self(id))
        } else {
            Err(InvalidChangeId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn counters(&self) -> impl Iterator<Item = i64> + '_ {
        self.0.split('-').map(|c| c.parse::<i64>().unwrap_or(0))
    }

    /// Sum of componentwise differences from `self` to `next`.
    ///
    /// Approximates how many stash updates lie between the two ids.
    pub fn delta(&self, next: &ChangeId) -> i64 {
        self.counters()
            .zip(next.counters())
            .map(|(prev, curr)| curr - prev)
            .sum()
    }
}

fn is_well_formed(id: &str) -> bool {
    !id.is_empty()
        && id
            .split('-')
            .all(|c| !c.is_empty() && c.bytes().all(|b| b.is_ascii_digit()))
}

impl FromStr for ChangeId {
    type Err = InvalidChangeId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChangeId::new(s.trim())
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ChangeId {
        s.parse().unwrap()
    }

    #[test]
    fn test_delta_sums_components() {
        assert_eq!(id("1-1-1-1-1").delta(&id("1-1-1-1-2")), 1);
        assert_eq!(id("10-20-30-40-50").delta(&id("15-25-35-45-55")), 25);
    }

    #[test]
    fn test_delta_can_be_negative() {
        assert_eq!(id("5-5-5-5-5").delta(&id("5-5-5-5-3")), -2);
    }

    #[test]
    fn test_rejects_malformed_ids() {
        assert!(ChangeId::new("").is_err());
        assert!(ChangeId::new("1--2").is_err());
        assert!(ChangeId::new("1-a-2").is_err());
        assert!(ChangeId::new("0").is_ok());
    }

    #[test]
    fn test_parse_trims_whitespace() {
        assert_eq!(id(" 1-2-3-4-5\n").as_str(), "1-2-3-4-5");
    }
}
