//! Key ordering.
//!
//! The collation is persisted in the tree header by id. Reopening a tree
//! with a different order would leave existing nodes unsorted, so unknown
//! ids are rejected instead of falling back to a default.

use std::cmp::Ordering;
use std::str::FromStr;

/// Total order applied to tree keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Collation {
    /// Raw code-point order, for keys that are opaque identifiers.
    Ordinal,
    /// Case-insensitive order with an ordinal tie-break, for natural text.
    #[default]
    Invariant,
}

impl Collation {
    pub const ORDINAL_ID: i32 = 0;
    pub const INVARIANT_ID: i32 = 127;

    /// Identifier stored in the tree header.
    #[must_use]
    pub const fn id(self) -> i32 {
        match self {
            Self::Ordinal => Self::ORDINAL_ID,
            Self::Invariant => Self::INVARIANT_ID,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ordinal => "ordinal",
            Self::Invariant => "invariant",
        }
    }

    /// Compare two keys.
    ///
    /// `Equal` is returned only for identical strings under both orders.
    #[must_use]
    pub fn compare(self, a: &str, b: &str) -> Ordering {
        match self {
            Self::Ordinal => a.cmp(b),
            Self::Invariant => a
                .chars()
                .flat_map(char::to_lowercase)
                .cmp(b.chars().flat_map(char::to_lowercase))
                .then_with(|| a.cmp(b)),
        }
    }
}

impl TryFrom<i32> for Collation {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            Self::ORDINAL_ID => Ok(Self::Ordinal),
            Self::INVARIANT_ID => Ok(Self::Invariant),
            _ => Err(value),
        }
    }
}

impl FromStr for Collation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ordinal" => Ok(Self::Ordinal),
            "invariant" => Ok(Self::Invariant),
            other => Err(format!("unknown collation '{other}' (expected ordinal or invariant)")),
        }
    }
}

impl std::fmt::Display for Collation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinal_is_code_point_order() {
        let c = Collation::Ordinal;
        assert_eq!(c.compare("B", "a"), Ordering::Less);
        assert_eq!(c.compare("abc", "abd"), Ordering::Less);
        assert_eq!(c.compare("", "a"), Ordering::Less);
        assert_eq!(c.compare("same", "same"), Ordering::Equal);
    }

    #[test]
    fn test_invariant_folds_case_first() {
        let c = Collation::Invariant;
        assert_eq!(c.compare("a", "B"), Ordering::Less);
        assert_eq!(c.compare("Apple", "apricot"), Ordering::Less);
        // Case only breaks ties, so the order stays total.
        assert_ne!(c.compare("abc", "ABC"), Ordering::Equal);
        assert_eq!(c.compare("ABC", "abc"), Ordering::Less);
    }

    #[test]
    fn test_id_round_trip() {
        for collation in [Collation::Ordinal, Collation::Invariant] {
            assert_eq!(Collation::try_from(collation.id()), Ok(collation));
        }
        assert_eq!(Collation::try_from(1033), Err(1033));
    }

    #[test]
    fn test_parse() {
        assert_eq!("Ordinal".parse::<Collation>(), Ok(Collation::Ordinal));
        assert_eq!("invariant".parse::<Collation>(), Ok(Collation::Invariant));
        assert!("klingon".parse::<Collation>().is_err());
    }
}
