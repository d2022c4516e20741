//! Key bounds, ranges and comparators.

use std::cmp::Ordering;
use std::fmt;

/// Orders the keys of one dictionary.
pub trait KeyComparator: Send + Sync + fmt::Debug {
    /// Compares two keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Short name, for diagnostics.
    fn name(&self) -> &str {
        "bytewise"
    }
}

/// Lexicographic byte order.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytewiseComparator;

impl KeyComparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// One end of a key range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyBound {
    /// Below every key.
    NegInf,
    /// A concrete key.
    Key(Vec<u8>),
    /// Above every key.
    PosInf,
}

impl KeyBound {
    /// Compares two bounds under `cmp`.
    pub fn compare(&self, other: &Self, cmp: &dyn KeyComparator) -> Ordering {
        match (self, other) {
            (Self::NegInf, Self::NegInf) | (Self::PosInf, Self::PosInf) => Ordering::Equal,
            (Self::NegInf, _) | (_, Self::PosInf) => Ordering::Less,
            (_, Self::NegInf) | (Self::PosInf, _) => Ordering::Greater,
            (Self::Key(a), Self::Key(b)) => cmp.compare(a, b),
        }
    }
}

impl fmt::Display for KeyBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NegInf => write!(f, "-inf"),
            Self::PosInf => write!(f, "+inf"),
            Self::Key(key) => {
                for byte in key {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// A closed interval `[low, high]` of keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    /// Inclusive lower bound.
    pub low: KeyBound,
    /// Inclusive upper bound.
    pub high: KeyBound,
}

impl KeyRange {
    /// The range holding exactly one key.
    pub fn point(key: &[u8]) -> Self {
        Self {
            low: KeyBound::Key(key.to_vec()),
            high: KeyBound::Key(key.to_vec()),
        }
    }

    /// The range `[low, high]`.
    pub fn span(low: KeyBound, high: KeyBound) -> Self {
        Self { low, high }
    }

    /// The range covering every key.
    pub fn all() -> Self {
        Self {
            low: KeyBound::NegInf,
            high: KeyBound::PosInf,
        }
    }

    /// Returns true if `low <= high`.
    pub fn is_valid(&self, cmp: &dyn KeyComparator) -> bool {
        self.low.compare(&self.high, cmp) != Ordering::Greater
    }

    /// Returns true if the two ranges share at least one key position.
    pub fn overlaps(&self, other: &Self, cmp: &dyn KeyComparator) -> bool {
        self.low.compare(&other.high, cmp) != Ordering::Greater
            && other.low.compare(&self.high, cmp) != Ordering::Greater
    }

    /// Returns true if `other` lies entirely inside `self`.
    pub fn contains(&self, other: &Self, cmp: &dyn KeyComparator) -> bool {
        self.low.compare(&other.low, cmp) != Ordering::Greater
            && other.high.compare(&self.high, cmp) != Ordering::Greater
    }

    /// Returns true if `key` lies inside the range.
    pub fn contains_key(&self, key: &[u8], cmp: &dyn KeyComparator) -> bool {
        let key = KeyBound::Key(key.to_vec());
        self.low.compare(&key, cmp) != Ordering::Greater
            && key.compare(&self.high, cmp) != Ordering::Greater
    }

    /// Smallest range covering both.
    pub fn union(&self, other: &Self, cmp: &dyn KeyComparator) -> Self {
        let low = if self.low.compare(&other.low, cmp) == Ordering::Greater {
            other.low.clone()
        } else {
            self.low.clone()
        };
        let high = if self.high.compare(&other.high, cmp) == Ordering::Less {
            other.high.clone()
        } else {
            self.high.clone()
        };
        Self { low, high }
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.low, self.high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> KeyBound {
        KeyBound::Key(s.as_bytes().to_vec())
    }

    #[test]
    fn bound_ordering() {
        let cmp = BytewiseComparator;
        assert_eq!(KeyBound::NegInf.compare(&key("a"), &cmp), Ordering::Less);
        assert_eq!(KeyBound::PosInf.compare(&key("zzz"), &cmp), Ordering::Greater);
        assert_eq!(key("b").compare(&key("a"), &cmp), Ordering::Greater);
        assert_eq!(KeyBound::NegInf.compare(&KeyBound::NegInf, &cmp), Ordering::Equal);
    }

    #[test]
    fn overlap_and_containment() {
        let cmp = BytewiseComparator;
        let ab = KeyRange::span(key("a"), key("b"));
        let bc = KeyRange::span(key("b"), key("c"));
        let cd = KeyRange::span(key("c"), key("d"));

        assert!(ab.overlaps(&bc, &cmp));
        assert!(!ab.overlaps(&cd, &cmp));
        assert!(KeyRange::all().contains(&ab, &cmp));
        assert!(!ab.contains(&bc, &cmp));
        assert!(ab.contains(&KeyRange::point(b"a"), &cmp));
        assert!(bc.contains_key(b"bz", &cmp));
        assert_eq!(ab.union(&cd, &cmp), KeyRange::span(key("a"), key("d")));
    }

    #[test]
    fn custom_comparator_changes_overlap() {
        #[derive(Debug)]
        struct Reverse;
        impl KeyComparator for Reverse {
            fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
                b.cmp(a)
            }
        }
        let range = KeyRange::span(key("c"), key("a"));
        assert!(range.is_valid(&Reverse));
        assert!(!range.is_valid(&BytewiseComparator));
        assert!(range.contains_key(b"b", &Reverse));
    }
}
