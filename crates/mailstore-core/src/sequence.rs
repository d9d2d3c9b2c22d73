//! Message sequence sets (`1:4,7,9:*`)

/// Stands for `*`, the largest number in use.
pub const LAST: u64 = u64::MAX;

/// Sequence set for message selection, by MSN or by UID
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceSet {
    /// Single number
    Single(u64),
    /// Range of numbers, inclusive, in either order
    Range(u64, u64),
    /// Multiple sets
    Multiple(Vec<SequenceSet>),
}

impl SequenceSet {
    /// Parse a sequence set string
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() {
            return None;
        }

        if s.contains(',') {
            let sets = s
                .split(',')
                .map(Self::parse)
                .collect::<Option<Vec<_>>>()?;
            return Some(SequenceSet::Multiple(sets));
        }

        if let Some((start, end)) = s.split_once(':') {
            return Some(SequenceSet::Range(Self::number(start)?, Self::number(end)?));
        }

        Self::number(s).map(SequenceSet::Single)
    }

    fn number(s: &str) -> Option<u64> {
        if s == "*" {
            return Some(LAST);
        }
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        match s.parse() {
            Ok(0) | Err(_) => None,
            Ok(n) => Some(n),
        }
    }

    /// Check if a number is in this set, `*` standing for `max`
    pub fn contains(&self, n: u64, max: u64) -> bool {
        let resolve = |v: u64| if v == LAST { max } else { v };
        match self {
            SequenceSet::Single(v) => n == resolve(*v),
            SequenceSet::Range(a, b) => {
                let (a, b) = (resolve(*a), resolve(*b));
                n >= a.min(b) && n <= a.max(b)
            }
            SequenceSet::Multiple(sets) => sets.iter().any(|s| s.contains(n, max)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_sequence_set_parse() {
        assert_eq!(SequenceSet::parse("1"), Some(SequenceSet::Single(1)));
        assert_eq!(SequenceSet::parse("*"), Some(SequenceSet::Single(LAST)));
        assert_eq!(SequenceSet::parse("1:5"), Some(SequenceSet::Range(1, 5)));
        assert_eq!(SequenceSet::parse("1:*"), Some(SequenceSet::Range(1, LAST)));
        assert_eq!(
            SequenceSet::parse("1,3:4"),
            Some(SequenceSet::Multiple(vec![
                SequenceSet::Single(1),
                SequenceSet::Range(3, 4)
            ]))
        );
        assert_eq!(SequenceSet::parse("0"), None);
        assert_eq!(SequenceSet::parse("1,x"), None);
        assert_eq!(SequenceSet::parse("ALL"), None);
    }

    #[test]
    fn test_sequence_set_contains() {
        let set = SequenceSet::Range(1, 5);
        assert!(set.contains(1, 10));
        assert!(set.contains(5, 10));
        assert!(!set.contains(6, 10));

        let star = SequenceSet::Single(LAST);
        assert!(star.contains(10, 10));
        assert!(!star.contains(9, 10));

        let reversed = SequenceSet::Range(LAST, 8);
        assert!(reversed.contains(9, 10));
        assert!(!reversed.contains(7, 10));
    }
}
