use std::cmp::Ordering;
use std::sync::Arc;

/// Total order over user keys.
///
/// Implementations are called from inside engine locks and must not call
/// back into the database.
pub trait Comparator: Send + Sync {
    /// Persisted in the manifest; reopening with a differently named
    /// comparator is rejected.
    fn name(&self) -> &str;

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    fn equal(&self, a: &[u8], b: &[u8]) -> bool {
        self.compare(a, b) == Ordering::Equal
    }
}

pub type ComparatorRef = Arc<dyn Comparator>;

#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &str {
        "cinderdb.BytewiseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn equal(&self, a: &[u8], b: &[u8]) -> bool {
        a == b
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReverseBytewiseComparator;

impl Comparator for ReverseBytewiseComparator {
    fn name(&self) -> &str {
        "cinderdb.ReverseBytewiseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        b.cmp(a)
    }
}

pub fn bytewise() -> ComparatorRef {
    Arc::new(BytewiseComparator)
}

pub fn reverse_bytewise() -> ComparatorRef {
    Arc::new(ReverseBytewiseComparator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytewise_is_unsigned_lexicographic() {
        let cmp = BytewiseComparator;
        assert_eq!(cmp.compare(b"a", b"b"), Ordering::Less);
        assert_eq!(cmp.compare(b"ab", b"a"), Ordering::Greater);
        assert_eq!(cmp.compare(&[0xFF], &[0x01]), Ordering::Greater);
        assert!(cmp.equal(b"same", b"same"));
    }

    #[test]
    fn test_reverse_flips_order() {
        let cmp = ReverseBytewiseComparator;
        assert_eq!(cmp.compare(b"a", b"b"), Ordering::Greater);
        assert_ne!(cmp.name(), BytewiseComparator.name());
    }
}
