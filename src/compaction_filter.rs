use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Keep,
    /// Replace the entry with a deletion tombstone.
    Remove,
    ChangeValue(Vec<u8>),
}

/// Hook applied to `Put` entries during compaction.
///
/// Only entries that no live snapshot can observe are passed to the filter.
/// Implementations must not call back into the database.
pub trait CompactionFilter: Send + Sync {
    fn name(&self) -> &str;

    fn filter(&self, level: usize, key: &[u8], value: &[u8]) -> Decision;
}

pub type CompactionFilterRef = Arc<dyn CompactionFilter>;

/// Drops entries whose value is empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct RemoveEmptyValueCompactionFilter;

impl CompactionFilter for RemoveEmptyValueCompactionFilter {
    fn name(&self) -> &str {
        "RemoveEmptyValueCompactionFilter"
    }

    fn filter(&self, _level: usize, _key: &[u8], value: &[u8]) -> Decision {
        if value.is_empty() {
            Decision::Remove
        } else {
            Decision::Keep
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_empty_values() {
        let filter = RemoveEmptyValueCompactionFilter;
        assert_eq!(filter.filter(1, b"k", b""), Decision::Remove);
        assert_eq!(filter.filter(1, b"k", b"v"), Decision::Keep);
    }
}
