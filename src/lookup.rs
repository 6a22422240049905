//! Point lookup state carried from the newest source to the oldest.

use crate::comparator::Comparator;
use crate::error::Result;
use crate::merge::MergeOperator;
use crate::types::{ParsedKey, SequenceNumber, ValueType};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupState {
    NotFound,
    Found,
    Deleted,
    Merging,
}

pub struct GetContext<'a> {
    cmp: &'a dyn Comparator,
    merge_operator: Option<&'a dyn MergeOperator>,
    user_key: &'a [u8],
    bound: SequenceNumber,
    tombstone_seq: SequenceNumber,
    state: LookupState,
    value: Option<Vec<u8>>,
    /// Newest first.
    operands: Vec<Vec<u8>>,
}

impl<'a> GetContext<'a> {
    pub fn new(
        cmp: &'a dyn Comparator,
        merge_operator: Option<&'a dyn MergeOperator>,
        user_key: &'a [u8],
        bound: SequenceNumber,
        tombstone_seq: SequenceNumber,
    ) -> Self {
        Self {
            cmp,
            merge_operator,
            user_key,
            bound,
            tombstone_seq,
            state: LookupState::NotFound,
            value: None,
            operands: Vec::new(),
        }
    }

    pub fn user_key(&self) -> &[u8] {
        self.user_key
    }

    pub fn bound(&self) -> SequenceNumber {
        self.bound
    }

    pub fn state(&self) -> LookupState {
        self.state
    }

    /// True once no older source can change the answer.
    pub fn is_done(&self) -> bool {
        matches!(self.state, LookupState::Found | LookupState::Deleted)
    }

    /// Feeds one entry, newest first. Returns whether older entries are
    /// still needed.
    pub fn save_value(&mut self, key: &ParsedKey<'_>, value: &[u8]) -> Result<bool> {
        if !self.cmp.equal(key.user_key, self.user_key) {
            return Ok(false);
        }
        let seq = key.seq();
        if seq > self.bound {
            return Ok(true);
        }
        if seq < self.tombstone_seq {
            self.resolve_deleted()?;
            return Ok(false);
        }

        match key.kind()? {
            ValueType::Put => {
                if self.state == LookupState::Merging {
                    self.value = Some(self.merge(Some(value))?);
                } else {
                    self.value = Some(value.to_vec());
                }
                self.state = LookupState::Found;
                Ok(false)
            }
            ValueType::Delete | ValueType::SingleDelete => {
                self.resolve_deleted()?;
                Ok(false)
            }
            ValueType::Merge => {
                self.operands.push(value.to_vec());
                self.state = LookupState::Merging;
                Ok(true)
            }
            ValueType::RangeDelete | ValueType::LogData => Ok(true),
        }
    }

    /// Called when a range tombstone shadows everything older.
    pub fn mark_covered(&mut self) -> Result<()> {
        self.resolve_deleted()
    }

    fn resolve_deleted(&mut self) -> Result<()> {
        if self.state == LookupState::Merging {
            self.value = Some(self.merge(None)?);
            self.state = LookupState::Found;
        } else {
            self.state = LookupState::Deleted;
        }
        Ok(())
    }

    fn merge(&self, base: Option<&[u8]>) -> Result<Vec<u8>> {
        let operator = self
            .merge_operator
            .ok_or_else(|| Error::NotSupported("merge operator not configured".into()))?;
        let oldest_first: Vec<Vec<u8>> = self.operands.iter().rev().cloned().collect();
        operator
            .full_merge(self.user_key, base, &oldest_first)
            .ok_or_else(|| Error::Corruption("merge operator failed".into()))
    }

    /// Final answer after every source was consulted.
    pub fn finish(mut self) -> Result<Option<Vec<u8>>> {
        match self.state {
            LookupState::Found => Ok(self.value.take()),
            LookupState::Deleted | LookupState::NotFound => Ok(None),
            LookupState::Merging => self.merge(None).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::merge::StringAppendOperator;
    use crate::types::InternalKey;

    fn feed(ctx: &mut GetContext<'_>, seq: u64, kind: ValueType, value: &[u8]) -> bool {
        let key = InternalKey::new(b"k".to_vec(), seq, kind).encode();
        ctx.save_value(&ParsedKey::parse(&key).unwrap(), value).unwrap()
    }

    #[test]
    fn test_first_visible_put_wins() -> Result<()> {
        let cmp = BytewiseComparator;
        let mut ctx = GetContext::new(&cmp, None, b"k", 10, 0);
        assert!(feed(&mut ctx, 12, ValueType::Put, b"future"));
        assert!(!feed(&mut ctx, 9, ValueType::Put, b"v9"));
        assert_eq!(ctx.finish()?, Some(b"v9".to_vec()));
        Ok(())
    }

    #[test]
    fn test_merge_operands_resolve_against_base() -> Result<()> {
        let cmp = BytewiseComparator;
        let op = StringAppendOperator::default();
        let mut ctx = GetContext::new(&cmp, Some(&op), b"k", 100, 0);
        assert!(feed(&mut ctx, 5, ValueType::Merge, b"c"));
        assert!(feed(&mut ctx, 4, ValueType::Merge, b"b"));
        assert!(!feed(&mut ctx, 3, ValueType::Put, b"a"));
        assert_eq!(ctx.finish()?, Some(b"a,b,c".to_vec()));
        Ok(())
    }

    #[test]
    fn test_merge_stops_at_deletion_and_range_tombstone() -> Result<()> {
        let cmp = BytewiseComparator;
        let op = StringAppendOperator::default();

        let mut ctx = GetContext::new(&cmp, Some(&op), b"k", 100, 0);
        feed(&mut ctx, 5, ValueType::Merge, b"x");
        assert!(!feed(&mut ctx, 4, ValueType::Delete, b""));
        assert_eq!(ctx.finish()?, Some(b"x".to_vec()));

        let mut ctx = GetContext::new(&cmp, Some(&op), b"k", 100, 4);
        feed(&mut ctx, 5, ValueType::Merge, b"y");
        assert!(!feed(&mut ctx, 3, ValueType::Put, b"hidden"));
        assert_eq!(ctx.finish()?, Some(b"y".to_vec()));
        Ok(())
    }

    #[test]
    fn test_merge_without_operator_is_not_supported() {
        let cmp = BytewiseComparator;
        let mut ctx = GetContext::new(&cmp, None, b"k", 100, 0);
        feed(&mut ctx, 5, ValueType::Merge, b"x");
        let err = ctx.finish().unwrap_err();
        assert_eq!(err.code(), crate::error::Code::NotSupported);
    }
}
