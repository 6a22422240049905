//! Drops entries no reader can observe while merging inputs.
//!
//! Live snapshots cut each key's history into stripes: a stripe holds the
//! versions visible to the same set of snapshots. Within a stripe only the
//! newest full value (put or deletion) matters, so anything behind it is
//! dropped. Merge operands are kept until a full value ends their chain.

use crate::comparator::ComparatorRef;
use crate::compaction_filter::{CompactionFilterRef, Decision};
use crate::error::Result;
use crate::iterator::BoxedIterator;
use crate::types::{InternalKey, ParsedKey, RangeTombstone, SequenceNumber, ValueType};
use crate::Error;

pub(crate) struct CompactionIterator {
    input: BoxedIterator,
    cmp: ComparatorRef,
    /// Ascending.
    snapshots: Vec<SequenceNumber>,
    tombstones: Vec<RangeTombstone>,
    bottommost: bool,
    filter: Option<(CompactionFilterRef, usize)>,

    current_user_key: Option<Vec<u8>>,
    last_stripe: Option<usize>,
    stripe_shadowed: bool,

    key: Vec<u8>,
    value: Vec<u8>,
    valid: bool,
    dropped: u64,
    status: Option<Error>,
}

impl CompactionIterator {
    pub(crate) fn new(
        input: BoxedIterator,
        cmp: ComparatorRef,
        snapshots: Vec<SequenceNumber>,
        tombstones: Vec<RangeTombstone>,
        bottommost: bool,
        filter: Option<(CompactionFilterRef, usize)>,
    ) -> Self {
        Self {
            input,
            cmp,
            snapshots,
            tombstones,
            bottommost,
            filter,
            current_user_key: None,
            last_stripe: None,
            stripe_shadowed: false,
            key: Vec::new(),
            value: Vec::new(),
            valid: false,
            dropped: 0,
            status: None,
        }
    }

    fn stripe(&self, seq: SequenceNumber) -> usize {
        self.snapshots.partition_point(|&s| s < seq)
    }

    fn earliest_snapshot(&self) -> SequenceNumber {
        self.snapshots.first().copied().unwrap_or(SequenceNumber::MAX)
    }

    pub(crate) fn seek_to_first(&mut self) {
        self.input.seek_to_first();
        self.find_next();
    }

    pub(crate) fn next(&mut self) {
        self.input.next();
        self.find_next();
    }

    pub(crate) fn valid(&self) -> bool {
        self.valid
    }

    pub(crate) fn key(&self) -> &[u8] {
        &self.key
    }

    pub(crate) fn value(&self) -> &[u8] {
        &self.value
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }

    pub(crate) fn status(&self) -> Result<()> {
        if let Some(e) = &self.status {
            return Err(e.duplicate());
        }
        self.input.status()
    }

    /// Range tombstones that still have to be written to the output.
    pub(crate) fn output_tombstones(&self) -> Vec<RangeTombstone> {
        let earliest = self.earliest_snapshot();
        self.tombstones
            .iter()
            .filter(|t| !(self.bottommost && t.seq <= earliest))
            .cloned()
            .collect()
    }

    fn find_next(&mut self) {
        self.valid = false;
        while self.input.valid() {
            match self.process() {
                Ok(true) => {
                    self.valid = true;
                    return;
                }
                Ok(false) => {
                    self.dropped += 1;
                    self.input.next();
                }
                Err(e) => {
                    self.status = Some(e);
                    return;
                }
            }
        }
    }

    /// Decides the current input entry. Returns true when it is emitted.
    fn process(&mut self) -> Result<bool> {
        let parsed = ParsedKey::parse(self.input.key())?;
        let seq = parsed.seq();
        let mut kind = parsed.kind()?;

        let same_key = self
            .current_user_key
            .as_deref()
            .map_or(false, |k| self.cmp.equal(k, parsed.user_key));
        if !same_key {
            self.current_user_key = Some(parsed.user_key.to_vec());
            self.last_stripe = None;
            self.stripe_shadowed = false;
        }

        let stripe = self.stripe(seq);
        if self.last_stripe == Some(stripe) && self.stripe_shadowed {
            return Ok(false);
        }
        if self.last_stripe != Some(stripe) {
            self.stripe_shadowed = false;
        }
        self.last_stripe = Some(stripe);

        let covered = self.tombstones.iter().any(|t| {
            t.seq > seq && self.stripe(t.seq) == stripe && t.covers(self.cmp.as_ref(), parsed.user_key)
        });
        if covered {
            self.stripe_shadowed = true;
            return Ok(false);
        }

        let mut value = None;
        if kind == ValueType::Put && stripe == self.snapshots.len() {
            if let Some((filter, level)) = &self.filter {
                match filter.filter(*level, parsed.user_key, self.input.value()) {
                    Decision::Keep => {}
                    Decision::Remove => kind = ValueType::Delete,
                    Decision::ChangeValue(v) => value = Some(v),
                }
            }
        }

        match kind {
            ValueType::Merge => {}
            ValueType::Delete | ValueType::SingleDelete => {
                self.stripe_shadowed = true;
                if self.bottommost && seq <= self.earliest_snapshot() {
                    return Ok(false);
                }
            }
            _ => self.stripe_shadowed = true,
        }

        if kind == parsed.kind()? {
            self.key.clear();
            self.key.extend_from_slice(self.input.key());
        } else {
            self.key = InternalKey::new(parsed.user_key.to_vec(), seq, kind).encode();
            value = Some(Vec::new());
        }
        match value {
            Some(v) => self.value = v,
            None => {
                self.value.clear();
                self.value.extend_from_slice(self.input.value());
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::bytewise;
    use crate::compaction_filter::CompactionFilter;
    use crate::iterator::VecIterator;
    use crate::types::compare_internal;
    use std::sync::Arc;

    fn input(entries: &[(&str, u64, ValueType, &str)]) -> BoxedIterator {
        let cmp = bytewise();
        let mut encoded: Vec<(Vec<u8>, Vec<u8>)> = entries
            .iter()
            .map(|(k, seq, kind, v)| {
                (
                    InternalKey::new(k.as_bytes().to_vec(), *seq, *kind).encode(),
                    v.as_bytes().to_vec(),
                )
            })
            .collect();
        encoded.sort_by(|a, b| compare_internal(cmp.as_ref(), &a.0, &b.0));
        Box::new(VecIterator::new(cmp, encoded))
    }

    fn drain(iter: &mut CompactionIterator) -> Result<Vec<(String, u64, ValueType, String)>> {
        let mut out = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            let key = InternalKey::decode(iter.key())?;
            out.push((
                String::from_utf8_lossy(&key.user_key).into_owned(),
                key.seq(),
                key.kind()?,
                String::from_utf8_lossy(iter.value()).into_owned(),
            ));
            iter.next();
        }
        iter.status()?;
        Ok(out)
    }

    #[test]
    fn test_snapshots_keep_visible_versions() -> Result<()> {
        let entries = [
            ("a", 9, ValueType::Put, "a9"),
            ("a", 7, ValueType::Put, "a7"),
            ("a", 5, ValueType::Put, "a5"),
            ("a", 2, ValueType::Put, "a2"),
            ("b", 4, ValueType::Delete, ""),
            ("b", 3, ValueType::Put, "b3"),
        ];
        let mut iter = CompactionIterator::new(input(&entries), bytewise(), vec![5], Vec::new(), false, None);
        let out = drain(&mut iter)?;
        let seqs: Vec<(String, u64)> = out.iter().map(|(k, s, _, _)| (k.clone(), *s)).collect();
        assert_eq!(
            seqs,
            vec![("a".into(), 9), ("a".into(), 5), ("b".into(), 4)]
        );
        assert_eq!(iter.dropped(), 3);
        Ok(())
    }

    #[test]
    fn test_bottommost_drops_tombstones_and_covered_entries() -> Result<()> {
        let entries = [
            ("a", 6, ValueType::Delete, ""),
            ("a", 1, ValueType::Put, "old"),
            ("c", 2, ValueType::Put, "covered"),
            ("d", 8, ValueType::Put, "live"),
        ];
        let tombstone = RangeTombstone {
            begin: b"b".to_vec(),
            end: b"d".to_vec(),
            seq: 4,
        };
        let mut iter = CompactionIterator::new(input(&entries), bytewise(), Vec::new(), vec![tombstone], true, None);
        let out = drain(&mut iter)?;
        assert_eq!(out, vec![("d".into(), 8, ValueType::Put, "live".into())]);
        assert!(iter.output_tombstones().is_empty());
        Ok(())
    }

    #[test]
    fn test_merge_operands_survive_until_full_value() -> Result<()> {
        let entries = [
            ("k", 5, ValueType::Merge, "m5"),
            ("k", 4, ValueType::Merge, "m4"),
            ("k", 3, ValueType::Put, "base"),
            ("k", 1, ValueType::Put, "stale"),
        ];
        let mut iter = CompactionIterator::new(input(&entries), bytewise(), Vec::new(), Vec::new(), true, None);
        let seqs: Vec<u64> = drain(&mut iter)?.into_iter().map(|(_, s, _, _)| s).collect();
        assert_eq!(seqs, vec![5, 4, 3]);
        Ok(())
    }

    struct DropPrefix;

    impl CompactionFilter for DropPrefix {
        fn name(&self) -> &str {
            "DropPrefix"
        }

        fn filter(&self, _level: usize, key: &[u8], value: &[u8]) -> Decision {
            if key.starts_with(b"tmp") {
                Decision::Remove
            } else if value == b"old" {
                Decision::ChangeValue(b"new".to_vec())
            } else {
                Decision::Keep
            }
        }
    }

    #[test]
    fn test_filter_sees_only_unpinned_entries() -> Result<()> {
        let entries = [
            ("keep", 2, ValueType::Put, "old"),
            ("tmp-pinned", 3, ValueType::Put, "x"),
            ("tmp-free", 9, ValueType::Put, "y"),
        ];
        let filter: CompactionFilterRef = Arc::new(DropPrefix);
        let mut iter = CompactionIterator::new(input(&entries), bytewise(), vec![5], Vec::new(), false, Some((filter, 1)));
        let out = drain(&mut iter)?;
        assert_eq!(
            out,
            vec![
                ("keep".into(), 2, ValueType::Put, "old".into()),
                ("tmp-free".into(), 9, ValueType::Delete, "".into()),
                ("tmp-pinned".into(), 3, ValueType::Put, "x".into()),
            ]
        );
        Ok(())
    }
}
