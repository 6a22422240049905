//! User-facing iterator.
//!
//! Wraps a [`MergingIterator`] over every source of a pinned super version
//! and collapses the internal entries of each user key into its visible
//! value. Versions newer than the read bound are skipped, deletions and
//! range tombstones hide older data and merge operands are resolved on the
//! fly. Errors are latched and surface through [`DbIterator::status`].

use std::cmp::Ordering;
use std::sync::Arc;

use crate::comparator::ComparatorRef;
use crate::config::ReadOptions;
use crate::error::Result;
use crate::iterator::{InternalIterator, MergingIterator};
use crate::merge::MergeOperatorRef;
use crate::sstable::BlockReadOptions;
use crate::statistics::Ticker;
use crate::types::{
    max_covering_tombstone, user_key, InternalKey, ParsedKey, RangeTombstone, SequenceNumber, ValueType,
    MAX_SEQUENCE_NUMBER,
};
use crate::Error;

use super::{ColumnFamilyData, DbInner, SuperVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// One visible version of a user key.
struct Entry {
    seq: SequenceNumber,
    kind: ValueType,
    value: Vec<u8>,
}

pub struct DbIterator<'a> {
    db: &'a DbInner,
    cf: u32,
    _pinned: Arc<SuperVersion>,
    iter: MergingIterator,
    cmp: ComparatorRef,
    merge_operator: Option<MergeOperatorRef>,
    bound: SequenceNumber,
    tombstones: Vec<RangeTombstone>,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    direction: Direction,
    valid: bool,
    key: Vec<u8>,
    value: Vec<u8>,
    error: Option<Error>,
}

impl<'a> DbIterator<'a> {
    pub(crate) fn new(
        db: &'a DbInner,
        cfd: &ColumnFamilyData,
        sv: Arc<SuperVersion>,
        opts: &ReadOptions,
        bound: SequenceNumber,
    ) -> Result<Self> {
        let options = cfd.options();
        let read_opts = BlockReadOptions {
            readahead_size: opts.readahead_size,
            ..db.block_read_options(opts.verify_checksums, opts.fill_cache)
        };
        let children = sv.iterators(&db.table_cache, read_opts)?;
        let tombstones: Vec<RangeTombstone> = sv
            .range_tombstones(&db.table_cache)?
            .into_iter()
            .filter(|t| t.seq <= bound)
            .collect();
        Ok(Self {
            db,
            cf: cfd.id(),
            iter: MergingIterator::new(options.comparator.clone(), children),
            _pinned: sv,
            cmp: options.comparator.clone(),
            merge_operator: options.merge_operator.clone(),
            bound,
            tombstones,
            lower: opts.iterate_lower_bound.clone(),
            upper: opts.iterate_upper_bound.clone(),
            direction: Direction::Forward,
            valid: false,
            key: Vec::new(),
            value: Vec::new(),
            error: None,
        })
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Current user key. Empty when not valid.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Current value. Empty when not valid.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// First error met while iterating, if any.
    pub fn status(&self) -> Result<()> {
        match &self.error {
            Some(e) => Err(e.duplicate()),
            None => self.iter.status(),
        }
    }

    pub fn seek_to_first(&mut self) {
        self.begin_seek();
        match self.lower.clone() {
            Some(lower) => self.iter.seek(&InternalKey::for_seek(&lower, MAX_SEQUENCE_NUMBER).encode()),
            None => self.iter.seek_to_first(),
        }
        self.direction = Direction::Forward;
        self.find_next();
    }

    pub fn seek_to_last(&mut self) {
        self.begin_seek();
        match self.upper.clone() {
            Some(upper) => {
                self.iter.seek(&InternalKey::for_seek(&upper, MAX_SEQUENCE_NUMBER).encode());
                if self.iter.valid() {
                    self.iter.prev();
                } else {
                    self.iter.seek_to_last();
                }
            }
            None => self.iter.seek_to_last(),
        }
        self.direction = Direction::Reverse;
        self.find_prev();
    }

    /// Positions at the first key at or after `target`.
    pub fn seek(&mut self, target: impl AsRef<[u8]>) {
        let mut target = target.as_ref();
        self.begin_seek();
        self.trace(|t, cf| t.iterator_seek(cf, target));
        let lower = self.lower.clone();
        if let Some(lower) = &lower {
            if self.cmp.compare(target, lower) == Ordering::Less {
                target = lower.as_slice();
            }
        }
        self.iter.seek(&InternalKey::for_seek(target, MAX_SEQUENCE_NUMBER).encode());
        self.direction = Direction::Forward;
        self.find_next();
    }

    /// Positions at the last key at or before `target`.
    pub fn seek_for_prev(&mut self, target: impl AsRef<[u8]>) {
        let target = target.as_ref();
        self.begin_seek();
        self.trace(|t, cf| t.iterator_seek_for_prev(cf, target));
        self.iter.seek_for_prev(&InternalKey::after_all(target).encode());
        self.direction = Direction::Reverse;
        self.find_prev();
    }

    pub fn next(&mut self) {
        if !self.valid {
            return;
        }
        if self.direction == Direction::Reverse {
            // The child iterators sit before the current key; step over it.
            let current = self.key.clone();
            self.iter.seek(&InternalKey::for_seek(&current, MAX_SEQUENCE_NUMBER).encode());
            while self.iter.valid() && self.cmp.equal(user_key(self.iter.key()), &current) {
                self.iter.next();
            }
            self.direction = Direction::Forward;
        }
        self.find_next();
    }

    pub fn prev(&mut self) {
        if !self.valid {
            return;
        }
        if self.direction == Direction::Forward {
            let current = self.key.clone();
            self.iter.seek(&InternalKey::for_seek(&current, MAX_SEQUENCE_NUMBER).encode());
            if self.iter.valid() {
                self.iter.prev();
            } else {
                self.iter.seek_to_last();
                while self.iter.valid()
                    && self.cmp.compare(user_key(self.iter.key()), &current) != Ordering::Less
                {
                    self.iter.prev();
                }
            }
            self.direction = Direction::Reverse;
        }
        self.find_prev();
    }

    fn begin_seek(&mut self) {
        self.error = None;
        self.db.stats.record(Ticker::NumberIterSeek, 1);
    }

    fn trace(&self, f: impl FnOnce(&mut crate::trace::Tracer, u32) -> Result<()>) {
        let result = match self.db.tracer.lock() {
            Ok(mut slot) => match slot.as_mut() {
                Some(tracer) => f(tracer, self.cf),
                None => Ok(()),
            },
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to trace iterator seek");
        }
    }

    fn below_lower(&self, key: &[u8]) -> bool {
        self.lower
            .as_deref()
            .map_or(false, |l| self.cmp.compare(key, l) == Ordering::Less)
    }

    fn at_or_above_upper(&self, key: &[u8]) -> bool {
        self.upper
            .as_deref()
            .map_or(false, |u| self.cmp.compare(key, u) != Ordering::Less)
    }

    fn fail(&mut self, error: Error) {
        self.error = Some(error);
        self.valid = false;
        self.key.clear();
        self.value.clear();
    }

    fn invalidate(&mut self) {
        self.valid = false;
        self.key.clear();
        self.value.clear();
    }

    fn parsed_entry(&self) -> Result<Option<Entry>> {
        let parsed = ParsedKey::parse(self.iter.key())?;
        if parsed.seq() > self.bound {
            return Ok(None);
        }
        Ok(Some(Entry {
            seq: parsed.seq(),
            kind: parsed.kind()?,
            value: self.iter.value().to_vec(),
        }))
    }

    /// Resolves the visible value of `key` from its versions, newest first.
    fn resolve(&self, key: &[u8], entries: &[Entry]) -> Result<Option<Vec<u8>>> {
        let covered_below = max_covering_tombstone(self.cmp.as_ref(), &self.tombstones, key, self.bound);
        let mut operands: Vec<&[u8]> = Vec::new();
        let mut base: Option<&[u8]> = None;
        for entry in entries {
            if entry.seq < covered_below {
                break;
            }
            match entry.kind {
                ValueType::Put => {
                    base = Some(entry.value.as_slice());
                    break;
                }
                ValueType::Delete | ValueType::SingleDelete => break,
                ValueType::Merge => operands.push(&entry.value),
                ValueType::RangeDelete | ValueType::LogData => {}
            }
        }
        if operands.is_empty() {
            return Ok(base.map(|v| v.to_vec()));
        }
        let operator = self
            .merge_operator
            .as_ref()
            .ok_or_else(|| Error::NotSupported("merge operator not configured".into()))?;
        let oldest_first: Vec<Vec<u8>> = operands.iter().rev().map(|o| o.to_vec()).collect();
        operator
            .full_merge(key, base, &oldest_first)
            .map(Some)
            .ok_or_else(|| Error::Corruption("merge operator failed".into()))
    }

    fn find_next(&mut self) {
        while self.iter.valid() {
            let current = user_key(self.iter.key()).to_vec();
            if self.at_or_above_upper(&current) {
                break;
            }
            let mut entries = Vec::new();
            let mut settled = false;
            while self.iter.valid() && self.cmp.equal(user_key(self.iter.key()), &current) {
                if !settled {
                    match self.parsed_entry() {
                        Ok(Some(entry)) => {
                            settled = matches!(
                                entry.kind,
                                ValueType::Put | ValueType::Delete | ValueType::SingleDelete
                            );
                            entries.push(entry);
                        }
                        Ok(None) => {}
                        Err(e) => return self.fail(e),
                    }
                }
                self.iter.next();
            }
            if self.below_lower(&current) || entries.is_empty() {
                continue;
            }
            match self.resolve(&current, &entries) {
                Ok(Some(value)) => {
                    self.key = current;
                    self.value = value;
                    self.valid = true;
                    return;
                }
                Ok(None) => {}
                Err(e) => return self.fail(e),
            }
        }
        if let Err(e) = self.iter.status() {
            return self.fail(e);
        }
        self.invalidate();
    }

    fn find_prev(&mut self) {
        while self.iter.valid() {
            let current = user_key(self.iter.key()).to_vec();
            if self.below_lower(&current) {
                break;
            }
            let mut entries = Vec::new();
            while self.iter.valid() && self.cmp.equal(user_key(self.iter.key()), &current) {
                match self.parsed_entry() {
                    Ok(Some(entry)) => entries.push(entry),
                    Ok(None) => {}
                    Err(e) => return self.fail(e),
                }
                self.iter.prev();
            }
            if self.at_or_above_upper(&current) || entries.is_empty() {
                continue;
            }
            entries.reverse();
            match self.resolve(&current, &entries) {
                Ok(Some(value)) => {
                    self.key = current;
                    self.value = value;
                    self.valid = true;
                    return;
                }
                Ok(None) => {}
                Err(e) => return self.fail(e),
            }
        }
        if let Err(e) = self.iter.status() {
            return self.fail(e);
        }
        self.invalidate();
    }
}

impl std::fmt::Debug for DbIterator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbIterator")
            .field("cf", &self.cf)
            .field("bound", &self.bound)
            .field("valid", &self.valid)
            .finish()
    }
}
