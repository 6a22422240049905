//! Memtable backed by a concurrent skip list.
//!
//! Entries are keyed by internal key, so every write is an insert: a newer
//! version of a user key never replaces an older one in place, it sorts in
//! front of it. Readers walk the skip list without locks while the write
//! path inserts.
//!
//! # Lifecycle
//!
//! 1. **Active**: receives writes for one column family
//! 2. **Immutable**: sealed by a memtable switch, queued for flush
//! 3. **Flushed**: written to a level 0 table and dropped once no reader
//!    holds it
//!
//! Range deletions are kept on a side list rather than in the skip list so
//! point lookups can find the covering tombstones without scanning.

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};

use crossbeam_skiplist::SkipMap;

use crate::comparator::ComparatorRef;
use crate::error::Result;
use crate::iterator::InternalIterator;
use crate::lookup::GetContext;
use crate::types::{
    compare_keys, InternalKey, ParsedKey, RangeTombstone, SequenceNumber, ValueType,
    MAX_SEQUENCE_NUMBER, TRAILER_SIZE,
};

/// Per-entry bookkeeping charged on top of key and value bytes.
const ENTRY_OVERHEAD: usize = 32;

/// Skip list key: an internal key ordered by the column family comparator.
#[derive(Clone)]
pub struct MemKey {
    key: InternalKey,
    cmp: ComparatorRef,
}

impl MemKey {
    fn new(key: InternalKey, cmp: ComparatorRef) -> Self {
        Self { key, cmp }
    }
}

impl PartialEq for MemKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MemKey {}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(self.cmp.as_ref(), &self.key, &other.key)
    }
}

pub struct Memtable {
    id: u64,
    cmp: ComparatorRef,
    data: SkipMap<MemKey, Vec<u8>>,
    range_tombstones: RwLock<Vec<RangeTombstone>>,
    size: AtomicUsize,
    num_entries: AtomicU64,
    num_deletes: AtomicU64,
    first_seq: AtomicU64,
    largest_seq: AtomicU64,
    /// WAL that was current when this memtable became active.
    log_number: u64,
    /// WAL of the successor memtable; set when sealed.
    next_log_number: AtomicU64,
    frozen: AtomicBool,
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("id", &self.id)
            .field("entries", &self.num_entries())
            .field("size", &self.approximate_memory_usage())
            .field("log_number", &self.log_number)
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

impl Memtable {
    pub fn new(id: u64, cmp: ComparatorRef, log_number: u64) -> Self {
        Self {
            id,
            cmp,
            data: SkipMap::new(),
            range_tombstones: RwLock::new(Vec::new()),
            size: AtomicUsize::new(0),
            num_entries: AtomicU64::new(0),
            num_deletes: AtomicU64::new(0),
            first_seq: AtomicU64::new(MAX_SEQUENCE_NUMBER),
            largest_seq: AtomicU64::new(0),
            log_number,
            next_log_number: AtomicU64::new(0),
            frozen: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn comparator(&self) -> &ComparatorRef {
        &self.cmp
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub fn next_log_number(&self) -> u64 {
        self.next_log_number.load(AtomicOrdering::Acquire)
    }

    /// Seals the memtable; `next_log_number` is the WAL its successor uses.
    pub fn freeze(&self, next_log_number: u64) {
        self.next_log_number
            .store(next_log_number, AtomicOrdering::Release);
        self.frozen.store(true, AtomicOrdering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(AtomicOrdering::Acquire)
    }

    pub fn approximate_memory_usage(&self) -> usize {
        self.size.load(AtomicOrdering::Acquire)
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries.load(AtomicOrdering::Acquire)
    }

    pub fn num_deletes(&self) -> u64 {
        self.num_deletes.load(AtomicOrdering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries() == 0
    }

    /// Smallest sequence number inserted, or `MAX_SEQUENCE_NUMBER` if empty.
    pub fn first_sequence(&self) -> SequenceNumber {
        self.first_seq.load(AtomicOrdering::Acquire)
    }

    pub fn largest_sequence(&self) -> SequenceNumber {
        self.largest_seq.load(AtomicOrdering::Acquire)
    }

    pub fn add(&self, seq: SequenceNumber, kind: ValueType, key: &[u8], value: &[u8]) {
        let charge = key.len() + value.len() + TRAILER_SIZE + ENTRY_OVERHEAD;
        match kind {
            ValueType::RangeDelete => {
                if let Ok(mut tombstones) = self.range_tombstones.write() {
                    tombstones.push(RangeTombstone {
                        begin: key.to_vec(),
                        end: value.to_vec(),
                        seq,
                    });
                }
                self.num_deletes.fetch_add(1, AtomicOrdering::AcqRel);
            }
            _ => {
                if kind.is_deletion() {
                    self.num_deletes.fetch_add(1, AtomicOrdering::AcqRel);
                }
                let mem_key = MemKey::new(InternalKey::new(key.to_vec(), seq, kind), self.cmp.clone());
                self.data.insert(mem_key, value.to_vec());
            }
        }
        self.size.fetch_add(charge, AtomicOrdering::AcqRel);
        self.num_entries.fetch_add(1, AtomicOrdering::AcqRel);
        self.first_seq.fetch_min(seq, AtomicOrdering::AcqRel);
        self.largest_seq.fetch_max(seq, AtomicOrdering::AcqRel);
    }

    /// Feeds the versions of the looked-up key to `ctx`, newest first.
    pub fn get(&self, ctx: &mut GetContext<'_>) -> Result<()> {
        let seek = MemKey::new(
            InternalKey::for_seek(ctx.user_key(), ctx.bound()),
            self.cmp.clone(),
        );
        let mut cursor = self.data.lower_bound(Bound::Included(&seek));
        while let Some(entry) = cursor {
            let key = &entry.key().key;
            let parsed = ParsedKey {
                user_key: &key.user_key,
                trailer: key.trailer,
            };
            if !ctx.save_value(&parsed, entry.value())? {
                break;
            }
            cursor = entry.next();
        }
        Ok(())
    }

    pub fn range_tombstones(&self) -> Vec<RangeTombstone> {
        self.range_tombstones
            .read()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    pub fn has_range_tombstones(&self) -> bool {
        self.range_tombstones
            .read()
            .map(|t| !t.is_empty())
            .unwrap_or(false)
    }

    pub fn iter(self: &Arc<Self>) -> MemtableIterator {
        MemtableIterator {
            memtable: Arc::clone(self),
            current: None,
            encoded: Vec::new(),
            value: Vec::new(),
        }
    }

    /// Approximate entry count and bytes for user keys in `[start, end)`.
    pub fn approximate_stats(&self, start: &[u8], end: &[u8]) -> (u64, u64) {
        let lower = MemKey::new(
            InternalKey::for_seek(start, MAX_SEQUENCE_NUMBER),
            self.cmp.clone(),
        );
        let upper = MemKey::new(
            InternalKey::for_seek(end, MAX_SEQUENCE_NUMBER),
            self.cmp.clone(),
        );
        let mut count = 0u64;
        let mut bytes = 0u64;
        for entry in self
            .data
            .range((Bound::Included(&lower), Bound::Excluded(&upper)))
        {
            count += 1;
            bytes += (entry.key().key.user_key.len() + TRAILER_SIZE + entry.value().len()) as u64;
        }
        (count, bytes)
    }
}

/// Cursor over a memtable that keeps it alive.
///
/// Each step re-enters the skip list from the current key, so the iterator
/// owns no borrow of the map.
pub struct MemtableIterator {
    memtable: Arc<Memtable>,
    current: Option<MemKey>,
    encoded: Vec<u8>,
    value: Vec<u8>,
}

impl MemtableIterator {
    fn set(&mut self, entry: Option<crossbeam_skiplist::map::Entry<'_, MemKey, Vec<u8>>>) {
        match entry {
            Some(entry) => {
                let key = entry.key().clone();
                self.encoded.clear();
                key.key.encode_into(&mut self.encoded);
                self.value.clear();
                self.value.extend_from_slice(entry.value());
                self.current = Some(key);
            }
            None => {
                self.current = None;
                self.encoded.clear();
                self.value.clear();
            }
        }
    }

    fn probe(&self, target: &[u8]) -> Option<MemKey> {
        InternalKey::decode(target)
            .ok()
            .map(|key| MemKey::new(key, self.memtable.cmp.clone()))
    }
}

impl InternalIterator for MemtableIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        let memtable = Arc::clone(&self.memtable);
        self.set(memtable.data.front());
    }

    fn seek_to_last(&mut self) {
        let memtable = Arc::clone(&self.memtable);
        self.set(memtable.data.back());
    }

    fn seek(&mut self, target: &[u8]) {
        let memtable = Arc::clone(&self.memtable);
        match self.probe(target) {
            Some(probe) => self.set(memtable.data.lower_bound(Bound::Included(&probe))),
            None => self.set(None),
        }
    }

    fn seek_for_prev(&mut self, target: &[u8]) {
        let memtable = Arc::clone(&self.memtable);
        match self.probe(target) {
            Some(probe) => self.set(memtable.data.upper_bound(Bound::Included(&probe))),
            None => self.set(None),
        }
    }

    fn next(&mut self) {
        let memtable = Arc::clone(&self.memtable);
        match self.current.take() {
            Some(current) => self.set(memtable.data.lower_bound(Bound::Excluded(&current))),
            None => self.set(None),
        }
    }

    fn prev(&mut self) {
        let memtable = Arc::clone(&self.memtable);
        match self.current.take() {
            Some(current) => self.set(memtable.data.upper_bound(Bound::Excluded(&current))),
            None => self.set(None),
        }
    }

    fn key(&self) -> &[u8] {
        &self.encoded
    }

    fn value(&self) -> &[u8] {
        &self.value
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::{bytewise, reverse_bytewise};
    use crate::merge::StringAppendOperator;
    use crate::types::{max_covering_tombstone, user_key};

    fn lookup(mem: &Memtable, key: &[u8], bound: SequenceNumber) -> Result<Option<Vec<u8>>> {
        let cmp = mem.comparator().clone();
        let tombstone = max_covering_tombstone(cmp.as_ref(), &mem.range_tombstones(), key, bound);
        let op = StringAppendOperator::default();
        let mut ctx = GetContext::new(cmp.as_ref(), Some(&op), key, bound, tombstone);
        mem.get(&mut ctx)?;
        ctx.finish()
    }

    #[test]
    fn test_get_respects_sequence_bound() -> Result<()> {
        let mem = Memtable::new(1, bytewise(), 1);
        mem.add(1, ValueType::Put, b"k", b"v1");
        mem.add(2, ValueType::Put, b"k", b"v2");
        mem.add(3, ValueType::Delete, b"k", b"");

        assert_eq!(lookup(&mem, b"k", 1)?, Some(b"v1".to_vec()));
        assert_eq!(lookup(&mem, b"k", 2)?, Some(b"v2".to_vec()));
        assert_eq!(lookup(&mem, b"k", 3)?, None);
        assert_eq!(lookup(&mem, b"missing", 3)?, None);
        assert_eq!(mem.num_entries(), 3);
        assert_eq!(mem.num_deletes(), 1);
        assert_eq!(mem.first_sequence(), 1);
        assert_eq!(mem.largest_sequence(), 3);
        Ok(())
    }

    #[test]
    fn test_merge_and_range_delete() -> Result<()> {
        let mem = Memtable::new(1, bytewise(), 1);
        mem.add(1, ValueType::Put, b"a", b"base");
        mem.add(2, ValueType::Merge, b"a", b"more");
        mem.add(3, ValueType::Put, b"b", b"doomed");
        mem.add(4, ValueType::RangeDelete, b"b", b"c");

        assert_eq!(lookup(&mem, b"a", 10)?, Some(b"base,more".to_vec()));
        assert_eq!(lookup(&mem, b"b", 10)?, None);
        assert_eq!(lookup(&mem, b"b", 3)?, Some(b"doomed".to_vec()));
        assert!(mem.has_range_tombstones());
        Ok(())
    }

    #[test]
    fn test_iterator_walks_both_directions() {
        let mem = Arc::new(Memtable::new(1, bytewise(), 1));
        mem.add(1, ValueType::Put, b"b", b"1");
        mem.add(2, ValueType::Put, b"a", b"2");
        mem.add(3, ValueType::Put, b"b", b"3");

        let mut iter = mem.iter();
        iter.seek_to_first();
        let mut seen = Vec::new();
        while iter.valid() {
            seen.push(iter.value().to_vec());
            iter.next();
        }
        assert_eq!(seen, vec![b"2".to_vec(), b"3".to_vec(), b"1".to_vec()]);

        iter.seek_to_last();
        assert_eq!(iter.value(), b"1");
        iter.prev();
        assert_eq!(iter.value(), b"3");

        iter.seek(&InternalKey::for_seek(b"b", 2).encode());
        assert_eq!(user_key(iter.key()), b"b");
        assert_eq!(iter.value(), b"1");

        iter.seek_for_prev(&InternalKey::after_all(b"a").encode());
        assert_eq!(iter.value(), b"2");
    }

    #[test]
    fn test_custom_comparator_orders_entries() {
        let mem = Arc::new(Memtable::new(1, reverse_bytewise(), 1));
        mem.add(1, ValueType::Put, b"a", b"");
        mem.add(2, ValueType::Put, b"c", b"");
        mem.add(3, ValueType::Put, b"b", b"");

        let mut iter = mem.iter();
        iter.seek_to_first();
        let mut keys = Vec::new();
        while iter.valid() {
            keys.push(user_key(iter.key()).to_vec());
            iter.next();
        }
        assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_freeze_records_successor_log() {
        let mem = Memtable::new(4, bytewise(), 7);
        assert!(!mem.is_frozen());
        mem.freeze(9);
        assert!(mem.is_frozen());
        assert_eq!(mem.log_number(), 7);
        assert_eq!(mem.next_log_number(), 9);
    }

    #[test]
    fn test_approximate_stats_counts_range() {
        let mem = Memtable::new(1, bytewise(), 1);
        for (i, key) in [b"a", b"b", b"c", b"d"].iter().enumerate() {
            mem.add(i as u64 + 1, ValueType::Put, *key, b"xx");
        }
        let (count, bytes) = mem.approximate_stats(b"b", b"d");
        assert_eq!(count, 2);
        assert_eq!(bytes, 2 * (1 + 8 + 2));
    }
}
