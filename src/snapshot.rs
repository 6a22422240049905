//! Live snapshot registry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::SequenceNumber;

#[derive(Debug, Clone, Copy)]
struct Entry {
    seq: SequenceNumber,
    unix_time: u64,
}

/// Sequence numbers pinned by live snapshots. Compaction keeps every
/// version of a key one of these can still observe.
#[derive(Debug, Default)]
pub struct SnapshotList {
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<u64, Entry>>,
}

impl SnapshotList {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn acquire(&self, seq: SequenceNumber) -> Snapshot<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let unix_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(id, Entry { seq, unix_time });
        }
        Snapshot {
            list: self,
            id,
            seq,
            unix_time,
        }
    }

    fn release(&self, id: u64) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&id);
        }
    }

    /// Pinned sequence numbers, ascending and deduplicated.
    pub fn sequences(&self) -> Vec<SequenceNumber> {
        let mut seqs: Vec<SequenceNumber> = self
            .entries
            .lock()
            .map(|entries| entries.values().map(|e| e.seq).collect())
            .unwrap_or_default();
        seqs.sort_unstable();
        seqs.dedup();
        seqs
    }

    pub fn oldest(&self) -> Option<SequenceNumber> {
        self.sequences().first().copied()
    }

    /// Creation time in unix seconds of the oldest snapshot.
    pub fn oldest_time(&self) -> Option<u64> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.values().map(|e| e.unix_time).min())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A consistent read view. Released when dropped.
#[derive(Debug)]
pub struct Snapshot<'a> {
    list: &'a SnapshotList,
    id: u64,
    seq: SequenceNumber,
    unix_time: u64,
}

impl Snapshot<'_> {
    pub fn sequence(&self) -> SequenceNumber {
        self.seq
    }

    pub fn unix_time(&self) -> u64 {
        self.unix_time
    }
}

impl Drop for Snapshot<'_> {
    fn drop(&mut self) {
        self.list.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshots_pin_until_dropped() {
        let list = SnapshotList::new();
        let a = list.acquire(10);
        let b = list.acquire(4);
        let c = list.acquire(10);
        assert_eq!(list.len(), 3);
        assert_eq!(list.sequences(), vec![4, 10]);
        assert_eq!(list.oldest(), Some(4));

        drop(b);
        assert_eq!(list.oldest(), Some(10));
        drop(a);
        assert_eq!(list.sequences(), vec![10]);
        assert_eq!(c.sequence(), 10);
        drop(c);
        assert!(list.is_empty());
        assert_eq!(list.oldest_time(), None);
    }
}
