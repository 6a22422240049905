//! Positional iterators over encoded internal keys.
//!
//! Every source (memtable, table file, level) exposes an
//! [`InternalIterator`]; the [`MergingIterator`] combines them into one
//! stream ordered by internal key. Errors are latched and reported through
//! `status()` instead of per step.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::comparator::ComparatorRef;
use crate::error::Result;
use crate::types::compare_internal;

pub trait InternalIterator: Send {
    fn valid(&self) -> bool;

    fn seek_to_first(&mut self);

    fn seek_to_last(&mut self);

    /// Positions at the first entry with key >= `target`.
    fn seek(&mut self, target: &[u8]);

    /// Positions at the last entry with key <= `target`.
    fn seek_for_prev(&mut self, target: &[u8]);

    fn next(&mut self);

    fn prev(&mut self);

    /// Encoded internal key of the current entry. Only legal while valid.
    fn key(&self) -> &[u8];

    fn value(&self) -> &[u8];

    fn status(&self) -> Result<()>;
}

pub type BoxedIterator = Box<dyn InternalIterator>;

/// Iterator over an owned, sorted list of entries.
pub struct VecIterator {
    cmp: ComparatorRef,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pos: Option<usize>,
}

impl VecIterator {
    /// `entries` must already be sorted by internal key.
    pub fn new(cmp: ComparatorRef, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self {
            cmp,
            entries,
            pos: None,
        }
    }

    fn lower_bound(&self, target: &[u8]) -> usize {
        self.entries
            .partition_point(|(k, _)| compare_internal(self.cmp.as_ref(), k, target) == Ordering::Less)
    }
}

impl InternalIterator for VecIterator {
    fn valid(&self) -> bool {
        self.pos.is_some()
    }

    fn seek_to_first(&mut self) {
        self.pos = if self.entries.is_empty() { None } else { Some(0) };
    }

    fn seek_to_last(&mut self) {
        self.pos = self.entries.len().checked_sub(1);
    }

    fn seek(&mut self, target: &[u8]) {
        let idx = self.lower_bound(target);
        self.pos = (idx < self.entries.len()).then_some(idx);
    }

    fn seek_for_prev(&mut self, target: &[u8]) {
        let idx = self.entries.partition_point(|(k, _)| {
            compare_internal(self.cmp.as_ref(), k, target) != Ordering::Greater
        });
        self.pos = idx.checked_sub(1);
    }

    fn next(&mut self) {
        self.pos = self
            .pos
            .map(|p| p + 1)
            .filter(|&p| p < self.entries.len());
    }

    fn prev(&mut self) {
        self.pos = self.pos.and_then(|p| p.checked_sub(1));
    }

    fn key(&self) -> &[u8] {
        self.pos.map_or(&[][..], |p| &self.entries[p].0)
    }

    fn value(&self) -> &[u8] {
        self.pos.map_or(&[][..], |p| &self.entries[p].1)
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

struct HeapEntry {
    key: Vec<u8>,
    source: usize,
    comparator: ComparatorRef,
    direction: Direction,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap pops the greatest entry: forward wants the smallest key,
    // reverse the largest. Ties go to the lower source index (newer data).
    fn cmp(&self, other: &Self) -> Ordering {
        let by_key = compare_internal(self.comparator.as_ref(), &self.key, &other.key);
        let by_key = match self.direction {
            Direction::Forward => by_key.reverse(),
            Direction::Reverse => by_key,
        };
        by_key.then_with(|| other.source.cmp(&self.source))
    }
}

/// Merges child iterators ordered newest source first.
pub struct MergingIterator {
    cmp: ComparatorRef,
    children: Vec<BoxedIterator>,
    heap: BinaryHeap<HeapEntry>,
    current: Option<usize>,
    direction: Direction,
}

impl MergingIterator {
    pub fn new(cmp: ComparatorRef, children: Vec<BoxedIterator>) -> Self {
        Self {
            cmp,
            children,
            heap: BinaryHeap::new(),
            current: None,
            direction: Direction::Forward,
        }
    }

    fn entry(&self, source: usize) -> HeapEntry {
        HeapEntry {
            key: self.children[source].key().to_vec(),
            source,
            comparator: self.cmp.clone(),
            direction: self.direction,
        }
    }

    fn rebuild(&mut self, direction: Direction) {
        self.direction = direction;
        self.heap.clear();
        for source in 0..self.children.len() {
            if self.children[source].valid() {
                let entry = self.entry(source);
                self.heap.push(entry);
            }
        }
        self.current = self.heap.peek().map(|e| e.source);
    }

    fn advance_current(&mut self, forward: bool) {
        let Some(entry) = self.heap.pop() else {
            self.current = None;
            return;
        };
        let child = &mut self.children[entry.source];
        if forward {
            child.next();
        } else {
            child.prev();
        }
        if child.valid() {
            let entry = self.entry(entry.source);
            self.heap.push(entry);
        }
        self.current = self.heap.peek().map(|e| e.source);
    }
}

impl InternalIterator for MergingIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.rebuild(Direction::Forward);
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.rebuild(Direction::Reverse);
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.rebuild(Direction::Forward);
    }

    fn seek_for_prev(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek_for_prev(target);
        }
        self.rebuild(Direction::Reverse);
    }

    fn next(&mut self) {
        let Some(current) = self.current else { return };
        if self.direction == Direction::Reverse {
            // Every other child has to move to the first entry after key().
            let key = self.key().to_vec();
            for (source, child) in self.children.iter_mut().enumerate() {
                if source == current {
                    continue;
                }
                child.seek(&key);
                if child.valid()
                    && compare_internal(self.cmp.as_ref(), &key, child.key()) == Ordering::Equal
                {
                    child.next();
                }
            }
            self.rebuild(Direction::Forward);
        }
        self.advance_current(true);
    }

    fn prev(&mut self) {
        let Some(current) = self.current else { return };
        if self.direction == Direction::Forward {
            let key = self.key().to_vec();
            for (source, child) in self.children.iter_mut().enumerate() {
                if source == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() {
                    child.prev();
                } else {
                    child.seek_to_last();
                }
            }
            self.rebuild(Direction::Reverse);
        }
        self.advance_current(false);
    }

    fn key(&self) -> &[u8] {
        match self.current {
            Some(source) => self.children[source].key(),
            None => &[],
        }
    }

    fn value(&self) -> &[u8] {
        match self.current {
            Some(source) => self.children[source].value(),
            None => &[],
        }
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::bytewise;
    use crate::types::{user_key, InternalKey, ValueType};

    fn source(entries: &[(&str, u64)]) -> BoxedIterator {
        let mut rows: Vec<(Vec<u8>, Vec<u8>)> = entries
            .iter()
            .map(|(k, seq)| {
                (
                    InternalKey::new(k.as_bytes().to_vec(), *seq, ValueType::Put).encode(),
                    format!("{}{}", k, seq).into_bytes(),
                )
            })
            .collect();
        let cmp = bytewise();
        rows.sort_by(|a, b| compare_internal(cmp.as_ref(), &a.0, &b.0));
        Box::new(VecIterator::new(cmp, rows))
    }

    fn forward(iter: &mut MergingIterator) -> Vec<String> {
        let mut out = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            out.push(String::from_utf8_lossy(iter.value()).into_owned());
            iter.next();
        }
        out
    }

    #[test]
    fn test_merge_orders_by_key_then_newest() {
        let mut iter = MergingIterator::new(
            bytewise(),
            vec![
                source(&[("b", 9), ("d", 8)]),
                source(&[("a", 3), ("b", 2)]),
                source(&[("c", 1)]),
            ],
        );
        assert_eq!(forward(&mut iter), vec!["a3", "b9", "b2", "c1", "d8"]);
    }

    #[test]
    fn test_reverse_matches_forward() {
        let mut iter = MergingIterator::new(
            bytewise(),
            vec![source(&[("b", 9), ("d", 8)]), source(&[("a", 3), ("b", 2)])],
        );
        let mut backward = Vec::new();
        iter.seek_to_last();
        while iter.valid() {
            backward.push(String::from_utf8_lossy(iter.value()).into_owned());
            iter.prev();
        }
        backward.reverse();
        assert_eq!(backward, forward(&mut iter));
    }

    #[test]
    fn test_direction_switch() {
        let mut iter = MergingIterator::new(
            bytewise(),
            vec![source(&[("a", 1), ("c", 1)]), source(&[("b", 1), ("d", 1)])],
        );
        iter.seek(&InternalKey::for_seek(b"b", 100).encode());
        assert_eq!(user_key(iter.key()), b"b");
        iter.next();
        assert_eq!(user_key(iter.key()), b"c");
        iter.prev();
        assert_eq!(user_key(iter.key()), b"b");
        iter.prev();
        assert_eq!(user_key(iter.key()), b"a");
        iter.next();
        assert_eq!(user_key(iter.key()), b"b");
        iter.seek_for_prev(&InternalKey::after_all(b"c").encode());
        assert_eq!(user_key(iter.key()), b"c");
    }
}
