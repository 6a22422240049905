use std::cmp::Ordering;
use std::io;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::comparator::Comparator;
use crate::error::Result;
use crate::iterator::InternalIterator;
use crate::types::compare_internal;
use crate::Error;

const ENTRY_HEADER_SIZE: usize = 12;

/// Builds one block of prefix-compressed entries.
///
/// ```text
/// +-------------+---------------+-------------+-----------------+-------+
/// | shared: u32 | unshared: u32 | value: u32  | key[shared..]   | value |
/// +-------------+---------------+-------------+-----------------+-------+
/// ...
/// | restart offsets: u32 * n | n: u32 |
/// ```
pub struct BlockBuilder {
    buffer: Vec<u8>,
    restart_positions: Vec<u32>,
    restart_interval: usize,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        Self {
            buffer: Vec::new(),
            restart_positions: Vec::new(),
            restart_interval: restart_interval.max(1),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.entry_count % self.restart_interval == 0 {
            self.restart_positions.push(self.buffer.len() as u32);
            0
        } else {
            shared_prefix_length(&self.last_key, key)
        };
        let unshared = key.len() - shared;

        let mut header = [0u8; ENTRY_HEADER_SIZE];
        BigEndian::write_u32(&mut header[0..4], shared as u32);
        BigEndian::write_u32(&mut header[4..8], unshared as u32);
        BigEndian::write_u32(&mut header[8..12], value.len() as u32);
        self.buffer.extend_from_slice(&header);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
    }

    /// Serialized size if finished now.
    pub fn estimated_size(&self) -> usize {
        self.buffer.len() + (self.restart_positions.len() + 1) * 4
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// Returns the block contents and resets the builder.
    pub fn finish(&mut self) -> Vec<u8> {
        if self.restart_positions.is_empty() {
            self.restart_positions.push(0);
        }
        let mut out = std::mem::take(&mut self.buffer);
        for pos in &self.restart_positions {
            // writes into a Vec cannot fail
            let _ = out.write_u32::<BigEndian>(*pos);
        }
        let _ = out.write_u32::<BigEndian>(self.restart_positions.len() as u32);

        self.restart_positions.clear();
        self.entry_count = 0;
        self.last_key.clear();
        out
    }
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|&(a, b)| a == b).count()
}

fn truncated(what: &'static str) -> Error {
    Error::Decode(what, io::Error::new(io::ErrorKind::UnexpectedEof, "block truncated"))
}

/// Decoded block. Entries are materialized once when the block is loaded so
/// cached blocks can be shared by iterators without re-parsing.
#[derive(Debug, Clone)]
pub struct Block {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    size: usize,
}

impl Block {
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(truncated("block data"));
        }
        let restarts_end = data.len() - 4;
        let num_restarts = BigEndian::read_u32(&data[restarts_end..]) as usize;
        let restarts_len = num_restarts
            .checked_mul(4)
            .filter(|len| *len <= restarts_end)
            .ok_or_else(|| truncated("block restarts"))?;
        let entries_end = restarts_end - restarts_len;
        let restarts: Vec<usize> = data[entries_end..restarts_end]
            .chunks_exact(4)
            .map(|c| BigEndian::read_u32(c) as usize)
            .collect();

        let mut entries = Vec::new();
        let mut last_key: Vec<u8> = Vec::new();
        let mut offset = 0;
        let mut next_restart = 0;
        while offset < entries_end {
            if offset + ENTRY_HEADER_SIZE > entries_end {
                return Err(truncated("block entry header"));
            }
            let shared = BigEndian::read_u32(&data[offset..]) as usize;
            let unshared = BigEndian::read_u32(&data[offset + 4..]) as usize;
            let value_len = BigEndian::read_u32(&data[offset + 8..]) as usize;

            let at_restart = restarts.get(next_restart) == Some(&offset);
            if at_restart {
                next_restart += 1;
                if shared != 0 {
                    return Err(Error::Corruption(format!(
                        "restart entry at {} shares a prefix",
                        offset
                    )));
                }
            }
            if shared > last_key.len() {
                return Err(Error::Corruption("bad shared prefix length".into()));
            }

            let key_start = offset + ENTRY_HEADER_SIZE;
            let value_start = key_start + unshared;
            let end = value_start + value_len;
            if end > entries_end {
                return Err(truncated("block entry"));
            }

            let mut key = Vec::with_capacity(shared + unshared);
            key.extend_from_slice(&last_key[..shared]);
            key.extend_from_slice(&data[key_start..value_start]);
            last_key.clone_from(&key);
            entries.push((key, data[value_start..end].to_vec()));
            offset = end;
        }

        Ok(Self {
            entries,
            size: data.len(),
        })
    }

    /// Wraps bytes that are not a block (a filter) so they can share the
    /// block cache.
    pub fn opaque(value: Vec<u8>) -> Self {
        let size = value.len();
        Self {
            entries: vec![(Vec::new(), value)],
            size,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decoded bytes, used as the cache charge.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn entry(&self, idx: usize) -> Option<(&[u8], &[u8])> {
        self.entries
            .get(idx)
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Rewrites the sequence number of every internal key.
    pub fn assign_sequence(&mut self, seq: u64) {
        for (key, _) in &mut self.entries {
            let split = key.len().saturating_sub(8);
            if key.len() >= 8 {
                let kind = key[key.len() - 1];
                BigEndian::write_u64(&mut key[split..], (seq << 8) | kind as u64);
            }
        }
    }

    /// Index of the first entry with internal key >= `target`.
    pub fn lower_bound(&self, cmp: &dyn Comparator, target: &[u8]) -> usize {
        self.entries
            .partition_point(|(k, _)| compare_internal(cmp, k, target) == Ordering::Less)
    }

    /// Index one past the last entry with internal key <= `target`.
    pub fn upper_bound(&self, cmp: &dyn Comparator, target: &[u8]) -> usize {
        self.entries
            .partition_point(|(k, _)| compare_internal(cmp, k, target) != Ordering::Greater)
    }
}

/// Iterator over one decoded block of internal keys.
pub struct BlockIterator {
    block: Arc<Block>,
    cmp: Arc<dyn Comparator>,
    pos: Option<usize>,
}

impl BlockIterator {
    pub fn new(block: Arc<Block>, cmp: Arc<dyn Comparator>) -> Self {
        Self {
            block,
            cmp,
            pos: None,
        }
    }
}

impl InternalIterator for BlockIterator {
    fn valid(&self) -> bool {
        self.pos.is_some()
    }

    fn seek_to_first(&mut self) {
        self.pos = (!self.block.is_empty()).then_some(0);
    }

    fn seek_to_last(&mut self) {
        self.pos = self.block.len().checked_sub(1);
    }

    fn seek(&mut self, target: &[u8]) {
        let idx = self.block.lower_bound(self.cmp.as_ref(), target);
        self.pos = (idx < self.block.len()).then_some(idx);
    }

    fn seek_for_prev(&mut self, target: &[u8]) {
        self.pos = self
            .block
            .upper_bound(self.cmp.as_ref(), target)
            .checked_sub(1);
    }

    fn next(&mut self) {
        self.pos = self.pos.map(|p| p + 1).filter(|&p| p < self.block.len());
    }

    fn prev(&mut self) {
        self.pos = self.pos.and_then(|p| p.checked_sub(1));
    }

    fn key(&self) -> &[u8] {
        self.pos
            .and_then(|p| self.block.entry(p))
            .map_or(&[][..], |(k, _)| k)
    }

    fn value(&self) -> &[u8] {
        self.pos
            .and_then(|p| self.block.entry(p))
            .map_or(&[][..], |(_, v)| v)
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::bytewise;
    use crate::types::{user_key, InternalKey, ValueType};

    fn ikey(k: &str, seq: u64) -> Vec<u8> {
        InternalKey::new(k.as_bytes().to_vec(), seq, ValueType::Put).encode()
    }

    #[test]
    fn test_prefix_compression_survives_restarts() -> Result<()> {
        let mut builder = BlockBuilder::new(3);
        let keys: Vec<String> = (0..10).map(|i| format!("user_key_{:03}", i)).collect();
        for key in &keys {
            builder.add(key.as_bytes(), b"v");
        }
        let raw_len: usize = keys.iter().map(|k| k.len() + 1 + ENTRY_HEADER_SIZE).sum();
        let data = builder.finish();
        assert!(data.len() < raw_len + 4 * 5);
        assert!(builder.is_empty());

        let block = Block::decode(&data)?;
        let decoded: Vec<Vec<u8>> = block.entries().map(|(k, _)| k.to_vec()).collect();
        let expected: Vec<Vec<u8>> = keys.iter().map(|k| k.as_bytes().to_vec()).collect();
        assert_eq!(decoded, expected);
        Ok(())
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"alpha", b"1");
        builder.add(b"alphabet", b"2");
        let data = builder.finish();
        assert!(Block::decode(&data[..data.len() - 6]).is_err());
        assert!(Block::decode(&[0, 0]).is_err());
    }

    #[test]
    fn test_iterator_seeks_internal_keys() -> Result<()> {
        let mut builder = BlockBuilder::new(2);
        for (k, seq) in [("a", 5), ("b", 9), ("b", 4), ("d", 1)] {
            builder.add(&ikey(k, seq), k.as_bytes());
        }
        let block = Arc::new(Block::decode(&builder.finish())?);
        let mut iter = BlockIterator::new(block, bytewise());

        iter.seek(&InternalKey::for_seek(b"b", 6).encode());
        assert_eq!(user_key(iter.key()), b"b");
        assert_eq!(InternalKey::decode(iter.key())?.seq(), 4);

        iter.seek(&InternalKey::for_seek(b"c", 100).encode());
        assert_eq!(user_key(iter.key()), b"d");
        iter.next();
        assert!(!iter.valid());

        iter.seek_for_prev(&InternalKey::after_all(b"c").encode());
        assert_eq!(InternalKey::decode(iter.key())?.seq(), 4);
        iter.prev();
        iter.prev();
        assert_eq!(user_key(iter.key()), b"a");
        Ok(())
    }

    #[test]
    fn test_assign_sequence_keeps_type() -> Result<()> {
        let mut builder = BlockBuilder::new(16);
        builder.add(&InternalKey::new(b"k".to_vec(), 0, ValueType::Merge).encode(), b"x");
        let mut block = Block::decode(&builder.finish())?;
        block.assign_sequence(77);
        let (key, _) = block.entry(0).unwrap();
        let key = InternalKey::decode(key)?;
        assert_eq!(key.seq(), 77);
        assert_eq!(key.kind()?, ValueType::Merge);
        Ok(())
    }
}
