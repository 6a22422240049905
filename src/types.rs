//! Internal key layout shared by the memtable, WAL replay and SST files.
//!
//! ```text
//! +-----------------+------------------------------+
//! | user key        | trailer: be64(seq << 8 | t)  |
//! +-----------------+------------------------------+
//! ```
//!
//! Internal keys sort by user key ascending (per the column family
//! comparator), then by trailer descending, so the newest version of a key
//! is met first.

use std::cmp::Ordering;
use std::fmt;

use byteorder::{BigEndian, ByteOrder};

use crate::comparator::Comparator;
use crate::error::Result;
use crate::Error;

pub type SequenceNumber = u64;

pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// Trailer type used when building lookup keys; sorts before every real type
/// at the same sequence number.
pub const TYPE_FOR_SEEK: u8 = 0xFF;

pub const TRAILER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ValueType {
    Delete = 0x0,
    Put = 0x1,
    Merge = 0x2,
    LogData = 0x3,
    SingleDelete = 0x7,
    RangeDelete = 0xF,
}

impl ValueType {
    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0x0 => Ok(ValueType::Delete),
            0x1 => Ok(ValueType::Put),
            0x2 => Ok(ValueType::Merge),
            0x3 => Ok(ValueType::LogData),
            0x7 => Ok(ValueType::SingleDelete),
            0xF => Ok(ValueType::RangeDelete),
            other => Err(Error::Corruption(format!("unknown value type {:#x}", other))),
        }
    }

    pub fn is_deletion(self) -> bool {
        matches!(self, ValueType::Delete | ValueType::SingleDelete)
    }
}

pub fn pack_trailer(seq: SequenceNumber, tag: u8) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE_NUMBER);
    (seq << 8) | tag as u64
}

/// Owned, decoded internal key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct InternalKey {
    pub user_key: Vec<u8>,
    pub trailer: u64,
}

impl InternalKey {
    pub fn new(user_key: impl Into<Vec<u8>>, seq: SequenceNumber, kind: ValueType) -> Self {
        Self {
            user_key: user_key.into(),
            trailer: pack_trailer(seq, kind as u8),
        }
    }

    /// Key that positions before every visible version of `user_key` at `seq`.
    pub fn for_seek(user_key: &[u8], seq: SequenceNumber) -> Self {
        Self {
            user_key: user_key.to_vec(),
            trailer: pack_trailer(seq, TYPE_FOR_SEEK),
        }
    }

    /// Key that positions after every version of `user_key`.
    pub fn after_all(user_key: &[u8]) -> Self {
        Self {
            user_key: user_key.to_vec(),
            trailer: 0,
        }
    }

    pub fn seq(&self) -> SequenceNumber {
        self.trailer >> 8
    }

    pub fn kind(&self) -> Result<ValueType> {
        ValueType::from_u8((self.trailer & 0xFF) as u8)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.user_key.len() + TRAILER_SIZE);
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.user_key);
        let mut trailer = [0u8; TRAILER_SIZE];
        BigEndian::write_u64(&mut trailer, self.trailer);
        buf.extend_from_slice(&trailer);
    }

    pub fn decode(encoded: &[u8]) -> Result<Self> {
        let parsed = ParsedKey::parse(encoded)?;
        Ok(Self {
            user_key: parsed.user_key.to_vec(),
            trailer: parsed.trailer,
        })
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}",
            String::from_utf8_lossy(&self.user_key),
            self.seq(),
            self.trailer & 0xFF
        )
    }
}

/// Borrowed view of an encoded internal key.
#[derive(Debug, Clone, Copy)]
pub struct ParsedKey<'a> {
    pub user_key: &'a [u8],
    pub trailer: u64,
}

impl<'a> ParsedKey<'a> {
    pub fn parse(encoded: &'a [u8]) -> Result<Self> {
        if encoded.len() < TRAILER_SIZE {
            return Err(Error::Corruption(format!(
                "internal key too short: {} bytes",
                encoded.len()
            )));
        }
        let split = encoded.len() - TRAILER_SIZE;
        Ok(Self {
            user_key: &encoded[..split],
            trailer: BigEndian::read_u64(&encoded[split..]),
        })
    }

    pub fn seq(&self) -> SequenceNumber {
        self.trailer >> 8
    }

    pub fn kind(&self) -> Result<ValueType> {
        ValueType::from_u8((self.trailer & 0xFF) as u8)
    }
}

/// Extracts the user key of an encoded internal key without validation.
pub fn user_key(encoded: &[u8]) -> &[u8] {
    &encoded[..encoded.len().saturating_sub(TRAILER_SIZE)]
}

fn trailer_of(encoded: &[u8]) -> u64 {
    if encoded.len() < TRAILER_SIZE {
        return 0;
    }
    BigEndian::read_u64(&encoded[encoded.len() - TRAILER_SIZE..])
}

/// Orders encoded internal keys with a user comparator.
pub fn compare_internal(cmp: &dyn Comparator, a: &[u8], b: &[u8]) -> Ordering {
    cmp.compare(user_key(a), user_key(b))
        .then_with(|| trailer_of(b).cmp(&trailer_of(a)))
}

/// Orders decoded internal keys with a user comparator.
pub fn compare_keys(cmp: &dyn Comparator, a: &InternalKey, b: &InternalKey) -> Ordering {
    cmp.compare(&a.user_key, &b.user_key)
        .then_with(|| b.trailer.cmp(&a.trailer))
}

/// `[begin, end)` deletion recorded at `seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeTombstone {
    pub begin: Vec<u8>,
    pub end: Vec<u8>,
    pub seq: SequenceNumber,
}

impl RangeTombstone {
    pub fn covers(&self, cmp: &dyn Comparator, key: &[u8]) -> bool {
        cmp.compare(&self.begin, key) != Ordering::Greater
            && cmp.compare(key, &self.end) == Ordering::Less
    }
}

/// Highest sequence number of a tombstone covering `key` that is visible at
/// `bound`, or zero.
pub fn max_covering_tombstone(
    cmp: &dyn Comparator,
    tombstones: &[RangeTombstone],
    key: &[u8],
    bound: SequenceNumber,
) -> SequenceNumber {
    tombstones
        .iter()
        .filter(|t| t.seq <= bound && t.covers(cmp, key))
        .map(|t| t.seq)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;

    #[test]
    fn test_newer_versions_sort_first() {
        let cmp = BytewiseComparator;
        let newer = InternalKey::new(b"k".to_vec(), 9, ValueType::Put).encode();
        let older = InternalKey::new(b"k".to_vec(), 3, ValueType::Put).encode();
        let other = InternalKey::new(b"j".to_vec(), 1, ValueType::Put).encode();

        assert_eq!(compare_internal(&cmp, &newer, &older), Ordering::Less);
        assert_eq!(compare_internal(&cmp, &other, &newer), Ordering::Less);
    }

    #[test]
    fn test_seek_key_precedes_versions_at_same_seq() {
        let cmp = BytewiseComparator;
        let seek = InternalKey::for_seek(b"k", 5);
        let put = InternalKey::new(b"k".to_vec(), 5, ValueType::Put);
        let older = InternalKey::new(b"k".to_vec(), 4, ValueType::Delete);
        assert_eq!(compare_keys(&cmp, &seek, &put), Ordering::Less);
        assert_eq!(compare_keys(&cmp, &seek, &older), Ordering::Less);
        assert_eq!(
            compare_keys(&cmp, &InternalKey::after_all(b"k"), &older),
            Ordering::Greater
        );
    }

    #[test]
    fn test_decode_rejects_short_keys() {
        assert!(InternalKey::decode(b"abc").is_err());
        let key = InternalKey::new(b"abc".to_vec(), 42, ValueType::Merge);
        let decoded = InternalKey::decode(&key.encode()).unwrap();
        assert_eq!(decoded.seq(), 42);
        assert_eq!(decoded.kind().unwrap(), ValueType::Merge);
    }

    #[test]
    fn test_range_tombstone_coverage() {
        let cmp = BytewiseComparator;
        let tombstones = vec![
            RangeTombstone {
                begin: b"b".to_vec(),
                end: b"d".to_vec(),
                seq: 10,
            },
            RangeTombstone {
                begin: b"c".to_vec(),
                end: b"z".to_vec(),
                seq: 20,
            },
        ];
        assert_eq!(max_covering_tombstone(&cmp, &tombstones, b"a", 100), 0);
        assert_eq!(max_covering_tombstone(&cmp, &tombstones, b"b", 100), 10);
        assert_eq!(max_covering_tombstone(&cmp, &tombstones, b"c", 100), 20);
        assert_eq!(max_covering_tombstone(&cmp, &tombstones, b"c", 15), 10);
        assert_eq!(max_covering_tombstone(&cmp, &tombstones, b"d", 15), 0);
    }
}
