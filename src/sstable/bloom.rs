//! Whole-table bloom filter over user keys.
//!
//! Bit positions come from double hashing: a single 128-bit xxh3 hash is
//! split into `h1` and `h2` and probe `i` lands on `h1 + i * h2 (mod m)`.
//!
//! ```text
//! +--------------------+-------------------+------------------+
//! | bit array (bytes)  | num_bits: u32 BE  | num_hashes: u8   |
//! +--------------------+-------------------+------------------+
//! ```

use std::io;

use byteorder::{BigEndian, ByteOrder};
use xxhash_rust::xxh3::xxh3_128;

use crate::error::Result;
use crate::Error;

const TRAILER_SIZE: usize = 5;

#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u32,
    num_hashes: u8,
}

fn hash_key(key: &[u8]) -> (u64, u64) {
    let hash = xxh3_128(key);
    (hash as u64, (hash >> 64) as u64)
}

fn position(h1: u64, h2: u64, i: u8, num_bits: u32) -> usize {
    (h1.wrapping_add((i as u64).wrapping_mul(h2)) % num_bits as u64) as usize
}

impl BloomFilter {
    /// Sizes a filter for `hashes.len()` keys at `bits_per_key`.
    fn build(hashes: &[(u64, u64)], bits_per_key: usize) -> Self {
        // k = bits_per_key * ln(2), clamped to something sane
        let num_hashes = ((bits_per_key as f64) * 0.69).round().clamp(1.0, 30.0) as u8;
        let num_bits = (hashes.len() * bits_per_key).max(64) as u32;
        let mut filter = Self {
            bits: vec![0u8; (num_bits as usize).div_ceil(8)],
            num_bits,
            num_hashes,
        };
        for &(h1, h2) in hashes {
            for i in 0..num_hashes {
                let pos = position(h1, h2, i, num_bits);
                filter.bits[pos / 8] |= 1 << (pos % 8);
            }
        }
        filter
    }

    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_key(key);
        (0..self.num_hashes).all(|i| {
            let pos = position(h1, h2, i, self.num_bits);
            self.bits[pos / 8] & (1 << (pos % 8)) != 0
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bits.len() + TRAILER_SIZE);
        out.extend_from_slice(&self.bits);
        let mut num_bits = [0u8; 4];
        BigEndian::write_u32(&mut num_bits, self.num_bits);
        out.extend_from_slice(&num_bits);
        out.push(self.num_hashes);
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < TRAILER_SIZE {
            return Err(Error::Decode(
                "bloom filter",
                io::Error::new(io::ErrorKind::UnexpectedEof, "filter too short"),
            ));
        }
        let split = data.len() - TRAILER_SIZE;
        let num_bits = BigEndian::read_u32(&data[split..split + 4]);
        let num_hashes = data[split + 4];
        if num_bits == 0 || (num_bits as usize).div_ceil(8) != split || num_hashes == 0 {
            return Err(Error::Corruption("malformed bloom filter".into()));
        }
        Ok(Self {
            bits: data[..split].to_vec(),
            num_bits,
            num_hashes,
        })
    }

    pub fn size(&self) -> usize {
        self.bits.len() + TRAILER_SIZE
    }
}

/// Probes a serialized filter in place. Malformed filters match everything.
pub fn may_contain_serialized(data: &[u8], key: &[u8]) -> bool {
    if data.len() < TRAILER_SIZE {
        return true;
    }
    let split = data.len() - TRAILER_SIZE;
    let num_bits = BigEndian::read_u32(&data[split..split + 4]);
    let num_hashes = data[split + 4];
    if num_bits == 0 || (num_bits as usize).div_ceil(8) != split {
        return true;
    }
    let (h1, h2) = hash_key(key);
    (0..num_hashes).all(|i| {
        let pos = position(h1, h2, i, num_bits);
        data[pos / 8] & (1 << (pos % 8)) != 0
    })
}

/// Collects key hashes while a table is written.
#[derive(Debug, Default)]
pub struct FilterBuilder {
    hashes: Vec<(u64, u64)>,
    last_key: Vec<u8>,
}

impl FilterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a user key; consecutive duplicates are folded.
    pub fn add(&mut self, user_key: &[u8]) {
        if !self.hashes.is_empty() && self.last_key == user_key {
            return;
        }
        self.hashes.push(hash_key(user_key));
        self.last_key.clear();
        self.last_key.extend_from_slice(user_key);
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn finish(&self, bits_per_key: usize) -> BloomFilter {
        BloomFilter::build(&self.hashes, bits_per_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserted_keys_are_found() {
        let mut builder = FilterBuilder::new();
        for i in 0..1000 {
            builder.add(format!("key{}", i).as_bytes());
        }
        let filter = builder.finish(10);
        for i in 0..1000 {
            assert!(filter.may_contain(format!("key{}", i).as_bytes()));
        }
    }

    #[test]
    fn test_false_positive_rate_is_low() {
        let mut builder = FilterBuilder::new();
        for i in 0..2000 {
            builder.add(format!("present{}", i).as_bytes());
        }
        let filter = builder.finish(10);
        let false_positives = (0..10_000)
            .filter(|i| filter.may_contain(format!("absent{}", i).as_bytes()))
            .count();
        // ~1% expected at 10 bits per key
        assert!(false_positives < 500, "fp = {}", false_positives);
    }

    #[test]
    fn test_serialized_filter_answers_the_same() -> Result<()> {
        let mut builder = FilterBuilder::new();
        builder.add(b"apple");
        builder.add(b"apple");
        builder.add(b"banana");
        let filter = builder.finish(8);
        let restored = BloomFilter::deserialize(&filter.serialize())?;
        assert!(restored.may_contain(b"apple"));
        assert!(restored.may_contain(b"banana"));
        assert_eq!(restored.size(), filter.size());
        assert!(may_contain_serialized(&filter.serialize(), b"banana"));
        assert!(BloomFilter::deserialize(&[1, 2]).is_err());
        Ok(())
    }
}
