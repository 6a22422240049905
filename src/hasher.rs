use std::fmt;

use crc::{Algorithm, Crc, Digest};

pub const CRC_64_ECMA: Algorithm<u64> = crc::CRC_64_ECMA_182;

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA);

/// Running crc64 over everything written to a table file; stored in the
/// table properties and checked by `verify_checksum`.
pub struct Hasher {
    digest: Digest<'static, u64>,
    len: u64,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher").field("len", &self.len).finish()
    }
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            digest: CRC64.digest(),
            len: 0,
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.digest.update(data);
        self.len += data.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn checksum(&self) -> u64 {
        self.digest.clone().finalize()
    }

    pub fn reset(&mut self) {
        self.digest = CRC64.digest();
        self.len = 0;
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

pub fn checksum(data: &[u8]) -> u64 {
    CRC64.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incremental_checksum() {
        let mut hasher1 = Hasher::new();
        hasher1.write(b"hello ");
        hasher1.write(b"world");
        let checksum1 = hasher1.checksum();

        assert_eq!(checksum1, checksum(b"hello world"));
        assert_eq!(hasher1.len(), 11);
    }

    #[test]
    fn test_checksum_does_not_consume_state() {
        let mut hasher = Hasher::new();
        hasher.write(b"abc");
        let first = hasher.checksum();
        assert_eq!(first, hasher.checksum());
        hasher.write(b"d");
        assert_eq!(hasher.checksum(), checksum(b"abcd"));
    }

    #[test]
    fn test_reset_hasher() {
        let mut hasher = Hasher::new();
        hasher.write(b"hello");
        let first_checksum = hasher.checksum();

        hasher.reset();
        assert!(hasher.is_empty());
        hasher.write(b"hello");
        assert_eq!(first_checksum, hasher.checksum());
    }
}
