use crate::error::Result;
use crate::Error;
use byteorder::{BigEndian, ByteOrder};

pub const HEADER_SIZE: usize = 64;

const MAGIC: &[u8; 8] = b"CINDERMF";
const VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ManifestHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub manifest_number: u64,
}

impl ManifestHeader {
    pub fn new(manifest_number: u64) -> Self {
        ManifestHeader {
            magic: *MAGIC,
            version: VERSION,
            manifest_number,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != *MAGIC {
            return Err(Error::Corruption("bad manifest magic".into()));
        }
        if self.version != VERSION {
            return Err(Error::NotSupported(format!(
                "manifest format version {}",
                self.version
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        BigEndian::write_u32(&mut buf[8..12], self.version);
        BigEndian::write_u64(&mut buf[12..20], self.manifest_number);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Corruption("manifest header truncated".into()));
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);

        let header = Self {
            magic,
            version: BigEndian::read_u32(&buf[8..12]),
            manifest_number: BigEndian::read_u64(&buf[12..20]),
        };
        header.validate()?;
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_rejects_foreign_files() {
        let mut encoded = ManifestHeader::new(7).encode();
        assert_eq!(ManifestHeader::decode(&encoded).unwrap().manifest_number, 7);

        encoded[0] = b'X';
        assert!(ManifestHeader::decode(&encoded).unwrap_err().is_corruption());
        assert!(ManifestHeader::decode(&encoded[..10]).is_err());
    }
}
