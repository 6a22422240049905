use crate::error::Result;
use crate::Error;
use byteorder::{BigEndian, ByteOrder};

pub const HEADER_SIZE: usize = 64;

const MAGIC: &[u8; 8] = b"CINDERWL";
const VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    pub magic: [u8; 8],
    pub version: u32,
    pub log_number: u64,
    pub entry_count: u64,
}

impl Header {
    pub fn new(log_number: u64) -> Self {
        Header {
            magic: *MAGIC,
            version: VERSION,
            log_number,
            entry_count: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != *MAGIC {
            return Err(Error::Corruption("bad WAL magic".into()));
        }
        if self.version != VERSION {
            return Err(Error::NotSupported(format!(
                "WAL format version {}",
                self.version
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        BigEndian::write_u32(&mut buf[8..12], self.version);
        BigEndian::write_u64(&mut buf[12..20], self.log_number);
        BigEndian::write_u64(&mut buf[20..28], self.entry_count);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Corruption("WAL header truncated".into()));
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);

        let header = Self {
            magic,
            version: BigEndian::read_u32(&buf[8..12]),
            log_number: BigEndian::read_u64(&buf[12..20]),
            entry_count: BigEndian::read_u64(&buf[20..28]),
        };
        header.validate()?;
        Ok(header)
    }
}
