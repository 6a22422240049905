use std::io;

use byteorder::{BigEndian, ByteOrder};

use crate::error::Result;
use crate::wal::CRC32;
use crate::Error;

pub const FOOTER_SIZE: usize = 80;
pub const TABLE_MAGIC: u64 = 0x43494e_44455253; // "CINDERS"
pub const FORMAT_VERSION: u32 = 1;

/// Location of a block inside a table file; `size` excludes the block trailer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub const ENCODED_LEN: usize = 16;

    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        BigEndian::write_u64(&mut buf[0..8], self.offset);
        BigEndian::write_u64(&mut buf[8..16], self.size);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::ENCODED_LEN];
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(Error::Decode(
                "block handle",
                io::Error::new(io::ErrorKind::UnexpectedEof, "handle too short"),
            ));
        }
        Ok(Self {
            offset: BigEndian::read_u64(&buf[0..8]),
            size: BigEndian::read_u64(&buf[8..16]),
        })
    }
}

/// Fixed-size tail of every table file.
///
/// ```text
/// +--------+-----------+------------+-------+---------+----------+-------+
/// | filter | range_del | properties | index | version | meta crc | magic |
/// |  16 B  |   16 B    |    16 B    | 16 B  |  u32    |   u32    |  u64  |
/// +--------+-----------+------------+-------+---------+----------+-------+
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Footer {
    pub filter: BlockHandle,
    pub range_del: BlockHandle,
    pub properties: BlockHandle,
    pub index: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        self.filter.encode_into(&mut buf[0..16]);
        self.range_del.encode_into(&mut buf[16..32]);
        self.properties.encode_into(&mut buf[32..48]);
        self.index.encode_into(&mut buf[48..64]);
        BigEndian::write_u32(&mut buf[64..68], FORMAT_VERSION);
        let crc = CRC32.checksum(&buf[0..68]);
        BigEndian::write_u32(&mut buf[68..72], crc);
        BigEndian::write_u64(&mut buf[72..80], TABLE_MAGIC);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != FOOTER_SIZE {
            return Err(Error::Decode(
                "table footer",
                io::Error::new(io::ErrorKind::UnexpectedEof, "footer truncated"),
            ));
        }
        let magic = BigEndian::read_u64(&buf[72..80]);
        if magic != TABLE_MAGIC {
            return Err(Error::Corruption(format!(
                "bad table magic number {:#x}",
                magic
            )));
        }
        let expected = BigEndian::read_u32(&buf[68..72]);
        let actual = CRC32.checksum(&buf[0..68]);
        if expected != actual {
            return Err(Error::ChecksumMismatch {
                context: "table footer",
                expected,
                actual,
            });
        }
        let version = BigEndian::read_u32(&buf[64..68]);
        if version != FORMAT_VERSION {
            return Err(Error::NotSupported(format!(
                "table format version {}",
                version
            )));
        }
        Ok(Self {
            filter: BlockHandle::decode(&buf[0..16])?,
            range_del: BlockHandle::decode(&buf[16..32])?,
            properties: BlockHandle::decode(&buf[32..48])?,
            index: BlockHandle::decode(&buf[48..64])?,
        })
    }
}
