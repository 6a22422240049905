//! Sorted string table files.
//!
//! # File Format
//!
//! ```text
//! +-------------------+
//! | Data Block 1      |  ← prefix-compressed entries, optionally zstd
//! +-------------------+
//! | ...               |
//! +-------------------+
//! | Data Block N      |
//! +-------------------+
//! | Filter Block      |  ← bloom filter over user keys (optional)
//! +-------------------+
//! | Range Del Block   |  ← [begin, end) tombstones (optional)
//! +-------------------+
//! | Index Block       |  ← first key of every data block → handle
//! +-------------------+
//! | Properties Block  |  ← counts, seqno range, comparator, checksum
//! +-------------------+
//! | Footer (80 bytes) |
//! +-------------------+
//! ```
//!
//! Every block is followed by a 5 byte trailer: the compression tag and a
//! crc32c over the stored body plus the tag. The whole-file crc64 recorded in
//! the properties covers every byte before the properties block.

use std::fs::File;
use std::io;

pub mod block;
pub mod bloom;
pub mod builder;
pub mod external;
pub mod footer;
pub mod properties;
pub mod table;

pub use builder::{TableBuilder, TableOptions, TableSummary};
pub use external::{ExternalFileInfo, SstFileReader, SstFileWriter};
pub use properties::TableProperties;
pub use table::{BlockCache, BlockReadOptions, Table, TableIterator, TableReaderOptions};

pub const BLOCK_TRAILER_SIZE: usize = 5;
pub const COMPRESSION_NONE: u8 = 0;
pub const COMPRESSION_ZSTD: u8 = 1;

#[cfg(unix)]
pub(crate) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut done = 0;
    while done < buf.len() {
        let n = file.seek_read(&mut buf[done..], offset + done as u64)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
        }
        done += n;
    }
    Ok(())
}
