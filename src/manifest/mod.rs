//! Manifest log for column family and table file metadata.
//!
//! The manifest is to the table set what the WAL is to user data: every
//! flush, compaction, ingestion and column family change is appended as one
//! atomic group of [`VersionEdit`]s, and replaying the groups rebuilds the
//! live version of every column family.
//!
//! # File Format
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|
//! +------------------+
//! | Edit group 1     |
//! +------------------+
//! | Edit group 2     |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! ## Record Format
//!
//! ```text
//! +-----------+------------------------------+-----------+
//! |length:u32 | count:u32, edit, edit, ...   |crc32:u32  |
//! +-----------+------------------------------+-----------+
//! ```
//!
//! A group is synced before the in-memory version changes. A torn final
//! record is a crash during append and is ignored on replay; a checksum
//! mismatch anywhere else is corruption.
//!
//! `CURRENT` names the manifest in use. Rewriting the manifest writes a new
//! `MANIFEST-NNNNNN` holding one snapshot group and then swaps `CURRENT`.

pub mod edit;
pub mod header;
pub mod meta;

pub use edit::VersionEdit;
pub use meta::FileMetaData;

use crate::error::Result;
use crate::wal::CRC32;
use crate::Error;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use header::{ManifestHeader, HEADER_SIZE};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

const MAX_RECORD_SIZE: usize = 1 << 30;

pub struct ManifestWriter {
    file: File,
    path: PathBuf,
    number: u64,
    size: u64,
}

impl ManifestWriter {
    pub fn create(path: impl Into<PathBuf>, number: u64) -> Result<Self> {
        let path = path.into();
        let mut file = File::options()
            .create_new(true)
            .write(true)
            .open(&path)?;
        file.write_all(&ManifestHeader::new(number).encode())?;
        file.sync_all()?;

        Ok(Self {
            file,
            path,
            number,
            size: HEADER_SIZE as u64,
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes durably written so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends one edit group and syncs it.
    pub fn append(&mut self, edits: &[VersionEdit]) -> Result<()> {
        let payload = edit::encode_group(edits)?;
        let mut record = Vec::with_capacity(payload.len() + 8);
        record.write_u32::<BigEndian>(payload.len() as u32)?;
        record.extend_from_slice(&payload);
        record.write_u32::<BigEndian>(CRC32.checksum(&payload))?;

        self.file.write_all(&record)?;
        self.file.sync_data()?;
        self.size += record.len() as u64;
        Ok(())
    }
}

pub struct ManifestReader {
    reader: BufReader<File>,
    number: u64,
    offset: u64,
    file_len: u64,
    done: bool,
}

impl ManifestReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut buf = [0u8; HEADER_SIZE];
        reader
            .read_exact(&mut buf)
            .map_err(|e| Error::Decode("manifest header", e))?;
        let header = ManifestHeader::decode(&buf)?;

        Ok(Self {
            reader,
            number: header.manifest_number,
            offset: HEADER_SIZE as u64,
            file_len,
            done: false,
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// Returns the next complete edit group.
    pub fn next_group(&mut self) -> Result<Option<Vec<VersionEdit>>> {
        if self.done || self.offset >= self.file_len {
            return Ok(None);
        }

        let mut len_buf = [0u8; 4];
        if !self.read_or_torn(&mut len_buf)? {
            return Ok(None);
        }
        let len = BigEndian::read_u32(&len_buf) as usize;
        if len > MAX_RECORD_SIZE || self.offset + 8 + len as u64 > self.file_len {
            return self.torn_tail();
        }

        let mut payload = vec![0u8; len];
        let mut crc_buf = [0u8; 4];
        if !self.read_or_torn(&mut payload)? || !self.read_or_torn(&mut crc_buf)? {
            return Ok(None);
        }

        let expected = BigEndian::read_u32(&crc_buf);
        let actual = CRC32.checksum(&payload);
        if expected != actual {
            return Err(Error::ChecksumMismatch {
                context: "manifest record",
                expected,
                actual,
            });
        }
        self.offset += len as u64 + 8;
        edit::decode_group(&payload).map(Some)
    }

    fn read_or_torn(&mut self, buf: &mut [u8]) -> Result<bool> {
        match self.reader.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.torn_tail()?;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn torn_tail(&mut self) -> Result<Option<Vec<VersionEdit>>> {
        tracing::warn!(
            manifest_number = self.number,
            offset = self.offset,
            "Ignoring torn manifest tail"
        );
        self.done = true;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;
    use std::fs::OpenOptions;

    fn read_all(path: &Path) -> Result<Vec<Vec<VersionEdit>>> {
        let mut reader = ManifestReader::open(path)?;
        let mut groups = Vec::new();
        while let Some(group) = reader.next_group()? {
            groups.push(group);
        }
        Ok(groups)
    }

    #[test]
    fn test_groups_replay_in_order() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.child("MANIFEST-000001");
        let mut writer = ManifestWriter::create(&path, 1)?;
        writer.append(&[VersionEdit::NextFileNumber(2), VersionEdit::LastSequence(0)])?;
        writer.append(&[VersionEdit::LogNumber { cf: 0, number: 5 }])?;
        assert_eq!(writer.size(), std::fs::metadata(&path)?.len());

        let groups = read_all(&path)?;
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1], vec![VersionEdit::LogNumber { cf: 0, number: 5 }]);
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_ignored() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.child("MANIFEST-000001");
        let mut writer = ManifestWriter::create(&path, 1)?;
        writer.append(&[VersionEdit::NextFileNumber(2)])?;
        writer.append(&[VersionEdit::NextFileNumber(3)])?;
        let len = std::fs::metadata(&path)?.len();
        OpenOptions::new().write(true).open(&path)?.set_len(len - 2)?;

        assert_eq!(read_all(&path)?, vec![vec![VersionEdit::NextFileNumber(2)]]);
        Ok(())
    }

    #[test]
    fn test_flipped_byte_is_reported() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.child("MANIFEST-000001");
        let mut writer = ManifestWriter::create(&path, 1)?;
        writer.append(&[VersionEdit::LastSequence(99)])?;
        writer.append(&[VersionEdit::LastSequence(100)])?;

        let mut bytes = std::fs::read(&path)?;
        bytes[HEADER_SIZE + 6] ^= 0xff;
        std::fs::write(&path, &bytes)?;
        assert!(read_all(&path).unwrap_err().is_corruption());
        Ok(())
    }
}
