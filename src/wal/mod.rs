//! Write-ahead log.
//!
//! Every write batch is appended here before it touches a memtable, so a
//! crash loses nothing that was acknowledged with `sync`.
//!
//! # File Format
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|
//! +------------------+
//! | Record 1         |
//! +------------------+
//! | Record 2         |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! ## Record Format
//!
//! ```text
//! +-----------+-----------------+-----------+
//! |length:u32 | write batch     |crc32:u32  |
//! +-----------+-----------------+-----------+
//! ```
//!
//! - All multi-byte integers are big-endian
//! - The CRC covers the payload only
//! - A record is one whole write batch; batches are never split
//!
//! Log files are numbered from the same counter as table files. A log is
//! obsolete once every column family has flushed the memtables that were
//! fed from it.

pub mod header;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use header::{Header, HEADER_SIZE};

use crate::config::WalRecoveryMode;
use crate::error::Result;
use crate::Error;

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

pub static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound on a single record; anything larger is treated as garbage.
const MAX_RECORD_SIZE: usize = 1 << 30;

/// File plus the records not yet handed to the operating system.
struct Sink {
    file: File,
    pending: Vec<u8>,
    /// Bytes of the file known to hold whole records.
    written: u64,
    failed: bool,
}

impl Sink {
    fn write_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.file.write_all(&self.pending) {
            self.failed = true;
            return Err(e.into());
        }
        self.written += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }

    fn check(&self, number: u64) -> Result<()> {
        if self.failed {
            return Err(Error::Aborted(format!("log {} failed a previous write", number)));
        }
        Ok(())
    }
}

pub struct Wal {
    number: u64,
    sink: Mutex<Sink>,
    path: PathBuf,
    header: RwLock<Header>,
    size: AtomicU64,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("number", &self.number)
            .field("path", &self.path)
            .finish()
    }
}

impl Wal {
    /// Creates a new, empty log file.
    pub fn create(path: impl Into<PathBuf>, number: u64) -> Result<Self> {
        let path = path.into();
        let mut file = File::options()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let header = Header::new(number);
        file.write_all(&header.encode())?;
        file.sync_all()?;

        Ok(Self {
            number,
            sink: Mutex::new(Sink {
                file,
                pending: Vec::with_capacity(DEFAULT_BUFFER_SIZE),
                written: HEADER_SIZE as u64,
                failed: false,
            }),
            path,
            header: RwLock::new(header),
            size: AtomicU64::new(HEADER_SIZE as u64),
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes appended so far, including buffered ones.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn entry_count(&self) -> u64 {
        self.header.read().map(|h| h.entry_count).unwrap_or(0)
    }

    /// True once a write to the file failed. A failed log accepts no more
    /// records.
    pub fn is_failed(&self) -> bool {
        self.sink.lock().map_or(true, |s| s.failed)
    }

    /// Appends one record. The bytes may sit in the buffer until
    /// [`Wal::flush`] or [`Wal::sync`].
    pub fn append(&self, payload: &[u8]) -> Result<()> {
        let checksum = CRC32.checksum(payload);

        let mut sink = self.sink.lock()?;
        sink.check(self.number)?;
        sink.pending.write_u32::<BigEndian>(payload.len() as u32)?;
        sink.pending.extend_from_slice(payload);
        sink.pending.write_u32::<BigEndian>(checksum)?;
        self.size.fetch_add(payload.len() as u64 + 8, Ordering::AcqRel);
        self.header.write()?.entry_count += 1;

        if sink.pending.len() >= DEFAULT_BUFFER_SIZE {
            sink.write_pending()?;
        }
        Ok(())
    }

    /// Hands buffered records to the operating system.
    pub fn flush(&self) -> Result<()> {
        let mut sink = self.sink.lock()?;
        sink.check(self.number)?;
        sink.write_pending()
    }

    /// Flushes and makes the log durable.
    pub fn sync(&self) -> Result<()> {
        let mut sink = self.sink.lock()?;
        sink.check(self.number)?;
        sink.write_pending()?;
        if let Err(e) = sink.file.sync_data() {
            sink.failed = true;
            return Err(e.into());
        }
        Ok(())
    }

    /// Drops everything appended at or after the logical offset `mark`,
    /// both buffered and on disk, and marks the log failed. Used when a
    /// write group could not be logged completely.
    pub fn abandon(&self, mark: u64) -> Result<()> {
        let mut sink = self.sink.lock()?;
        sink.failed = true;
        if mark >= sink.written {
            let keep = ((mark - sink.written) as usize).min(sink.pending.len());
            sink.pending.truncate(keep);
        } else {
            sink.pending.clear();
            sink.written = mark;
        }
        self.size.store(mark, Ordering::Release);

        // The failed write may have left part of a record behind.
        let written = sink.written;
        sink.file.set_len(written)?;
        sink.file.seek(SeekFrom::Start(written))?;
        let kept = std::mem::take(&mut sink.pending);
        sink.file.write_all(&kept)?;
        sink.written += kept.len() as u64;
        sink.file.sync_data()?;
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Ok(sink) = self.sink.get_mut() {
            if !sink.failed {
                if let Err(e) = sink.write_pending() {
                    tracing::warn!(log_number = self.number, error = %e, "Failed to flush WAL on close");
                }
            }
        }
    }
}

/// Sequential reader over the records of one log file.
pub struct WalReader {
    reader: BufReader<File>,
    number: u64,
    mode: WalRecoveryMode,
    offset: u64,
    file_len: u64,
    stopped: bool,
}

impl WalReader {
    pub fn open(path: &Path, mode: WalRecoveryMode) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut buf = [0u8; HEADER_SIZE];
        if let Err(e) = reader.read_exact(&mut buf) {
            if e.kind() == ErrorKind::UnexpectedEof && mode != WalRecoveryMode::AbsoluteConsistency
            {
                // Crashed before the header reached disk: an empty log.
                return Ok(Self {
                    reader,
                    number: 0,
                    mode,
                    offset: file_len,
                    file_len,
                    stopped: true,
                });
            }
            return Err(Error::Decode("WAL header", e));
        }
        let header = Header::decode(&buf)?;

        Ok(Self {
            reader,
            number: header.log_number,
            mode,
            offset: HEADER_SIZE as u64,
            file_len,
            stopped: false,
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// Offset just past the last record returned.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// True when replay stopped before the physical end of the file.
    pub fn stopped_early(&self) -> bool {
        self.stopped && self.offset < self.file_len
    }

    /// Returns the next intact record, `None` at the end of the usable log.
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if self.stopped {
                return Ok(None);
            }

            let mut len_buf = [0u8; 4];
            match read_full(&mut self.reader, &mut len_buf)? {
                0 => return Ok(None),
                4 => {}
                _ => return self.torn_tail("record length"),
            }
            let len = BigEndian::read_u32(&len_buf) as usize;
            let remaining = self.file_len.saturating_sub(self.offset + 4);
            if len > MAX_RECORD_SIZE || (len as u64 + 4) > remaining {
                return self.torn_tail("record payload");
            }

            let mut payload = vec![0u8; len];
            if read_full(&mut self.reader, &mut payload)? != len {
                return self.torn_tail("record payload");
            }
            let mut crc_buf = [0u8; 4];
            if read_full(&mut self.reader, &mut crc_buf)? != 4 {
                return self.torn_tail("record checksum");
            }
            self.offset += len as u64 + 8;

            let stored = BigEndian::read_u32(&crc_buf);
            let actual = CRC32.checksum(&payload);
            if stored == actual {
                return Ok(Some(payload));
            }

            match self.mode {
                WalRecoveryMode::SkipAnyCorruptedRecords => {
                    tracing::warn!(
                        log_number = self.number,
                        offset = self.offset,
                        "Skipping corrupted WAL record"
                    );
                    continue;
                }
                WalRecoveryMode::PointInTime => {
                    tracing::warn!(
                        log_number = self.number,
                        offset = self.offset,
                        "Stopping WAL replay at corrupted record"
                    );
                    self.stopped = true;
                    return Ok(None);
                }
                WalRecoveryMode::TolerateCorruptedTailRecords
                    if self.offset >= self.file_len =>
                {
                    self.stopped = true;
                    return Ok(None);
                }
                _ => {
                    return Err(Error::ChecksumMismatch {
                        context: "WAL record",
                        expected: stored,
                        actual,
                    })
                }
            }
        }
    }

    fn torn_tail(&mut self, what: &str) -> Result<Option<Vec<u8>>> {
        self.stopped = true;
        if self.mode == WalRecoveryMode::AbsoluteConsistency {
            return Err(Error::Corruption(format!(
                "truncated {} in log {}",
                what, self.number
            )));
        }
        tracing::debug!(
            log_number = self.number,
            offset = self.offset,
            "Ignoring torn WAL tail"
        );
        Ok(None)
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;
    use std::fs::OpenOptions;

    fn collect(path: &Path, mode: WalRecoveryMode) -> Result<Vec<Vec<u8>>> {
        let mut reader = WalReader::open(path, mode)?;
        let mut records = Vec::new();
        while let Some(record) = reader.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    fn write_records(path: &Path, records: &[&[u8]]) -> Result<()> {
        let wal = Wal::create(path, 1)?;
        for record in records {
            wal.append(record)?;
        }
        wal.sync()
    }

    #[test]
    fn test_append_and_replay() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("000001.log");
        let wal = Wal::create(&path, 1)?;
        wal.append(b"first")?;
        wal.append(b"second")?;
        wal.sync()?;
        assert_eq!(wal.entry_count(), 2);
        assert_eq!(wal.size(), std::fs::metadata(&path)?.len());

        let records = collect(&path, WalRecoveryMode::PointInTime)?;
        assert_eq!(records, vec![b"first".to_vec(), b"second".to_vec()]);
        Ok(())
    }

    #[test]
    fn test_records_after_sync_are_kept() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("000003.log");
        let wal = Wal::create(&path, 3)?;
        wal.append(b"one")?;
        wal.sync()?;
        wal.append(b"two")?;
        wal.sync()?;
        wal.append(b"three")?;
        wal.flush()?;

        // read while the writer is still open
        let records = collect(&path, WalRecoveryMode::AbsoluteConsistency)?;
        assert_eq!(records, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
        assert_eq!(wal.size(), std::fs::metadata(&path)?.len());
        Ok(())
    }

    #[test]
    fn test_abandon_discards_unlogged_group() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("000004.log");
        let wal = Wal::create(&path, 4)?;
        wal.append(b"kept")?;
        wal.sync()?;

        let mark = wal.size();
        wal.append(b"lost-1")?;
        wal.flush()?;
        wal.append(b"lost-2")?;
        wal.abandon(mark)?;

        assert!(wal.is_failed());
        assert_eq!(wal.size(), mark);
        assert!(wal.append(b"more").is_err());
        assert!(wal.sync().is_err());
        drop(wal);

        let records = collect(&path, WalRecoveryMode::AbsoluteConsistency)?;
        assert_eq!(records, vec![b"kept".to_vec()]);
        Ok(())
    }

    #[test]
    fn test_empty_replay() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("000002.log");
        let wal = Wal::create(&path, 2)?;
        wal.sync()?;

        let reader = WalReader::open(&path, WalRecoveryMode::PointInTime)?;
        assert_eq!(reader.number(), 2);
        assert!(collect(&path, WalRecoveryMode::PointInTime)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_tolerated_except_in_absolute_mode() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("000001.log");
        write_records(&path, &[b"one", b"two"])?;

        let len = std::fs::metadata(&path)?.len();
        OpenOptions::new().write(true).open(&path)?.set_len(len - 3)?;

        let records = collect(&path, WalRecoveryMode::PointInTime)?;
        assert_eq!(records, vec![b"one".to_vec()]);
        assert!(collect(&path, WalRecoveryMode::AbsoluteConsistency).is_err());
        Ok(())
    }

    #[test]
    fn test_corrupted_record_by_mode() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("000001.log");
        write_records(&path, &[b"aaaa", b"bbbb", b"cccc"])?;

        // flip a payload byte of the second record
        let mut file = OpenOptions::new().write(true).open(&path)?;
        let second_payload = HEADER_SIZE as u64 + (4 + 4 + 4) + 4;
        file.seek(SeekFrom::Start(second_payload))?;
        file.write_all(b"X")?;
        file.sync_all()?;

        assert_eq!(
            collect(&path, WalRecoveryMode::PointInTime)?,
            vec![b"aaaa".to_vec()]
        );
        assert_eq!(
            collect(&path, WalRecoveryMode::SkipAnyCorruptedRecords)?,
            vec![b"aaaa".to_vec(), b"cccc".to_vec()]
        );
        let err = collect(&path, WalRecoveryMode::AbsoluteConsistency).unwrap_err();
        assert!(err.is_corruption());
        Ok(())
    }
}
