//! Operation tracing.
//!
//! A trace is a stream of records:
//!
//! ```text
//! +-------------+---------+-------------+-----------+
//! | ts_micros:8 | type:1  | length:4    | payload   |
//! +-------------+---------+-------------+-----------+
//! ```
//!
//! The first record is `Begin` carrying the magic and format version, the
//! last one `End`. Payloads by type:
//!
//! - Write: the encoded write batch
//! - Get, IteratorSeek, IteratorSeekForPrev: `cf:4 | key`
//! - MultiGet: `count:4` then `cf:4 | key_len:4 | key` per key

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::batch::WriteBatch;
use crate::error::Result;
use crate::Error;

const TRACE_MAGIC: &[u8] = b"cinderdb-trace";
const TRACE_VERSION: u32 = 1;
const RECORD_HEADER_SIZE: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TraceType {
    Begin = 0,
    End = 1,
    Write = 2,
    Get = 3,
    MultiGet = 4,
    IteratorSeek = 5,
    IteratorSeekForPrev = 6,
}

impl TraceType {
    fn from_u8(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => TraceType::Begin,
            1 => TraceType::End,
            2 => TraceType::Write,
            3 => TraceType::Get,
            4 => TraceType::MultiGet,
            5 => TraceType::IteratorSeek,
            6 => TraceType::IteratorSeekForPrev,
            other => return Err(Error::Corruption(format!("unknown trace record type {}", other))),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TraceOptions {
    /// Tracing stops silently once the trace reaches this size (default: 64GB)
    pub max_trace_file_size: u64,
    /// Record one of every N operations (default: 1)
    pub sampling_frequency: u64,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            max_trace_file_size: 64 * 1024 * 1024 * 1024, // 64GB
            sampling_frequency: 1,
        }
    }
}

impl TraceOptions {
    pub fn max_trace_file_size(mut self, bytes: u64) -> Self {
        self.max_trace_file_size = bytes;
        self
    }

    pub fn sampling_frequency(mut self, frequency: u64) -> Self {
        self.sampling_frequency = frequency.max(1);
        self
    }
}

/// Destination of trace records.
pub trait TraceWriter: Send {
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Bytes written so far.
    fn file_size(&self) -> u64;

    fn close(&mut self) -> Result<()>;
}

pub struct FileTraceWriter {
    writer: BufWriter<File>,
    size: u64,
}

impl FileTraceWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            size: 0,
        })
    }
}

impl TraceWriter for FileTraceWriter {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.size += data.len() as u64;
        Ok(())
    }

    fn file_size(&self) -> u64 {
        self.size
    }

    fn close(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub timestamp_micros: u64,
    pub kind: TraceType,
    pub payload: Vec<u8>,
}

impl TraceRecord {
    /// Column family and key of a Get or iterator seek record.
    pub fn key(&self) -> Result<(u32, &[u8])> {
        if self.payload.len() < 4 {
            return Err(Error::Corruption("trace payload too short".into()));
        }
        let cf = Cursor::new(&self.payload[..4]).read_u32::<BigEndian>()?;
        Ok((cf, &self.payload[4..]))
    }

    /// Column families and keys of a MultiGet record.
    pub fn keys(&self) -> Result<Vec<(u32, Vec<u8>)>> {
        let mut cursor = Cursor::new(self.payload.as_slice());
        let count = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("trace key count", e))?;
        let mut keys = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let cf = cursor.read_u32::<BigEndian>()?;
            let len = cursor.read_u32::<BigEndian>()? as usize;
            let mut key = vec![0u8; len];
            cursor.read_exact(&mut key)?;
            keys.push((cf, key));
        }
        Ok(keys)
    }

    pub fn batch(&self) -> Result<WriteBatch> {
        WriteBatch::from_data(self.payload.clone())
    }
}

pub struct TraceReader {
    reader: BufReader<File>,
}

impl TraceReader {
    /// Opens a trace and checks its `Begin` record.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut reader = Self {
            reader: BufReader::new(File::open(path)?),
        };
        let header = reader
            .next_record()?
            .ok_or_else(|| Error::Corruption("empty trace".into()))?;
        if header.kind != TraceType::Begin || !header.payload.starts_with(TRACE_MAGIC) {
            return Err(Error::Corruption("trace does not start with a header".into()));
        }
        Ok(reader)
    }

    /// Next record, or `None` at the end of the stream.
    pub fn next_record(&mut self) -> Result<Option<TraceRecord>> {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        match self.reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let mut cursor = Cursor::new(&header[..]);
        let timestamp_micros = cursor.read_u64::<BigEndian>()?;
        let kind = TraceType::from_u8(cursor.read_u8()?)?;
        let len = cursor.read_u32::<BigEndian>()? as usize;
        let mut payload = vec![0u8; len];
        self.reader
            .read_exact(&mut payload)
            .map_err(|e| Error::Decode("trace payload", e))?;
        Ok(Some(TraceRecord {
            timestamp_micros,
            kind,
            payload,
        }))
    }
}

/// Active trace session of a database.
pub struct Tracer {
    options: TraceOptions,
    writer: Box<dyn TraceWriter>,
    operations: u64,
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

impl Tracer {
    pub fn start(options: TraceOptions, writer: Box<dyn TraceWriter>) -> Result<Self> {
        let mut tracer = Self {
            options,
            writer,
            operations: 0,
        };
        let mut header = TRACE_MAGIC.to_vec();
        header.write_u32::<BigEndian>(TRACE_VERSION)?;
        tracer.emit(TraceType::Begin, &header)?;
        Ok(tracer)
    }

    fn emit(&mut self, kind: TraceType, payload: &[u8]) -> Result<()> {
        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        record.write_u64::<BigEndian>(now_micros())?;
        record.write_u8(kind as u8)?;
        record.write_u32::<BigEndian>(payload.len() as u32)?;
        record.extend_from_slice(payload);
        self.writer.write(&record)
    }

    fn record(&mut self, kind: TraceType, payload: &[u8]) -> Result<()> {
        self.operations += 1;
        if (self.operations - 1) % self.options.sampling_frequency != 0 {
            return Ok(());
        }
        if self.writer.file_size() >= self.options.max_trace_file_size {
            return Ok(());
        }
        self.emit(kind, payload)
    }

    fn key_payload(cf: u32, key: &[u8]) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(4 + key.len());
        payload.write_u32::<BigEndian>(cf)?;
        payload.extend_from_slice(key);
        Ok(payload)
    }

    pub fn write(&mut self, batch: &WriteBatch) -> Result<()> {
        self.record(TraceType::Write, batch.data())
    }

    pub fn get(&mut self, cf: u32, key: &[u8]) -> Result<()> {
        let payload = Self::key_payload(cf, key)?;
        self.record(TraceType::Get, &payload)
    }

    pub fn multi_get(&mut self, keys: &[(u32, &[u8])]) -> Result<()> {
        let mut payload = Vec::new();
        payload.write_u32::<BigEndian>(keys.len() as u32)?;
        for (cf, key) in keys {
            payload.write_u32::<BigEndian>(*cf)?;
            payload.write_u32::<BigEndian>(key.len() as u32)?;
            payload.extend_from_slice(key);
        }
        self.record(TraceType::MultiGet, &payload)
    }

    pub fn iterator_seek(&mut self, cf: u32, key: &[u8]) -> Result<()> {
        let payload = Self::key_payload(cf, key)?;
        self.record(TraceType::IteratorSeek, &payload)
    }

    pub fn iterator_seek_for_prev(&mut self, cf: u32, key: &[u8]) -> Result<()> {
        let payload = Self::key_payload(cf, key)?;
        self.record(TraceType::IteratorSeekForPrev, &payload)
    }

    /// Writes the `End` record and closes the writer.
    pub fn finish(mut self) -> Result<()> {
        self.emit(TraceType::End, &[])?;
        self.writer.close()
    }
}
