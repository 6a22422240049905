//! Atomic group of mutations.
//!
//! The batch keeps its encoded form so the write path can append it to the
//! WAL without re-serializing:
//!
//! ```text
//! +---------+----------+-----------+-----------+-----
//! | seq:u64 | count:u32| record 1  | record 2  | ...
//! +---------+----------+-----------+-----------+-----
//!
//! record = tag:u8 | cf:u32 | key_len:u32 | key | [val_len:u32 | value]
//! log    = tag:u8 | blob_len:u32 | blob
//! ```
//!
//! `count` is the number of sequence numbers the batch consumes; log data
//! records consume none.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::types::{SequenceNumber, ValueType};
use crate::Error;

pub const HEADER_SIZE: usize = 12;

/// Receiver for [`WriteBatch::iterate`].
pub trait WriteBatchHandler {
    fn put(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&mut self, cf: u32, key: &[u8]) -> Result<()>;

    fn single_delete(&mut self, cf: u32, key: &[u8]) -> Result<()> {
        self.delete(cf, key)
    }

    fn delete_range(&mut self, cf: u32, begin: &[u8], end: &[u8]) -> Result<()>;

    fn merge(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<()>;

    fn log_data(&mut self, _blob: &[u8]) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct WriteBatch {
    rep: Vec<u8>,
    save_points: Vec<SavePoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SavePoint {
    size: usize,
    count: u32,
}

impl std::fmt::Debug for WriteBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBatch")
            .field("count", &self.count())
            .field("data_size", &self.data_size())
            .finish()
    }
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            rep: vec![0u8; HEADER_SIZE],
            save_points: Vec::new(),
        }
    }

    /// Rebuilds a batch from its encoded form, e.g. a WAL record.
    pub fn from_data(data: Vec<u8>) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::Corruption("write batch too small".into()));
        }
        Ok(Self {
            rep: data,
            save_points: Vec::new(),
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.rep
    }

    pub fn data_size(&self) -> usize {
        self.rep.len()
    }

    pub fn count(&self) -> u32 {
        BigEndian::read_u32(&self.rep[8..12])
    }

    pub fn is_empty(&self) -> bool {
        self.rep.len() == HEADER_SIZE
    }

    pub fn sequence(&self) -> SequenceNumber {
        BigEndian::read_u64(&self.rep[0..8])
    }

    pub(crate) fn set_sequence(&mut self, seq: SequenceNumber) {
        BigEndian::write_u64(&mut self.rep[0..8], seq);
    }

    fn set_count(&mut self, count: u32) {
        BigEndian::write_u32(&mut self.rep[8..12], count);
    }

    pub fn clear(&mut self) {
        self.rep.truncate(HEADER_SIZE);
        self.rep.iter_mut().for_each(|b| *b = 0);
        self.save_points.clear();
    }

    fn push_record(&mut self, kind: ValueType, cf: u32, key: &[u8], value: Option<&[u8]>) {
        self.rep.push(kind as u8);
        self.rep.write_u32::<BigEndian>(cf).ok();
        self.rep.write_u32::<BigEndian>(key.len() as u32).ok();
        self.rep.extend_from_slice(key);
        if let Some(value) = value {
            self.rep.write_u32::<BigEndian>(value.len() as u32).ok();
            self.rep.extend_from_slice(value);
        }
        let count = self.count() + 1;
        self.set_count(count);
    }

    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.put_cf(0, key, value)
    }

    pub fn put_cf(&mut self, cf: u32, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.push_record(ValueType::Put, cf, key.as_ref(), Some(value.as_ref()));
    }

    pub fn delete(&mut self, key: impl AsRef<[u8]>) {
        self.delete_cf(0, key)
    }

    pub fn delete_cf(&mut self, cf: u32, key: impl AsRef<[u8]>) {
        self.push_record(ValueType::Delete, cf, key.as_ref(), None);
    }

    pub fn single_delete(&mut self, key: impl AsRef<[u8]>) {
        self.single_delete_cf(0, key)
    }

    pub fn single_delete_cf(&mut self, cf: u32, key: impl AsRef<[u8]>) {
        self.push_record(ValueType::SingleDelete, cf, key.as_ref(), None);
    }

    /// Deletes every key in `[begin, end)`.
    pub fn delete_range(&mut self, begin: impl AsRef<[u8]>, end: impl AsRef<[u8]>) {
        self.delete_range_cf(0, begin, end)
    }

    pub fn delete_range_cf(&mut self, cf: u32, begin: impl AsRef<[u8]>, end: impl AsRef<[u8]>) {
        self.push_record(
            ValueType::RangeDelete,
            cf,
            begin.as_ref(),
            Some(end.as_ref()),
        );
    }

    pub fn merge(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.merge_cf(0, key, value)
    }

    pub fn merge_cf(&mut self, cf: u32, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.push_record(ValueType::Merge, cf, key.as_ref(), Some(value.as_ref()));
    }

    /// Appends a blob that is written to the WAL but never applied.
    pub fn put_log_data(&mut self, blob: impl AsRef<[u8]>) {
        let blob = blob.as_ref();
        self.rep.push(ValueType::LogData as u8);
        self.rep.write_u32::<BigEndian>(blob.len() as u32).ok();
        self.rep.extend_from_slice(blob);
    }

    pub fn set_save_point(&mut self) {
        self.save_points.push(SavePoint {
            size: self.rep.len(),
            count: self.count(),
        });
    }

    /// Drops every record added since the most recent save point.
    pub fn rollback_to_save_point(&mut self) -> Result<()> {
        let point = self
            .save_points
            .pop()
            .ok_or_else(|| Error::NotFound("no save point".into()))?;
        self.rep.truncate(point.size);
        self.set_count(point.count);
        Ok(())
    }

    pub fn pop_save_point(&mut self) -> Result<()> {
        self.save_points
            .pop()
            .map(|_| ())
            .ok_or_else(|| Error::NotFound("no save point".into()))
    }

    /// Appends the records of `other`.
    pub fn append(&mut self, other: &WriteBatch) {
        self.rep.extend_from_slice(&other.rep[HEADER_SIZE..]);
        let count = self.count() + other.count();
        self.set_count(count);
    }

    pub fn iterate(&self, handler: &mut dyn WriteBatchHandler) -> Result<()> {
        let mut cursor = Cursor::new(&self.rep[HEADER_SIZE..]);
        let mut found = 0u32;
        let total = cursor.get_ref().len() as u64;

        while cursor.position() < total {
            let tag = cursor
                .read_u8()
                .map_err(|e| Error::Decode("batch tag", e))?;
            let kind = ValueType::from_u8(tag)?;
            if kind == ValueType::LogData {
                let blob = read_slice(&mut cursor, "log blob")?;
                handler.log_data(&blob)?;
                continue;
            }

            let cf = cursor
                .read_u32::<BigEndian>()
                .map_err(|e| Error::Decode("batch column family", e))?;
            let key = read_slice(&mut cursor, "batch key")?;
            found += 1;
            match kind {
                ValueType::Put => {
                    let value = read_slice(&mut cursor, "batch value")?;
                    handler.put(cf, &key, &value)?;
                }
                ValueType::Merge => {
                    let value = read_slice(&mut cursor, "batch value")?;
                    handler.merge(cf, &key, &value)?;
                }
                ValueType::RangeDelete => {
                    let end = read_slice(&mut cursor, "range end")?;
                    handler.delete_range(cf, &key, &end)?;
                }
                ValueType::Delete => handler.delete(cf, &key)?,
                ValueType::SingleDelete => handler.single_delete(cf, &key)?,
                ValueType::LogData => unreachable!("log data handled above"),
            }
        }

        if found != self.count() {
            return Err(Error::Corruption(format!(
                "write batch has wrong count: header says {}, found {}",
                self.count(),
                found
            )));
        }
        Ok(())
    }

    /// Column families touched by this batch.
    pub fn column_families(&self) -> Result<Vec<u32>> {
        struct Collector(Vec<u32>);

        impl Collector {
            fn note(&mut self, cf: u32) {
                if !self.0.contains(&cf) {
                    self.0.push(cf);
                }
            }
        }

        impl WriteBatchHandler for Collector {
            fn put(&mut self, cf: u32, _: &[u8], _: &[u8]) -> Result<()> {
                self.note(cf);
                Ok(())
            }
            fn delete(&mut self, cf: u32, _: &[u8]) -> Result<()> {
                self.note(cf);
                Ok(())
            }
            fn delete_range(&mut self, cf: u32, _: &[u8], _: &[u8]) -> Result<()> {
                self.note(cf);
                Ok(())
            }
            fn merge(&mut self, cf: u32, _: &[u8], _: &[u8]) -> Result<()> {
                self.note(cf);
                Ok(())
            }
        }

        let mut collector = Collector(Vec::new());
        self.iterate(&mut collector)?;
        Ok(collector.0)
    }
}

fn read_slice(cursor: &mut Cursor<&[u8]>, field: &'static str) -> Result<Vec<u8>> {
    let len = cursor
        .read_u32::<BigEndian>()
        .map_err(|e| Error::Decode(field, e))? as usize;
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if len as u64 > remaining {
        return Err(Error::Corruption(format!(
            "{} length {} exceeds batch",
            field, len
        )));
    }
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|e| Error::Decode(field, e))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        ops: Vec<String>,
    }

    impl WriteBatchHandler for Recorder {
        fn put(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<()> {
            self.ops.push(format!(
                "put({},{},{})",
                cf,
                String::from_utf8_lossy(key),
                String::from_utf8_lossy(value)
            ));
            Ok(())
        }
        fn delete(&mut self, cf: u32, key: &[u8]) -> Result<()> {
            self.ops
                .push(format!("delete({},{})", cf, String::from_utf8_lossy(key)));
            Ok(())
        }
        fn single_delete(&mut self, cf: u32, key: &[u8]) -> Result<()> {
            self.ops.push(format!(
                "single_delete({},{})",
                cf,
                String::from_utf8_lossy(key)
            ));
            Ok(())
        }
        fn delete_range(&mut self, cf: u32, begin: &[u8], end: &[u8]) -> Result<()> {
            self.ops.push(format!(
                "delete_range({},{},{})",
                cf,
                String::from_utf8_lossy(begin),
                String::from_utf8_lossy(end)
            ));
            Ok(())
        }
        fn merge(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<()> {
            self.ops.push(format!(
                "merge({},{},{})",
                cf,
                String::from_utf8_lossy(key),
                String::from_utf8_lossy(value)
            ));
            Ok(())
        }
        fn log_data(&mut self, blob: &[u8]) -> Result<()> {
            self.ops
                .push(format!("log({})", String::from_utf8_lossy(blob)));
            Ok(())
        }
    }

    #[test]
    fn test_iterate_preserves_order() -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put("a", "1");
        batch.delete_cf(2, "b");
        batch.put_log_data("marker");
        batch.merge("c", "x");
        batch.delete_range("d", "f");
        batch.single_delete("g");

        assert_eq!(batch.count(), 5);

        let mut recorder = Recorder::default();
        batch.iterate(&mut recorder)?;
        assert_eq!(
            recorder.ops,
            vec![
                "put(0,a,1)",
                "delete(2,b)",
                "log(marker)",
                "merge(0,c,x)",
                "delete_range(0,d,f)",
                "single_delete(0,g)",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_rollback_to_save_point() -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put("keep", "1");
        batch.set_save_point();
        batch.put("drop", "2");
        batch.delete("drop-too");
        assert_eq!(batch.count(), 3);

        batch.rollback_to_save_point()?;
        assert_eq!(batch.count(), 1);

        let mut recorder = Recorder::default();
        batch.iterate(&mut recorder)?;
        assert_eq!(recorder.ops, vec!["put(0,keep,1)"]);

        assert!(batch.rollback_to_save_point().is_err());
        Ok(())
    }

    #[test]
    fn test_truncated_data_is_corruption() {
        let mut batch = WriteBatch::new();
        batch.put("key", "value");
        let mut data = batch.data().to_vec();
        data.truncate(data.len() - 2);

        let damaged = WriteBatch::from_data(data).unwrap();
        let err = damaged.iterate(&mut Recorder::default()).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_append_and_column_families() -> Result<()> {
        let mut first = WriteBatch::new();
        first.put_cf(1, "a", "1");
        let mut second = WriteBatch::new();
        second.put_cf(3, "b", "2");
        second.delete_cf(1, "c");

        first.append(&second);
        assert_eq!(first.count(), 3);
        assert_eq!(first.column_families()?, vec![1, 3]);
        Ok(())
    }

    #[test]
    fn test_sequence_is_stored_in_header() {
        let mut batch = WriteBatch::new();
        batch.put("k", "v");
        batch.set_sequence(77);
        let copy = WriteBatch::from_data(batch.data().to_vec()).unwrap();
        assert_eq!(copy.sequence(), 77);
        assert_eq!(copy.count(), 1);
    }
}
