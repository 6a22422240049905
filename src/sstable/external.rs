//! Building and inspecting table files outside a running database.
//!
//! Files written by [`SstFileWriter`] carry sequence number zero on every
//! key; ingestion assigns them one global sequence number.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::builder::{TableBuilder, TableOptions};
use super::properties::TableProperties;
use super::table::{BlockReadOptions, Table, TableReaderOptions};
use crate::comparator::ComparatorRef;
use crate::config::ColumnFamilyOptions;
use crate::error::Result;
use crate::iterator::InternalIterator;
use crate::types::{InternalKey, RangeTombstone, ValueType};
use crate::Error;

/// Describes a finished external file.
#[derive(Debug, Clone)]
pub struct ExternalFileInfo {
    pub path: PathBuf,
    pub smallest_key: Vec<u8>,
    pub largest_key: Vec<u8>,
    pub num_entries: u64,
    pub num_range_deletions: u64,
    pub file_size: u64,
}

pub struct SstFileWriter {
    builder: Option<TableBuilder>,
    comparator: ComparatorRef,
    path: PathBuf,
    last_key: Option<Vec<u8>>,
}

impl SstFileWriter {
    pub fn create(options: &ColumnFamilyOptions, path: impl AsRef<Path>) -> Result<Self> {
        let mut table_options = TableOptions::from_cf_options(options, 0);
        table_options.external_file = true;
        let path = path.as_ref().to_path_buf();
        Ok(Self {
            builder: Some(TableBuilder::create(&path, table_options)?),
            comparator: options.comparator.clone(),
            path,
            last_key: None,
        })
    }

    fn add(&mut self, key: &[u8], kind: ValueType, value: &[u8]) -> Result<()> {
        if let Some(last) = &self.last_key {
            if self.comparator.compare(last, key).is_ge() {
                return Err(Error::InvalidArgument(format!(
                    "keys must be added in strictly increasing order to {}",
                    self.path.display()
                )));
            }
        }
        let builder = self
            .builder
            .as_mut()
            .ok_or_else(|| Error::InvalidArgument("writer already finished".into()))?;
        builder.add(&InternalKey::new(key.to_vec(), 0, kind).encode(), value)?;
        self.last_key = Some(key.to_vec());
        Ok(())
    }

    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.add(key.as_ref(), ValueType::Put, value.as_ref())
    }

    pub fn merge(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.add(key.as_ref(), ValueType::Merge, value.as_ref())
    }

    pub fn delete(&mut self, key: impl AsRef<[u8]>) -> Result<()> {
        self.add(key.as_ref(), ValueType::Delete, &[])
    }

    /// Range deletions may be added in any order relative to point keys.
    pub fn delete_range(&mut self, begin: impl AsRef<[u8]>, end: impl AsRef<[u8]>) -> Result<()> {
        let builder = self
            .builder
            .as_mut()
            .ok_or_else(|| Error::InvalidArgument("writer already finished".into()))?;
        builder.add_range_tombstone(RangeTombstone {
            begin: begin.as_ref().to_vec(),
            end: end.as_ref().to_vec(),
            seq: 0,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.builder.as_ref().map_or(0, |b| b.file_size())
    }

    pub fn finish(&mut self) -> Result<ExternalFileInfo> {
        let builder = self
            .builder
            .take()
            .ok_or_else(|| Error::InvalidArgument("writer already finished".into()))?;
        if builder.num_entries() == 0 {
            builder.abandon()?;
            return Err(Error::InvalidArgument(
                "cannot create a table file with no entries".into(),
            ));
        }
        let summary = builder.finish()?;
        Ok(ExternalFileInfo {
            path: self.path.clone(),
            smallest_key: summary.smallest.user_key,
            largest_key: summary.largest.user_key,
            num_entries: summary.properties.num_entries,
            num_range_deletions: summary.properties.num_range_deletions,
            file_size: summary.file_size,
        })
    }
}

impl Drop for SstFileWriter {
    fn drop(&mut self) {
        if let Some(builder) = self.builder.take() {
            let _ = builder.abandon();
        }
    }
}

/// Read-only view of a single table file.
pub struct SstFileReader {
    table: Arc<Table>,
}

impl SstFileReader {
    pub fn open(options: &ColumnFamilyOptions, path: impl AsRef<Path>) -> Result<Self> {
        let table = Table::open(
            path,
            0,
            TableReaderOptions {
                comparator: options.comparator.clone(),
                block_cache: None,
                cache_index_and_filter_blocks: false,
                global_seqno: None,
                verify_checksums: true,
            },
        )?;
        Ok(Self {
            table: Arc::new(table),
        })
    }

    pub fn properties(&self) -> &TableProperties {
        self.table.properties()
    }

    pub fn verify_checksum(&self) -> Result<()> {
        self.table.verify_checksum()
    }

    pub fn range_tombstones(&self) -> &[RangeTombstone] {
        self.table.range_tombstones()
    }

    pub fn file_size(&self) -> u64 {
        self.table.file_size()
    }

    /// Smallest and largest user key, counting range tombstone extents.
    /// `None` for a file with no entries.
    pub fn key_range(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let cmp = self.table.comparator().clone();
        let mut range: Option<(Vec<u8>, Vec<u8>)> = None;
        let mut widen = |lo: &[u8], hi: &[u8]| {
            if let Some((smallest, largest)) = range.as_mut() {
                if cmp.compare(lo, smallest).is_lt() {
                    *smallest = lo.to_vec();
                }
                if cmp.compare(hi, largest).is_gt() {
                    *largest = hi.to_vec();
                }
                return;
            }
            range = Some((lo.to_vec(), hi.to_vec()));
        };

        let mut iter = self.table.iter(BlockReadOptions {
            verify_checksums: true,
            fill_cache: false,
            ..BlockReadOptions::default()
        });
        iter.seek_to_first();
        if iter.valid() {
            let first = crate::types::user_key(iter.key()).to_vec();
            iter.seek_to_last();
            if iter.valid() {
                let last = crate::types::user_key(iter.key()).to_vec();
                widen(&first, &last);
            }
        }
        iter.status()?;
        for t in self.table.range_tombstones() {
            widen(&t.begin, &t.end);
        }
        Ok(range)
    }

    /// Every point entry in file order.
    pub fn entries(&self) -> Result<Vec<(InternalKey, Vec<u8>)>> {
        let mut iter = self.table.iter(BlockReadOptions {
            verify_checksums: true,
            fill_cache: false,
            ..BlockReadOptions::default()
        });
        let mut out = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            out.push((InternalKey::decode(iter.key())?, iter.value().to_vec()));
            iter.next();
        }
        iter.status()?;
        Ok(out)
    }
}
