//! Streams sorted internal keys into a new table file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use super::block::BlockBuilder;
use super::bloom::FilterBuilder;
use super::footer::{BlockHandle, Footer};
use super::properties::TableProperties;
use super::{BLOCK_TRAILER_SIZE, COMPRESSION_NONE, COMPRESSION_ZSTD};
use crate::comparator::ComparatorRef;
use crate::config::{ColumnFamilyOptions, CompressionType};
use crate::error::Result;
use crate::hasher::Hasher;
use crate::types::{
    compare_internal, compare_keys, InternalKey, ParsedKey, RangeTombstone, SequenceNumber,
    ValueType, MAX_SEQUENCE_NUMBER,
};
use crate::wal::CRC32;
use crate::Error;

const ZSTD_LEVEL: i32 = 3;

/// Layout knobs for a table, taken from the column family options.
#[derive(Clone)]
pub struct TableOptions {
    pub comparator: ComparatorRef,
    pub block_size: usize,
    pub restart_interval: usize,
    pub bloom_bits_per_key: usize,
    pub compression: CompressionType,
    pub column_family_id: u32,
    pub external_file: bool,
}

impl TableOptions {
    pub fn from_cf_options(options: &ColumnFamilyOptions, column_family_id: u32) -> Self {
        Self {
            comparator: options.comparator.clone(),
            block_size: options.block_size,
            restart_interval: options.block_restart_interval,
            bloom_bits_per_key: options.bloom_bits_per_key,
            compression: options.compression,
            column_family_id,
            external_file: false,
        }
    }
}

/// What a finished table covers; becomes the file's manifest entry.
#[derive(Debug, Clone)]
pub struct TableSummary {
    pub file_size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    pub properties: TableProperties,
}

pub struct TableBuilder {
    options: TableOptions,
    path: PathBuf,
    writer: BufWriter<File>,
    hasher: Hasher,
    offset: u64,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    pending_first_key: Option<Vec<u8>>,
    filter: FilterBuilder,
    tombstones: Vec<RangeTombstone>,
    props: TableProperties,
    smallest: Option<InternalKey>,
    largest: Option<InternalKey>,
    last_key: Vec<u8>,
}

impl TableBuilder {
    pub fn create(path: impl AsRef<Path>, options: TableOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::options().write(true).create_new(true).open(&path)?;
        let props = TableProperties {
            smallest_seq: MAX_SEQUENCE_NUMBER,
            column_family_id: options.column_family_id,
            comparator_name: options.comparator.name().to_string(),
            compression_name: match options.compression {
                CompressionType::None => "none".into(),
                CompressionType::Zstd => "zstd".into(),
            },
            external_file: options.external_file,
            ..Default::default()
        };
        Ok(Self {
            data_block: BlockBuilder::new(options.restart_interval),
            index_block: BlockBuilder::new(1),
            options,
            path,
            writer: BufWriter::new(file),
            hasher: Hasher::new(),
            offset: 0,
            pending_first_key: None,
            filter: FilterBuilder::new(),
            tombstones: Vec::new(),
            props,
            smallest: None,
            largest: None,
            last_key: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_entries(&self) -> u64 {
        self.props.num_entries + self.props.num_range_deletions
    }

    /// Bytes written so far plus the pending data block.
    pub fn file_size(&self) -> u64 {
        self.offset + self.data_block.estimated_size() as u64
    }

    fn note_seq(&mut self, seq: SequenceNumber) {
        self.props.smallest_seq = self.props.smallest_seq.min(seq);
        self.props.largest_seq = self.props.largest_seq.max(seq);
    }

    fn widen_range(&mut self, lower: InternalKey, upper: InternalKey) {
        let cmp = self.options.comparator.clone();
        match &self.smallest {
            Some(s) if compare_keys(cmp.as_ref(), s, &lower).is_le() => {}
            _ => self.smallest = Some(lower),
        }
        match &self.largest {
            Some(l) if compare_keys(cmp.as_ref(), l, &upper).is_ge() => {}
            _ => self.largest = Some(upper),
        }
    }

    /// Appends one entry. Keys must arrive in strictly increasing internal
    /// key order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let parsed = ParsedKey::parse(key)?;
        let kind = parsed.kind()?;
        if kind == ValueType::RangeDelete {
            return self.add_range_tombstone(RangeTombstone {
                begin: parsed.user_key.to_vec(),
                end: value.to_vec(),
                seq: parsed.seq(),
            });
        }
        if self.props.num_entries > 0
            && compare_internal(self.options.comparator.as_ref(), &self.last_key, key).is_ge()
        {
            return Err(Error::InvalidArgument(format!(
                "keys added out of order to {}",
                self.path.display()
            )));
        }

        if self.pending_first_key.is_none() {
            self.pending_first_key = Some(key.to_vec());
        }
        self.data_block.add(key, value);
        if self.options.bloom_bits_per_key > 0 {
            self.filter.add(parsed.user_key);
        }

        match kind {
            ValueType::Put => self.props.num_puts += 1,
            ValueType::Delete | ValueType::SingleDelete => self.props.num_deletions += 1,
            ValueType::Merge => self.props.num_merges += 1,
            ValueType::LogData | ValueType::RangeDelete => {}
        }
        self.props.num_entries += 1;
        self.props.raw_key_size += key.len() as u64;
        self.props.raw_value_size += value.len() as u64;
        self.note_seq(parsed.seq());

        let ikey = InternalKey::decode(key)?;
        self.widen_range(ikey.clone(), ikey);
        self.last_key.clear();
        self.last_key.extend_from_slice(key);

        if self.data_block.estimated_size() >= self.options.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    pub fn add_range_tombstone(&mut self, tombstone: RangeTombstone) -> Result<()> {
        let cmp = self.options.comparator.clone();
        if cmp.compare(&tombstone.begin, &tombstone.end).is_ge() {
            return Ok(());
        }
        self.note_seq(tombstone.seq);
        self.props.num_range_deletions += 1;
        self.widen_range(
            InternalKey::new(tombstone.begin.clone(), tombstone.seq, ValueType::RangeDelete),
            InternalKey::new(tombstone.end.clone(), MAX_SEQUENCE_NUMBER, ValueType::RangeDelete),
        );
        self.tombstones.push(tombstone);
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.hasher.write(data);
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Writes a block plus its trailer and returns its handle.
    fn write_block(&mut self, contents: &[u8], compress: bool) -> Result<BlockHandle> {
        let compressed = match (compress, self.options.compression) {
            (true, CompressionType::Zstd) => {
                let out = zstd::bulk::compress(contents, ZSTD_LEVEL)?;
                // keep the raw block unless compression saves at least 1/8
                (out.len() < contents.len() - contents.len() / 8).then_some(out)
            }
            _ => None,
        };
        let (body, tag) = match &compressed {
            Some(out) => (out.as_slice(), COMPRESSION_ZSTD),
            None => (contents, COMPRESSION_NONE),
        };

        let handle = BlockHandle::new(self.offset, body.len() as u64);
        let mut digest = CRC32.digest();
        digest.update(body);
        digest.update(&[tag]);
        let mut trailer = [0u8; BLOCK_TRAILER_SIZE];
        trailer[0] = tag;
        trailer[1..].copy_from_slice(&digest.finalize().to_be_bytes());

        self.write_raw(body)?;
        self.write_raw(&trailer)?;
        Ok(handle)
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let contents = self.data_block.finish();
        let handle = self.write_block(&contents, true)?;
        self.props.num_data_blocks += 1;
        self.props.data_size += handle.size + BLOCK_TRAILER_SIZE as u64;
        if let Some(first_key) = self.pending_first_key.take() {
            self.index_block.add(&first_key, &handle.encode());
        }
        Ok(())
    }

    /// Writes the meta blocks and footer, syncs the file and reports what
    /// it covers.
    pub fn finish(mut self) -> Result<TableSummary> {
        self.flush_data_block()?;
        let mut footer = Footer::default();

        if !self.filter.is_empty() {
            let filter = self.filter.finish(self.options.bloom_bits_per_key).serialize();
            footer.filter = self.write_block(&filter, false)?;
            self.props.filter_size = footer.filter.size;
        }

        if !self.tombstones.is_empty() {
            let cmp = self.options.comparator.clone();
            let mut entries: Vec<(Vec<u8>, Vec<u8>)> = self
                .tombstones
                .iter()
                .map(|t| {
                    (
                        InternalKey::new(t.begin.clone(), t.seq, ValueType::RangeDelete).encode(),
                        t.end.clone(),
                    )
                })
                .collect();
            entries.sort_by(|a, b| compare_internal(cmp.as_ref(), &a.0, &b.0));
            let mut block = BlockBuilder::new(1);
            for (key, end) in &entries {
                block.add(key, end);
            }
            let contents = block.finish();
            footer.range_del = self.write_block(&contents, false)?;
        }

        let index = self.index_block.finish();
        footer.index = self.write_block(&index, false)?;
        self.props.index_size = footer.index.size;

        self.props.file_checksum = self.hasher.checksum();
        self.props.creation_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if self.props.smallest_seq == MAX_SEQUENCE_NUMBER {
            self.props.smallest_seq = 0;
        }
        let props = self.props.encode();
        footer.properties = self.write_block(&props, false)?;
        self.write_raw(&footer.encode())?;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        let (smallest, largest) = match (self.smallest.take(), self.largest.take()) {
            (Some(s), Some(l)) => (s, l),
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "empty table {}",
                    self.path.display()
                )))
            }
        };
        Ok(TableSummary {
            file_size: self.offset,
            smallest,
            largest,
            properties: self.props,
        })
    }

    /// Drops the partially written file.
    pub fn abandon(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
