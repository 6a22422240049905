//! Read side of a table file.
//!
//! Opening a table reads the footer, properties and range-deletion block
//! eagerly. The index and filter blocks are either pinned in the reader or,
//! with `cache_index_and_filter_blocks`, loaded through the block cache at
//! high priority. Data blocks always go through the block cache when one is
//! configured.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use super::block::{Block, BlockIterator};
use super::bloom::{self, BloomFilter};
use super::footer::{BlockHandle, Footer, FOOTER_SIZE};
use super::properties::TableProperties;
use super::{read_at, BLOCK_TRAILER_SIZE, COMPRESSION_NONE, COMPRESSION_ZSTD};
use crate::cache::{Cache, Priority};
use crate::comparator::ComparatorRef;
use crate::error::Result;
use crate::hasher::Hasher;
use crate::iterator::InternalIterator;
use crate::lookup::GetContext;
use crate::types::{InternalKey, ParsedKey, RangeTombstone, SequenceNumber};
use crate::wal::CRC32;
use crate::Error;

/// Shared block cache keyed by `(table cache id, block offset)`.
pub type BlockCache = Cache<(u64, u64), Block>;

#[derive(Clone)]
pub struct TableReaderOptions {
    pub comparator: ComparatorRef,
    pub block_cache: Option<Arc<BlockCache>>,
    pub cache_index_and_filter_blocks: bool,
    /// Overrides the sequence number of every key (ingested files).
    pub global_seqno: Option<SequenceNumber>,
    pub verify_checksums: bool,
}

/// Per-read block options.
#[derive(Debug, Clone, Copy)]
pub struct BlockReadOptions {
    pub verify_checksums: bool,
    pub fill_cache: bool,
    /// Minimum read size for data blocks missing from the cache during
    /// iteration. Zero reads one block at a time.
    pub readahead_size: usize,
}

impl Default for BlockReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: true,
            fill_cache: true,
            readahead_size: 0,
        }
    }
}

pub struct Table {
    file: File,
    path: PathBuf,
    file_number: u64,
    file_size: u64,
    options: TableReaderOptions,
    cache_id: u64,
    footer: Footer,
    properties: TableProperties,
    index: Option<Arc<Block>>,
    filter: Option<Arc<Block>>,
    range_tombstones: Vec<RangeTombstone>,
    file_reads: AtomicU64,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("file_number", &self.file_number)
            .field("file_size", &self.file_size)
            .field("entries", &self.properties.num_entries)
            .finish()
    }
}

impl Table {
    pub fn open(path: impl AsRef<Path>, file_number: u64, options: TableReaderOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        if file_size < FOOTER_SIZE as u64 {
            return Err(Error::Corruption(format!(
                "table {} is too short to be a table file",
                path.display()
            )));
        }
        let mut footer_buf = [0u8; FOOTER_SIZE];
        read_at(&file, &mut footer_buf, file_size - FOOTER_SIZE as u64)?;
        let footer = Footer::decode(&footer_buf)?;

        let cache_id = options
            .block_cache
            .as_ref()
            .map(|c| c.new_id())
            .unwrap_or(0);

        let mut table = Self {
            file,
            path,
            file_number,
            file_size,
            options,
            cache_id,
            footer,
            properties: TableProperties::default(),
            index: None,
            filter: None,
            range_tombstones: Vec::new(),
            file_reads: AtomicU64::new(0),
        };

        let verify = table.options.verify_checksums;
        let props = table.read_block(table.footer.properties, verify)?;
        table.properties = TableProperties::decode(&props)?;
        let expected = table.options.comparator.name();
        if !table.properties.comparator_name.is_empty()
            && table.properties.comparator_name != expected
        {
            return Err(Error::InvalidArgument(format!(
                "table {} was written with comparator {}, expected {}",
                table.path.display(),
                table.properties.comparator_name,
                expected
            )));
        }

        if table.footer.range_del.size > 0 {
            let raw = table.read_block(table.footer.range_del, verify)?;
            let block = Block::decode(&raw)?;
            for (key, end) in block.entries() {
                let parsed = ParsedKey::parse(key)?;
                table.range_tombstones.push(RangeTombstone {
                    begin: parsed.user_key.to_vec(),
                    end: end.to_vec(),
                    seq: table.options.global_seqno.unwrap_or(parsed.seq()),
                });
            }
        }

        if !table.options.cache_index_and_filter_blocks || table.options.block_cache.is_none() {
            table.index = Some(table.load_index(verify)?);
            table.filter = table.load_filter(verify)?;
        }
        Ok(table)
    }

    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn properties(&self) -> &TableProperties {
        &self.properties
    }

    pub fn comparator(&self) -> &ComparatorRef {
        &self.options.comparator
    }

    pub fn range_tombstones(&self) -> &[RangeTombstone] {
        &self.range_tombstones
    }

    pub fn cache_id(&self) -> u64 {
        self.cache_id
    }

    /// Number of block reads issued against the file so far.
    pub fn file_reads(&self) -> u64 {
        self.file_reads.load(Ordering::Relaxed)
    }

    /// Reads a block body and checks its trailer. Returns the decompressed
    /// contents.
    fn read_block(&self, handle: BlockHandle, verify: bool) -> Result<Vec<u8>> {
        let total = self.check_handle(handle)?;
        let mut buf = vec![0u8; total];
        read_at(&self.file, &mut buf, handle.offset)?;
        self.file_reads.fetch_add(1, Ordering::Relaxed);
        self.block_contents(buf, handle, verify)
    }

    /// Size of the block with its trailer, if it lies inside the file.
    fn check_handle(&self, handle: BlockHandle) -> Result<usize> {
        let total = handle.size as usize + BLOCK_TRAILER_SIZE;
        if handle.offset + total as u64 > self.file_size {
            return Err(Error::Corruption(format!(
                "block handle {:?} past end of {}",
                handle,
                self.path.display()
            )));
        }
        Ok(total)
    }

    /// Checks the trailer of a raw block and decompresses its body.
    fn block_contents(&self, mut buf: Vec<u8>, handle: BlockHandle, verify: bool) -> Result<Vec<u8>> {
        let body_len = handle.size as usize;
        let tag = buf[body_len];
        if verify {
            let expected = BigEndian::read_u32(&buf[body_len + 1..]);
            let mut digest = CRC32.digest();
            digest.update(&buf[..body_len + 1]);
            let actual = digest.finalize();
            if expected != actual {
                return Err(Error::ChecksumMismatch {
                    context: "table block",
                    expected,
                    actual,
                });
            }
        }
        buf.truncate(body_len);
        match tag {
            COMPRESSION_NONE => Ok(buf),
            COMPRESSION_ZSTD => Ok(zstd::stream::decode_all(&buf[..])?),
            other => Err(Error::Corruption(format!("unknown block compression {}", other))),
        }
    }

    fn load_index(&self, verify: bool) -> Result<Arc<Block>> {
        let raw = self.read_block(self.footer.index, verify)?;
        let mut block = Block::decode(&raw)?;
        if let Some(seq) = self.options.global_seqno {
            block.assign_sequence(seq);
        }
        Ok(Arc::new(block))
    }

    fn load_filter(&self, verify: bool) -> Result<Option<Arc<Block>>> {
        if self.footer.filter.size == 0 {
            return Ok(None);
        }
        let raw = self.read_block(self.footer.filter, verify)?;
        // reject a damaged filter up front rather than answering wrong
        BloomFilter::deserialize(&raw)?;
        Ok(Some(Arc::new(Block::opaque(raw))))
    }

    /// Looks up a block through the cache, reading it on a miss.
    fn cached<F>(&self, offset: u64, priority: Priority, fill: bool, load: F) -> Result<Arc<Block>>
    where
        F: FnOnce() -> Result<Arc<Block>>,
    {
        let Some(cache) = &self.options.block_cache else {
            return load();
        };
        let key = (self.cache_id, offset);
        if let Some(block) = cache.get(&key) {
            return Ok(block);
        }
        let block = load()?;
        if fill {
            // a full strict cache only means this block is not retained
            let _ = cache.insert(key, Arc::clone(&block), block.size(), priority);
        }
        Ok(block)
    }

    pub fn index_block(&self, opts: BlockReadOptions) -> Result<Arc<Block>> {
        if let Some(index) = &self.index {
            return Ok(Arc::clone(index));
        }
        self.cached(self.footer.index.offset, Priority::High, true, || {
            self.load_index(opts.verify_checksums)
        })
    }

    fn filter_block(&self, opts: BlockReadOptions) -> Result<Option<Arc<Block>>> {
        if self.index.is_some() {
            return Ok(self.filter.clone());
        }
        if self.footer.filter.size == 0 {
            return Ok(None);
        }
        self.cached(self.footer.filter.offset, Priority::High, true, || {
            self.load_filter(opts.verify_checksums)?
                .ok_or_else(|| Error::Corruption("filter block vanished".into()))
        })
        .map(Some)
    }

    pub fn data_block(&self, handle: BlockHandle, opts: BlockReadOptions) -> Result<Arc<Block>> {
        self.cached(handle.offset, Priority::Low, opts.fill_cache, || {
            let raw = self.read_block(handle, opts.verify_checksums)?;
            self.decode_data_block(&raw)
        })
    }

    /// Like [`Table::data_block`], but a cache miss reads at least
    /// `opts.readahead_size` bytes and keeps them for the blocks that follow.
    fn data_block_ahead(
        &self,
        handle: BlockHandle,
        opts: BlockReadOptions,
        ahead: &mut Readahead,
    ) -> Result<Arc<Block>> {
        if opts.readahead_size == 0 {
            return self.data_block(handle, opts);
        }
        self.cached(handle.offset, Priority::Low, opts.fill_cache, || {
            let total = self.check_handle(handle)?;
            if !ahead.covers(handle.offset, total) {
                let len = (total as u64)
                    .max(opts.readahead_size as u64)
                    .min(self.file_size - handle.offset);
                let mut buf = vec![0u8; len as usize];
                read_at(&self.file, &mut buf, handle.offset)?;
                self.file_reads.fetch_add(1, Ordering::Relaxed);
                *ahead = Readahead {
                    offset: handle.offset,
                    buf,
                };
            }
            let start = (handle.offset - ahead.offset) as usize;
            let raw = ahead.buf[start..start + total].to_vec();
            let contents = self.block_contents(raw, handle, opts.verify_checksums)?;
            self.decode_data_block(&contents)
        })
    }

    fn decode_data_block(&self, raw: &[u8]) -> Result<Arc<Block>> {
        let mut block = Block::decode(raw)?;
        if let Some(seq) = self.options.global_seqno {
            block.assign_sequence(seq);
        }
        Ok(Arc::new(block))
    }

    /// False only when the bloom filter proves `user_key` is absent.
    pub fn may_contain(&self, user_key: &[u8], opts: BlockReadOptions) -> Result<bool> {
        match self.filter_block(opts)? {
            Some(filter) => Ok(filter
                .entry(0)
                .map_or(true, |(_, bits)| bloom::may_contain_serialized(bits, user_key))),
            None => Ok(true),
        }
    }

    /// Feeds every version of the looked-up key to `ctx`.
    pub fn get(self: &Arc<Self>, ctx: &mut GetContext<'_>, opts: BlockReadOptions) -> Result<()> {
        let target = InternalKey::for_seek(ctx.user_key(), ctx.bound()).encode();
        let mut iter = TableIterator::new(Arc::clone(self), opts);
        iter.seek(&target);
        while iter.valid() {
            let parsed = ParsedKey::parse(iter.key())?;
            if !ctx.save_value(&parsed, iter.value())? {
                break;
            }
            iter.next();
        }
        iter.status()
    }

    pub fn iter(self: &Arc<Self>, opts: BlockReadOptions) -> TableIterator {
        TableIterator::new(Arc::clone(self), opts)
    }

    /// File offset where data for `key` (an internal key) would begin.
    pub fn approximate_offset_of(&self, key: &[u8]) -> Result<u64> {
        let index = self.index_block(BlockReadOptions::default())?;
        let idx = index.lower_bound(self.options.comparator.as_ref(), key);
        match index.entry(idx) {
            Some((_, handle)) => Ok(BlockHandle::decode(handle)?.offset),
            None => Ok(self.properties.data_size),
        }
    }

    /// Reads every block with checksums on and compares the whole-file
    /// checksum recorded at build time.
    pub fn verify_checksum(&self) -> Result<()> {
        let index = self.load_index(true)?;
        for (_, handle) in index.entries() {
            self.read_block(BlockHandle::decode(handle)?, true)?;
        }
        self.load_filter(true)?;

        let mut hasher = Hasher::new();
        let mut offset = 0u64;
        let end = self.footer.properties.offset;
        let mut buf = vec![0u8; 64 * 1024];
        while offset < end {
            let n = ((end - offset) as usize).min(buf.len());
            read_at(&self.file, &mut buf[..n], offset)?;
            hasher.write(&buf[..n]);
            offset += n as u64;
        }
        let actual = hasher.checksum();
        if actual != self.properties.file_checksum {
            return Err(Error::Corruption(format!(
                "file checksum mismatch for {}: expected {:#x}, got {:#x}",
                self.path.display(),
                self.properties.file_checksum,
                actual
            )));
        }
        Ok(())
    }

    /// Drops this table's blocks from the shared cache.
    pub fn evict_from_cache(&self) {
        if let Some(cache) = &self.options.block_cache {
            let id = self.cache_id;
            cache.erase_if(|(owner, _)| *owner == id);
        }
    }
}

/// File bytes read past the block an iterator asked for.
#[derive(Default)]
struct Readahead {
    offset: u64,
    buf: Vec<u8>,
}

impl Readahead {
    fn covers(&self, offset: u64, len: usize) -> bool {
        offset >= self.offset && offset + len as u64 <= self.offset + self.buf.len() as u64
    }
}

/// Two-level iterator: index block positions a data block iterator.
pub struct TableIterator {
    table: Arc<Table>,
    opts: BlockReadOptions,
    index: Option<Arc<Block>>,
    index_pos: Option<usize>,
    data: Option<BlockIterator>,
    readahead: Readahead,
    error: Option<Error>,
}

impl TableIterator {
    fn new(table: Arc<Table>, opts: BlockReadOptions) -> Self {
        let mut iter = Self {
            table,
            opts,
            index: None,
            index_pos: None,
            data: None,
            readahead: Readahead::default(),
            error: None,
        };
        match iter.table.index_block(opts) {
            Ok(index) => iter.index = Some(index),
            Err(e) => iter.error = Some(e),
        }
        iter
    }

    fn num_blocks(&self) -> usize {
        self.index.as_ref().map_or(0, |i| i.len())
    }

    fn load(&mut self, idx: usize) -> bool {
        self.data = None;
        self.index_pos = None;
        let Some(index) = &self.index else {
            return false;
        };
        let Some((_, handle)) = index.entry(idx) else {
            return false;
        };
        let block = BlockHandle::decode(handle)
            .and_then(|h| self.table.data_block_ahead(h, self.opts, &mut self.readahead));
        match block {
            Ok(block) => {
                self.data = Some(BlockIterator::new(block, self.table.options.comparator.clone()));
                self.index_pos = Some(idx);
                true
            }
            Err(e) => {
                if self.error.is_none() {
                    self.error = Some(e);
                }
                false
            }
        }
    }

    fn data_valid(&self) -> bool {
        self.data.as_ref().map_or(false, |d| d.valid())
    }

    fn skip_empty_forward(&mut self) {
        while !self.data_valid() {
            let Some(pos) = self.index_pos else { return };
            if pos + 1 >= self.num_blocks() || !self.load(pos + 1) {
                self.data = None;
                self.index_pos = None;
                return;
            }
            if let Some(data) = &mut self.data {
                data.seek_to_first();
            }
        }
    }

    fn skip_empty_backward(&mut self) {
        while !self.data_valid() {
            let Some(pos) = self.index_pos else { return };
            if pos == 0 || !self.load(pos - 1) {
                self.data = None;
                self.index_pos = None;
                return;
            }
            if let Some(data) = &mut self.data {
                data.seek_to_last();
            }
        }
    }
}

impl InternalIterator for TableIterator {
    fn valid(&self) -> bool {
        self.error.is_none() && self.data_valid()
    }

    fn seek_to_first(&mut self) {
        if self.num_blocks() > 0 && self.load(0) {
            if let Some(data) = &mut self.data {
                data.seek_to_first();
            }
            self.skip_empty_forward();
        } else {
            self.data = None;
        }
    }

    fn seek_to_last(&mut self) {
        let n = self.num_blocks();
        if n > 0 && self.load(n - 1) {
            if let Some(data) = &mut self.data {
                data.seek_to_last();
            }
            self.skip_empty_backward();
        } else {
            self.data = None;
        }
    }

    fn seek(&mut self, target: &[u8]) {
        let Some(index) = self.index.clone() else { return };
        let cmp = self.table.options.comparator.clone();
        let idx = index.upper_bound(cmp.as_ref(), target).saturating_sub(1);
        if idx < index.len() && self.load(idx) {
            if let Some(data) = &mut self.data {
                data.seek(target);
            }
            self.skip_empty_forward();
        } else {
            self.data = None;
        }
    }

    fn seek_for_prev(&mut self, target: &[u8]) {
        let Some(index) = self.index.clone() else { return };
        let cmp = self.table.options.comparator.clone();
        let upper = index.upper_bound(cmp.as_ref(), target);
        if upper > 0 && self.load(upper - 1) {
            if let Some(data) = &mut self.data {
                data.seek_for_prev(target);
            }
            self.skip_empty_backward();
        } else {
            self.data = None;
            self.index_pos = None;
        }
    }

    fn next(&mut self) {
        if let Some(data) = &mut self.data {
            data.next();
        }
        self.skip_empty_forward();
    }

    fn prev(&mut self) {
        if let Some(data) = &mut self.data {
            data.prev();
        }
        self.skip_empty_backward();
    }

    fn key(&self) -> &[u8] {
        self.data.as_ref().map_or(&[][..], |d| d.key())
    }

    fn value(&self) -> &[u8] {
        self.data.as_ref().map_or(&[][..], |d| d.value())
    }

    fn status(&self) -> Result<()> {
        match &self.error {
            Some(e) => Err(e.duplicate()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::{bytewise, reverse_bytewise};
    use crate::config::CompressionType;
    use crate::merge::StringAppendOperator;
    use crate::sstable::builder::{TableBuilder, TableOptions};
    use crate::tmpfs::TempDir;
    use crate::types::{user_key, ValueType};

    fn table_options(compression: CompressionType) -> TableOptions {
        TableOptions {
            comparator: bytewise(),
            block_size: 256,
            restart_interval: 4,
            bloom_bits_per_key: 10,
            compression,
            column_family_id: 0,
            external_file: false,
        }
    }

    fn reader_options(cache: Option<Arc<BlockCache>>, cache_meta: bool) -> TableReaderOptions {
        TableReaderOptions {
            comparator: bytewise(),
            block_cache: cache,
            cache_index_and_filter_blocks: cache_meta,
            global_seqno: None,
            verify_checksums: true,
        }
    }

    fn build(dir: &TempDir, name: &str, compression: CompressionType, n: usize) -> Result<PathBuf> {
        let path = dir.child(name);
        let mut builder = TableBuilder::create(&path, table_options(compression))?;
        for i in 0..n {
            let key = InternalKey::new(format!("key{:05}", i).into_bytes(), (i + 1) as u64, ValueType::Put);
            builder.add(&key.encode(), format!("value-{}-{}", i, "x".repeat(20)).as_bytes())?;
        }
        let summary = builder.finish()?;
        assert_eq!(summary.properties.num_entries, n as u64);
        assert_eq!(summary.smallest.user_key, b"key00000".to_vec());
        Ok(path)
    }

    fn lookup(table: &Arc<Table>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cmp = bytewise();
        let op = StringAppendOperator::default();
        let mut ctx = GetContext::new(cmp.as_ref(), Some(&op), key, u64::MAX >> 8, 0);
        table.get(&mut ctx, BlockReadOptions::default())?;
        ctx.finish()
    }

    #[test]
    fn test_point_lookups_across_blocks() -> Result<()> {
        let dir = TempDir::new()?;
        for compression in [CompressionType::None, CompressionType::Zstd] {
            let path = build(&dir, &format!("{:?}.sst", compression), compression, 500)?;
            let table = Arc::new(Table::open(&path, 1, reader_options(None, false))?);
            assert!(table.properties().num_data_blocks > 1);

            for i in [0, 1, 77, 250, 499] {
                let key = format!("key{:05}", i);
                let got = lookup(&table, key.as_bytes())?;
                assert_eq!(got, Some(format!("value-{}-{}", i, "x".repeat(20)).into_bytes()));
            }
            assert_eq!(lookup(&table, b"key99999")?, None);
            assert!(table.may_contain(b"key00001", BlockReadOptions::default())?);
        }
        Ok(())
    }

    #[test]
    fn test_iterator_walks_every_block_both_ways() -> Result<()> {
        let dir = TempDir::new()?;
        let path = build(&dir, "iter.sst", CompressionType::None, 300)?;
        let table = Arc::new(Table::open(&path, 1, reader_options(None, false))?);

        let mut iter = table.iter(BlockReadOptions::default());
        iter.seek_to_first();
        let mut count = 0;
        while iter.valid() {
            count += 1;
            iter.next();
        }
        assert_eq!(count, 300);

        iter.seek_to_last();
        let mut back = 0;
        while iter.valid() {
            back += 1;
            iter.prev();
        }
        assert_eq!(back, 300);

        iter.seek(&InternalKey::for_seek(b"key00150x", 1000).encode());
        assert_eq!(user_key(iter.key()), b"key00151");
        iter.seek_for_prev(&InternalKey::after_all(b"key00150x").encode());
        assert_eq!(user_key(iter.key()), b"key00150");
        iter.seek_for_prev(&InternalKey::after_all(b"a").encode());
        assert!(!iter.valid());
        iter.status()
    }

    #[test]
    fn test_readahead_batches_sequential_block_reads() -> Result<()> {
        let dir = TempDir::new()?;
        let path = build(&dir, "ahead.sst", CompressionType::Zstd, 500)?;

        let scan = |table: &Arc<Table>, opts: BlockReadOptions| -> Result<Vec<Vec<u8>>> {
            let mut keys = Vec::new();
            let mut iter = table.iter(opts);
            iter.seek_to_first();
            while iter.valid() {
                keys.push(iter.key().to_vec());
                iter.next();
            }
            iter.status()?;
            Ok(keys)
        };

        let plain = Arc::new(Table::open(&path, 1, reader_options(None, false))?);
        let before = plain.file_reads();
        let expected = scan(&plain, BlockReadOptions::default())?;
        let block_at_a_time = plain.file_reads() - before;
        assert_eq!(block_at_a_time, plain.properties().num_data_blocks);

        let ahead = Arc::new(Table::open(&path, 2, reader_options(None, false))?);
        let before = ahead.file_reads();
        let opts = BlockReadOptions {
            readahead_size: 1 << 20,
            ..BlockReadOptions::default()
        };
        assert_eq!(scan(&ahead, opts)?, expected);
        assert_eq!(ahead.file_reads() - before, 1);
        Ok(())
    }

    #[test]
    fn test_block_cache_serves_repeat_reads() -> Result<()> {
        let dir = TempDir::new()?;
        let path = build(&dir, "cached.sst", CompressionType::None, 200)?;
        let cache = Arc::new(BlockCache::new(1 << 20, 0, 0.5, false));
        let table = Arc::new(Table::open(&path, 1, reader_options(Some(cache.clone()), true))?);

        lookup(&table, b"key00010")?;
        let misses = cache.stats().misses();
        lookup(&table, b"key00010")?;
        assert_eq!(cache.stats().misses(), misses);
        assert!(cache.stats().hits() > 0);
        assert!(cache.usage() > 0);

        table.evict_from_cache();
        assert_eq!(cache.usage(), 0);
        Ok(())
    }

    #[test]
    fn test_corrupted_block_is_reported() -> Result<()> {
        let dir = TempDir::new()?;
        let path = build(&dir, "corrupt.sst", CompressionType::None, 200)?;
        let mut bytes = std::fs::read(&path)?;
        bytes[20] ^= 0xFF;
        std::fs::write(&path, &bytes)?;

        let table = Arc::new(Table::open(&path, 1, reader_options(None, false))?);
        let err = lookup(&table, b"key00000").unwrap_err();
        assert!(err.is_corruption());
        assert!(table.verify_checksum().unwrap_err().is_corruption());
        Ok(())
    }

    #[test]
    fn test_range_tombstones_and_global_seqno() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.child("ingest.sst");
        let mut options = table_options(CompressionType::None);
        options.external_file = true;
        let mut builder = TableBuilder::create(&path, options)?;
        builder.add(&InternalKey::new(b"a".to_vec(), 0, ValueType::Put).encode(), b"1")?;
        builder.add(&InternalKey::new(b"m".to_vec(), 0, ValueType::Merge).encode(), b"2")?;
        builder.add_range_tombstone(RangeTombstone {
            begin: b"x".to_vec(),
            end: b"z".to_vec(),
            seq: 0,
        })?;
        let summary = builder.finish()?;
        assert_eq!(summary.largest.user_key, b"z".to_vec());
        assert!(summary.properties.external_file);

        let mut options = reader_options(None, false);
        options.global_seqno = Some(42);
        let table = Arc::new(Table::open(&path, 9, options)?);
        assert_eq!(table.range_tombstones()[0].seq, 42);

        let mut iter = table.iter(BlockReadOptions::default());
        iter.seek_to_first();
        assert_eq!(InternalKey::decode(iter.key())?.seq(), 42);
        Ok(())
    }

    #[test]
    fn test_comparator_mismatch_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let path = build(&dir, "cmp.sst", CompressionType::None, 10)?;
        let mut options = reader_options(None, false);
        options.comparator = reverse_bytewise();
        let err = Table::open(&path, 1, options).unwrap_err();
        assert_eq!(err.code(), crate::error::Code::InvalidArgument);
        Ok(())
    }
}
