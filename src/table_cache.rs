//! Open table readers keyed by file number.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::ColumnFamilyOptions;
use crate::error::Result;
use crate::filename::table_file_name;
use crate::manifest::FileMetaData;
use crate::sstable::{BlockCache, Table, TableReaderOptions};

pub struct TableCache {
    dir: PathBuf,
    block_cache: Arc<BlockCache>,
    tables: Mutex<HashMap<u64, Arc<Table>>>,
}

impl TableCache {
    pub fn new(dir: impl Into<PathBuf>, block_cache: Arc<BlockCache>) -> Self {
        Self {
            dir: dir.into(),
            block_cache,
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn block_cache(&self) -> &Arc<BlockCache> {
        &self.block_cache
    }

    /// Returns the reader for `meta`, opening the file on first use.
    pub fn find_table(&self, meta: &FileMetaData, options: &ColumnFamilyOptions) -> Result<Arc<Table>> {
        if let Some(table) = self.tables.lock()?.get(&meta.number) {
            return Ok(Arc::clone(table));
        }

        let table = Arc::new(Table::open(
            table_file_name(&self.dir, meta.number),
            meta.number,
            TableReaderOptions {
                comparator: options.comparator.clone(),
                block_cache: Some(Arc::clone(&self.block_cache)),
                cache_index_and_filter_blocks: options.cache_index_and_filter_blocks,
                global_seqno: meta.global_seqno,
                verify_checksums: true,
            },
        )?);
        tracing::trace!(file_number = meta.number, "Opened table");

        let mut tables = self.tables.lock()?;
        Ok(Arc::clone(tables.entry(meta.number).or_insert(table)))
    }

    /// Forgets an obsolete file and drops its cached blocks.
    pub fn evict(&self, number: u64) {
        let removed = match self.tables.lock() {
            Ok(mut tables) => tables.remove(&number),
            Err(_) => None,
        };
        if let Some(table) = removed {
            table.evict_from_cache();
        }
    }

    pub fn len(&self) -> usize {
        self.tables.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::sstable::{TableBuilder, TableOptions};
    use crate::tmpfs::TempDir;
    use crate::types::{InternalKey, ValueType};

    #[test]
    fn test_readers_are_shared_until_evicted() -> Result<()> {
        let dir = TempDir::new()?;
        let options = ColumnFamilyOptions::default();
        let mut builder = TableBuilder::create(
            table_file_name(dir.path(), 7),
            TableOptions::from_cf_options(&options, 0),
        )?;
        builder.add(&InternalKey::new(b"k".to_vec(), 1, ValueType::Put).encode(), b"v")?;
        let summary = builder.finish()?;

        let meta = FileMetaData {
            number: 7,
            file_size: summary.file_size,
            smallest: summary.smallest,
            largest: summary.largest,
            smallest_seq: 1,
            largest_seq: 1,
            num_entries: 1,
            num_deletions: 0,
            num_range_deletions: 0,
            global_seqno: None,
        };
        let cache = TableCache::new(dir.path(), Arc::new(Cache::new(1 << 20, 2, 0.5, false)));
        let first = cache.find_table(&meta, &options)?;
        let second = cache.find_table(&meta, &options)?;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);

        cache.evict(7);
        assert!(cache.is_empty());
        Ok(())
    }
}
