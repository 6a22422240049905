//! Immutable per column family file sets.
//!
//! A [`Version`] lists the table files of every level. Level 0 files may
//! overlap and are kept newest first; deeper levels hold disjoint, sorted
//! key ranges. Versions are never mutated: flushes and compactions build a
//! successor through [`builder::VersionBuilder`] and the
//! [`set::VersionSet`] installs it after the edit reaches the manifest.

pub mod builder;
pub mod set;

use std::cmp::Ordering;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use crate::comparator::Comparator;
use crate::config::ColumnFamilyOptions;
use crate::error::Result;
use crate::iterator::{BoxedIterator, InternalIterator};
use crate::lookup::GetContext;
use crate::manifest::FileMetaData;
use crate::sstable::{BlockReadOptions, TableIterator};
use crate::statistics::{Ticker, Statistics};
use crate::table_cache::TableCache;
use crate::types::{compare_internal, compare_keys, InternalKey, RangeTombstone, MAX_SEQUENCE_NUMBER};
use crate::Error;

pub use builder::VersionBuilder;
pub use set::{ColumnFamilyState, VersionSet};

pub struct Version {
    cf_id: u32,
    number: u64,
    options: Arc<ColumnFamilyOptions>,
    levels: Vec<Vec<Arc<FileMetaData>>>,
    tombstones: Mutex<Option<Arc<Vec<RangeTombstone>>>>,
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Version")
            .field("cf_id", &self.cf_id)
            .field("number", &self.number)
            .field("files", &self.levels.iter().map(|l| l.len()).collect::<Vec<_>>())
            .finish()
    }
}

fn sort_level(cmp: &dyn Comparator, level: usize, files: &mut [Arc<FileMetaData>]) {
    if level == 0 {
        files.sort_by(|a, b| {
            b.effective_largest_seq()
                .cmp(&a.effective_largest_seq())
                .then_with(|| b.number.cmp(&a.number))
        });
    } else {
        files.sort_by(|a, b| compare_keys(cmp, &a.smallest, &b.smallest));
    }
}

impl Version {
    pub fn empty(cf_id: u32, options: Arc<ColumnFamilyOptions>) -> Self {
        let levels = vec![Vec::new(); options.num_levels.max(1)];
        Self {
            cf_id,
            number: 0,
            options,
            levels,
            tombstones: Mutex::new(None),
        }
    }

    /// Builds a version from unsorted levels, checking the disjointness of
    /// every level below 0.
    pub fn from_levels(
        cf_id: u32,
        number: u64,
        options: Arc<ColumnFamilyOptions>,
        mut levels: Vec<Vec<Arc<FileMetaData>>>,
    ) -> Result<Self> {
        let num_levels = options.num_levels.max(1);
        if levels.len() > num_levels && levels[num_levels..].iter().any(|l| !l.is_empty()) {
            return Err(Error::InvalidArgument(format!(
                "column family {} has files beyond num_levels {}",
                cf_id, options.num_levels
            )));
        }
        levels.resize(num_levels, Vec::new());

        let cmp = options.comparator.clone();
        for (level, files) in levels.iter_mut().enumerate() {
            sort_level(cmp.as_ref(), level, files);
            if level > 0 {
                for pair in files.windows(2) {
                    if cmp
                        .compare(&pair[0].largest.user_key, &pair[1].smallest.user_key)
                        != Ordering::Less
                    {
                        return Err(Error::Corruption(format!(
                            "overlapping files {} and {} in level {}",
                            pair[0].number, pair[1].number, level
                        )));
                    }
                }
            }
        }

        Ok(Self {
            cf_id,
            number,
            options,
            levels,
            tombstones: Mutex::new(None),
        })
    }

    pub fn cf_id(&self) -> u32 {
        self.cf_id
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn options(&self) -> &Arc<ColumnFamilyOptions> {
        &self.options
    }

    pub fn comparator(&self) -> &dyn Comparator {
        self.options.comparator.as_ref()
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        self.levels.get(level).map_or(&[][..], |l| l.as_slice())
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files(level).len()
    }

    pub fn total_files(&self) -> usize {
        self.levels.iter().map(|l| l.len()).sum()
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        self.files(level).iter().map(|f| f.file_size).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        (0..self.num_levels()).map(|l| self.level_bytes(l)).sum()
    }

    /// Every file with its level, shallowest first.
    pub fn all_files(&self) -> impl Iterator<Item = (usize, &Arc<FileMetaData>)> {
        self.levels
            .iter()
            .enumerate()
            .flat_map(|(level, files)| files.iter().map(move |f| (level, f)))
    }

    pub fn max_level_with_files(&self) -> Option<usize> {
        (0..self.num_levels()).rev().find(|&l| !self.levels[l].is_empty())
    }

    pub fn find_file(&self, number: u64) -> Option<(usize, &Arc<FileMetaData>)> {
        self.all_files().find(|(_, f)| f.number == number)
    }

    fn before_file(&self, user_key: Option<&[u8]>, file: &FileMetaData) -> bool {
        // true when user_key is strictly after the file
        user_key.map_or(false, |k| {
            self.comparator().compare(k, &file.largest.user_key) == Ordering::Greater
        })
    }

    fn after_file(&self, user_key: Option<&[u8]>, file: &FileMetaData) -> bool {
        // true when user_key is strictly before the file
        user_key.map_or(false, |k| {
            self.comparator().compare(k, &file.smallest.user_key) == Ordering::Less
        })
    }

    /// Files in `level` whose user key range intersects `[begin, end]`.
    /// `None` is unbounded. Level 0 inputs are widened until the set is
    /// closed under overlap.
    pub fn overlapping_files(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<FileMetaData>> {
        let mut begin = begin.map(|k| k.to_vec());
        let mut end = end.map(|k| k.to_vec());
        let cmp = self.comparator();
        loop {
            let picked: Vec<Arc<FileMetaData>> = self
                .files(level)
                .iter()
                .filter(|f| !self.before_file(begin.as_deref(), f) && !self.after_file(end.as_deref(), f))
                .cloned()
                .collect();
            if level != 0 {
                return picked;
            }

            let mut widened = false;
            for f in &picked {
                if let Some(b) = &begin {
                    if cmp.compare(&f.smallest.user_key, b) == Ordering::Less {
                        begin = Some(f.smallest.user_key.clone());
                        widened = true;
                    }
                }
                if let Some(e) = &end {
                    if cmp.compare(&f.largest.user_key, e) == Ordering::Greater {
                        end = Some(f.largest.user_key.clone());
                        widened = true;
                    }
                }
            }
            if !widened {
                return picked;
            }
        }
    }

    pub fn overlap_in_level(&self, level: usize, smallest: &[u8], largest: &[u8]) -> bool {
        self.files(level)
            .iter()
            .any(|f| !self.before_file(Some(smallest), f) && !self.after_file(Some(largest), f))
    }

    /// Range tombstones of every file, loaded once per version.
    pub fn range_tombstones(&self, tables: &TableCache) -> Result<Arc<Vec<RangeTombstone>>> {
        let mut cached = self.tombstones.lock()?;
        if let Some(tombstones) = cached.as_ref() {
            return Ok(Arc::clone(tombstones));
        }
        let mut all = Vec::new();
        for (_, file) in self.all_files() {
            if file.has_range_deletions() {
                let table = tables.find_table(file, &self.options)?;
                all.extend_from_slice(table.range_tombstones());
            }
        }
        let all = Arc::new(all);
        *cached = Some(Arc::clone(&all));
        Ok(all)
    }

    fn contains_user_key(&self, file: &FileMetaData, user_key: &[u8]) -> bool {
        let cmp = self.comparator();
        cmp.compare(user_key, &file.smallest.user_key) != Ordering::Less
            && cmp.compare(user_key, &file.largest.user_key) != Ordering::Greater
    }

    fn search_file(
        &self,
        file: &FileMetaData,
        ctx: &mut GetContext<'_>,
        tables: &TableCache,
        opts: BlockReadOptions,
        stats: &Statistics,
    ) -> Result<()> {
        let table = tables.find_table(file, &self.options)?;
        if !table.may_contain(ctx.user_key(), opts)? {
            stats.record(Ticker::BloomFilterUseful, 1);
            return Ok(());
        }
        table.get(ctx, opts)
    }

    /// Consults table files newest first until `ctx` is resolved.
    pub fn get(
        &self,
        ctx: &mut GetContext<'_>,
        tables: &TableCache,
        opts: BlockReadOptions,
        stats: &Statistics,
    ) -> Result<()> {
        for file in self.files(0) {
            if self.contains_user_key(file, ctx.user_key()) {
                self.search_file(file, ctx, tables, opts, stats)?;
                if ctx.is_done() {
                    return Ok(());
                }
            }
        }

        for level in 1..self.num_levels() {
            let files = self.files(level);
            let idx = files.partition_point(|f| {
                self.comparator().compare(&f.largest.user_key, ctx.user_key()) == Ordering::Less
            });
            if let Some(file) = files.get(idx) {
                if self.contains_user_key(file, ctx.user_key()) {
                    self.search_file(file, ctx, tables, opts, stats)?;
                    if ctx.is_done() {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// One iterator per level 0 file and one per deeper non-empty level.
    pub fn add_iterators(
        &self,
        tables: &Arc<TableCache>,
        opts: BlockReadOptions,
        out: &mut Vec<BoxedIterator>,
    ) -> Result<()> {
        for file in self.files(0) {
            let table = tables.find_table(file, &self.options)?;
            out.push(Box::new(table.iter(opts)));
        }
        for level in 1..self.num_levels() {
            if !self.levels[level].is_empty() {
                out.push(Box::new(LevelIterator::new(
                    self.levels[level].clone(),
                    Arc::clone(tables),
                    Arc::clone(&self.options),
                    opts,
                )));
            }
        }
        Ok(())
    }

    /// Bytes of table data between two user keys.
    pub fn approximate_size(&self, tables: &TableCache, start: &[u8], end: &[u8]) -> Result<u64> {
        let cmp = self.comparator();
        let start_key = InternalKey::for_seek(start, MAX_SEQUENCE_NUMBER).encode();
        let end_key = InternalKey::after_all(end).encode();
        let mut total = 0u64;
        for (_, file) in self.all_files() {
            if cmp.compare(&file.largest.user_key, start) == Ordering::Less
                || cmp.compare(&file.smallest.user_key, end) != Ordering::Less
            {
                continue;
            }
            let starts_inside = cmp.compare(&file.smallest.user_key, start) != Ordering::Less;
            let ends_inside = cmp.compare(&file.largest.user_key, end) == Ordering::Less;
            if starts_inside && ends_inside {
                total += file.file_size;
                continue;
            }
            let table = tables.find_table(file, &self.options)?;
            let lo = if starts_inside {
                0
            } else {
                table.approximate_offset_of(&start_key)?
            };
            let hi = if ends_inside {
                file.file_size
            } else {
                table.approximate_offset_of(&end_key)?
            };
            total += hi.saturating_sub(lo);
        }
        Ok(total)
    }

    pub fn estimated_entries(&self) -> u64 {
        self.all_files()
            .map(|(_, f)| f.num_entries.saturating_sub(2 * f.num_deletions))
            .sum()
    }

    /// Multi-line dump used by the `sstables` property.
    pub fn debug_string(&self) -> String {
        let mut out = String::new();
        for (level, files) in self.levels.iter().enumerate() {
            let _ = writeln!(out, "--- level {} --- version# {} ---", level, self.number);
            for f in files {
                let _ = writeln!(
                    out,
                    " {}:{}[{:?} .. {:?}]",
                    f.number, f.file_size, f.smallest, f.largest
                );
            }
        }
        out
    }
}

/// Concatenates the disjoint files of one level, opening them lazily.
pub struct LevelIterator {
    files: Vec<Arc<FileMetaData>>,
    tables: Arc<TableCache>,
    options: Arc<ColumnFamilyOptions>,
    opts: BlockReadOptions,
    idx: Option<usize>,
    current: Option<TableIterator>,
    error: Option<Error>,
}

impl LevelIterator {
    pub fn new(
        files: Vec<Arc<FileMetaData>>,
        tables: Arc<TableCache>,
        options: Arc<ColumnFamilyOptions>,
        opts: BlockReadOptions,
    ) -> Self {
        Self {
            files,
            tables,
            options,
            opts,
            idx: None,
            current: None,
            error: None,
        }
    }

    fn open(&mut self, idx: usize) -> bool {
        self.current = None;
        self.idx = None;
        let Some(file) = self.files.get(idx) else {
            return false;
        };
        match self.tables.find_table(file, &self.options) {
            Ok(table) => {
                self.current = Some(table.iter(self.opts));
                self.idx = Some(idx);
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

    fn current_valid(&self) -> bool {
        self.current.as_ref().map_or(false, |c| c.valid())
    }

    fn latch_current_error(&mut self) {
        if let Some(Err(e)) = self.current.as_ref().map(|c| c.status()) {
            if self.error.is_none() {
                self.error = Some(e);
            }
        }
    }

    fn skip_empty_forward(&mut self) {
        while !self.current_valid() {
            self.latch_current_error();
            let Some(idx) = self.idx else { return };
            if !self.open(idx + 1) {
                return;
            }
            if let Some(c) = &mut self.current {
                c.seek_to_first();
            }
        }
    }

    fn skip_empty_backward(&mut self) {
        while !self.current_valid() {
            self.latch_current_error();
            let Some(idx) = self.idx else { return };
            if idx == 0 || !self.open(idx - 1) {
                self.current = None;
                self.idx = None;
                return;
            }
            if let Some(c) = &mut self.current {
                c.seek_to_last();
            }
        }
    }

    fn comparator(&self) -> &dyn Comparator {
        self.options.comparator.as_ref()
    }
}

impl InternalIterator for LevelIterator {
    fn valid(&self) -> bool {
        self.error.is_none() && self.current_valid()
    }

    fn seek_to_first(&mut self) {
        if self.open(0) {
            if let Some(c) = &mut self.current {
                c.seek_to_first();
            }
            self.skip_empty_forward();
        }
    }

    fn seek_to_last(&mut self) {
        if !self.files.is_empty() && self.open(self.files.len() - 1) {
            if let Some(c) = &mut self.current {
                c.seek_to_last();
            }
            self.skip_empty_backward();
        }
    }

    fn seek(&mut self, target: &[u8]) {
        let idx = self.files.partition_point(|f| {
            compare_internal(self.comparator(), &f.largest.encode(), target) == Ordering::Less
        });
        if self.open(idx) {
            if let Some(c) = &mut self.current {
                c.seek(target);
            }
            self.skip_empty_forward();
        }
    }

    fn seek_for_prev(&mut self, target: &[u8]) {
        let upper = self.files.partition_point(|f| {
            compare_internal(self.comparator(), &f.smallest.encode(), target) != Ordering::Greater
        });
        if upper == 0 {
            self.current = None;
            self.idx = None;
            return;
        }
        if self.open(upper - 1) {
            if let Some(c) = &mut self.current {
                c.seek_for_prev(target);
            }
            self.skip_empty_backward();
        }
    }

    fn next(&mut self) {
        if let Some(c) = &mut self.current {
            c.next();
        }
        self.skip_empty_forward();
    }

    fn prev(&mut self) {
        if let Some(c) = &mut self.current {
            c.prev();
        }
        self.skip_empty_backward();
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], |c| c.key())
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], |c| c.value())
    }

    fn status(&self) -> Result<()> {
        if let Some(e) = &self.error {
            return Err(e.duplicate());
        }
        match &self.current {
            Some(c) => c.status(),
            None => Ok(()),
        }
    }
}
