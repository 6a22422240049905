//! Compaction: choosing input files, merging them and installing outputs.
//!
//! At most one compaction runs per database; `compaction_lock` is held for
//! the whole pick-run-install cycle, by background and manual runs alike.
//! Flushes and ingestion may add level 0 files meanwhile, which never
//! conflicts because inputs are named by file number.

mod iter;
mod job;
mod picker;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, TryLockError};

pub(crate) use iter::CompactionIterator;
pub(crate) use picker::pick_compaction;

use crate::config::{BottommostLevelCompaction, CompactRangeOptions};
use crate::error::Result;
use crate::filename::{parse_file_name, table_file_name, FileType};
use crate::manifest::{FileMetaData, VersionEdit};
use crate::version::Version;
use crate::Error;

use super::{ColumnFamilyData, ColumnFamilyHandle, Db, DbInner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompactionReason {
    LevelL0FilesNum,
    LevelMaxBytes,
    Tiered,
    ManualRange,
    ManualFiles,
}

impl CompactionReason {
    pub(crate) fn is_manual(self) -> bool {
        matches!(self, CompactionReason::ManualRange | CompactionReason::ManualFiles)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CompactionInputs {
    pub level: usize,
    pub files: Vec<Arc<FileMetaData>>,
}

/// One unit of compaction work against a fixed version.
#[derive(Debug)]
pub(crate) struct Compaction {
    pub version: Arc<Version>,
    /// Ascending by level, never empty.
    pub inputs: Vec<CompactionInputs>,
    pub output_level: usize,
    pub max_output_file_size: u64,
    /// Nothing below the output level overlaps the input range.
    pub bottommost: bool,
    pub reason: CompactionReason,
}

impl Compaction {
    pub(crate) fn new(
        version: Arc<Version>,
        inputs: Vec<CompactionInputs>,
        output_level: usize,
        max_output_file_size: u64,
        reason: CompactionReason,
    ) -> Self {
        let inputs: Vec<CompactionInputs> = inputs.into_iter().filter(|i| !i.files.is_empty()).collect();
        let bottommost = match key_range(version.comparator(), inputs.iter().flat_map(|i| i.files.iter())) {
            Some((smallest, largest)) => ((output_level + 1)..version.num_levels())
                .all(|level| !version.overlap_in_level(level, &smallest, &largest)),
            None => true,
        };
        Self {
            version,
            inputs,
            output_level,
            max_output_file_size,
            bottommost,
            reason,
        }
    }

    pub(crate) fn cf_id(&self) -> u32 {
        self.version.cf_id()
    }

    pub(crate) fn start_level(&self) -> usize {
        self.inputs.first().map_or(self.output_level, |i| i.level)
    }

    pub(crate) fn input_files(&self) -> impl Iterator<Item = (usize, &Arc<FileMetaData>)> {
        self.inputs
            .iter()
            .flat_map(|i| i.files.iter().map(move |f| (i.level, f)))
    }

    pub(crate) fn num_input_files(&self) -> usize {
        self.inputs.iter().map(|i| i.files.len()).sum()
    }

    pub(crate) fn input_bytes(&self) -> u64 {
        self.input_files().map(|(_, f)| f.file_size).sum()
    }

    /// A single file with nothing to merge against is moved by a manifest
    /// edit alone. Manual runs always rewrite so deletions are applied.
    pub(crate) fn is_trivial_move(&self) -> bool {
        !self.reason.is_manual()
            && self.inputs.len() == 1
            && self.inputs[0].files.len() == 1
            && self.inputs[0].level != self.output_level
            && self.version.options().compaction_filter.is_none()
    }
}

/// Smallest and largest user keys over `files`.
pub(crate) fn key_range<'a>(
    cmp: &dyn crate::comparator::Comparator,
    files: impl Iterator<Item = &'a Arc<FileMetaData>>,
) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut range: Option<(Vec<u8>, Vec<u8>)> = None;
    for f in files {
        match &mut range {
            None => range = Some((f.smallest.user_key.clone(), f.largest.user_key.clone())),
            Some((smallest, largest)) => {
                if cmp.compare(&f.smallest.user_key, smallest) == Ordering::Less {
                    *smallest = f.smallest.user_key.clone();
                }
                if cmp.compare(&f.largest.user_key, largest) == Ordering::Greater {
                    *largest = f.largest.user_key.clone();
                }
            }
        }
    }
    range
}

impl DbInner {
    /// Stop point checked between keys.
    pub(crate) fn check_compaction_cancelled(&self, manual: bool) -> Result<()> {
        if manual {
            if self.is_shutting_down() || self.is_paused() {
                return Err(Error::ManualCompactionPaused);
            }
        } else if self.is_shutting_down() {
            return Err(Error::ShutdownInProgress);
        }
        Ok(())
    }

    /// Runs one automatic compaction if any column family needs it.
    /// Returns whether work was done.
    pub(crate) fn maybe_compact(&self) -> Result<bool> {
        if !self.is_read_write() || self.is_paused() || self.is_shutting_down() {
            return Ok(false);
        }
        if self.stop_writes_error().is_some() {
            return Ok(false);
        }
        let _guard = match self.compaction_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Ok(false),
            Err(TryLockError::Poisoned(_)) => return Err(Error::MutexPoisoned),
        };

        for cfd in self.column_family_list()? {
            if !cfd.auto_compactions_enabled() || cfd.is_dropped() {
                continue;
            }
            let version = cfd.current()?;
            let Some(compaction) = pick_compaction(&version, |level| cfd.compact_cursor(level)) else {
                continue;
            };
            if compaction.reason == CompactionReason::LevelMaxBytes {
                if let Some(last) = compaction.inputs.first().and_then(|i| i.files.last()) {
                    cfd.set_compact_cursor(compaction.start_level(), last.largest.clone());
                }
            }
            self.run_compaction(&cfd, compaction)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn compact_range_locked(
        &self,
        cfd: &Arc<ColumnFamilyData>,
        opts: &CompactRangeOptions,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        let options = cfd.options();
        let num_levels = cfd.current()?.num_levels();
        let Some(max_level) = cfd.current()?.max_level_with_files() else {
            return Ok(());
        };

        for level in 0..max_level.max(1) {
            if level + 1 >= num_levels {
                break;
            }
            self.check_compaction_cancelled(true)?;
            let version = cfd.current()?;
            let files = version.overlapping_files(level, begin, end);
            let Some((smallest, largest)) = key_range(version.comparator(), files.iter()) else {
                continue;
            };
            let next = version.overlapping_files(level + 1, Some(&smallest), Some(&largest));
            let compaction = Compaction::new(
                Arc::clone(&version),
                vec![
                    CompactionInputs { level, files },
                    CompactionInputs {
                        level: level + 1,
                        files: next,
                    },
                ],
                level + 1,
                options.target_file_size_base,
                CompactionReason::ManualRange,
            );
            self.run_compaction(cfd, compaction)?;
        }

        let version = cfd.current()?;
        let Some(bottom) = version.max_level_with_files() else {
            return Ok(());
        };
        let rewrite_bottom = match opts.bottommost_level_compaction {
            BottommostLevelCompaction::Skip => false,
            BottommostLevelCompaction::IfHaveCompactionFilter => options.compaction_filter.is_some(),
            BottommostLevelCompaction::Force => true,
        };
        // A single-level family has nowhere else to put its data.
        if rewrite_bottom || num_levels == 1 {
            let files = version.overlapping_files(bottom, begin, end);
            if !files.is_empty() {
                self.check_compaction_cancelled(true)?;
                let compaction = Compaction::new(
                    Arc::clone(&version),
                    vec![CompactionInputs { level: bottom, files }],
                    bottom,
                    options.target_file_size_base,
                    CompactionReason::ManualRange,
                );
                self.run_compaction(cfd, compaction)?;
            }
        }

        if opts.change_level {
            self.refit_level(cfd, opts.target_level)?;
        }
        Ok(())
    }

    /// Moves every file of the only populated level to `target`. Without
    /// a target, picks the shallowest level whose size limit fits the data.
    fn refit_level(&self, cfd: &ColumnFamilyData, target: Option<usize>) -> Result<()> {
        let version = cfd.current()?;
        let num_levels = version.num_levels();
        let Some(from) = version.max_level_with_files() else {
            return Ok(());
        };
        if version.total_files() != version.num_files(from) {
            tracing::warn!(cf = cfd.id(), level = from, "Skipped level change, data spans several levels");
            return Ok(());
        }
        let options = cfd.options();
        let target = match target {
            Some(t) if t >= num_levels => {
                return Err(Error::InvalidArgument(format!(
                    "target level {} out of range, column family has {} levels",
                    t, num_levels
                )))
            }
            Some(t) => t,
            None => {
                let bytes = version.level_bytes(from);
                (1..num_levels)
                    .find(|&l| options.max_bytes_for_level(l) >= bytes)
                    .unwrap_or(num_levels - 1)
                    .min(num_levels - 1)
            }
        };
        if target == from || (from == 0 && version.num_files(0) > 1) {
            return Ok(());
        }

        let mut edits = Vec::new();
        for file in version.files(from) {
            edits.push(VersionEdit::DeleteFile {
                cf: cfd.id(),
                level: from as u32,
                number: file.number,
            });
            edits.push(VersionEdit::AddFile {
                cf: cfd.id(),
                level: target as u32,
                meta: (**file).clone(),
            });
        }
        self.install_edits(cfd, edits, &[])?;
        tracing::info!(cf = cfd.id(), from, to = target, files = version.num_files(from), "Changed level");
        Ok(())
    }

    /// Widens explicitly named inputs so no older version of a key is left
    /// behind in a level the outputs skip over.
    fn expand_file_inputs(
        &self,
        version: &Arc<Version>,
        picked: Vec<(usize, Arc<FileMetaData>)>,
        output_level: usize,
    ) -> Vec<CompactionInputs> {
        let cmp = version.comparator();
        let mut by_level: BTreeMap<usize, BTreeMap<u64, Arc<FileMetaData>>> = BTreeMap::new();
        for (level, file) in picked {
            by_level.entry(level).or_default().insert(file.number, file);
        }
        let start_level = by_level.keys().next().copied().unwrap_or(output_level);

        loop {
            let Some((smallest, largest)) = key_range(cmp, by_level.values().flat_map(|files| files.values())) else {
                break;
            };
            let mut grew = false;
            for level in start_level..=output_level {
                for file in version.overlapping_files(level, Some(&smallest), Some(&largest)) {
                    let files = by_level.entry(level).or_default();
                    if !files.contains_key(&file.number) {
                        files.insert(file.number, file);
                        grew = true;
                    }
                }
            }
            if !grew {
                break;
            }
        }

        by_level
            .into_iter()
            .map(|(level, files)| CompactionInputs {
                level,
                files: files.into_values().collect(),
            })
            .collect()
    }
}

fn parse_table_number(name: &str) -> Result<u64> {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name);
    match parse_file_name(base) {
        Some(FileType::Table(number)) => Ok(number),
        _ => Err(Error::InvalidArgument(format!("{} is not a table file name", name))),
    }
}

impl Db {
    /// Compacts the default column family over `[begin, end]`; `None`
    /// bounds are open.
    pub fn compact_range(&self, opts: &CompactRangeOptions, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let cf = self.default_cf();
        self.compact_range_cf(opts, &cf, begin, end)
    }

    /// Flushes the column family, then pushes every file overlapping the
    /// range down one level at a time until it reaches the deepest
    /// populated level.
    pub fn compact_range_cf(
        &self,
        opts: &CompactRangeOptions,
        cf: &ColumnFamilyHandle,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        let inner = &self.inner;
        inner.check_writable()?;
        let cfd = self.resolve(cf)?;
        if let (Some(b), Some(e)) = (begin, end) {
            if cfd.options().comparator.compare(b, e) == Ordering::Greater {
                return Err(Error::InvalidArgument("compaction range begin is after end".into()));
            }
        }
        inner.check_compaction_cancelled(true)?;
        inner.flush_column_family(&cfd, true)?;

        let guard = inner.compaction_lock.lock()?;
        tracing::info!(cf = cfd.id(), "Manual range compaction started");
        inner.compact_range_locked(&cfd, opts, begin, end)?;
        tracing::info!(cf = cfd.id(), "Manual range compaction finished");
        drop(guard);
        inner.compaction_wake.notify_one();
        Ok(())
    }

    /// Compacts the named table files, plus whatever overlaps them on the
    /// way down, into `output_level`. Returns the names of the new files.
    pub fn compact_files<S: AsRef<str>>(
        &self,
        cf: &ColumnFamilyHandle,
        input_files: &[S],
        output_level: usize,
    ) -> Result<Vec<String>> {
        let inner = &self.inner;
        inner.check_writable()?;
        let cfd = self.resolve(cf)?;
        if input_files.is_empty() {
            return Err(Error::InvalidArgument("no input files given".into()));
        }
        let numbers = input_files
            .iter()
            .map(|n| parse_table_number(n.as_ref()))
            .collect::<Result<Vec<u64>>>()?;
        inner.check_compaction_cancelled(true)?;

        let guard = inner.compaction_lock.lock()?;
        let version = cfd.current()?;
        if output_level >= version.num_levels() {
            return Err(Error::InvalidArgument(format!(
                "output level {} out of range, column family has {} levels",
                output_level,
                version.num_levels()
            )));
        }
        let mut picked = Vec::with_capacity(numbers.len());
        for number in numbers {
            let (level, file) = version.find_file(number).ok_or_else(|| {
                Error::InvalidArgument(format!("table file {} is not live in column family {}", number, cfd.name()))
            })?;
            if level > output_level {
                return Err(Error::InvalidArgument(format!(
                    "file {} at level {} is below output level {}",
                    number, level, output_level
                )));
            }
            picked.push((level, Arc::clone(file)));
        }

        let inputs = inner.expand_file_inputs(&version, picked, output_level);
        let compaction = Compaction::new(
            Arc::clone(&version),
            inputs,
            output_level,
            cfd.options().target_file_size_base,
            CompactionReason::ManualFiles,
        );
        let outputs = inner.run_compaction(&cfd, compaction)?;
        drop(guard);
        inner.compaction_wake.notify_one();

        Ok(outputs
            .into_iter()
            .filter_map(|n| {
                table_file_name(&inner.path, n)
                    .file_name()
                    .and_then(|s| s.to_str())
                    .map(str::to_string)
            })
            .collect())
    }
}
