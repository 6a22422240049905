use std::sync::Arc;
use std::time::Instant;

use crate::config::FlushOptions;
use crate::error::Result;
use crate::filename::table_file_name;
use crate::iterator::{BoxedIterator, MergingIterator};
use crate::manifest::{FileMetaData, VersionEdit};
use crate::memtable::Memtable;
use crate::sstable::{TableBuilder, TableOptions};
use crate::statistics::Ticker;
use crate::types::RangeTombstone;

use super::compaction::CompactionIterator;
use super::{ColumnFamilyData, ColumnFamilyHandle, Db, DbInner};

impl DbInner {
    /// Seals the active memtable of `cfd` if it holds data and, with
    /// `wait`, writes every sealed memtable to level 0 before returning.
    pub(crate) fn flush_column_family(&self, cfd: &Arc<ColumnFamilyData>, wait: bool) -> Result<()> {
        {
            let _write = self.write_lock.lock()?;
            let active = cfd.active_memtable()?;
            if active.is_empty() && cfd.num_immutables() == 0 {
                return Ok(());
            }
            if !active.is_empty() {
                self.switch_memtable(cfd)?;
            }
        }
        if wait {
            self.flush_immutables(cfd)
        } else {
            self.flush_wake.notify_one();
            Ok(())
        }
    }

    /// Writes every sealed memtable of `cfd` into one level 0 file and
    /// installs it together with the new log number.
    pub(crate) fn flush_immutables(&self, cfd: &Arc<ColumnFamilyData>) -> Result<()> {
        let _flush = self.flush_lock.lock()?;
        let imms = cfd.immutables()?;
        let Some(newest) = imms.last() else {
            return Ok(());
        };
        if cfd.is_dropped() {
            return Ok(());
        }
        let started = Instant::now();
        let next_log = newest.next_log_number();
        let flushed: Vec<u64> = imms.iter().map(|m| m.id()).collect();

        let meta = self.write_level0_table(cfd, &imms)?;
        let mut edits = Vec::with_capacity(2);
        if let Some(meta) = &meta {
            edits.push(VersionEdit::AddFile {
                cf: cfd.id(),
                level: 0,
                meta: meta.clone(),
            });
        }
        edits.push(VersionEdit::LogNumber {
            cf: cfd.id(),
            number: next_log,
        });

        let installed = self.install_edits(cfd, edits, &flushed);
        if let Some(meta) = &meta {
            self.release_outputs(&[meta.number]);
        }
        installed?;

        let bytes = meta.as_ref().map_or(0, |m| m.file_size);
        self.stats.record(Ticker::FlushBytes, bytes);
        tracing::info!(
            cf = cfd.id(),
            memtables = flushed.len(),
            table = meta.as_ref().map(|m| m.number),
            bytes,
            log_number = next_log,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Flushed memtables"
        );
        self.signal_stall_change();
        self.compaction_wake.notify_one();
        Ok(())
    }

    /// Logs `edits` and publishes the resulting version for `cfd`,
    /// retiring the memtables listed in `flushed`.
    pub(crate) fn install_edits(&self, cfd: &ColumnFamilyData, edits: Vec<VersionEdit>, flushed: &[u64]) -> Result<()> {
        let mut versions = self.versions.lock()?;
        versions.log_and_apply(edits, self.last_sequence())?;
        if let Some(version) = versions.current(cfd.id()) {
            cfd.install_version(version, flushed)?;
        }
        Ok(())
    }

    /// Builds a level 0 table from `mems`, oldest first. Returns `None`
    /// when nothing survives. The file number stays pending until the
    /// caller releases it.
    pub(crate) fn write_level0_table(
        &self,
        cfd: &ColumnFamilyData,
        mems: &[Arc<Memtable>],
    ) -> Result<Option<FileMetaData>> {
        let options = cfd.options();
        let number = self.new_output_number()?;
        let path = table_file_name(&self.path, number);

        let children: Vec<BoxedIterator> = mems
            .iter()
            .rev()
            .map(|m| Box::new(m.iter()) as BoxedIterator)
            .collect();
        let input = Box::new(MergingIterator::new(options.comparator.clone(), children));
        let tombstones: Vec<RangeTombstone> = mems.iter().flat_map(|m| m.range_tombstones()).collect();
        let mut iter = CompactionIterator::new(
            input,
            options.comparator.clone(),
            self.snapshots.sequences(),
            tombstones,
            false,
            None,
        );

        let mut builder = match TableBuilder::create(&path, TableOptions::from_cf_options(options, cfd.id())) {
            Ok(b) => b,
            Err(e) => {
                self.release_outputs(&[number]);
                return Err(e);
            }
        };
        let built = (|| -> Result<()> {
            iter.seek_to_first();
            while iter.valid() {
                builder.add(iter.key(), iter.value())?;
                iter.next();
            }
            iter.status()?;
            for tombstone in iter.output_tombstones() {
                builder.add_range_tombstone(tombstone)?;
            }
            Ok(())
        })();

        if let Err(e) = built {
            builder.abandon()?;
            self.release_outputs(&[number]);
            return Err(e);
        }
        if builder.num_entries() == 0 {
            builder.abandon()?;
            self.release_outputs(&[number]);
            return Ok(None);
        }
        match builder.finish() {
            Ok(summary) => Ok(Some(FileMetaData::from_table(number, &summary))),
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                self.release_outputs(&[number]);
                Err(e)
            }
        }
    }
}

impl Db {
    /// Flushes the default column family.
    pub fn flush(&self, opts: &FlushOptions) -> Result<()> {
        let cf = self.default_cf();
        self.flush_cf(opts, &cf)
    }

    pub fn flush_cf(&self, opts: &FlushOptions, cf: &ColumnFamilyHandle) -> Result<()> {
        self.inner.check_writable()?;
        let cfd = self.resolve(cf)?;
        if let Some(e) = self.inner.stop_writes_error() {
            return Err(e);
        }
        self.inner.flush_column_family(&cfd, opts.wait)
    }
}
