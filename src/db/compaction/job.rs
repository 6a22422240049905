use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::error::Result;
use crate::filename::table_file_name;
use crate::iterator::{BoxedIterator, MergingIterator};
use crate::manifest::{FileMetaData, VersionEdit};
use crate::sstable::{TableBuilder, TableOptions};
use crate::statistics::Ticker;
use crate::types::{user_key, RangeTombstone};
use crate::version::LevelIterator;

use super::{Compaction, CompactionIterator};
use crate::db::{ColumnFamilyData, DbInner};

struct RunningGuard<'a>(&'a DbInner);

impl<'a> RunningGuard<'a> {
    fn new(inner: &'a DbInner) -> Self {
        inner.running_compactions.fetch_add(1, Ordering::AcqRel);
        Self(inner)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.running_compactions.fetch_sub(1, Ordering::AcqRel);
    }
}

impl DbInner {
    /// Executes `compaction` and installs its outputs. Returns the new
    /// file numbers. Called with `compaction_lock` held.
    pub(crate) fn run_compaction(&self, cfd: &Arc<ColumnFamilyData>, compaction: Compaction) -> Result<Vec<u64>> {
        if compaction.inputs.is_empty() {
            return Ok(Vec::new());
        }
        let cf = compaction.cf_id();
        let output_level = compaction.output_level as u32;

        if compaction.is_trivial_move() {
            let mut edits = Vec::new();
            for (level, file) in compaction.input_files() {
                edits.push(VersionEdit::DeleteFile {
                    cf,
                    level: level as u32,
                    number: file.number,
                });
                edits.push(VersionEdit::AddFile {
                    cf,
                    level: output_level,
                    meta: (**file).clone(),
                });
            }
            self.install_edits(cfd, edits, &[])?;
            for (level, file) in compaction.input_files() {
                tracing::info!(
                    cf,
                    file_number = file.number,
                    from = level,
                    to = compaction.output_level,
                    "Trivial move"
                );
            }
            self.signal_stall_change();
            return Ok(Vec::new());
        }

        let _running = RunningGuard::new(self);
        let started = Instant::now();
        let manual = compaction.reason.is_manual();
        tracing::info!(
            cf,
            reason = ?compaction.reason,
            start_level = compaction.start_level(),
            output_level = compaction.output_level,
            inputs = compaction.num_input_files(),
            bottommost = compaction.bottommost,
            "Compaction started"
        );

        let mut outputs: Vec<FileMetaData> = Vec::new();
        let mut allocated: Vec<u64> = Vec::new();
        let result = self.write_compaction_outputs(cfd, &compaction, manual, &mut outputs, &mut allocated);

        let dropped = match result {
            Ok(dropped) => dropped,
            Err(e) => {
                for number in &allocated {
                    let _ = std::fs::remove_file(table_file_name(&self.path, *number));
                }
                self.release_outputs(&allocated);
                tracing::warn!(cf, error = %e, "Compaction aborted");
                return Err(e);
            }
        };

        let mut edits = Vec::new();
        for (level, file) in compaction.input_files() {
            edits.push(VersionEdit::DeleteFile {
                cf,
                level: level as u32,
                number: file.number,
            });
        }
        for meta in &outputs {
            edits.push(VersionEdit::AddFile {
                cf,
                level: output_level,
                meta: meta.clone(),
            });
        }
        let installed = self.install_edits(cfd, edits, &[]);
        self.release_outputs(&allocated);
        installed?;

        let bytes_read = compaction.input_bytes();
        let bytes_written: u64 = outputs.iter().map(|m| m.file_size).sum();
        self.stats.record(Ticker::CompactionBytesRead, bytes_read);
        self.stats.record(Ticker::CompactionBytesWritten, bytes_written);
        self.stats.record(Ticker::CompactionKeysDropped, dropped);
        tracing::info!(
            cf,
            output_level = compaction.output_level,
            inputs = compaction.num_input_files(),
            outputs = outputs.len(),
            bytes_read,
            bytes_written,
            keys_dropped = dropped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Compaction finished"
        );
        self.signal_stall_change();
        if let Err(e) = self.purge_obsolete_files() {
            tracing::warn!(error = %e, "Failed to purge compaction inputs");
        }
        Ok(outputs.iter().map(|m| m.number).collect())
    }

    /// Merges the inputs into new tables. Every allocated number is pushed
    /// to `allocated` before its file is created. Returns the number of
    /// dropped entries.
    fn write_compaction_outputs(
        &self,
        cfd: &ColumnFamilyData,
        compaction: &Compaction,
        manual: bool,
        outputs: &mut Vec<FileMetaData>,
        allocated: &mut Vec<u64>,
    ) -> Result<u64> {
        let options = cfd.options();
        let read_opts = self.block_read_options(true, false);

        let mut children: Vec<BoxedIterator> = Vec::new();
        let mut tombstones: Vec<RangeTombstone> = Vec::new();
        for input in &compaction.inputs {
            for file in &input.files {
                let table = self.table_cache.find_table(file, options)?;
                tombstones.extend_from_slice(table.range_tombstones());
                if input.level == 0 {
                    children.push(Box::new(table.iter(read_opts)));
                }
            }
            if input.level > 0 {
                children.push(Box::new(LevelIterator::new(
                    input.files.clone(),
                    Arc::clone(&self.table_cache),
                    Arc::clone(options),
                    read_opts,
                )));
            }
        }

        let filter = options
            .compaction_filter
            .clone()
            .map(|f| (f, compaction.start_level()));
        let input = Box::new(MergingIterator::new(options.comparator.clone(), children));
        let mut iter = CompactionIterator::new(
            input,
            options.comparator.clone(),
            self.snapshots.sequences(),
            tombstones,
            compaction.bottommost,
            filter,
        );
        let tombstones = iter.output_tombstones();
        // Tombstone extents widen file bounds, so a file holding them
        // cannot share the level with a split neighbour.
        let single_output = !tombstones.is_empty();
        let table_options = TableOptions::from_cf_options(options, cfd.id());

        let mut builder: Option<(u64, TableBuilder)> = None;
        let mut last_user_key: Vec<u8> = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            self.check_compaction_cancelled(manual)?;
            let key = iter.key();
            let current_user_key = user_key(key);

            let cut = match &builder {
                Some((_, b)) => {
                    !single_output
                        && b.file_size() >= compaction.max_output_file_size
                        && !options.comparator.equal(current_user_key, &last_user_key)
                }
                None => false,
            };
            if cut {
                if let Some((number, full)) = builder.take() {
                    outputs.push(FileMetaData::from_table(number, &full.finish()?));
                }
            }
            if builder.is_none() {
                let number = self.new_output_number()?;
                allocated.push(number);
                builder = Some((number, TableBuilder::create(table_file_name(&self.path, number), table_options.clone())?));
            }
            if let Some((_, b)) = builder.as_mut() {
                b.add(key, iter.value())?;
            }
            last_user_key.clear();
            last_user_key.extend_from_slice(current_user_key);
            iter.next();
        }
        iter.status()?;

        if !tombstones.is_empty() && builder.is_none() {
            let number = self.new_output_number()?;
            allocated.push(number);
            builder = Some((number, TableBuilder::create(table_file_name(&self.path, number), table_options.clone())?));
        }
        if let Some((number, mut last)) = builder.take() {
            for tombstone in tombstones {
                last.add_range_tombstone(tombstone)?;
            }
            if last.num_entries() == 0 {
                last.abandon()?;
            } else {
                outputs.push(FileMetaData::from_table(number, &last.finish()?));
            }
        }
        Ok(iter.dropped())
    }
}
