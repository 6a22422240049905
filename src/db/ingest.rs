use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::IngestOptions;
use crate::error::Result;
use crate::filename::{sync_dir, table_file_name};
use crate::manifest::{FileMetaData, VersionEdit};
use crate::sstable::SstFileReader;
use crate::types::{InternalKey, ValueType};
use crate::Error;

use super::column_family::memtable_overlaps;
use super::{ColumnFamilyData, ColumnFamilyHandle, Db, DbInner};

struct ExternalFile {
    path: PathBuf,
    smallest: Vec<u8>,
    largest: Vec<u8>,
    file_size: u64,
    num_entries: u64,
    num_deletions: u64,
    num_range_deletions: u64,
}

fn inspect(cfd: &ColumnFamilyData, path: &Path) -> Result<ExternalFile> {
    let options = cfd.options();
    let reader = SstFileReader::open(options, path)?;
    let props = reader.properties();
    if !props.external_file {
        return Err(Error::InvalidArgument(format!(
            "{} was not written by SstFileWriter",
            path.display()
        )));
    }
    if props.comparator_name != options.comparator.name() {
        return Err(Error::InvalidArgument(format!(
            "{} uses comparator {}, column family uses {}",
            path.display(),
            props.comparator_name,
            options.comparator.name()
        )));
    }
    let (smallest, largest) = reader
        .key_range()?
        .ok_or_else(|| Error::InvalidArgument(format!("{} is empty", path.display())))?;
    Ok(ExternalFile {
        path: path.to_path_buf(),
        smallest,
        largest,
        file_size: reader.file_size(),
        num_entries: props.num_entries,
        num_deletions: props.num_deletions,
        num_range_deletions: props.num_range_deletions,
    })
}

/// Hard-links `from` to `to` when asked, copying when linking fails.
/// Returns whether a link was made.
fn place(from: &Path, to: &Path, link: bool) -> Result<bool> {
    if link {
        match fs::hard_link(from, to) {
            Ok(()) => return Ok(true),
            Err(e) => {
                tracing::debug!(file = %from.display(), error = %e, "Hard link failed, copying instead");
            }
        }
    }
    fs::copy(from, to)?;
    fs::File::open(to)?.sync_all()?;
    Ok(false)
}

impl DbInner {
    fn ingest(&self, opts: &IngestOptions, cfd: &Arc<ColumnFamilyData>, paths: &[PathBuf]) -> Result<()> {
        self.check_writable()?;
        if paths.is_empty() {
            return Err(Error::InvalidArgument("no files to ingest".into()));
        }
        let cmp = cfd.options().comparator.clone();

        let mut files = paths
            .iter()
            .map(|p| inspect(cfd, p))
            .collect::<Result<Vec<_>>>()?;
        files.sort_by(|a, b| cmp.compare(&a.smallest, &b.smallest));
        for pair in files.windows(2) {
            if cmp.compare(&pair[0].largest, &pair[1].smallest) != Ordering::Less {
                return Err(Error::InvalidArgument(format!(
                    "{} and {} overlap",
                    pair[0].path.display(),
                    pair[1].path.display()
                )));
            }
        }

        // Writers are held off until the files are visible at their
        // sequence number.
        let _write = self.write_lock.lock()?;
        let overlaps_memtable = {
            let sv = cfd.super_version()?;
            files.iter().any(|f| {
                memtable_overlaps(&sv.mem, &f.smallest, &f.largest)
                    || sv.imms.iter().any(|m| memtable_overlaps(m, &f.smallest, &f.largest))
            })
        };
        if overlaps_memtable {
            if !opts.allow_blocking_flush {
                return Err(Error::InvalidArgument(
                    "ingested range overlaps unflushed data".into(),
                ));
            }
            if !cfd.active_memtable()?.is_empty() {
                self.switch_memtable(cfd)?;
            }
            self.flush_immutables(cfd)?;
        }

        let seq = self.last_sequence() + 1;
        let mut placed: Vec<(u64, bool)> = Vec::with_capacity(files.len());
        let mut edits = Vec::with_capacity(files.len());
        let copied = (|| -> Result<()> {
            for f in &files {
                let number = self.new_output_number()?;
                placed.push((number, false));
                let linked = place(&f.path, &table_file_name(&self.path, number), opts.move_files)?;
                if let Some(last) = placed.last_mut() {
                    last.1 = linked;
                }
                edits.push(VersionEdit::AddFile {
                    cf: cfd.id(),
                    level: 0,
                    meta: FileMetaData {
                        number,
                        file_size: f.file_size,
                        smallest: InternalKey::new(f.smallest.clone(), seq, ValueType::Put),
                        largest: InternalKey::new(f.largest.clone(), seq, ValueType::Put),
                        smallest_seq: seq,
                        largest_seq: seq,
                        num_entries: f.num_entries,
                        num_deletions: f.num_deletions,
                        num_range_deletions: f.num_range_deletions,
                        global_seqno: Some(seq),
                    },
                });
            }
            sync_dir(&self.path)
        })();

        let numbers: Vec<u64> = placed.iter().map(|(n, _)| *n).collect();
        let installed = copied.and_then(|()| {
            self.last_sequence.store(seq, std::sync::atomic::Ordering::Release);
            self.install_edits(cfd, edits, &[])
        });
        if let Err(e) = installed {
            for n in &numbers {
                let _ = fs::remove_file(table_file_name(&self.path, *n));
            }
            self.release_outputs(&numbers);
            tracing::warn!(cf = cfd.id(), error = %e, "Ingestion failed");
            return Err(e);
        }
        self.release_outputs(&numbers);

        if opts.move_files {
            for (f, (_, linked)) in files.iter().zip(&placed) {
                if *linked {
                    if let Err(e) = fs::remove_file(&f.path) {
                        tracing::warn!(file = %f.path.display(), error = %e, "Failed to remove ingested source file");
                    }
                }
            }
        }
        tracing::info!(
            cf = cfd.id(),
            files = files.len(),
            sequence = seq,
            file_numbers = ?numbers,
            "Ingested external files"
        );
        self.signal_stall_change();
        self.compaction_wake.notify_one();
        Ok(())
    }
}

impl Db {
    pub fn ingest_external_file<P: AsRef<Path>>(&self, opts: &IngestOptions, paths: &[P]) -> Result<()> {
        self.ingest_external_file_cf(&self.default_cf, opts, paths)
    }

    /// Adds table files built by [`crate::SstFileWriter`] to level 0 of a
    /// column family under one new sequence number. Files may not overlap
    /// each other; overlapping memtables are flushed first.
    pub fn ingest_external_file_cf<P: AsRef<Path>>(
        &self,
        cf: &ColumnFamilyHandle,
        opts: &IngestOptions,
        paths: &[P],
    ) -> Result<()> {
        let cfd = self.resolve(cf)?;
        let paths: Vec<PathBuf> = paths.iter().map(|p| p.as_ref().to_path_buf()).collect();
        self.inner.ingest(opts, &cfd, &paths)
    }
}
