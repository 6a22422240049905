//! Point-in-time copies of an open database.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::filename::{
    log_file_name, manifest_file_name, options_file_name, parse_file_name, set_current_file, sync_dir,
    table_file_name, FileType,
};
use crate::Error;

use super::{wal_numbers, Db};

/// Files captured while writes were held off.
struct CheckpointFiles {
    tables: Vec<u64>,
    manifest_number: u64,
    manifest_size: u64,
    /// Log numbers and the bytes of each that belong to the checkpoint.
    logs: Vec<(u64, u64)>,
    options: Option<u64>,
}

/// Builds openable copies of a live database.
pub struct Checkpoint<'a> {
    db: &'a Db,
}

/// Re-enables file deletions when dropped.
struct DeletionsDisabled<'a>(&'a Db);

impl Drop for DeletionsDisabled<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.0.enable_file_deletions(false) {
            tracing::warn!(error = %e, "Failed to re-enable file deletions");
        }
    }
}

fn copy_prefix(from: &Path, to: &Path, len: u64) -> Result<()> {
    let mut src = io::Read::take(File::open(from)?, len);
    let mut dst = File::create(to)?;
    io::copy(&mut src, &mut dst)?;
    dst.sync_all()?;
    Ok(())
}

fn link_or_copy(from: &Path, to: &Path) -> Result<()> {
    if fs::hard_link(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    File::open(to)?.sync_all()?;
    Ok(())
}

impl<'a> Checkpoint<'a> {
    pub fn new(db: &'a Db) -> Result<Self> {
        Ok(Self { db })
    }

    /// Writes a consistent copy of the database to `path`, which must not
    /// exist. Table files are hard-linked when possible; the manifest and
    /// live logs are copied up to their size at the time of the call.
    pub fn create_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let target = path.as_ref();
        if target.exists() {
            return Err(Error::InvalidArgument(format!("{} already exists", target.display())));
        }
        let staging = PathBuf::from(format!("{}.tmp", target.display()));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        self.db.disable_file_deletions()?;
        let _enable = DeletionsDisabled(self.db);

        let result = self.capture().and_then(|files| {
            self.materialize(&files, &staging)?;
            Ok(files)
        });
        match result {
            Ok(files) => {
                fs::rename(&staging, target)?;
                if let Some(parent) = target.parent() {
                    let _ = sync_dir(parent);
                }
                tracing::info!(
                    path = %target.display(),
                    tables = files.tables.len(),
                    logs = files.logs.len(),
                    manifest = files.manifest_number,
                    "Created checkpoint"
                );
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                tracing::warn!(path = %target.display(), error = %e, "Checkpoint failed");
                Err(e)
            }
        }
    }

    fn capture(&self) -> Result<CheckpointFiles> {
        let inner = &self.db.inner;
        let _write = inner.write_lock.lock()?;
        if let Some(wal) = inner.current_wal()? {
            wal.flush()?;
        }

        let mut log_floor = u64::MAX;
        let mut tables = Vec::new();
        for cfd in inner.column_family_list()? {
            log_floor = log_floor.min(cfd.min_log_number()?);
            let version = cfd.current()?;
            tables.extend(version.all_files().map(|(_, f)| f.number));
        }
        let (manifest_number, manifest_size) = {
            let versions = inner.versions.lock()?;
            (versions.manifest_number(), versions.manifest_size())
        };

        let mut logs = Vec::new();
        for number in wal_numbers(&inner.path)? {
            if number >= log_floor {
                let size = fs::metadata(log_file_name(&inner.path, number))?.len();
                logs.push((number, size));
            }
        }

        let mut options = None;
        for entry in fs::read_dir(&inner.path)? {
            if let Some(FileType::Options(n)) = entry?.file_name().to_str().and_then(parse_file_name) {
                options = options.max(Some(n));
            }
        }

        Ok(CheckpointFiles {
            tables,
            manifest_number,
            manifest_size,
            logs,
            options,
        })
    }

    fn materialize(&self, files: &CheckpointFiles, staging: &Path) -> Result<()> {
        let dir = &self.db.inner.path;
        for &number in &files.tables {
            link_or_copy(&table_file_name(dir, number), &table_file_name(staging, number))?;
        }
        copy_prefix(
            &manifest_file_name(dir, files.manifest_number),
            &manifest_file_name(staging, files.manifest_number),
            files.manifest_size,
        )?;
        for &(number, size) in &files.logs {
            copy_prefix(&log_file_name(dir, number), &log_file_name(staging, number), size)?;
        }
        if let Some(number) = files.options {
            fs::copy(options_file_name(dir, number), options_file_name(staging, number))?;
        }
        set_current_file(staging, files.manifest_number)?;
        sync_dir(staging)
    }
}
