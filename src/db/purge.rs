use std::fs;

use crate::error::Result;
use crate::filename::{parse_file_name, FileType};

use super::DbInner;

impl DbInner {
    /// Deletes files no live version, memtable or in-flight job needs:
    /// unreferenced tables, logs below every column family's log number,
    /// superseded manifests and options files, and stray temp files.
    pub(crate) fn purge_obsolete_files(&self) -> Result<()> {
        if !self.is_read_write() || !self.deletions_enabled() {
            return Ok(());
        }

        let mut versions = self.versions.lock()?;
        let live = versions.live_files();
        let manifest = versions.manifest_number();
        let current_wal = self.current_wal()?.map(|w| w.number());
        let mut log_floor = current_wal.unwrap_or(u64::MAX);
        for cfd in self.column_family_list()? {
            log_floor = log_floor.min(cfd.min_log_number()?);
        }

        let mut candidates = Vec::new();
        let mut newest_options = 0;
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(kind) = name.to_str().and_then(parse_file_name) else {
                continue;
            };
            if let FileType::Options(n) = kind {
                newest_options = newest_options.max(n);
            }
            candidates.push((kind, entry.path()));
        }

        let mut deleted = 0usize;
        for (kind, path) in candidates {
            let obsolete = match kind {
                FileType::Table(n) => !live.contains(&n) && !self.is_pending_output(n),
                FileType::Log(n) => n < log_floor && Some(n) != current_wal,
                FileType::Manifest(n) => n < manifest,
                FileType::Options(n) => n < newest_options,
                FileType::Temp(n) => !self.is_pending_output(n),
                FileType::Current | FileType::Lock => false,
            };
            if !obsolete {
                continue;
            }
            if let FileType::Table(n) = kind {
                self.table_cache.evict(n);
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    deleted += 1;
                    tracing::debug!(file = %path.display(), "Deleted obsolete file");
                }
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "Failed to delete obsolete file");
                }
            }
        }
        drop(versions);

        if deleted > 0 {
            tracing::info!(deleted, log_floor, "Purged obsolete files");
        }
        Ok(())
    }
}
