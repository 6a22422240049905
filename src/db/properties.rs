//! Introspection: named properties, live file listings and size estimates.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use crate::error::Result;
use crate::filename::{log_file_name, manifest_file_name, options_file_name, parse_file_name, FileType};
use crate::statistics::Ticker;
use crate::types::SequenceNumber;

use super::{wal_numbers, ColumnFamilyData, ColumnFamilyHandle, Db, DbInner};

const PREFIX: &str = "cinderdb.";

/// A table file of the current state, as reported to backup tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveFileMetaData {
    pub column_family_name: String,
    pub level: usize,
    /// File name relative to the database directory.
    pub name: String,
    pub size: u64,
    pub smallest_key: Vec<u8>,
    pub largest_key: Vec<u8>,
    pub smallest_seqno: SequenceNumber,
    pub largest_seqno: SequenceNumber,
    pub num_entries: u64,
    pub num_deletions: u64,
}

/// A write-ahead log file still needed by recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub number: u64,
    pub path: PathBuf,
    pub size_bytes: u64,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl DbInner {
    fn int_property_of(&self, cfd: &ColumnFamilyData, name: &str) -> Result<Option<u64>> {
        let Some(name) = name.strip_prefix(PREFIX) else {
            return Ok(None);
        };
        if let Some(level) = name.strip_prefix("num-files-at-level") {
            let Ok(level) = level.parse::<usize>() else {
                return Ok(None);
            };
            let version = cfd.current()?;
            if level >= version.num_levels() {
                return Ok(None);
            }
            return Ok(Some(version.num_files(level) as u64));
        }

        let value = match name {
            "num-immutable-mem-table" => cfd.num_immutables() as u64,
            "cur-size-active-mem-table" => cfd.active_memtable()?.approximate_memory_usage() as u64,
            "estimate-num-keys" => {
                let sv = cfd.super_version()?;
                let mut keys = sv.version.estimated_entries();
                for mem in std::iter::once(&sv.mem).chain(sv.imms.iter()) {
                    keys += mem.num_entries().saturating_sub(2 * mem.num_deletes());
                }
                keys
            }
            "num-snapshots" => self.snapshots.len() as u64,
            "oldest-snapshot-time" => self.snapshots.oldest_time().unwrap_or(0),
            "background-errors" => u64::from(self.background_error().is_some()),
            "total-sst-files-size" => cfd.current()?.total_bytes(),
            "num-live-versions" => self.versions.lock()?.num_live_versions() as u64,
            "is-file-deletions-enabled" => u64::from(self.deletions_enabled()),
            "block-cache-usage" => self.block_cache.usage() as u64,
            "num-running-compactions" => self.running_compactions.load(Ordering::Acquire) as u64,
            _ => return Ok(None),
        };
        Ok(Some(value))
    }

    fn level_stats(&self, cfd: &ColumnFamilyData) -> Result<String> {
        let version = cfd.current()?;
        let mut out = String::from("Level Files Size(MB)\n--------------------\n");
        for level in 0..version.num_levels() {
            let _ = writeln!(
                out,
                "{:>5} {:>5} {:>8.2}",
                level,
                version.num_files(level),
                version.level_bytes(level) as f64 / 1_048_576.0
            );
        }
        Ok(out)
    }

    fn mirror_cache_stats(&self) {
        let cache = self.block_cache.stats();
        self.stats.set(Ticker::BlockCacheHit, cache.hits());
        self.stats.set(Ticker::BlockCacheMiss, cache.misses());
        self.stats.set(Ticker::BlockCacheAdd, cache.inserts());
    }

    fn property_of(&self, cfd: &ColumnFamilyData, name: &str) -> Result<Option<String>> {
        if let Some(value) = self.int_property_of(cfd, name)? {
            return Ok(Some(value.to_string()));
        }
        let Some(short) = name.strip_prefix(PREFIX) else {
            return Ok(None);
        };
        let value = match short {
            "levelstats" => self.level_stats(cfd)?,
            "sstables" => cfd.current()?.debug_string(),
            "stats" => {
                self.mirror_cache_stats();
                let mut out = format!("** Column family {} **\n", cfd.name());
                out.push_str(&self.level_stats(cfd)?);
                out.push_str("\n** Statistics **\n");
                out.push_str(&self.stats.report());
                out
            }
            _ => return Ok(None),
        };
        Ok(Some(value))
    }
}

impl Db {
    pub fn property(&self, name: &str) -> Result<Option<String>> {
        self.property_cf(&self.default_cf, name)
    }

    /// Value of a `cinderdb.*` property, or `None` when the name is unknown.
    pub fn property_cf(&self, cf: &ColumnFamilyHandle, name: &str) -> Result<Option<String>> {
        let cfd = self.resolve(cf)?;
        self.inner.property_of(&cfd, name)
    }

    pub fn int_property(&self, name: &str) -> Result<Option<u64>> {
        self.int_property_cf(&self.default_cf, name)
    }

    /// Numeric properties only.
    pub fn int_property_cf(&self, cf: &ColumnFamilyHandle, name: &str) -> Result<Option<u64>> {
        let cfd = self.resolve(cf)?;
        self.inner.int_property_of(&cfd, name)
    }

    /// Names of the files a backup needs, relative to the database
    /// directory, and the valid size of the manifest. With
    /// `flush_memtable` the memtables are flushed first so no WAL is
    /// needed.
    pub fn get_live_files(&self, flush_memtable: bool) -> Result<(Vec<String>, u64)> {
        let inner = &self.inner;
        if flush_memtable && inner.is_read_write() {
            for cfd in inner.column_family_list()? {
                inner.flush_column_family(&cfd, true)?;
            }
        }

        let mut files = Vec::new();
        for cfd in inner.column_family_list()? {
            let version = cfd.current()?;
            files.extend(version.all_files().map(|(_, f)| format!("{:06}.sst", f.number)));
        }
        let (manifest_number, manifest_size) = {
            let versions = inner.versions.lock()?;
            (versions.manifest_number(), versions.manifest_size())
        };
        files.push("CURRENT".to_string());
        files.push(file_name(&manifest_file_name(&inner.path, manifest_number)));

        let mut newest_options = None;
        for entry in std::fs::read_dir(&inner.path)? {
            if let Some(FileType::Options(n)) = entry?.file_name().to_str().and_then(parse_file_name) {
                newest_options = newest_options.max(Some(n));
            }
        }
        if let Some(n) = newest_options {
            files.push(file_name(&options_file_name(&inner.path, n)));
        }
        Ok((files, manifest_size))
    }

    /// Every table file of every open column family with its level and
    /// key range.
    pub fn get_live_files_metadata(&self) -> Result<Vec<LiveFileMetaData>> {
        let mut out = Vec::new();
        for cfd in self.inner.column_family_list()? {
            let version = cfd.current()?;
            for (level, f) in version.all_files() {
                out.push(LiveFileMetaData {
                    column_family_name: cfd.name().to_string(),
                    level,
                    name: format!("{:06}.sst", f.number),
                    size: f.file_size,
                    smallest_key: f.smallest.user_key.clone(),
                    largest_key: f.largest.user_key.clone(),
                    smallest_seqno: f.global_seqno.unwrap_or(f.smallest_seq),
                    largest_seqno: f.effective_largest_seq(),
                    num_entries: f.num_entries,
                    num_deletions: f.num_deletions,
                });
            }
        }
        Ok(out)
    }

    /// Live WAL files, oldest first.
    pub fn get_sorted_wal_files(&self) -> Result<Vec<LogFile>> {
        let inner = &self.inner;
        let mut floor = u64::MAX;
        for cfd in inner.column_family_list()? {
            floor = floor.min(cfd.min_log_number()?);
        }
        let mut logs = Vec::new();
        for number in wal_numbers(&inner.path)? {
            if number < floor {
                continue;
            }
            let path = log_file_name(&inner.path, number);
            let size_bytes = std::fs::metadata(&path)?.len();
            logs.push(LogFile {
                number,
                path,
                size_bytes,
            });
        }
        Ok(logs)
    }

    /// Approximate table bytes for each `[start, end)` range.
    pub fn get_approximate_sizes<K: AsRef<[u8]>>(&self, cf: &ColumnFamilyHandle, ranges: &[(K, K)]) -> Result<Vec<u64>> {
        let cfd = self.resolve(cf)?;
        let version = cfd.current()?;
        ranges
            .iter()
            .map(|(start, end)| version.approximate_size(&self.inner.table_cache, start.as_ref(), end.as_ref()))
            .collect()
    }

    /// Approximate entry count and bytes held in memtables for `[start, end)`.
    pub fn get_approximate_memtable_stats(
        &self,
        cf: &ColumnFamilyHandle,
        start: impl AsRef<[u8]>,
        end: impl AsRef<[u8]>,
    ) -> Result<(u64, u64)> {
        let cfd = self.resolve(cf)?;
        let sv = cfd.super_version()?;
        let (start, end) = (start.as_ref(), end.as_ref());
        let mut count = 0;
        let mut bytes = 0;
        for mem in std::iter::once(&sv.mem).chain(sv.imms.iter()) {
            let (c, b) = mem.approximate_stats(start, end);
            count += c;
            bytes += b;
        }
        Ok((count, bytes))
    }
}
