//! Persisted options.
//!
//! Every open writes the effective options to `OPTIONS-<n>` as TOML.
//! Callback objects (comparator, merge operator, compaction filter) are
//! recorded by name only.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::comparator;
use crate::config::{
    ColumnFamilyOptions, CompactionConfig, CompactionStyle, CompressionType, Options,
    WalRecoveryMode,
};
use crate::error::Result;
use crate::filename::{options_file_name, parse_file_name, sync_dir, temp_file_name, FileType};
use crate::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbOptionsRecord {
    pub paranoid_checks: bool,
    pub max_background_jobs: usize,
    pub flush_interval_ms: u64,
    pub compaction_interval_ms: u64,
    pub purge_interval_ms: u64,
    pub stats_dump_period_ms: u64,
    pub block_cache_capacity: usize,
    pub block_cache_shard_bits: u32,
    pub high_pri_pool_ratio: f64,
    pub strict_cache_capacity: bool,
    pub max_manifest_file_size: u64,
    pub wal_recovery_mode: WalRecoveryMode,
    pub manual_wal_flush: bool,
    pub max_write_batch_group_size_bytes: usize,
    pub avoid_flush_during_shutdown: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnFamilyRecord {
    pub name: String,
    pub comparator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction_filter: Option<String>,
    pub write_buffer_size: usize,
    pub max_write_buffer_number: usize,
    pub level0_file_num_compaction_trigger: usize,
    pub level0_slowdown_writes_trigger: usize,
    pub level0_stop_writes_trigger: usize,
    pub num_levels: usize,
    pub max_bytes_for_level_base: u64,
    pub max_bytes_for_level_multiplier: f64,
    pub target_file_size_base: u64,
    pub compaction_style: CompactionStyle,
    pub compaction: CompactionConfig,
    pub disable_auto_compactions: bool,
    pub block_size: usize,
    pub block_restart_interval: usize,
    pub bloom_bits_per_key: usize,
    pub compression: CompressionType,
    pub cache_index_and_filter_blocks: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionsFile {
    pub db: DbOptionsRecord,
    pub column_families: Vec<ColumnFamilyRecord>,
}

impl DbOptionsRecord {
    pub fn from_options(options: &Options) -> Self {
        Self {
            paranoid_checks: options.paranoid_checks,
            max_background_jobs: options.max_background_jobs,
            flush_interval_ms: options.flush_interval.as_millis() as u64,
            compaction_interval_ms: options.compaction_interval.as_millis() as u64,
            purge_interval_ms: options.purge_interval.as_millis() as u64,
            stats_dump_period_ms: options.stats_dump_period.as_millis() as u64,
            block_cache_capacity: options.block_cache_capacity,
            block_cache_shard_bits: options.block_cache_shard_bits,
            high_pri_pool_ratio: options.high_pri_pool_ratio,
            strict_cache_capacity: options.strict_cache_capacity,
            max_manifest_file_size: options.max_manifest_file_size,
            wal_recovery_mode: options.wal_recovery_mode,
            manual_wal_flush: options.manual_wal_flush,
            max_write_batch_group_size_bytes: options.max_write_batch_group_size_bytes,
            avoid_flush_during_shutdown: options.avoid_flush_during_shutdown,
        }
    }

    /// Recorded settings on top of `Options::default()`.
    pub fn to_options(&self) -> Options {
        Options {
            paranoid_checks: self.paranoid_checks,
            max_background_jobs: self.max_background_jobs,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            compaction_interval: Duration::from_millis(self.compaction_interval_ms),
            purge_interval: Duration::from_millis(self.purge_interval_ms),
            stats_dump_period: Duration::from_millis(self.stats_dump_period_ms),
            block_cache_capacity: self.block_cache_capacity,
            block_cache_shard_bits: self.block_cache_shard_bits,
            high_pri_pool_ratio: self.high_pri_pool_ratio,
            strict_cache_capacity: self.strict_cache_capacity,
            max_manifest_file_size: self.max_manifest_file_size,
            wal_recovery_mode: self.wal_recovery_mode,
            manual_wal_flush: self.manual_wal_flush,
            max_write_batch_group_size_bytes: self.max_write_batch_group_size_bytes,
            avoid_flush_during_shutdown: self.avoid_flush_during_shutdown,
            ..Options::default()
        }
    }
}

impl ColumnFamilyRecord {
    pub fn from_options(name: &str, options: &ColumnFamilyOptions) -> Self {
        Self {
            name: name.to_string(),
            comparator: options.comparator.name().to_string(),
            merge_operator: options.merge_operator.as_ref().map(|m| m.name().to_string()),
            compaction_filter: options
                .compaction_filter
                .as_ref()
                .map(|f| f.name().to_string()),
            write_buffer_size: options.write_buffer_size,
            max_write_buffer_number: options.max_write_buffer_number,
            level0_file_num_compaction_trigger: options.level0_file_num_compaction_trigger,
            level0_slowdown_writes_trigger: options.level0_slowdown_writes_trigger,
            level0_stop_writes_trigger: options.level0_stop_writes_trigger,
            num_levels: options.num_levels,
            max_bytes_for_level_base: options.max_bytes_for_level_base,
            max_bytes_for_level_multiplier: options.max_bytes_for_level_multiplier,
            target_file_size_base: options.target_file_size_base,
            compaction_style: options.compaction_style,
            compaction: options.compaction.clone(),
            disable_auto_compactions: options.disable_auto_compactions,
            block_size: options.block_size,
            block_restart_interval: options.block_restart_interval,
            bloom_bits_per_key: options.bloom_bits_per_key,
            compression: options.compression,
            cache_index_and_filter_blocks: options.cache_index_and_filter_blocks,
        }
    }

    /// Rebuilds column family options. Built-in comparators are resolved by
    /// name; any other callback has to be set again by the caller.
    pub fn to_options(&self) -> Result<ColumnFamilyOptions> {
        let cmp = if self.comparator == comparator::bytewise().name() {
            comparator::bytewise()
        } else if self.comparator == comparator::reverse_bytewise().name() {
            comparator::reverse_bytewise()
        } else {
            return Err(Error::NotSupported(format!(
                "comparator {} must be supplied by the caller",
                self.comparator
            )));
        };
        Ok(ColumnFamilyOptions {
            comparator: cmp,
            merge_operator: None,
            compaction_filter: None,
            write_buffer_size: self.write_buffer_size,
            max_write_buffer_number: self.max_write_buffer_number,
            level0_file_num_compaction_trigger: self.level0_file_num_compaction_trigger,
            level0_slowdown_writes_trigger: self.level0_slowdown_writes_trigger,
            level0_stop_writes_trigger: self.level0_stop_writes_trigger,
            num_levels: self.num_levels,
            max_bytes_for_level_base: self.max_bytes_for_level_base,
            max_bytes_for_level_multiplier: self.max_bytes_for_level_multiplier,
            target_file_size_base: self.target_file_size_base,
            compaction_style: self.compaction_style,
            compaction: self.compaction.clone(),
            disable_auto_compactions: self.disable_auto_compactions,
            block_size: self.block_size,
            block_restart_interval: self.block_restart_interval,
            bloom_bits_per_key: self.bloom_bits_per_key,
            compression: self.compression,
            cache_index_and_filter_blocks: self.cache_index_and_filter_blocks,
        })
    }
}

/// Writes `OPTIONS-<number>` through a temp file and rename.
pub fn write_options_file(
    dir: &Path,
    number: u64,
    options: &Options,
    families: &[(String, Arc<ColumnFamilyOptions>)],
) -> Result<()> {
    let file = OptionsFile {
        db: DbOptionsRecord::from_options(options),
        column_families: families
            .iter()
            .map(|(name, cf)| ColumnFamilyRecord::from_options(name, cf))
            .collect(),
    };
    let contents = toml::to_string(&file)?;
    let tmp = temp_file_name(dir, number);
    fs::write(&tmp, contents)?;
    if let Err(e) = fs::rename(&tmp, options_file_name(dir, number)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    sync_dir(dir)
}

/// Reads the newest options file of the database at `dir`.
pub fn load_latest_options(dir: impl AsRef<Path>) -> Result<OptionsFile> {
    let dir = dir.as_ref();
    let mut latest = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(FileType::Options(n)) = entry.file_name().to_str().and_then(parse_file_name) {
            latest = latest.max(Some(n));
        }
    }
    let number = latest.ok_or_else(|| {
        Error::NotFound(format!("no options file in {}", dir.display()))
    })?;
    let contents = fs::read_to_string(options_file_name(dir, number))?;
    Ok(toml::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::UInt64AddOperator;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_latest_options_file_wins() -> Result<()> {
        let dir = TempDir::new()?;
        let options = Options::default().max_background_jobs(4);
        let counters = Arc::new(
            ColumnFamilyOptions::default()
                .merge_operator(Arc::new(UInt64AddOperator))
                .compression(CompressionType::Zstd)
                .num_levels(4),
        );

        write_options_file(
            dir.path(),
            3,
            &options,
            &[("default".into(), Arc::new(ColumnFamilyOptions::default()))],
        )?;
        write_options_file(
            dir.path(),
            9,
            &options,
            &[
                ("default".into(), Arc::new(ColumnFamilyOptions::default())),
                ("counters".into(), counters),
            ],
        )?;

        let loaded = load_latest_options(dir.path())?;
        assert_eq!(loaded.db.max_background_jobs, 4);
        assert_eq!(loaded.column_families.len(), 2);
        let record = &loaded.column_families[1];
        assert_eq!(record.name, "counters");
        assert_eq!(record.merge_operator.as_deref(), Some("UInt64AddOperator"));
        assert_eq!(record.compaction_filter, None);

        let rebuilt = record.to_options()?;
        assert_eq!(rebuilt.num_levels, 4);
        assert_eq!(rebuilt.compression, CompressionType::Zstd);
        assert_eq!(loaded.db.to_options().max_background_jobs, 4);
        Ok(())
    }

    #[test]
    fn test_missing_options_file() -> Result<()> {
        let dir = TempDir::new()?;
        assert!(load_latest_options(dir.path()).unwrap_err().is_not_found());
        Ok(())
    }
}
