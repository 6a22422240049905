use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::comparator::{self, ComparatorRef};
use crate::compaction_filter::CompactionFilterRef;
use crate::merge::MergeOperatorRef;
use crate::snapshot::Snapshot;
use crate::types::SequenceNumber;

/// How WAL corruption is treated during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecoveryMode {
    /// Ignore a corrupted record only at the very end of the last log.
    TolerateCorruptedTailRecords,
    /// Fail on any corruption, including a torn tail.
    AbsoluteConsistency,
    /// Stop replaying at the first bad record.
    PointInTime,
    /// Skip bad records and keep going.
    SkipAnyCorruptedRecords,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionType {
    None,
    Zstd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompactionStyle {
    /// Non-overlapping files per level, one file pushed down at a time.
    Level,
    /// Whole levels merged into the next once they hold enough tables.
    Tiered,
}

/// Database-wide configuration.
#[derive(Debug, Clone)]
pub struct Options {
    pub create_if_missing: bool,

    pub create_missing_column_families: bool,

    pub error_if_exists: bool,

    /// Verify block checksums on every read and fail recovery on any
    /// inconsistency (default: true)
    pub paranoid_checks: bool,

    /// Worker threads for flush and compaction (default: 2)
    pub max_background_jobs: usize,

    /// How often to check for flush opportunities (default: 1s)
    pub flush_interval: Duration,

    /// How often to check for compaction opportunities (default: 1s)
    pub compaction_interval: Duration,

    /// How often obsolete WAL and SST files are purged (default: 10s)
    pub purge_interval: Duration,

    /// How often statistics are logged (default: 600s)
    pub stats_dump_period: Duration,

    /// Block cache capacity in bytes (default: 8MB)
    pub block_cache_capacity: usize,

    pub block_cache_shard_bits: u32,

    /// Share of the block cache reserved for index and filter blocks
    pub high_pri_pool_ratio: f64,

    /// Reject inserts instead of overshooting capacity
    pub strict_cache_capacity: bool,

    /// Rewrite the manifest once it grows past this size (default: 1GB)
    pub max_manifest_file_size: u64,

    pub wal_recovery_mode: WalRecoveryMode,

    /// Leave WAL buffers in memory until `flush_wal` is called
    pub manual_wal_flush: bool,

    /// Upper bound on the bytes a write group leader collects (default: 1MB)
    pub max_write_batch_group_size_bytes: usize,

    pub avoid_flush_during_shutdown: bool,

    /// Options of the default column family
    pub cf_options: ColumnFamilyOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            create_missing_column_families: false,
            error_if_exists: false,
            paranoid_checks: true,
            max_background_jobs: 2,
            flush_interval: Duration::from_secs(1),
            compaction_interval: Duration::from_secs(1),
            purge_interval: Duration::from_secs(10),
            stats_dump_period: Duration::from_secs(600),
            block_cache_capacity: 8 * 1024 * 1024, // 8MB
            block_cache_shard_bits: 4,
            high_pri_pool_ratio: 0.5,
            strict_cache_capacity: false,
            max_manifest_file_size: 1024 * 1024 * 1024, // 1GB
            wal_recovery_mode: WalRecoveryMode::PointInTime,
            manual_wal_flush: false,
            max_write_batch_group_size_bytes: 1024 * 1024, // 1MB
            avoid_flush_during_shutdown: false,
            cf_options: ColumnFamilyOptions::default(),
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_if_missing(mut self, enabled: bool) -> Self {
        self.create_if_missing = enabled;
        self
    }

    pub fn create_missing_column_families(mut self, enabled: bool) -> Self {
        self.create_missing_column_families = enabled;
        self
    }

    pub fn error_if_exists(mut self, enabled: bool) -> Self {
        self.error_if_exists = enabled;
        self
    }

    pub fn paranoid_checks(mut self, enabled: bool) -> Self {
        self.paranoid_checks = enabled;
        self
    }

    pub fn max_background_jobs(mut self, jobs: usize) -> Self {
        self.max_background_jobs = jobs.max(1);
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    pub fn purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }

    pub fn stats_dump_period(mut self, period: Duration) -> Self {
        self.stats_dump_period = period;
        self
    }

    pub fn block_cache_capacity(mut self, bytes: usize) -> Self {
        self.block_cache_capacity = bytes;
        self
    }

    pub fn block_cache_shard_bits(mut self, bits: u32) -> Self {
        self.block_cache_shard_bits = bits.min(8);
        self
    }

    pub fn high_pri_pool_ratio(mut self, ratio: f64) -> Self {
        self.high_pri_pool_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn strict_cache_capacity(mut self, enabled: bool) -> Self {
        self.strict_cache_capacity = enabled;
        self
    }

    pub fn max_manifest_file_size(mut self, bytes: u64) -> Self {
        self.max_manifest_file_size = bytes;
        self
    }

    pub fn wal_recovery_mode(mut self, mode: WalRecoveryMode) -> Self {
        self.wal_recovery_mode = mode;
        self
    }

    pub fn manual_wal_flush(mut self, enabled: bool) -> Self {
        self.manual_wal_flush = enabled;
        self
    }

    pub fn max_write_batch_group_size_bytes(mut self, bytes: usize) -> Self {
        self.max_write_batch_group_size_bytes = bytes;
        self
    }

    pub fn avoid_flush_during_shutdown(mut self, enabled: bool) -> Self {
        self.avoid_flush_during_shutdown = enabled;
        self
    }

    pub fn cf_options(mut self, options: ColumnFamilyOptions) -> Self {
        self.cf_options = options;
        self
    }
}

/// Tiered compaction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Size ratio threshold for tiered compaction (default: 10)
    /// When the combined size of tables at level N is >= size_ratio * size of level N+1,
    /// compact level N to level N+1
    pub size_ratio_threshold: u32,

    /// Maximum number of tables per level in tiered compaction (default: 10)
    pub max_tables_per_level: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            size_ratio_threshold: 10,
            max_tables_per_level: 10,
        }
    }
}

impl CompactionConfig {
    pub fn size_ratio_threshold(mut self, ratio: u32) -> Self {
        self.size_ratio_threshold = ratio;
        self
    }

    pub fn max_tables_per_level(mut self, max_tables: usize) -> Self {
        self.max_tables_per_level = max_tables;
        self
    }
}

/// Per column family configuration.
#[derive(Clone)]
pub struct ColumnFamilyOptions {
    pub comparator: ComparatorRef,
    pub merge_operator: Option<MergeOperatorRef>,
    pub compaction_filter: Option<CompactionFilterRef>,

    /// Memtable size that triggers a switch to a new memtable (default: 64MB)
    pub write_buffer_size: usize,

    /// Active plus immutable memtables allowed before writes stall (default: 2)
    pub max_write_buffer_number: usize,

    pub level0_file_num_compaction_trigger: usize,
    pub level0_slowdown_writes_trigger: usize,
    pub level0_stop_writes_trigger: usize,

    pub num_levels: usize,

    /// Target size of level 1 (default: 256MB)
    pub max_bytes_for_level_base: u64,
    pub max_bytes_for_level_multiplier: f64,

    /// Compaction output files are cut at this size (default: 64MB)
    pub target_file_size_base: u64,

    pub compaction_style: CompactionStyle,
    pub compaction: CompactionConfig,
    pub disable_auto_compactions: bool,

    /// Uncompressed data block size (default: 4KB)
    pub block_size: usize,
    pub block_restart_interval: usize,

    /// Bloom filter density; zero disables the filter (default: 10)
    pub bloom_bits_per_key: usize,

    pub compression: CompressionType,

    /// Load index and filter blocks through the block cache at high priority
    pub cache_index_and_filter_blocks: bool,
}

impl Default for ColumnFamilyOptions {
    fn default() -> Self {
        Self {
            comparator: comparator::bytewise(),
            merge_operator: None,
            compaction_filter: None,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
            max_write_buffer_number: 2,
            level0_file_num_compaction_trigger: 4,
            level0_slowdown_writes_trigger: 20,
            level0_stop_writes_trigger: 36,
            num_levels: 7,
            max_bytes_for_level_base: 256 * 1024 * 1024, // 256MB
            max_bytes_for_level_multiplier: 10.0,
            target_file_size_base: 64 * 1024 * 1024, // 64MB
            compaction_style: CompactionStyle::Level,
            compaction: CompactionConfig::default(),
            disable_auto_compactions: false,
            block_size: 4 * 1024, // 4KB
            block_restart_interval: 16,
            bloom_bits_per_key: 10,
            compression: CompressionType::None,
            cache_index_and_filter_blocks: false,
        }
    }
}

impl fmt::Debug for ColumnFamilyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnFamilyOptions")
            .field("comparator", &self.comparator.name())
            .field(
                "merge_operator",
                &self.merge_operator.as_ref().map(|op| op.name().to_string()),
            )
            .field(
                "compaction_filter",
                &self.compaction_filter.as_ref().map(|cf| cf.name().to_string()),
            )
            .field("write_buffer_size", &self.write_buffer_size)
            .field("max_write_buffer_number", &self.max_write_buffer_number)
            .field("num_levels", &self.num_levels)
            .field("compaction_style", &self.compaction_style)
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

impl ColumnFamilyOptions {
    pub fn comparator(mut self, comparator: ComparatorRef) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn merge_operator(mut self, operator: MergeOperatorRef) -> Self {
        self.merge_operator = Some(operator);
        self
    }

    pub fn compaction_filter(mut self, filter: CompactionFilterRef) -> Self {
        self.compaction_filter = Some(filter);
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn max_write_buffer_number(mut self, count: usize) -> Self {
        self.max_write_buffer_number = count.max(2);
        self
    }

    pub fn level0_file_num_compaction_trigger(mut self, count: usize) -> Self {
        self.level0_file_num_compaction_trigger = count.max(1);
        self
    }

    pub fn level0_slowdown_writes_trigger(mut self, count: usize) -> Self {
        self.level0_slowdown_writes_trigger = count;
        self
    }

    pub fn level0_stop_writes_trigger(mut self, count: usize) -> Self {
        self.level0_stop_writes_trigger = count;
        self
    }

    pub fn num_levels(mut self, levels: usize) -> Self {
        self.num_levels = levels.max(2);
        self
    }

    pub fn max_bytes_for_level_base(mut self, bytes: u64) -> Self {
        self.max_bytes_for_level_base = bytes;
        self
    }

    pub fn max_bytes_for_level_multiplier(mut self, multiplier: f64) -> Self {
        self.max_bytes_for_level_multiplier = multiplier;
        self
    }

    pub fn target_file_size_base(mut self, bytes: u64) -> Self {
        self.target_file_size_base = bytes;
        self
    }

    pub fn compaction_style(mut self, style: CompactionStyle) -> Self {
        self.compaction_style = style;
        self
    }

    pub fn compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = config;
        self
    }

    pub fn disable_auto_compactions(mut self, disabled: bool) -> Self {
        self.disable_auto_compactions = disabled;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size.max(64);
        self
    }

    pub fn block_restart_interval(mut self, interval: usize) -> Self {
        self.block_restart_interval = interval.max(1);
        self
    }

    pub fn bloom_bits_per_key(mut self, bits: usize) -> Self {
        self.bloom_bits_per_key = bits;
        self
    }

    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    pub fn cache_index_and_filter_blocks(mut self, enabled: bool) -> Self {
        self.cache_index_and_filter_blocks = enabled;
        self
    }

    /// Target size in bytes of `level` (level 0 is governed by file count).
    pub fn max_bytes_for_level(&self, level: usize) -> u64 {
        if level <= 1 {
            return self.max_bytes_for_level_base;
        }
        let mut bytes = self.max_bytes_for_level_base as f64;
        for _ in 1..level {
            bytes *= self.max_bytes_for_level_multiplier;
        }
        bytes as u64
    }
}

/// Per-read settings.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub snapshot: Option<SequenceNumber>,
    pub verify_checksums: bool,
    pub fill_cache: bool,
    /// Iterators read at least this many bytes per table file read.
    pub readahead_size: usize,
    /// Inclusive lower bound for iterators.
    pub iterate_lower_bound: Option<Vec<u8>>,
    /// Exclusive upper bound for iterators.
    pub iterate_upper_bound: Option<Vec<u8>>,
    pub deadline: Option<Instant>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            snapshot: None,
            verify_checksums: true,
            fill_cache: true,
            readahead_size: 0,
            iterate_lower_bound: None,
            iterate_upper_bound: None,
            deadline: None,
        }
    }
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(mut self, snapshot: &Snapshot<'_>) -> Self {
        self.snapshot = Some(snapshot.sequence());
        self
    }

    pub fn verify_checksums(mut self, enabled: bool) -> Self {
        self.verify_checksums = enabled;
        self
    }

    pub fn fill_cache(mut self, enabled: bool) -> Self {
        self.fill_cache = enabled;
        self
    }

    pub fn readahead_size(mut self, bytes: usize) -> Self {
        self.readahead_size = bytes;
        self
    }

    pub fn iterate_lower_bound(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.iterate_lower_bound = Some(key.into());
        self
    }

    pub fn iterate_upper_bound(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.iterate_upper_bound = Some(key.into());
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Per-write settings.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// fsync the WAL before acknowledging
    pub sync: bool,
    pub disable_wal: bool,
    /// Fail with `Incomplete` instead of stalling
    pub no_slowdown: bool,
    pub deadline: Option<Instant>,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync(mut self, enabled: bool) -> Self {
        self.sync = enabled;
        self
    }

    pub fn disable_wal(mut self, disabled: bool) -> Self {
        self.disable_wal = disabled;
        self
    }

    pub fn no_slowdown(mut self, enabled: bool) -> Self {
        self.no_slowdown = enabled;
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone)]
pub struct FlushOptions {
    /// Block until the flush is installed (default: true)
    pub wait: bool,
    pub allow_write_stall: bool,
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self {
            wait: true,
            allow_write_stall: false,
        }
    }
}

impl FlushOptions {
    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn allow_write_stall(mut self, allow: bool) -> Self {
        self.allow_write_stall = allow;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BottommostLevelCompaction {
    Skip,
    IfHaveCompactionFilter,
    Force,
}

#[derive(Debug, Clone)]
pub struct CompactRangeOptions {
    pub exclusive_manual_compaction: bool,
    /// Move the result to `target_level` once compacted.
    pub change_level: bool,
    pub target_level: Option<usize>,
    pub bottommost_level_compaction: BottommostLevelCompaction,
}

impl Default for CompactRangeOptions {
    fn default() -> Self {
        Self {
            exclusive_manual_compaction: true,
            change_level: false,
            target_level: None,
            bottommost_level_compaction: BottommostLevelCompaction::IfHaveCompactionFilter,
        }
    }
}

impl CompactRangeOptions {
    pub fn change_level(mut self, enabled: bool) -> Self {
        self.change_level = enabled;
        self
    }

    pub fn target_level(mut self, level: usize) -> Self {
        self.target_level = Some(level);
        self
    }

    pub fn bottommost_level_compaction(mut self, mode: BottommostLevelCompaction) -> Self {
        self.bottommost_level_compaction = mode;
        self
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Hard-link the files instead of copying them
    pub move_files: bool,
    pub snapshot_consistency: bool,
    /// Flush an overlapping memtable instead of failing
    pub allow_blocking_flush: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            move_files: false,
            snapshot_consistency: true,
            allow_blocking_flush: true,
        }
    }
}

impl IngestOptions {
    pub fn move_files(mut self, enabled: bool) -> Self {
        self.move_files = enabled;
        self
    }

    pub fn allow_blocking_flush(mut self, enabled: bool) -> Self {
        self.allow_blocking_flush = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::StringAppendOperator;
    use std::sync::Arc;

    #[test]
    fn test_default_config() {
        let options = Options::default();
        assert!(!options.create_if_missing);
        assert!(options.paranoid_checks);
        assert_eq!(options.block_cache_capacity, 8 * 1024 * 1024);
        assert_eq!(options.wal_recovery_mode, WalRecoveryMode::PointInTime);

        let cf = options.cf_options;
        assert_eq!(cf.write_buffer_size, 64 * 1024 * 1024);
        assert_eq!(cf.level0_file_num_compaction_trigger, 4);
        assert_eq!(cf.num_levels, 7);
        assert_eq!(cf.compaction_style, CompactionStyle::Level);
        assert_eq!(cf.compaction.size_ratio_threshold, 10);
        assert_eq!(cf.compaction.max_tables_per_level, 10);
        assert_eq!(cf.comparator.name(), "cinderdb.BytewiseComparator");
    }

    #[test]
    fn test_config_builder() {
        let options = Options::new()
            .create_if_missing(true)
            .max_background_jobs(4)
            .flush_interval(Duration::from_millis(500))
            .compaction_interval(Duration::from_secs(5))
            .purge_interval(Duration::from_secs(15))
            .cf_options(
                ColumnFamilyOptions::default()
                    .write_buffer_size(1024)
                    .max_write_buffer_number(1)
                    .merge_operator(Arc::new(StringAppendOperator::default()))
                    .compaction(CompactionConfig::default().max_tables_per_level(8)),
            );

        assert!(options.create_if_missing);
        assert_eq!(options.max_background_jobs, 4);
        assert_eq!(options.flush_interval, Duration::from_millis(500));
        assert_eq!(options.compaction_interval, Duration::from_secs(5));
        assert_eq!(options.purge_interval, Duration::from_secs(15));
        assert_eq!(options.cf_options.write_buffer_size, 1024);
        // clamped: one active plus at least one immutable
        assert_eq!(options.cf_options.max_write_buffer_number, 2);
        assert!(options.cf_options.merge_operator.is_some());
        assert_eq!(options.cf_options.compaction.max_tables_per_level, 8);
    }

    #[test]
    fn test_level_targets_grow_by_multiplier() {
        let cf = ColumnFamilyOptions::default()
            .max_bytes_for_level_base(1000)
            .max_bytes_for_level_multiplier(10.0);
        assert_eq!(cf.max_bytes_for_level(1), 1000);
        assert_eq!(cf.max_bytes_for_level(2), 10_000);
        assert_eq!(cf.max_bytes_for_level(3), 100_000);
    }
}
