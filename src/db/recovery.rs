//! Opening a database: manifest recovery, WAL replay and startup of the
//! background tasks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use tokio::sync::Notify;

use crate::batch::WriteBatch;
use crate::config::{ColumnFamilyOptions, Options, WalRecoveryMode};
use crate::error::Result;
use crate::filename::{current_file_name, lock_file_name, log_file_name, parse_file_name, FileType};
use crate::flock::FileLock;
use crate::manifest::VersionEdit;
use crate::memtable::Memtable;
use crate::scheduler::Scheduler;
use crate::snapshot::SnapshotList;
use crate::sstable::BlockCache;
use crate::statistics::Statistics;
use crate::table_cache::TableCache;
use crate::types::SequenceNumber;
use crate::version::set::{DEFAULT_COLUMN_FAMILY_ID, DEFAULT_COLUMN_FAMILY_NAME};
use crate::version::VersionSet;
use crate::wal::{Wal, WalReader};
use crate::Error;

use super::tasks::{CompactionTask, FlushTask, PurgeTask, StatsTask};
use super::write::{MemtableInserter, WriteQueue};
use super::{wal_numbers, ColumnFamilyData, ColumnFamilyDescriptor, ColumnFamilyHandle, Db, DbInner, OpenMode};

/// Replays every log at or above the oldest column family log number into
/// the active memtables of `cfs`. Returns the highest sequence number seen
/// and how many logs were read.
fn replay_logs(
    dir: &Path,
    mode: WalRecoveryMode,
    versions: &VersionSet,
    cfs: &BTreeMap<u32, Arc<ColumnFamilyData>>,
) -> Result<(SequenceNumber, usize)> {
    let log_numbers: HashMap<u32, u64> = versions
        .column_families()
        .map(|state| (state.id, state.log_number))
        .collect();
    let min_log = versions.min_log_number();
    let mut last_sequence = versions.last_sequence();
    let mut replayed = 0usize;

    for log in wal_numbers(dir)?.into_iter().filter(|n| *n >= min_log) {
        let mut reader = WalReader::open(&log_file_name(dir, log), mode)?;
        let mut records = 0u64;
        while let Some(record) = reader.next_record()? {
            let batch = WriteBatch::from_data(record)?;
            let seq = batch.sequence();
            let mut inserter = MemtableInserter::for_recovery(cfs, seq, &log_numbers, log);
            batch.iterate(&mut inserter)?;
            if batch.count() > 0 {
                last_sequence = last_sequence.max(seq + batch.count() as u64 - 1);
            }
            records += 1;
        }
        replayed += 1;
        tracing::debug!(log_number = log, records, "Replayed WAL");
        if mode == WalRecoveryMode::PointInTime && reader.stopped_early() {
            tracing::warn!(log_number = log, "Stopped recovery at the first damaged log");
            break;
        }
    }
    Ok((last_sequence, replayed))
}

/// Column family objects for every family in `versions`, each with an
/// empty memtable bound to its recorded log number.
fn column_families_from(versions: &VersionSet, next_memtable_id: &mut u64) -> BTreeMap<u32, Arc<ColumnFamilyData>> {
    versions
        .column_families()
        .map(|state| {
            let mem = Memtable::new(*next_memtable_id, state.options.comparator.clone(), state.log_number);
            *next_memtable_id += 1;
            let cfd = ColumnFamilyData::new(
                state.id,
                state.name.clone(),
                Arc::clone(&state.options),
                Arc::clone(&state.current),
                Arc::new(mem),
            );
            (state.id, Arc::new(cfd))
        })
        .collect()
}

fn mark_existing_files(dir: &Path, versions: &mut VersionSet) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        match entry.file_name().to_str().and_then(parse_file_name) {
            Some(FileType::Log(n))
            | Some(FileType::Table(n))
            | Some(FileType::Manifest(n))
            | Some(FileType::Options(n))
            | Some(FileType::Temp(n)) => versions.mark_file_number_used(n),
            _ => {}
        }
    }
    Ok(())
}

fn with_default(options: &Options, mut descriptors: Vec<ColumnFamilyDescriptor>) -> Result<Vec<ColumnFamilyDescriptor>> {
    if !descriptors.iter().any(|d| d.name == DEFAULT_COLUMN_FAMILY_NAME) {
        descriptors.insert(
            0,
            ColumnFamilyDescriptor::new(DEFAULT_COLUMN_FAMILY_NAME, options.cf_options.clone()),
        );
    }
    let mut seen = BTreeSet::new();
    for d in &descriptors {
        if d.options.num_levels == 0 {
            return Err(Error::InvalidArgument(format!(
                "column family {} needs at least one level",
                d.name
            )));
        }
        if !seen.insert(d.name.as_str()) {
            return Err(Error::InvalidArgument(format!("column family {} given twice", d.name)));
        }
    }
    Ok(descriptors)
}

impl DbInner {
    #[allow(clippy::too_many_arguments)]
    fn new(
        path: PathBuf,
        options: Options,
        mode: OpenMode,
        lock: Option<FileLock>,
        table_cache: Arc<TableCache>,
        block_cache: Arc<BlockCache>,
        versions: VersionSet,
        cfs: BTreeMap<u32, Arc<ColumnFamilyData>>,
        last_sequence: SequenceNumber,
        next_memtable_id: u64,
    ) -> Self {
        Self {
            path,
            options,
            mode,
            _lock: lock,
            block_cache,
            table_cache,
            versions: Mutex::new(versions),
            column_families: RwLock::new(cfs),
            wal: Mutex::new(None),
            write_queue: WriteQueue::default(),
            write_lock: Mutex::new(()),
            last_sequence: AtomicU64::new(last_sequence),
            next_memtable_id: AtomicU64::new(next_memtable_id),
            has_unpersisted_data: AtomicBool::new(false),
            snapshots: SnapshotList::new(),
            stats: Statistics::new(),
            tracer: Mutex::new(None),
            bg_error: Mutex::new(None),
            bg_paused: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            running_compactions: AtomicUsize::new(0),
            compaction_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
            deletions_disabled: AtomicUsize::new(0),
            pending_outputs: Mutex::new(BTreeSet::new()),
            stall_mu: Mutex::new(()),
            stall_cv: Condvar::new(),
            flush_wake: Arc::new(Notify::new()),
            compaction_wake: Arc::new(Notify::new()),
        }
    }

    /// Makes the recovered state durable on its own: writes a fresh
    /// manifest, creates requested families, flushes replayed memtables
    /// to level 0 and starts a new WAL that every family points at.
    fn finish_read_write_recovery(&self, descriptors: &[ColumnFamilyDescriptor]) -> Result<()> {
        let last_sequence = self.last_sequence();
        let new_log = {
            let mut versions = self.versions.lock()?;
            versions.write_snapshot()?;
            versions.new_file_number()
        };

        for d in descriptors {
            let exists = self.versions.lock()?.column_family_by_name(&d.name).is_some();
            if exists {
                continue;
            }
            if !self.options.create_missing_column_families {
                return Err(Error::InvalidArgument(format!(
                    "column family {} does not exist, set create_missing_column_families",
                    d.name
                )));
            }
            let options = Arc::new(d.options.clone());
            let mut versions = self.versions.lock()?;
            let id = versions.create_column_family(&d.name, Arc::clone(&options), new_log, last_sequence)?;
            let version = versions
                .current(id)
                .ok_or_else(|| Error::Corruption(format!("column family {} has no version", id)))?;
            drop(versions);
            let mem = Arc::new(self.new_memtable(&options, new_log));
            let cfd = Arc::new(ColumnFamilyData::new(id, d.name.clone(), options, version, mem));
            self.column_families.write()?.insert(id, cfd);
            tracing::info!(cf = id, name = %d.name, "Created missing column family");
        }

        let mut edits = Vec::new();
        let mut outputs = Vec::new();
        let cfds = self.column_family_list()?;
        for cfd in &cfds {
            let active = cfd.active_memtable()?;
            if !active.is_empty() {
                if let Some(meta) = self.write_level0_table(cfd, &[active])? {
                    outputs.push(meta.number);
                    edits.push(VersionEdit::AddFile {
                        cf: cfd.id(),
                        level: 0,
                        meta,
                    });
                }
            }
            edits.push(VersionEdit::LogNumber {
                cf: cfd.id(),
                number: new_log,
            });
        }

        let applied = (|| -> Result<()> {
            let mut versions = self.versions.lock()?;
            versions.log_and_apply(edits, last_sequence)?;
            for cfd in &cfds {
                if let Some(version) = versions.current(cfd.id()) {
                    let fresh = Arc::new(self.new_memtable(cfd.options(), new_log));
                    cfd.reset_memtables(fresh, Vec::new(), version)?;
                }
            }
            Ok(())
        })();
        self.release_outputs(&outputs);
        applied?;

        let wal = Wal::create(log_file_name(&self.path, new_log), new_log)?;
        *self.wal.lock()? = Some(Arc::new(wal));
        tracing::info!(wal = new_log, flushed = outputs.len(), "Recovered WAL contents");
        Ok(())
    }
}

impl Db {
    /// Opens the database at `path` with only the default column family.
    pub fn open(options: &Options, path: impl AsRef<Path>) -> Result<Self> {
        Self::open_cf(options, path, Vec::new())
    }

    /// Opens the database with the listed column families. Every family
    /// stored in the database has to be listed; the default one is added
    /// when missing.
    pub fn open_cf(options: &Options, path: impl AsRef<Path>, descriptors: Vec<ColumnFamilyDescriptor>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let descriptors = with_default(options, descriptors)?;

        let exists = current_file_name(&path).exists();
        if exists && options.error_if_exists {
            return Err(Error::InvalidArgument(format!("{} already exists", path.display())));
        }
        if !exists {
            if !options.create_if_missing {
                return Err(Error::InvalidArgument(format!(
                    "{} does not exist, set create_if_missing",
                    path.display()
                )));
            }
            fs::create_dir_all(&path)?;
        }
        let lock = FileLock::lock(lock_file_name(&path)).map_err(Error::LockError)?;

        let families: HashMap<String, Arc<ColumnFamilyOptions>> = descriptors
            .iter()
            .map(|d| (d.name.clone(), Arc::new(d.options.clone())))
            .collect();
        let mut versions = if exists {
            VersionSet::recover(&path, options.max_manifest_file_size, &families, true)?
        } else {
            let default = families
                .get(DEFAULT_COLUMN_FAMILY_NAME)
                .cloned()
                .unwrap_or_else(|| Arc::new(options.cf_options.clone()));
            let mut fresh = VersionSet::new_database(&path, options.max_manifest_file_size, default);
            fresh.write_snapshot()?;
            tracing::info!(path = %path.display(), "Created new database");
            fresh
        };
        mark_existing_files(&path, &mut versions)?;

        let inner = Self::recover_into(path, options, OpenMode::ReadWrite, Some(lock), versions)?;
        inner.finish_read_write_recovery(&descriptors)?;
        inner.write_options_file()?;
        Self::start(inner, true)
    }

    /// Opens without writing anything. WAL contents are replayed into
    /// memory only. Unlisted column families stay closed.
    pub fn open_read_only(
        options: &Options,
        path: impl AsRef<Path>,
        descriptors: Vec<ColumnFamilyDescriptor>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let descriptors = with_default(options, descriptors)?;
        let versions = Self::recover_existing(options, &path, &descriptors)?;
        let inner = Self::recover_into(path, options, OpenMode::ReadOnly, None, versions)?;
        Self::start(inner, false)
    }

    /// Opens a read-only follower of the database at `primary`, which may
    /// be open in another process. [`Db::try_catch_up_with_primary`] picks
    /// up its later changes.
    pub fn open_as_secondary(
        options: &Options,
        primary: impl AsRef<Path>,
        secondary: impl AsRef<Path>,
        descriptors: Vec<ColumnFamilyDescriptor>,
    ) -> Result<Self> {
        let path = primary.as_ref().to_path_buf();
        let secondary_path = secondary.as_ref().to_path_buf();
        fs::create_dir_all(&secondary_path)?;
        let descriptors = with_default(options, descriptors)?;
        let versions = Self::recover_existing(options, &path, &descriptors)?;
        let inner = Self::recover_into(path, options, OpenMode::Secondary { secondary_path }, None, versions)?;
        Self::start(inner, false)
    }

    fn recover_existing(options: &Options, path: &Path, descriptors: &[ColumnFamilyDescriptor]) -> Result<VersionSet> {
        if !current_file_name(path).exists() {
            return Err(Error::NotFound(format!("no database at {}", path.display())));
        }
        let families: HashMap<String, Arc<ColumnFamilyOptions>> = descriptors
            .iter()
            .map(|d| (d.name.clone(), Arc::new(d.options.clone())))
            .collect();
        let versions = VersionSet::recover(path, options.max_manifest_file_size, &families, false)?;
        for d in descriptors {
            if versions.column_family_by_name(&d.name).is_none() {
                return Err(Error::InvalidArgument(format!("column family {} does not exist", d.name)));
            }
        }
        Ok(versions)
    }

    /// Builds the shared state from recovered versions and replays logs.
    fn recover_into(
        path: PathBuf,
        options: &Options,
        mode: OpenMode,
        lock: Option<FileLock>,
        versions: VersionSet,
    ) -> Result<Arc<DbInner>> {
        let block_cache = Arc::new(BlockCache::new(
            options.block_cache_capacity,
            options.block_cache_shard_bits,
            options.high_pri_pool_ratio,
            options.strict_cache_capacity,
        ));
        let table_cache = Arc::new(TableCache::new(&path, Arc::clone(&block_cache)));

        let mut next_memtable_id = 1u64;
        let cfs = column_families_from(&versions, &mut next_memtable_id);
        let (last_sequence, logs) = replay_logs(&path, options.wal_recovery_mode, &versions, &cfs)?;
        tracing::info!(
            path = %path.display(),
            mode = ?mode,
            families = cfs.len(),
            logs,
            last_sequence,
            "Recovered database"
        );

        Ok(Arc::new(DbInner::new(
            path,
            options.clone(),
            mode,
            lock,
            table_cache,
            block_cache,
            versions,
            cfs,
            last_sequence,
            next_memtable_id,
        )))
    }

    fn start(inner: Arc<DbInner>, background: bool) -> Result<Self> {
        let default = inner.column_family(DEFAULT_COLUMN_FAMILY_ID)?;
        let mut db = Db {
            inner: Arc::clone(&inner),
            default_cf: ColumnFamilyHandle::new(default),
            scheduler: None,
            runtime: None,
            closed: false,
        };
        if !background {
            return Ok(db);
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(inner.options.max_background_jobs.max(1))
            .thread_name("cinderdb-bg")
            .enable_all()
            .build()?;
        let scheduler = Scheduler::new();
        {
            let _context = runtime.enter();
            scheduler
                .register(Arc::new(FlushTask::new(Arc::clone(&inner))))
                .register(Arc::new(CompactionTask::new(Arc::clone(&inner))))
                .register(Arc::new(PurgeTask::new(Arc::clone(&inner))))
                .register(Arc::new(StatsTask::new(Arc::clone(&inner))));
        }
        db.scheduler = Some(scheduler);
        db.runtime = Some(runtime);

        inner.purge_obsolete_files()?;
        inner.compaction_wake.notify_one();
        tracing::info!(path = %inner.path.display(), "Opened database");
        Ok(db)
    }

    /// Re-reads the primary's manifest and logs so reads observe its
    /// latest state.
    pub fn try_catch_up_with_primary(&self) -> Result<()> {
        let inner = &self.inner;
        if !matches!(inner.mode, OpenMode::Secondary { .. }) {
            return Err(Error::NotSupported("only secondary instances catch up".into()));
        }
        let current = inner.column_family_list()?;
        let families: HashMap<String, Arc<ColumnFamilyOptions>> = current
            .iter()
            .map(|cfd| (cfd.name().to_string(), Arc::clone(cfd.options())))
            .collect();
        let mut versions = VersionSet::recover(&inner.path, inner.options.max_manifest_file_size, &families, false)?;
        mark_existing_files(&inner.path, &mut versions)?;

        let mut next_memtable_id = inner.next_memtable_id.load(Ordering::Relaxed);
        let staged = column_families_from(&versions, &mut next_memtable_id);
        inner.next_memtable_id.store(next_memtable_id, Ordering::Relaxed);
        let (last_sequence, logs) = replay_logs(&inner.path, inner.options.wal_recovery_mode, &versions, &staged)?;

        let mut cfs = inner.column_families.write()?;
        for cfd in &current {
            match (versions.current(cfd.id()), staged.get(&cfd.id())) {
                (Some(version), Some(fresh)) => {
                    cfd.reset_memtables(fresh.active_memtable()?, Vec::new(), version)?;
                }
                _ => {
                    cfd.set_dropped();
                    cfs.remove(&cfd.id());
                    tracing::info!(cf = cfd.id(), name = cfd.name(), "Column family dropped by primary");
                }
            }
        }
        drop(cfs);
        *inner.versions.lock()? = versions;
        inner.last_sequence.store(last_sequence, Ordering::Release);
        tracing::info!(last_sequence, logs, "Caught up with primary");
        Ok(())
    }
}
