//! The database handle.
//!
//! [`Db`] is a thin owner around `DbInner`, which is shared with the
//! background tasks. Foreground calls are synchronous; flush, compaction,
//! purge and statistics dumps run as scheduler tasks on a private tokio
//! runtime and are woken early through `Notify` handles.
//!
//! Lock order, outermost first: write queue leader, `write_lock`,
//! `versions`, a column family's memtable list, its super version.
//! `flush_lock` and `compaction_lock` are taken before `versions` and never
//! while holding `write_lock`, except by ingestion which has to flush
//! under it.

mod checkpoint;
mod column_family;
mod compaction;
mod db_iter;
mod flush;
mod ingest;
mod properties;
mod purge;
mod read;
mod recovery;
mod tasks;
mod write;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::Notify;

use crate::config::{ColumnFamilyOptions, Options};
use crate::error::Result;
use crate::filename::{lock_file_name, parse_file_name, FileType};
use crate::flock::FileLock;
use crate::memtable::Memtable;
use crate::options_file::write_options_file;
use crate::scheduler::Scheduler;
use crate::snapshot::{Snapshot, SnapshotList};
use crate::sstable::{BlockCache, BlockReadOptions};
use crate::statistics::Statistics;
use crate::table_cache::TableCache;
use crate::trace::{TraceOptions, TraceWriter, Tracer};
use crate::types::SequenceNumber;
use crate::version::VersionSet;
use crate::wal::Wal;
use crate::Error;

pub use checkpoint::Checkpoint;
pub use column_family::{ColumnFamilyDescriptor, ColumnFamilyHandle, SuperVersion};
pub use db_iter::DbIterator;
pub use properties::{LiveFileMetaData, LogFile};

pub(crate) use column_family::ColumnFamilyData;
use write::WriteQueue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OpenMode {
    ReadWrite,
    ReadOnly,
    /// Tails the files of another process's database.
    Secondary { secondary_path: PathBuf },
}

struct BackgroundError {
    error: Error,
    stops_writes: bool,
}

pub(crate) struct DbInner {
    pub(crate) path: PathBuf,
    pub(crate) options: Options,
    pub(crate) mode: OpenMode,
    _lock: Option<FileLock>,

    pub(crate) block_cache: Arc<BlockCache>,
    pub(crate) table_cache: Arc<TableCache>,
    pub(crate) versions: Mutex<VersionSet>,
    pub(crate) column_families: RwLock<BTreeMap<u32, Arc<ColumnFamilyData>>>,

    pub(crate) wal: Mutex<Option<Arc<Wal>>>,
    write_queue: WriteQueue,
    pub(crate) write_lock: Mutex<()>,
    /// Highest sequence number visible to readers.
    pub(crate) last_sequence: AtomicU64,
    next_memtable_id: AtomicU64,
    has_unpersisted_data: AtomicBool,

    pub(crate) snapshots: SnapshotList,
    pub(crate) stats: Statistics,
    pub(crate) tracer: Mutex<Option<Tracer>>,

    bg_error: Mutex<Option<BackgroundError>>,
    bg_paused: AtomicUsize,
    pub(crate) shutting_down: AtomicBool,
    pub(crate) running_compactions: AtomicUsize,
    pub(crate) compaction_lock: Mutex<()>,
    pub(crate) flush_lock: Mutex<()>,
    deletions_disabled: AtomicUsize,
    /// Numbers of files being written that no version references yet.
    pending_outputs: Mutex<BTreeSet<u64>>,

    stall_mu: Mutex<()>,
    stall_cv: Condvar,
    pub(crate) flush_wake: Arc<Notify>,
    pub(crate) compaction_wake: Arc<Notify>,
}

impl DbInner {
    pub(crate) fn is_read_write(&self) -> bool {
        self.mode == OpenMode::ReadWrite
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        match self.mode {
            OpenMode::ReadWrite => Ok(()),
            OpenMode::ReadOnly => Err(Error::NotSupported(
                "not supported in read-only mode".into(),
            )),
            OpenMode::Secondary { .. } => Err(Error::NotSupported(
                "not supported in secondary mode".into(),
            )),
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.bg_paused.load(Ordering::Acquire) > 0
    }

    pub(crate) fn next_memtable_id(&self) -> u64 {
        self.next_memtable_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn new_memtable(&self, cf: &ColumnFamilyOptions, log_number: u64) -> Memtable {
        Memtable::new(self.next_memtable_id(), cf.comparator.clone(), log_number)
    }

    pub(crate) fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence.load(Ordering::Acquire)
    }

    pub(crate) fn column_family(&self, id: u32) -> Result<Arc<ColumnFamilyData>> {
        self.column_families
            .read()?
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("column family {} does not exist", id)))
    }

    pub(crate) fn column_family_list(&self) -> Result<Vec<Arc<ColumnFamilyData>>> {
        Ok(self.column_families.read()?.values().cloned().collect())
    }

    /// Allocates a file number that purge leaves alone until released.
    pub(crate) fn new_output_number(&self) -> Result<u64> {
        let number = self.versions.lock()?.new_file_number();
        self.pending_outputs.lock()?.insert(number);
        Ok(number)
    }

    pub(crate) fn release_outputs(&self, numbers: &[u64]) {
        if let Ok(mut pending) = self.pending_outputs.lock() {
            for n in numbers {
                pending.remove(n);
            }
        }
    }

    pub(crate) fn is_pending_output(&self, number: u64) -> bool {
        self.pending_outputs
            .lock()
            .map(|p| p.contains(&number))
            .unwrap_or(true)
    }

    pub(crate) fn deletions_enabled(&self) -> bool {
        self.deletions_disabled.load(Ordering::Acquire) == 0
    }

    pub(crate) fn block_read_options(&self, verify_checksums: bool, fill_cache: bool) -> BlockReadOptions {
        BlockReadOptions {
            verify_checksums: verify_checksums || self.options.paranoid_checks,
            fill_cache,
            readahead_size: 0,
        }
    }

    /// Latches the first background failure. Later failures are logged
    /// only, unless they are the first to stop writes.
    pub(crate) fn set_background_error(&self, error: Error, stops_writes: bool) {
        tracing::error!(error = %error, stops_writes, "Background error");
        if let Ok(mut slot) = self.bg_error.lock() {
            match slot.as_ref() {
                Some(existing) if existing.stops_writes || !stops_writes => {}
                _ => {
                    *slot = Some(BackgroundError {
                        error,
                        stops_writes,
                    })
                }
            }
        }
        self.signal_stall_change();
    }

    pub(crate) fn background_error(&self) -> Option<Error> {
        self.bg_error
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|b| b.error.duplicate()))
    }

    pub(crate) fn stop_writes_error(&self) -> Option<Error> {
        self.bg_error.lock().ok().and_then(|slot| {
            slot.as_ref()
                .filter(|b| b.stops_writes)
                .map(|b| b.error.duplicate())
        })
    }

    fn clear_background_error(&self) {
        if let Ok(mut slot) = self.bg_error.lock() {
            *slot = None;
        }
    }

    /// Wakes writers stalled on flush or compaction progress.
    pub(crate) fn signal_stall_change(&self) {
        let _guard = self.stall_mu.lock();
        self.stall_cv.notify_all();
    }

    pub(crate) fn wait_for_stall_change(&self, timeout: Duration) -> Result<()> {
        let guard = self.stall_mu.lock()?;
        let _ = self.stall_cv.wait_timeout(guard, timeout)?;
        Ok(())
    }

    pub(crate) fn write_options_file(&self) -> Result<()> {
        let families: Vec<(String, Arc<ColumnFamilyOptions>)> = self
            .column_family_list()?
            .iter()
            .map(|cfd| (cfd.name().to_string(), Arc::clone(cfd.options())))
            .collect();
        let number = self.versions.lock()?.new_file_number();
        write_options_file(&self.path, number, &self.options, &families)
    }

    pub(crate) fn current_wal(&self) -> Result<Option<Arc<Wal>>> {
        Ok(self.wal.lock()?.clone())
    }
}

/// An open database.
///
/// Dropping the handle closes the database; [`Db::close`] does the same and
/// reports errors.
pub struct Db {
    inner: Arc<DbInner>,
    default_cf: ColumnFamilyHandle,
    scheduler: Option<Scheduler>,
    runtime: Option<Runtime>,
    closed: bool,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.inner.path)
            .field("mode", &self.inner.mode)
            .finish()
    }
}

impl Db {
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Names of the column families stored in the database at `path`.
    pub fn list_column_families(_options: &Options, path: impl AsRef<Path>) -> Result<Vec<String>> {
        VersionSet::list_column_families(path.as_ref())
    }

    /// Deletes every engine file of a closed database and the directory
    /// itself when nothing else is left in it.
    pub fn destroy(_options: &Options, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(());
        }
        let lock_path = lock_file_name(path);
        let lock = FileLock::lock(&lock_path).map_err(Error::LockError)?;

        let mut removed = 0usize;
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(kind) = name.to_str().and_then(parse_file_name) else {
                continue;
            };
            if kind == FileType::Lock {
                continue;
            }
            fs::remove_file(entry.path())?;
            removed += 1;
        }
        drop(lock);
        let _ = fs::remove_file(&lock_path);
        // only succeeds when the directory is empty
        let _ = fs::remove_dir(path);
        tracing::info!(path = %path.display(), removed, "Destroyed database");
        Ok(())
    }

    pub fn default_cf(&self) -> ColumnFamilyHandle {
        self.default_cf.clone()
    }

    pub fn cf_handle(&self, name: &str) -> Option<ColumnFamilyHandle> {
        self.inner
            .column_families
            .read()
            .ok()?
            .values()
            .find(|cfd| cfd.name() == name)
            .cloned()
            .map(ColumnFamilyHandle::new)
    }

    /// Handles of every open column family, in id order.
    pub fn column_families(&self) -> Result<Vec<ColumnFamilyHandle>> {
        Ok(self
            .inner
            .column_family_list()?
            .into_iter()
            .map(ColumnFamilyHandle::new)
            .collect())
    }

    pub fn create_column_family(&self, name: &str, options: ColumnFamilyOptions) -> Result<ColumnFamilyHandle> {
        let inner = &self.inner;
        inner.check_writable()?;
        if options.num_levels == 0 {
            return Err(Error::InvalidArgument("num_levels must be at least 1".into()));
        }
        let options = Arc::new(options);
        let cfd = {
            let _write = inner.write_lock.lock()?;
            let log_number = inner.current_wal()?.map_or(0, |w| w.number());
            let mut versions = inner.versions.lock()?;
            let id = versions.create_column_family(name, Arc::clone(&options), log_number, inner.last_sequence())?;
            let version = versions
                .current(id)
                .ok_or_else(|| Error::Corruption(format!("column family {} has no version", id)))?;
            drop(versions);

            let mem = Arc::new(inner.new_memtable(&options, log_number));
            let cfd = Arc::new(ColumnFamilyData::new(id, name.to_string(), options, version, mem));
            inner.column_families.write()?.insert(id, Arc::clone(&cfd));
            cfd
        };
        inner.write_options_file()?;
        tracing::info!(cf = cfd.id(), name, "Created column family");
        Ok(ColumnFamilyHandle::new(cfd))
    }

    /// Drops a column family. Existing handles keep reading the data they
    /// can see; its files are deleted once nothing references them.
    pub fn drop_column_family(&self, handle: &ColumnFamilyHandle) -> Result<()> {
        let inner = &self.inner;
        inner.check_writable()?;
        {
            let _write = inner.write_lock.lock()?;
            inner
                .versions
                .lock()?
                .drop_column_family(handle.id(), inner.last_sequence())?;
            handle.cfd.set_dropped();
            inner.column_families.write()?.remove(&handle.id());
        }
        inner.write_options_file()?;
        tracing::info!(cf = handle.id(), name = handle.name(), "Dropped column family");
        Ok(())
    }

    pub(crate) fn resolve(&self, handle: &ColumnFamilyHandle) -> Result<Arc<ColumnFamilyData>> {
        if handle.is_dropped() {
            return Err(Error::InvalidArgument(format!(
                "column family {} was dropped",
                handle.name()
            )));
        }
        Ok(Arc::clone(&handle.cfd))
    }

    /// Pins the current state for reads.
    pub fn snapshot(&self) -> Snapshot<'_> {
        self.inner.snapshots.acquire(self.inner.last_sequence())
    }

    pub fn release_snapshot(&self, snapshot: Snapshot<'_>) {
        drop(snapshot);
    }

    pub fn latest_sequence_number(&self) -> SequenceNumber {
        self.inner.last_sequence()
    }

    pub fn number_levels(&self, cf: &ColumnFamilyHandle) -> usize {
        cf.options().num_levels
    }

    /// Writes buffered WAL records to the file, and syncs it with `sync`.
    pub fn flush_wal(&self, sync: bool) -> Result<()> {
        self.inner.check_writable()?;
        if let Some(wal) = self.inner.current_wal()? {
            if sync {
                wal.sync()?;
                self.inner.stats.record(crate::statistics::Ticker::WalSynced, 1);
            } else {
                wal.flush()?;
            }
        }
        Ok(())
    }

    pub fn sync_wal(&self) -> Result<()> {
        self.flush_wal(true)
    }

    /// Re-reads every block of every live table file and compares the
    /// whole-file checksums.
    pub fn verify_checksum(&self) -> Result<()> {
        let mut verified = 0usize;
        for cfd in self.inner.column_family_list()? {
            let version = cfd.current()?;
            for (_, file) in version.all_files() {
                let table = self.inner.table_cache.find_table(file, cfd.options())?;
                table.verify_checksum()?;
                verified += 1;
            }
        }
        tracing::debug!(files = verified, "Verified table checksums");
        Ok(())
    }

    pub fn disable_file_deletions(&self) -> Result<()> {
        let count = self.inner.deletions_disabled.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(count, "File deletions disabled");
        Ok(())
    }

    /// Undoes one `disable_file_deletions`, or all of them with `force`.
    pub fn enable_file_deletions(&self, force: bool) -> Result<()> {
        let inner = &self.inner;
        let remaining = if force {
            inner.deletions_disabled.store(0, Ordering::Release);
            0
        } else {
            let previous = inner
                .deletions_disabled
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
                .unwrap_or(0);
            previous.saturating_sub(1)
        };
        tracing::info!(remaining, "File deletions enabled");
        if remaining == 0 {
            inner.purge_obsolete_files()?;
        }
        Ok(())
    }

    pub fn start_trace(&self, options: TraceOptions, writer: Box<dyn TraceWriter>) -> Result<()> {
        let mut slot = self.inner.tracer.lock()?;
        if slot.is_some() {
            return Err(Error::Busy("a trace is already running".into()));
        }
        *slot = Some(Tracer::start(options, writer)?);
        tracing::info!("Started trace");
        Ok(())
    }

    pub fn end_trace(&self) -> Result<()> {
        let tracer = self
            .inner
            .tracer
            .lock()?
            .take()
            .ok_or_else(|| Error::InvalidArgument("no trace running".into()))?;
        tracer.finish()?;
        tracing::info!("Ended trace");
        Ok(())
    }

    /// Stops scheduling flushes and compactions and waits for the running
    /// ones. Calls nest.
    pub fn pause_background_work(&self) -> Result<()> {
        self.inner.bg_paused.fetch_add(1, Ordering::AcqRel);
        let _compaction = self.inner.compaction_lock.lock()?;
        let _flush = self.inner.flush_lock.lock()?;
        tracing::info!("Background work paused");
        Ok(())
    }

    pub fn continue_background_work(&self) -> Result<()> {
        self.inner
            .bg_paused
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| Error::InvalidArgument("background work is not paused".into()))?;
        if !self.inner.is_paused() {
            tracing::info!("Background work resumed");
            self.inner.flush_wake.notify_one();
            self.inner.compaction_wake.notify_one();
        }
        Ok(())
    }

    /// Signals running compactions to stop at their next key and stops
    /// scheduling new work. With `wait`, blocks until background tasks exit.
    pub fn cancel_all_background_work(&self, wait: bool) -> Result<()> {
        self.inner.shutting_down.store(true, Ordering::Release);
        self.inner.signal_stall_change();
        if wait {
            self.shutdown_scheduler()?;
            let _compaction = self.inner.compaction_lock.lock()?;
        }
        Ok(())
    }

    pub fn enable_auto_compaction(&self, handles: &[&ColumnFamilyHandle]) -> Result<()> {
        for handle in handles {
            handle.cfd.set_auto_compactions(true);
        }
        self.inner.compaction_wake.notify_one();
        self.inner.signal_stall_change();
        Ok(())
    }

    /// The latched background error, if any.
    pub fn background_error(&self) -> Option<Error> {
        self.inner.background_error()
    }

    /// Retries flushing what a failed background flush left behind and
    /// clears the latched error when that succeeds.
    pub fn resume(&self) -> Result<()> {
        let inner = &self.inner;
        inner.check_writable()?;
        if inner.background_error().is_none() {
            return Ok(());
        }
        inner.roll_failed_wal()?;
        if let Some(wal) = inner.current_wal()? {
            wal.sync()?;
        }
        for cfd in inner.column_family_list()? {
            inner.flush_immutables(&cfd)?;
        }
        inner.clear_background_error();
        tracing::info!("Resumed after background error");
        inner.compaction_wake.notify_one();
        inner.signal_stall_change();
        Ok(())
    }

    fn shutdown_scheduler(&self) -> Result<()> {
        if let (Some(scheduler), Some(runtime)) = (&self.scheduler, &self.runtime) {
            runtime.block_on(scheduler.shutdown())?;
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.closed = true;
        let inner = Arc::clone(&self.inner);
        inner.shutting_down.store(true, Ordering::Release);
        inner.signal_stall_change();
        self.shutdown_scheduler()?;
        self.scheduler = None;
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }

        if !inner.is_read_write() {
            return Ok(());
        }
        if inner.has_unpersisted_data.load(Ordering::Acquire) && !inner.options.avoid_flush_during_shutdown {
            for cfd in inner.column_family_list()? {
                if cfd.has_unflushed_data() {
                    inner.flush_column_family(&cfd, true)?;
                }
            }
        }
        if let Some(wal) = inner.current_wal()?.filter(|w| !w.is_failed()) {
            wal.sync()?;
        }
        if let Some(tracer) = inner.tracer.lock()?.take() {
            tracer.finish()?;
        }
        tracing::info!(path = %inner.path.display(), "Closed database");
        Ok(())
    }

    /// Stops background work and makes the WAL durable.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "Failed to close database cleanly");
        }
    }
}

/// Lists live WAL numbers in `dir`, ascending.
pub(crate) fn wal_numbers(dir: &Path) -> Result<Vec<u64>> {
    let mut logs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(FileType::Log(n)) = entry.file_name().to_str().and_then(parse_file_name) {
            logs.push(n);
        }
    }
    logs.sort_unstable();
    Ok(logs)
}
