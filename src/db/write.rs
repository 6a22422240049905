//! Write path.
//!
//! Writers queue up; the writer at the head becomes the leader, takes
//! compatible writers behind it into one group and commits the whole group
//! with a single WAL append sequence and at most one sync. Followers sleep
//! until the leader hands them their result.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::column_family::ColumnFamilyData;
use super::{ColumnFamilyHandle, Db, DbInner};
use crate::batch::{WriteBatch, WriteBatchHandler};
use crate::config::WriteOptions;
use crate::error::{Result, SubCode};
use crate::filename::log_file_name;
use crate::memtable::Memtable;
use crate::statistics::Ticker;
use crate::types::{SequenceNumber, ValueType};
use crate::wal::Wal;
use crate::Error;

const STALL_POLL: Duration = Duration::from_millis(10);
const SLOWDOWN_DELAY: Duration = Duration::from_millis(1);

struct Writer {
    batch: WriteBatch,
    sync: bool,
    disable_wal: bool,
    no_slowdown: bool,
    deadline: Option<Instant>,
    result: Mutex<Option<Result<SequenceNumber>>>,
}

impl Writer {
    fn take_result(&self) -> Option<Result<SequenceNumber>> {
        self.result.lock().ok().and_then(|mut r| r.take())
    }

    fn set_result(&self, result: Result<SequenceNumber>) {
        if let Ok(mut slot) = self.result.lock() {
            *slot = Some(result);
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Arc<Writer>>,
    leader_active: bool,
}

#[derive(Default)]
pub(crate) struct WriteQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

enum Stall {
    Slowdown,
    Stop(&'static str),
}

/// Applies batch records to the memtables of their column families.
///
/// Records for unknown or dropped families are skipped but still consume
/// their sequence numbers. During recovery, records in logs older than a
/// family's recovered log number are skipped the same way.
pub(crate) struct MemtableInserter<'a> {
    cfs: &'a BTreeMap<u32, Arc<ColumnFamilyData>>,
    seq: SequenceNumber,
    recovery: Option<(&'a HashMap<u32, u64>, u64)>,
}

impl<'a> MemtableInserter<'a> {
    pub(crate) fn new(cfs: &'a BTreeMap<u32, Arc<ColumnFamilyData>>, seq: SequenceNumber) -> Self {
        Self {
            cfs,
            seq,
            recovery: None,
        }
    }

    pub(crate) fn for_recovery(
        cfs: &'a BTreeMap<u32, Arc<ColumnFamilyData>>,
        seq: SequenceNumber,
        log_numbers: &'a HashMap<u32, u64>,
        log: u64,
    ) -> Self {
        Self {
            cfs,
            seq,
            recovery: Some((log_numbers, log)),
        }
    }

    fn memtable(&self, cf: u32) -> Result<Option<Arc<Memtable>>> {
        if let Some((log_numbers, log)) = self.recovery {
            if log_numbers.get(&cf).map_or(true, |min| log < *min) {
                return Ok(None);
            }
        }
        match self.cfs.get(&cf) {
            Some(cfd) if !cfd.is_dropped() => Ok(Some(cfd.active_memtable()?)),
            _ => Ok(None),
        }
    }

    fn add(&mut self, cf: u32, kind: ValueType, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some(mem) = self.memtable(cf)? {
            mem.add(self.seq, kind, key, value);
        }
        self.seq += 1;
        Ok(())
    }
}

impl WriteBatchHandler for MemtableInserter<'_> {
    fn put(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<()> {
        self.add(cf, ValueType::Put, key, value)
    }

    fn delete(&mut self, cf: u32, key: &[u8]) -> Result<()> {
        self.add(cf, ValueType::Delete, key, &[])
    }

    fn single_delete(&mut self, cf: u32, key: &[u8]) -> Result<()> {
        self.add(cf, ValueType::SingleDelete, key, &[])
    }

    fn delete_range(&mut self, cf: u32, begin: &[u8], end: &[u8]) -> Result<()> {
        self.add(cf, ValueType::RangeDelete, begin, end)
    }

    fn merge(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<()> {
        self.add(cf, ValueType::Merge, key, value)
    }
}

impl DbInner {
    fn validate_batch(&self, batch: &WriteBatch) -> Result<()> {
        self.check_writable()?;
        if let Some(e) = self.stop_writes_error() {
            return Err(e);
        }
        if self.is_shutting_down() {
            return Err(Error::ShutdownInProgress);
        }
        let cfs = self.column_families.read()?;
        for cf in batch.column_families()? {
            match cfs.get(&cf) {
                Some(cfd) if !cfd.is_dropped() => {}
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "column family {} does not exist",
                        cf
                    )))
                }
            }
        }
        Ok(())
    }

    pub(crate) fn write(&self, opts: &WriteOptions, batch: WriteBatch) -> Result<SequenceNumber> {
        self.validate_batch(&batch)?;
        if batch.is_empty() {
            return Ok(self.last_sequence());
        }
        if opts.sync && opts.disable_wal {
            return Err(Error::InvalidArgument(
                "sync writes need the WAL".into(),
            ));
        }

        let writer = Arc::new(Writer {
            batch,
            sync: opts.sync,
            disable_wal: opts.disable_wal,
            no_slowdown: opts.no_slowdown,
            deadline: opts.deadline,
            result: Mutex::new(None),
        });

        {
            let mut queue = self.write_queue.state.lock()?;
            queue.pending.push_back(Arc::clone(&writer));
            loop {
                if let Some(result) = writer.take_result() {
                    return result;
                }
                let at_front = queue
                    .pending
                    .front()
                    .map_or(false, |w| Arc::ptr_eq(w, &writer));
                if at_front && !queue.leader_active {
                    queue.leader_active = true;
                    break;
                }
                queue = self.write_queue.cv.wait(queue)?;
            }
        }

        let group = self.form_group()?;
        let result = self.commit_group(&group);

        let mut own = None;
        match result {
            Ok(seqs) => {
                for (w, seq) in group.iter().zip(seqs) {
                    if Arc::ptr_eq(w, &writer) {
                        own = Some(Ok(seq));
                    } else {
                        w.set_result(Ok(seq));
                    }
                }
            }
            Err(e) => {
                for w in group.iter().skip(1) {
                    w.set_result(Err(e.duplicate()));
                }
                own = Some(Err(e));
            }
        }

        {
            let mut queue = self.write_queue.state.lock()?;
            queue.leader_active = false;
            self.write_queue.cv.notify_all();
        }
        own.unwrap_or_else(|| Err(Error::Aborted("write group lost its leader".into())))
    }

    /// Pops the leader and every compatible writer queued behind it.
    fn form_group(&self) -> Result<Vec<Arc<Writer>>> {
        let mut queue = self.write_queue.state.lock()?;
        let leader = queue
            .pending
            .pop_front()
            .ok_or_else(|| Error::Aborted("write queue is empty".into()))?;
        let max_bytes = self.options.max_write_batch_group_size_bytes;
        let mut bytes = leader.batch.data_size();
        let mut group = vec![leader];

        while let Some(next) = queue.pending.front() {
            let leader = &group[0];
            if next.disable_wal != leader.disable_wal
                || next.no_slowdown != leader.no_slowdown
                || (next.sync && !leader.sync)
                || bytes + next.batch.data_size() > max_bytes
            {
                break;
            }
            bytes += next.batch.data_size();
            if let Some(next) = queue.pending.pop_front() {
                group.push(next);
            }
        }
        Ok(group)
    }

    /// Writes a group to the WAL and the memtables. Returns the last
    /// sequence number of every writer's batch.
    fn commit_group(&self, group: &[Arc<Writer>]) -> Result<Vec<SequenceNumber>> {
        let _write = self.write_lock.lock()?;
        let leader = &group[0];
        let deadline = group.iter().filter_map(|w| w.deadline).min();
        self.make_room_for_write(leader.no_slowdown, deadline)?;

        let mut seq = self.last_sequence() + 1;
        let mut batches = Vec::with_capacity(group.len());
        let mut seqs = Vec::with_capacity(group.len());
        for w in group {
            let mut batch = w.batch.clone();
            batch.set_sequence(seq);
            seq += batch.count() as u64;
            seqs.push(seq - 1);
            batches.push(batch);
        }

        if leader.disable_wal {
            self.has_unpersisted_data.store(true, Ordering::Release);
        } else if let Some(wal) = self.current_wal()? {
            if let Err(e) = self.append_to_wal(&wal, &batches, group.iter().any(|w| w.sync)) {
                self.set_background_error(e.duplicate(), true);
                return Err(e);
            }
        }

        let cfs = self.column_families.read()?;
        let mut keys = 0u64;
        let mut bytes = 0u64;
        for batch in &batches {
            batch.iterate(&mut MemtableInserter::new(&cfs, batch.sequence()))?;
            keys += batch.count() as u64;
            bytes += batch.data_size() as u64;
        }
        drop(cfs);
        self.last_sequence.store(seq - 1, Ordering::Release);

        self.stats.record(Ticker::KeysWritten, keys);
        self.stats.record(Ticker::BytesWritten, bytes);
        self.stats.record(Ticker::WriteGroups, 1);
        if let Some(tracer) = self.tracer.lock()?.as_mut() {
            for batch in &batches {
                if let Err(e) = tracer.write(batch) {
                    tracing::warn!(error = %e, "Failed to trace write");
                }
            }
        }
        Ok(seqs)
    }

    /// Logs a whole group or none of it. On failure the group's records
    /// are cut from the log and the log accepts no more writes.
    fn append_to_wal(&self, wal: &Wal, batches: &[WriteBatch], sync: bool) -> Result<()> {
        let mark = wal.size();
        let logged = batches
            .iter()
            .try_for_each(|batch| wal.append(batch.data()))
            .and_then(|()| {
                if sync {
                    wal.sync()
                } else if !self.options.manual_wal_flush {
                    wal.flush()
                } else {
                    Ok(())
                }
            });
        if let Err(e) = logged {
            if let Err(cut) = wal.abandon(mark) {
                tracing::warn!(wal = wal.number(), error = %cut, "Failed to cut unlogged group from WAL");
            }
            return Err(e);
        }

        let bytes: usize = batches.iter().map(|b| b.data_size()).sum();
        self.stats.record(Ticker::WalBytes, bytes as u64);
        if sync {
            self.stats.record(Ticker::WalSynced, 1);
        }
        Ok(())
    }

    fn stall_condition(&self, cfd: &ColumnFamilyData) -> Result<Option<Stall>> {
        let opts = cfd.options();
        let active_full = cfd.active_memtable()?.approximate_memory_usage() >= opts.write_buffer_size;
        if active_full && cfd.num_immutables() + 1 >= opts.max_write_buffer_number.max(2) {
            return Ok(Some(Stall::Stop("too many immutable memtables")));
        }
        if !cfd.auto_compactions_enabled() {
            return Ok(None);
        }
        let l0 = cfd.current()?.num_files(0);
        if l0 >= opts.level0_stop_writes_trigger {
            return Ok(Some(Stall::Stop("too many level 0 files")));
        }
        if l0 >= opts.level0_slowdown_writes_trigger {
            return Ok(Some(Stall::Slowdown));
        }
        Ok(None)
    }

    /// Switches full memtables and applies write backpressure. Called with
    /// `write_lock` held.
    fn make_room_for_write(&self, no_slowdown: bool, deadline: Option<Instant>) -> Result<()> {
        let started = Instant::now();
        let mut slowed = false;
        let mut stalled = false;

        let outcome = loop {
            if self.is_shutting_down() {
                break Err(Error::ShutdownInProgress);
            }
            if let Some(e) = self.stop_writes_error() {
                break Err(e);
            }

            let mut blocked = None;
            for cfd in self.column_family_list()? {
                let opts = cfd.options();
                let active = cfd.active_memtable()?;
                if active.approximate_memory_usage() >= opts.write_buffer_size
                    && cfd.num_immutables() + 1 < opts.max_write_buffer_number.max(2)
                {
                    self.switch_memtable(&cfd)?;
                }
                match self.stall_condition(&cfd)? {
                    Some(Stall::Slowdown) if slowed => {}
                    Some(stall) => {
                        blocked = Some(stall);
                        break;
                    }
                    None => {}
                }
            }

            match blocked {
                None => break Ok(()),
                Some(_) if no_slowdown => {
                    break Err(Error::Incomplete("write stall".into()));
                }
                Some(_) if deadline.map_or(false, |d| Instant::now() >= d) => {
                    break Err(Error::TimedOut(SubCode::None));
                }
                Some(Stall::Slowdown) => {
                    std::thread::sleep(SLOWDOWN_DELAY);
                    slowed = true;
                }
                Some(Stall::Stop(reason)) => {
                    if !stalled {
                        tracing::warn!(reason, "Stopping writes");
                        stalled = true;
                    }
                    self.flush_wake.notify_one();
                    self.compaction_wake.notify_one();
                    let wait = deadline.map_or(STALL_POLL, |d| {
                        d.saturating_duration_since(Instant::now()).min(STALL_POLL)
                    });
                    self.wait_for_stall_change(wait)?;
                }
            }
        };

        if slowed || stalled {
            let micros = started.elapsed().as_micros() as u64;
            self.stats.record(Ticker::StallMicros, micros);
            if stalled {
                tracing::info!(micros, "Writes resumed");
            }
        }
        outcome
    }

    /// Seals the active memtable of `cfd` and starts a new WAL. Families
    /// with nothing buffered move to the new WAL too. Called with
    /// `write_lock` held.
    pub(crate) fn switch_memtable(&self, cfd: &ColumnFamilyData) -> Result<()> {
        let new_log = if self.current_wal()?.is_some() {
            let number = self.versions.lock()?.new_file_number();
            let wal = Arc::new(Wal::create(log_file_name(&self.path, number), number)?);
            if let Some(old) = self.wal.lock()?.replace(wal) {
                if !old.is_failed() {
                    old.flush()?;
                }
            }
            number
        } else {
            cfd.active_memtable()?.log_number()
        };

        cfd.seal_active(self.new_memtable(cfd.options(), new_log))?;
        for other in self.column_family_list()? {
            if other.id() != cfd.id() {
                other.renew_empty_active(self.new_memtable(other.options(), new_log))?;
            }
        }
        tracing::info!(cf = cfd.id(), wal = new_log, "Switched memtable");
        self.flush_wake.notify_one();
        Ok(())
    }

    /// Swaps a log that failed a write for a fresh one. Every non-empty
    /// memtable is sealed, so nothing still depends on the failed log
    /// once the immutables are flushed.
    pub(crate) fn roll_failed_wal(&self) -> Result<()> {
        let _write = self.write_lock.lock()?;
        let failed = match self.current_wal()? {
            Some(wal) if wal.is_failed() => wal.number(),
            _ => return Ok(()),
        };

        let number = self.versions.lock()?.new_file_number();
        let wal = Arc::new(Wal::create(log_file_name(&self.path, number), number)?);
        *self.wal.lock()? = Some(wal);
        for cfd in self.column_family_list()? {
            let fresh = self.new_memtable(cfd.options(), number);
            if cfd.active_memtable()?.is_empty() {
                cfd.renew_empty_active(fresh)?;
            } else {
                cfd.seal_active(fresh)?;
            }
        }
        tracing::info!(failed, wal = number, "Replaced failed WAL");
        Ok(())
    }
}

impl Db {
    /// Applies `batch` atomically and returns the sequence number of its
    /// last record.
    pub fn write(&self, opts: &WriteOptions, batch: WriteBatch) -> Result<SequenceNumber> {
        self.inner.write(opts, batch)
    }

    pub fn put(&self, opts: &WriteOptions, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.put_cf(opts, &self.default_cf, key, value)
    }

    pub fn put_cf(
        &self,
        opts: &WriteOptions,
        cf: &ColumnFamilyHandle,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put_cf(cf.id(), key, value);
        self.write(opts, batch).map(|_| ())
    }

    pub fn delete(&self, opts: &WriteOptions, key: impl AsRef<[u8]>) -> Result<()> {
        self.delete_cf(opts, &self.default_cf, key)
    }

    pub fn delete_cf(&self, opts: &WriteOptions, cf: &ColumnFamilyHandle, key: impl AsRef<[u8]>) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete_cf(cf.id(), key);
        self.write(opts, batch).map(|_| ())
    }

    pub fn single_delete(&self, opts: &WriteOptions, key: impl AsRef<[u8]>) -> Result<()> {
        self.single_delete_cf(opts, &self.default_cf, key)
    }

    pub fn single_delete_cf(&self, opts: &WriteOptions, cf: &ColumnFamilyHandle, key: impl AsRef<[u8]>) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.single_delete_cf(cf.id(), key);
        self.write(opts, batch).map(|_| ())
    }

    /// Deletes every key in `[begin, end)`.
    pub fn delete_range(&self, opts: &WriteOptions, begin: impl AsRef<[u8]>, end: impl AsRef<[u8]>) -> Result<()> {
        self.delete_range_cf(opts, &self.default_cf, begin, end)
    }

    pub fn delete_range_cf(
        &self,
        opts: &WriteOptions,
        cf: &ColumnFamilyHandle,
        begin: impl AsRef<[u8]>,
        end: impl AsRef<[u8]>,
    ) -> Result<()> {
        let cfd = self.resolve(cf)?;
        let (begin, end) = (begin.as_ref(), end.as_ref());
        if cfd.options().comparator.compare(begin, end).is_gt() {
            return Err(Error::InvalidArgument("range deletion end is before its begin".into()));
        }
        let mut batch = WriteBatch::new();
        batch.delete_range_cf(cf.id(), begin, end);
        self.write(opts, batch).map(|_| ())
    }

    pub fn merge(&self, opts: &WriteOptions, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.merge_cf(opts, &self.default_cf, key, value)
    }

    pub fn merge_cf(
        &self,
        opts: &WriteOptions,
        cf: &ColumnFamilyHandle,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.merge_cf(cf.id(), key, value);
        self.write(opts, batch).map(|_| ())
    }
}
