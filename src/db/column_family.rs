//! In-memory state of one column family.
//!
//! Readers never lock the memtable list: they clone the current
//! [`SuperVersion`], which bundles the active memtable, the sealed ones and
//! the table files into one consistent view. Memtable switches, flushes and
//! compactions publish a new super version.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::ColumnFamilyOptions;
use crate::error::Result;
use crate::iterator::{BoxedIterator, InternalIterator};
use crate::memtable::Memtable;
use crate::sstable::BlockReadOptions;
use crate::table_cache::TableCache;
use crate::types::{max_covering_tombstone, user_key, InternalKey, RangeTombstone, SequenceNumber, MAX_SEQUENCE_NUMBER};
use crate::version::Version;

/// Name and options of a column family to open or create.
#[derive(Debug, Clone)]
pub struct ColumnFamilyDescriptor {
    pub name: String,
    pub options: ColumnFamilyOptions,
}

impl ColumnFamilyDescriptor {
    pub fn new(name: impl Into<String>, options: ColumnFamilyOptions) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }
}

/// Consistent read view of a column family.
pub struct SuperVersion {
    pub mem: Arc<Memtable>,
    /// Sealed memtables, newest first.
    pub imms: Vec<Arc<Memtable>>,
    pub version: Arc<Version>,
}

impl SuperVersion {
    /// Every range tombstone of the view.
    pub fn range_tombstones(&self, tables: &TableCache) -> Result<Vec<RangeTombstone>> {
        let mut all = self.mem.range_tombstones();
        for imm in &self.imms {
            all.extend(imm.range_tombstones());
        }
        all.extend(self.version.range_tombstones(tables)?.iter().cloned());
        Ok(all)
    }

    /// Highest visible tombstone sequence covering `key`.
    pub fn covering_tombstone(&self, tables: &TableCache, key: &[u8], bound: SequenceNumber) -> Result<SequenceNumber> {
        let cmp = self.version.comparator();
        let mut seq = max_covering_tombstone(cmp, &self.mem.range_tombstones(), key, bound);
        for imm in &self.imms {
            seq = seq.max(max_covering_tombstone(cmp, &imm.range_tombstones(), key, bound));
        }
        let persisted = self.version.range_tombstones(tables)?;
        Ok(seq.max(max_covering_tombstone(cmp, &persisted, key, bound)))
    }

    /// Memtable iterators newest first, then table iterators.
    pub fn iterators(&self, tables: &Arc<TableCache>, opts: BlockReadOptions) -> Result<Vec<BoxedIterator>> {
        let mut out: Vec<BoxedIterator> = Vec::with_capacity(2 + self.imms.len());
        out.push(Box::new(self.mem.iter()));
        for imm in &self.imms {
            out.push(Box::new(imm.iter()));
        }
        self.version.add_iterators(tables, opts, &mut out)?;
        Ok(out)
    }
}

pub(crate) struct MemState {
    pub active: Arc<Memtable>,
    /// Oldest first.
    pub imms: Vec<Arc<Memtable>>,
}

pub(crate) struct ColumnFamilyData {
    id: u32,
    name: String,
    options: Arc<ColumnFamilyOptions>,
    dropped: AtomicBool,
    auto_compactions_disabled: AtomicBool,
    mem: RwLock<MemState>,
    super_version: RwLock<Arc<SuperVersion>>,
    /// Per level, the largest key of the file last picked for compaction.
    compact_cursors: Mutex<Vec<Option<InternalKey>>>,
}

impl std::fmt::Debug for ColumnFamilyData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnFamilyData")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dropped", &self.is_dropped())
            .finish()
    }
}

impl ColumnFamilyData {
    pub fn new(
        id: u32,
        name: String,
        options: Arc<ColumnFamilyOptions>,
        version: Arc<Version>,
        active: Arc<Memtable>,
    ) -> Self {
        let super_version = Arc::new(SuperVersion {
            mem: Arc::clone(&active),
            imms: Vec::new(),
            version,
        });
        let levels = options.num_levels;
        Self {
            id,
            name,
            auto_compactions_disabled: AtomicBool::new(options.disable_auto_compactions),
            options,
            dropped: AtomicBool::new(false),
            mem: RwLock::new(MemState {
                active,
                imms: Vec::new(),
            }),
            super_version: RwLock::new(super_version),
            compact_cursors: Mutex::new(vec![None; levels]),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &Arc<ColumnFamilyOptions> {
        &self.options
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(AtomicOrdering::Acquire)
    }

    pub fn set_dropped(&self) {
        self.dropped.store(true, AtomicOrdering::Release);
    }

    pub fn auto_compactions_enabled(&self) -> bool {
        !self.auto_compactions_disabled.load(AtomicOrdering::Acquire)
    }

    pub fn set_auto_compactions(&self, enabled: bool) {
        self.auto_compactions_disabled
            .store(!enabled, AtomicOrdering::Release);
    }

    pub fn super_version(&self) -> Result<Arc<SuperVersion>> {
        Ok(Arc::clone(&*self.super_version.read()?))
    }

    pub fn current(&self) -> Result<Arc<Version>> {
        Ok(Arc::clone(&self.super_version.read()?.version))
    }

    pub fn active_memtable(&self) -> Result<Arc<Memtable>> {
        Ok(Arc::clone(&self.mem.read()?.active))
    }

    /// Sealed memtables, oldest first.
    pub fn immutables(&self) -> Result<Vec<Arc<Memtable>>> {
        Ok(self.mem.read()?.imms.clone())
    }

    pub fn num_immutables(&self) -> usize {
        self.mem.read().map(|m| m.imms.len()).unwrap_or(0)
    }

    /// WAL holding the oldest unflushed data of this family.
    pub fn min_log_number(&self) -> Result<u64> {
        let mem = self.mem.read()?;
        Ok(mem
            .imms
            .first()
            .map_or(mem.active.log_number(), |m| m.log_number()))
    }

    pub fn has_unflushed_data(&self) -> bool {
        self.mem
            .read()
            .map(|m| !m.active.is_empty() || !m.imms.is_empty())
            .unwrap_or(false)
    }

    fn publish(&self, mem: &MemState, version: Arc<Version>) -> Result<()> {
        let next = Arc::new(SuperVersion {
            mem: Arc::clone(&mem.active),
            imms: mem.imms.iter().rev().cloned().collect(),
            version,
        });
        *self.super_version.write()? = next;
        Ok(())
    }

    /// Seals the active memtable and makes `fresh` the new active one.
    pub fn seal_active(&self, fresh: Memtable) -> Result<()> {
        let mut mem = self.mem.write()?;
        let next_log = fresh.log_number();
        let old = std::mem::replace(&mut mem.active, Arc::new(fresh));
        old.freeze(next_log);
        mem.imms.push(old);
        let version = self.current()?;
        self.publish(&mem, version)
    }

    /// Swaps an empty active memtable for one bound to a newer WAL.
    pub fn renew_empty_active(&self, fresh: Memtable) -> Result<bool> {
        let mut mem = self.mem.write()?;
        if !mem.active.is_empty() || !mem.imms.is_empty() {
            return Ok(false);
        }
        mem.active = Arc::new(fresh);
        let version = self.current()?;
        self.publish(&mem, version)?;
        Ok(true)
    }

    /// Replaces every memtable, e.g. after a secondary catches up.
    pub fn reset_memtables(&self, active: Arc<Memtable>, imms: Vec<Arc<Memtable>>, version: Arc<Version>) -> Result<()> {
        let mut mem = self.mem.write()?;
        mem.active = active;
        mem.imms = imms;
        self.publish(&mem, version)
    }

    /// Publishes `version` and drops the memtables it now contains.
    pub fn install_version(&self, version: Arc<Version>, flushed: &[u64]) -> Result<()> {
        let mut mem = self.mem.write()?;
        if !flushed.is_empty() {
            mem.imms.retain(|m| !flushed.contains(&m.id()));
        }
        self.publish(&mem, version)
    }

    pub fn compact_cursor(&self, level: usize) -> Option<InternalKey> {
        self.compact_cursors
            .lock()
            .ok()
            .and_then(|c| c.get(level).cloned().flatten())
    }

    pub fn set_compact_cursor(&self, level: usize, key: InternalKey) {
        if let Ok(mut cursors) = self.compact_cursors.lock() {
            if let Some(slot) = cursors.get_mut(level) {
                *slot = Some(key);
            }
        }
    }
}

/// True when any entry or range tombstone of `mem` falls in
/// `[smallest, largest]`.
pub(crate) fn memtable_overlaps(mem: &Arc<Memtable>, smallest: &[u8], largest: &[u8]) -> bool {
    let cmp = mem.comparator().clone();
    let mut iter = mem.iter();
    iter.seek(&InternalKey::for_seek(smallest, MAX_SEQUENCE_NUMBER).encode());
    if iter.valid() && cmp.compare(user_key(iter.key()), largest) != Ordering::Greater {
        return true;
    }
    mem.range_tombstones().iter().any(|t| {
        cmp.compare(&t.begin, largest) != Ordering::Greater
            && cmp.compare(&t.end, smallest) == Ordering::Greater
    })
}

/// Cheap, clonable reference to an open column family.
///
/// Handles stay usable for reads after the family is dropped; its memory
/// is released with the last handle.
#[derive(Clone)]
pub struct ColumnFamilyHandle {
    pub(crate) cfd: Arc<ColumnFamilyData>,
}

impl ColumnFamilyHandle {
    pub(crate) fn new(cfd: Arc<ColumnFamilyData>) -> Self {
        Self { cfd }
    }

    pub fn id(&self) -> u32 {
        self.cfd.id()
    }

    pub fn name(&self) -> &str {
        self.cfd.name()
    }

    pub fn options(&self) -> &ColumnFamilyOptions {
        self.cfd.options()
    }

    pub fn is_dropped(&self) -> bool {
        self.cfd.is_dropped()
    }
}

impl std::fmt::Debug for ColumnFamilyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnFamilyHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}
