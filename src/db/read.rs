use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::ReadOptions;
use crate::error::{Result, SubCode};
use crate::lookup::GetContext;
use crate::statistics::Ticker;
use crate::types::SequenceNumber;
use crate::Error;

use super::{ColumnFamilyData, ColumnFamilyHandle, Db, DbInner, DbIterator, SuperVersion};

fn check_deadline(deadline: Option<Instant>) -> Result<()> {
    match deadline {
        Some(d) if Instant::now() >= d => Err(Error::TimedOut(SubCode::None)),
        _ => Ok(()),
    }
}

impl DbInner {
    /// Sequence number reads with `opts` observe.
    pub(crate) fn read_bound(&self, opts: &ReadOptions) -> SequenceNumber {
        opts.snapshot.unwrap_or_else(|| self.last_sequence())
    }

    /// Point lookup against a pinned view: memtables newest first, then
    /// table files level by level.
    pub(crate) fn get_from(
        &self,
        opts: &ReadOptions,
        cfd: &ColumnFamilyData,
        sv: &SuperVersion,
        bound: SequenceNumber,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        check_deadline(opts.deadline)?;
        let options = cfd.options();
        let tombstone_seq = sv.covering_tombstone(&self.table_cache, key, bound)?;
        let mut ctx = GetContext::new(
            options.comparator.as_ref(),
            options.merge_operator.as_deref(),
            key,
            bound,
            tombstone_seq,
        );

        sv.mem.get(&mut ctx)?;
        for imm in &sv.imms {
            if ctx.is_done() {
                break;
            }
            imm.get(&mut ctx)?;
        }
        if ctx.is_done() {
            self.stats.record(Ticker::MemtableHit, 1);
        } else {
            self.stats.record(Ticker::MemtableMiss, 1);
            check_deadline(opts.deadline)?;
            let read_opts = self.block_read_options(opts.verify_checksums, opts.fill_cache);
            sv.version.get(&mut ctx, &self.table_cache, read_opts, &self.stats)?;
        }

        let value = ctx.finish()?;
        self.stats.record(Ticker::KeysRead, 1);
        if let Some(v) = &value {
            self.stats.record(Ticker::BytesRead, v.len() as u64);
        }
        Ok(value)
    }

    fn trace_get(&self, cf: u32, key: &[u8]) -> Result<()> {
        if let Some(tracer) = self.tracer.lock()?.as_mut() {
            tracer.get(cf, key)?;
        }
        Ok(())
    }

    fn trace_multi_get(&self, keys: &[(u32, &[u8])]) -> Result<()> {
        if let Some(tracer) = self.tracer.lock()?.as_mut() {
            tracer.multi_get(keys)?;
        }
        Ok(())
    }
}

impl Db {
    pub fn get(&self, opts: &ReadOptions, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        self.get_cf(opts, &self.default_cf, key)
    }

    /// Value of `key` as of the snapshot in `opts`, or the latest state.
    /// A missing key is `Ok(None)`.
    pub fn get_cf(&self, opts: &ReadOptions, cf: &ColumnFamilyHandle, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        let key = key.as_ref();
        let cfd = self.resolve(cf)?;
        self.inner.trace_get(cfd.id(), key)?;
        let sv = cfd.super_version()?;
        let bound = self.inner.read_bound(opts);
        self.inner.get_from(opts, &cfd, &sv, bound, key)
    }

    /// Looks up every key in the default column family. Results line up
    /// with `keys`.
    pub fn multi_get<K: AsRef<[u8]>>(&self, opts: &ReadOptions, keys: &[K]) -> Result<Vec<Result<Option<Vec<u8>>>>> {
        let cfs = vec![&self.default_cf; keys.len()];
        self.multi_get_cf(opts, &cfs, keys)
    }

    /// Looks up `keys[i]` in `cfs[i]` against one consistent view per
    /// column family. Each key reports its own error.
    pub fn multi_get_cf<K: AsRef<[u8]>>(
        &self,
        opts: &ReadOptions,
        cfs: &[&ColumnFamilyHandle],
        keys: &[K],
    ) -> Result<Vec<Result<Option<Vec<u8>>>>> {
        if cfs.len() != keys.len() {
            return Err(Error::InvalidArgument(format!(
                "{} column families given for {} keys",
                cfs.len(),
                keys.len()
            )));
        }
        let inner = &self.inner;
        let traced: Vec<(u32, &[u8])> = cfs.iter().zip(keys).map(|(cf, k)| (cf.id(), k.as_ref())).collect();
        inner.trace_multi_get(&traced)?;

        let bound = inner.read_bound(opts);
        let mut pinned: HashMap<u32, (Arc<ColumnFamilyData>, Arc<SuperVersion>)> = HashMap::new();
        for cf in cfs {
            if !pinned.contains_key(&cf.id()) {
                let cfd = self.resolve(cf)?;
                let sv = cfd.super_version()?;
                pinned.insert(cf.id(), (cfd, sv));
            }
        }

        // Visit keys grouped by family and sorted so neighbouring lookups
        // hit the same blocks.
        let mut order: Vec<usize> = (0..keys.len()).collect();
        order.sort_by(|&a, &b| {
            let (ca, cb) = (cfs[a].id(), cfs[b].id());
            ca.cmp(&cb).then_with(|| match pinned.get(&ca) {
                Some((cfd, _)) => cfd.options().comparator.compare(keys[a].as_ref(), keys[b].as_ref()),
                None => Ordering::Equal,
            })
        });

        let mut results: Vec<Option<Result<Option<Vec<u8>>>>> = (0..keys.len()).map(|_| None).collect();
        for i in order {
            let result = match pinned.get(&cfs[i].id()) {
                Some((cfd, sv)) => inner.get_from(opts, cfd, sv, bound, keys[i].as_ref()),
                None => Err(Error::InvalidArgument("column family not pinned".into())),
            };
            results[i] = Some(result);
        }
        Ok(results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(Error::Incomplete("key skipped".into()))))
            .collect())
    }

    pub fn key_may_exist(&self, opts: &ReadOptions, key: impl AsRef<[u8]>) -> Result<bool> {
        self.key_may_exist_cf(opts, &self.default_cf, key)
    }

    /// Cheap existence check. `false` means the key is definitely absent;
    /// `true` may be a false positive. Only memtables, file key ranges and
    /// bloom filters are consulted.
    pub fn key_may_exist_cf(&self, opts: &ReadOptions, cf: &ColumnFamilyHandle, key: impl AsRef<[u8]>) -> Result<bool> {
        let key = key.as_ref();
        let inner = &self.inner;
        let cfd = self.resolve(cf)?;
        let sv = cfd.super_version()?;
        let bound = inner.read_bound(opts);
        let options = cfd.options();

        let mut ctx = GetContext::new(
            options.comparator.as_ref(),
            options.merge_operator.as_deref(),
            key,
            bound,
            0,
        );
        sv.mem.get(&mut ctx)?;
        for imm in &sv.imms {
            if ctx.is_done() {
                break;
            }
            imm.get(&mut ctx)?;
        }
        if ctx.is_done() {
            return Ok(ctx.finish()?.is_some());
        }

        let read_opts = inner.block_read_options(false, opts.fill_cache);
        for level in 0..sv.version.num_levels() {
            for file in sv.version.overlapping_files(level, Some(key), Some(key)) {
                let table = inner.table_cache.find_table(&file, options)?;
                if table.may_contain(key, read_opts)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    pub fn iterator(&self, opts: &ReadOptions) -> Result<DbIterator<'_>> {
        self.iterator_cf(opts, &self.default_cf)
    }

    /// Unpositioned iterator over one column family. It pins the current
    /// memtables and files until dropped.
    pub fn iterator_cf(&self, opts: &ReadOptions, cf: &ColumnFamilyHandle) -> Result<DbIterator<'_>> {
        let cfd = self.resolve(cf)?;
        let bound = self.inner.read_bound(opts);
        DbIterator::new(&self.inner, &cfd, cfd.super_version()?, opts, bound)
    }

    /// Iterators over several column families sharing one sequence bound.
    pub fn iterators(&self, opts: &ReadOptions, cfs: &[&ColumnFamilyHandle]) -> Result<Vec<DbIterator<'_>>> {
        let bound = self.inner.read_bound(opts);
        let mut views = Vec::with_capacity(cfs.len());
        for cf in cfs {
            let cfd = self.resolve(cf)?;
            let sv = cfd.super_version()?;
            views.push((cfd, sv));
        }
        views
            .into_iter()
            .map(|(cfd, sv)| DbIterator::new(&self.inner, &cfd, sv, opts, bound))
            .collect()
    }
}
