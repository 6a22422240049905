use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::Result;
use crate::scheduler::{BackgroundTask, Context};
use crate::Error;

use super::DbInner;

/// Tokio panics on zero-length intervals.
fn nonzero(interval: Duration) -> Duration {
    interval.max(Duration::from_millis(1))
}

/// Writes sealed memtables to level 0.
pub(crate) struct FlushTask {
    inner: Arc<DbInner>,
}

impl FlushTask {
    pub(crate) fn new(inner: Arc<DbInner>) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for FlushTask {
    fn name(&self) -> &'static str {
        "memtable-flush"
    }

    fn interval(&self) -> Duration {
        nonzero(self.inner.options.flush_interval)
    }

    fn wake(&self) -> Option<Arc<Notify>> {
        Some(Arc::clone(&self.inner.flush_wake))
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let inner = &self.inner;
        if inner.is_paused() || inner.stop_writes_error().is_some() {
            return Ok(());
        }
        for cfd in inner.column_family_list()? {
            if cfd.num_immutables() == 0 {
                continue;
            }
            if let Err(e) = inner.flush_immutables(&cfd) {
                inner.set_background_error(e.duplicate(), true);
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Runs automatic compactions until nothing scores above its threshold.
pub(crate) struct CompactionTask {
    inner: Arc<DbInner>,
}

impl CompactionTask {
    pub(crate) fn new(inner: Arc<DbInner>) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        nonzero(self.inner.options.compaction_interval)
    }

    fn wake(&self) -> Option<Arc<Notify>> {
        Some(Arc::clone(&self.inner.compaction_wake))
    }

    async fn execute(&self, mut ctx: Context) -> Result<()> {
        while !ctx.is_cancelled() {
            match self.inner.maybe_compact() {
                Ok(true) => tokio::task::yield_now().await,
                Ok(false) => return Ok(()),
                Err(Error::ShutdownInProgress) => return Ok(()),
                Err(e) => {
                    self.inner.set_background_error(e.duplicate(), false);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

/// Deletes files that became obsolete outside flush and compaction.
pub(crate) struct PurgeTask {
    inner: Arc<DbInner>,
}

impl PurgeTask {
    pub(crate) fn new(inner: Arc<DbInner>) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for PurgeTask {
    fn name(&self) -> &'static str {
        "obsolete-file-purge"
    }

    fn interval(&self) -> Duration {
        nonzero(self.inner.options.purge_interval)
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.inner.purge_obsolete_files()
    }
}

/// Logs the statistics tickers.
pub(crate) struct StatsTask {
    inner: Arc<DbInner>,
}

impl StatsTask {
    pub(crate) fn new(inner: Arc<DbInner>) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for StatsTask {
    fn name(&self) -> &'static str {
        "stats-dump"
    }

    fn interval(&self) -> Duration {
        nonzero(self.inner.options.stats_dump_period)
    }

    async fn execute(&self, ctx: Context) -> Result<()> {
        // the first tick fires immediately
        if ctx.run_id > 1 {
            self.inner.stats.log();
        }
        Ok(())
    }
}
