//! Periodic background jobs on a tokio runtime.
//!
//! Each registered [`BackgroundTask`] gets its own loop that runs the task
//! on every tick of its interval, or earlier when its wake handle is
//! notified. [`Scheduler::shutdown`] stops every loop and joins it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::Result;
use crate::Error;

/// Handed to a task for one run.
pub struct Context {
    pub task_name: &'static str,
    /// Starts at 1; the first run happens right after registration.
    pub run_id: u64,
    shutdown: broadcast::Receiver<()>,
}

impl Context {
    /// True once shutdown was requested. Long-running tasks check this
    /// between units of work.
    pub fn is_cancelled(&mut self) -> bool {
        !matches!(self.shutdown.try_recv(), Err(broadcast::error::TryRecvError::Empty))
    }
}

#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// Notified to run the task ahead of its next tick.
    fn wake(&self) -> Option<Arc<Notify>> {
        None
    }

    async fn execute(&self, ctx: Context) -> Result<()>;
}

pub struct Scheduler {
    loops: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            loops: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Starts the loop for `task`. Must be called inside a tokio runtime.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(run_loop(task, shutdown));
        match self.loops.lock() {
            Ok(mut loops) => loops.push(handle),
            Err(_) => handle.abort(),
        }
        self
    }

    /// Number of registered loops that have not been joined.
    pub fn len(&self) -> usize {
        self.loops.lock().map_or(0, |l| l.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signals every loop to stop and waits for them. Runs in progress
    /// finish first. Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        let handles: Vec<JoinHandle<()>> = self.loops.lock()?.drain(..).collect();
        for handle in handles {
            handle
                .await
                .map_err(|e| Error::Aborted(format!("background task did not stop cleanly: {}", e)))?;
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_loop<T: BackgroundTask + 'static>(task: Arc<T>, mut shutdown: broadcast::Receiver<()>) {
    let wake = task.wake().unwrap_or_else(|| Arc::new(Notify::new()));
    let mut ticker = tokio::time::interval(task.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut run_id = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wake.notified() => {}
            _ = shutdown.recv() => break,
        }
        run_id += 1;
        let ctx = Context {
            task_name: task.name(),
            run_id,
            shutdown: shutdown.resubscribe(),
        };
        if let Err(e) = task.execute(ctx).await {
            tracing::error!(task = task.name(), run_id, error = %e, "Background task failed");
        }
    }
    tracing::debug!(task = task.name(), runs = run_id, "Background task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        interval: Duration,
        runs: Arc<AtomicUsize>,
        wake: Arc<Notify>,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        fn wake(&self) -> Option<Arc<Notify>> {
            Some(self.wake.clone())
        }

        async fn execute(&self, _ctx: Context) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting(interval: Duration) -> Arc<Counting> {
        Arc::new(Counting {
            interval,
            runs: Arc::new(AtomicUsize::new(0)),
            wake: Arc::new(Notify::new()),
        })
    }

    #[tokio::test]
    async fn test_task_runs_on_interval() -> Result<()> {
        let scheduler = Scheduler::new();
        let task = counting(Duration::from_millis(10));
        scheduler.register(task.clone());
        assert_eq!(scheduler.len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(task.runs.load(Ordering::SeqCst) > 1);

        scheduler.shutdown().await?;
        assert!(scheduler.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_wake_runs_task_before_tick() -> Result<()> {
        let scheduler = Scheduler::new();
        let task = counting(Duration::from_secs(3600));
        scheduler.register(task.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let before = task.runs.load(Ordering::SeqCst);

        task.wake.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), before + 1);

        scheduler.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_no_runs_after_shutdown() -> Result<()> {
        let scheduler = Scheduler::new();
        let task = counting(Duration::from_millis(10));
        scheduler.register(task.clone());
        tokio::time::sleep(Duration::from_millis(25)).await;

        let start = std::time::Instant::now();
        scheduler.shutdown().await?;
        assert!(start.elapsed() < Duration::from_millis(100));
        let stopped_at = task.runs.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), stopped_at);
        scheduler.shutdown().await?;
        Ok(())
    }

    struct Cancellable {
        saw_cancel: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for Cancellable {
        fn name(&self) -> &'static str {
            "cancellable"
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(3600)
        }

        async fn execute(&self, mut ctx: Context) -> Result<()> {
            for _ in 0..200 {
                if ctx.is_cancelled() {
                    self.saw_cancel.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_running_task_sees_cancellation() -> Result<()> {
        let scheduler = Scheduler::new();
        let saw_cancel = Arc::new(AtomicUsize::new(0));
        scheduler.register(Arc::new(Cancellable {
            saw_cancel: saw_cancel.clone(),
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;

        scheduler.shutdown().await?;
        assert_eq!(saw_cancel.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
