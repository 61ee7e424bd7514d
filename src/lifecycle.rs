//! # Lifecycle
//!
//! ```text
//! Stopped ──start()──▶ Starting ──▶ Running ──stop()──▶ Stopping ──▶ Stopped (closed)
//! ```
//!
//! `Starting` runs bootstrap once. A failed bootstrap is not fatal: a
//! retry loop with capped exponential backoff is spawned and the DHT moves
//! on to `Running`. While running, three periodic jobs tick independently:
//!
//! | Job | Default period |
//! |-----|----------------|
//! | bucket refresh | 1h |
//! | cleanup | 10min |
//! | republish | 20min |
//!
//! Every background task, including lookups streamed to callers and
//! eviction pings, is spawned through one [`TaskSet`]: a shared
//! cancellation token plus a join point. `stop()` cancels the token and
//! waits for every task to exit before reporting `Stopped`. A stopped DHT is
//! closed for good. `stop()` issued during `Starting` waits for start to
//! finish and then stops.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{DhtError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DhtState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl DhtState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => DhtState::Starting,
            2 => DhtState::Running,
            3 => DhtState::Stopping,
            _ => DhtState::Stopped,
        }
    }
}

// ============================================================================
// Task Set
// ============================================================================

/// Cancellation signal and join point shared by all background work.
///
/// Closing happens under the join-set lock, so a task is either spawned into
/// the set that `shutdown` drains or refused.
#[derive(Clone)]
pub(crate) struct TaskSet {
    cancel: CancellationToken,
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Run `fut` until it finishes or the set shuts down.
    /// Returns false once the set is closed.
    pub fn spawn<F>(&self, name: &'static str, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        if self.cancel.is_cancelled() {
            return false;
        }
        while tasks.try_join_next().is_some() {}
        let cancel = self.cancel.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => trace!(task = name, "task cancelled"),
                _ = fut => {}
            }
        });
        true
    }

    /// Cancel everything and wait for every task to exit.
    pub async fn shutdown(&self) {
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            self.cancel.cancel();
            std::mem::take(&mut *guard)
        };
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined
                && e.is_panic()
            {
                warn!(error = %e, "background task panicked");
            }
        }
    }
}

// ============================================================================
// Maintenance Jobs
// ============================================================================

/// The jobs the lifecycle schedules. Implemented by the DHT core.
#[async_trait]
pub(crate) trait Maintenance: Send + Sync + 'static {
    async fn bootstrap(&self) -> Result<()>;
    async fn refresh_buckets(&self) -> Result<()>;
    async fn cleanup(&self) -> Result<()>;
    async fn republish(&self) -> Result<()>;
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Schedule {
    pub refresh: Duration,
    pub cleanup: Duration,
    pub republish: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

fn spawn_periodic<F, Fut>(tasks: &TaskSet, name: &'static str, period: Duration, job: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    tasks.spawn(name, async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            trace!(task = name, "periodic tick");
            if let Err(e) = job().await {
                warn!(task = name, error = %e, "periodic task failed");
            }
        }
    });
}

// ============================================================================
// State Machine
// ============================================================================

pub(crate) struct Lifecycle {
    state: AtomicU8,
    closed: AtomicBool,
    bootstrapped: Arc<AtomicBool>,
    started: Notify,
    tasks: TaskSet,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(DhtState::Stopped as u8),
            closed: AtomicBool::new(false),
            bootstrapped: Arc::new(AtomicBool::new(false)),
            started: Notify::new(),
            tasks: TaskSet::new(),
        }
    }

    pub fn state(&self) -> DhtState {
        DhtState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn tasks(&self) -> &TaskSet {
        &self.tasks
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::Acquire)
    }

    pub fn mark_bootstrapped(&self) {
        self.bootstrapped.store(true, Ordering::Release);
    }

    fn transition(&self, from: DhtState, to: DhtState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Error describing why the DHT is not usable right now.
    fn unusable(&self) -> DhtError {
        if self.closed.load(Ordering::Acquire) {
            return DhtError::Closed;
        }
        match self.state() {
            DhtState::Stopped => DhtError::NotStarted,
            DhtState::Starting | DhtState::Running => DhtError::AlreadyStarted,
            DhtState::Stopping => DhtError::Closed,
        }
    }

    /// Public operations are allowed while `Running`.
    pub fn ensure_running(&self) -> Result<()> {
        if self.state() == DhtState::Running {
            Ok(())
        } else {
            match self.unusable() {
                DhtError::AlreadyStarted => Err(DhtError::NotStarted),
                other => Err(other),
            }
        }
    }

    /// Bootstrap is also allowed during `Starting`.
    pub fn ensure_active(&self) -> Result<()> {
        match self.state() {
            DhtState::Starting | DhtState::Running => Ok(()),
            _ => Err(self.unusable()),
        }
    }

    pub async fn start<M: Maintenance>(&self, jobs: Arc<M>, schedule: Schedule) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DhtError::Closed);
        }
        if !self.transition(DhtState::Stopped, DhtState::Starting) {
            return Err(self.unusable());
        }
        info!("dht starting");

        match jobs.bootstrap().await {
            Ok(()) => self.mark_bootstrapped(),
            Err(e) => {
                warn!(error = %e, "initial bootstrap failed, retrying in background");
                self.spawn_bootstrap_retry(jobs.clone(), schedule);
            }
        }

        let refresh_jobs = jobs.clone();
        spawn_periodic(&self.tasks, "bucket-refresh", schedule.refresh, move || {
            let jobs = refresh_jobs.clone();
            async move { jobs.refresh_buckets().await }
        });
        let cleanup_jobs = jobs.clone();
        spawn_periodic(&self.tasks, "cleanup", schedule.cleanup, move || {
            let jobs = cleanup_jobs.clone();
            async move { jobs.cleanup().await }
        });
        let republish_jobs = jobs;
        spawn_periodic(&self.tasks, "republish", schedule.republish, move || {
            let jobs = republish_jobs.clone();
            async move { jobs.republish().await }
        });

        self.transition(DhtState::Starting, DhtState::Running);
        self.started.notify_waiters();
        info!(bootstrapped = self.is_bootstrapped(), "dht running");
        Ok(())
    }

    fn spawn_bootstrap_retry<M: Maintenance>(&self, jobs: Arc<M>, schedule: Schedule) {
        let bootstrapped = self.bootstrapped.clone();
        self.tasks.spawn("bootstrap-retry", async move {
            let mut delay = schedule.backoff_initial;
            let mut attempt: u32 = 1;
            loop {
                tokio::time::sleep(delay).await;
                if bootstrapped.load(Ordering::Acquire) {
                    debug!(attempt, "bootstrap completed elsewhere, retry loop done");
                    break;
                }
                attempt += 1;
                match jobs.bootstrap().await {
                    Ok(()) => {
                        bootstrapped.store(true, Ordering::Release);
                        info!(attempt, "bootstrap succeeded");
                        break;
                    }
                    Err(e) => {
                        delay = (delay * 2).min(schedule.backoff_max);
                        debug!(attempt, error = %e, next_in = ?delay, "bootstrap retry failed");
                    }
                }
            }
        });
    }

    pub async fn stop(&self) -> Result<()> {
        loop {
            if self.transition(DhtState::Running, DhtState::Stopping) {
                break;
            }
            if self.state() != DhtState::Starting {
                return Err(match self.unusable() {
                    DhtError::AlreadyStarted => DhtError::NotStarted,
                    other => other,
                });
            }
            let started = self.started.notified();
            tokio::pin!(started);
            started.as_mut().enable();
            if self.state() == DhtState::Starting {
                started.await;
            }
        }
        info!("dht stopping");
        self.tasks.shutdown().await;
        self.closed.store(true, Ordering::Release);
        self.transition(DhtState::Stopping, DhtState::Stopped);
        info!("dht stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingJobs {
        bootstrap_calls: AtomicUsize,
        bootstrap_succeeds_after: usize,
        bootstrap_delay: Duration,
        refreshes: AtomicUsize,
        cleanups: AtomicUsize,
        republishes: AtomicUsize,
    }

    #[async_trait]
    impl Maintenance for CountingJobs {
        async fn bootstrap(&self) -> Result<()> {
            let n = self.bootstrap_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.bootstrap_delay.is_zero() {
                tokio::time::sleep(self.bootstrap_delay).await;
            }
            if n > self.bootstrap_succeeds_after {
                Ok(())
            } else {
                Err(DhtError::NoNodes)
            }
        }

        async fn refresh_buckets(&self) -> Result<()> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn cleanup(&self) -> Result<()> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Err(DhtError::Timeout)
        }

        async fn republish(&self) -> Result<()> {
            self.republishes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn schedule() -> Schedule {
        Schedule {
            refresh: Duration::from_secs(3600),
            cleanup: Duration::from_secs(600),
            republish: Duration::from_secs(1200),
            backoff_initial: Duration::from_secs(2),
            backoff_max: Duration::from_secs(16),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_walk_the_state_machine() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), DhtState::Stopped);
        assert!(matches!(lifecycle.ensure_running(), Err(DhtError::NotStarted)));
        assert!(matches!(lifecycle.stop().await, Err(DhtError::NotStarted)));

        lifecycle.start(Arc::new(CountingJobs::default()), schedule()).await.unwrap();
        assert_eq!(lifecycle.state(), DhtState::Running);
        assert!(lifecycle.is_bootstrapped());
        assert!(matches!(
            lifecycle.start(Arc::new(CountingJobs::default()), schedule()).await,
            Err(DhtError::AlreadyStarted)
        ));

        lifecycle.stop().await.unwrap();
        assert_eq!(lifecycle.state(), DhtState::Stopped);
        assert!(matches!(lifecycle.ensure_running(), Err(DhtError::Closed)));
        assert!(matches!(lifecycle.stop().await, Err(DhtError::Closed)));
        assert!(matches!(
            lifecycle.start(Arc::new(CountingJobs::default()), schedule()).await,
            Err(DhtError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_jobs_tick_and_survive_errors() {
        let lifecycle = Lifecycle::new();
        let jobs = Arc::new(CountingJobs::default());
        lifecycle.start(jobs.clone(), schedule()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1250)).await;
        // Cleanup fails every time yet keeps its schedule.
        assert_eq!(jobs.cleanups.load(Ordering::SeqCst), 2);
        assert_eq!(jobs.republishes.load(Ordering::SeqCst), 1);
        assert_eq!(jobs.refreshes.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(jobs.refreshes.load(Ordering::SeqCst), 1);

        lifecycle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_and_joins_all_tasks() {
        let lifecycle = Lifecycle::new();
        let jobs = Arc::new(CountingJobs::default());
        lifecycle.start(jobs.clone(), schedule()).await.unwrap();
        lifecycle.stop().await.unwrap();

        tokio::time::sleep(Duration::from_secs(10 * 3600)).await;
        assert_eq!(jobs.cleanups.load(Ordering::SeqCst), 0);
        assert_eq!(jobs.republishes.load(Ordering::SeqCst), 0);
        assert!(!lifecycle.tasks().spawn("late", async {}));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_bootstrap_retries_with_backoff() {
        let lifecycle = Lifecycle::new();
        let jobs = Arc::new(CountingJobs {
            bootstrap_succeeds_after: 3,
            ..Default::default()
        });
        lifecycle.start(jobs.clone(), schedule()).await.unwrap();
        assert_eq!(lifecycle.state(), DhtState::Running);
        assert!(!lifecycle.is_bootstrapped());

        // Retries at +2s and +4s fail, the one at +8s succeeds.
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(jobs.bootstrap_calls.load(Ordering::SeqCst), 3);
        assert!(!lifecycle.is_bootstrapped());

        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(jobs.bootstrap_calls.load(Ordering::SeqCst), 4);
        assert!(lifecycle.is_bootstrapped());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(jobs.bootstrap_calls.load(Ordering::SeqCst), 4);
        lifecycle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn task_set_refuses_work_after_shutdown() {
        let tasks = TaskSet::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        assert!(tasks.spawn("one-shot", async move {
            flag.store(true, Ordering::SeqCst);
        }));
        tokio::task::yield_now().await;
        tasks.shutdown().await;
        assert!(ran.load(Ordering::SeqCst));
        assert!(!tasks.spawn("late", async {}));
    }

    #[tokio::test(start_paused = true)]
    async fn external_bootstrap_ends_retry_loop() {
        let lifecycle = Lifecycle::new();
        let jobs = Arc::new(CountingJobs {
            bootstrap_succeeds_after: usize::MAX,
            ..Default::default()
        });
        lifecycle.start(jobs.clone(), schedule()).await.unwrap();
        assert_eq!(jobs.bootstrap_calls.load(Ordering::SeqCst), 1);

        lifecycle.mark_bootstrapped();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(jobs.bootstrap_calls.load(Ordering::SeqCst), 1);
        lifecycle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_start_waits_then_stops() {
        let lifecycle = Lifecycle::new();
        let jobs = Arc::new(CountingJobs {
            bootstrap_delay: Duration::from_secs(5),
            ..Default::default()
        });

        let (started, stopped) = tokio::join!(lifecycle.start(jobs.clone(), schedule()), async {
            tokio::task::yield_now().await;
            assert_eq!(lifecycle.state(), DhtState::Starting);
            lifecycle.stop().await
        });
        started.unwrap();
        stopped.unwrap();
        assert_eq!(lifecycle.state(), DhtState::Stopped);
        assert!(matches!(lifecycle.ensure_running(), Err(DhtError::Closed)));
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shutdown_joins_every_accepted_task() {
        let tasks = TaskSet::new();
        let dropped = Arc::new(AtomicUsize::new(0));

        let spawner = {
            let tasks = tasks.clone();
            let dropped = dropped.clone();
            tokio::spawn(async move {
                let mut accepted = 0usize;
                loop {
                    let guard = DropCounter(dropped.clone());
                    let accepted_now = tasks.spawn("parked", async move {
                        let _guard = guard;
                        std::future::pending::<()>().await
                    });
                    if !accepted_now {
                        return accepted;
                    }
                    accepted += 1;
                    tokio::task::yield_now().await;
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        tasks.shutdown().await;
        let accepted = spawner.await.unwrap();

        // Every accepted task was torn down by shutdown, plus the refused one.
        assert!(accepted > 0);
        assert_eq!(dropped.load(Ordering::SeqCst), accepted + 1);
    }
}
