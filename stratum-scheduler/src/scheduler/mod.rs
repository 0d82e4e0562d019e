//! Leader-elected scheduling loop
//!
//! `Scheduler::run` supervises sessions. A session holds the lease, owns a
//! fresh lifecycle bus, reattaches to jobs left running or claimed by a
//! previous session, then polls pending jobs until the lease is lost or shutdown is
//! requested. Whatever ends a session, the supervisor sleeps the restart
//! backoff and starts a new one.

pub mod admission;
pub mod bus;
pub mod dispatch;

use std::collections::BTreeSet;
use std::sync::Arc;
use stratum_core::domain::job::{Job, JobStatus};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use self::bus::{Admission, Bus, BusTasks};
use self::dispatch::WaitContext;
use crate::config::Config;
use crate::error::LockError;
use crate::lease::{Lease, LockService};
use crate::runner::JobRunner;
use crate::store::JobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    LeaseLost,
    Shutdown,
}

pub struct Scheduler {
    config: Config,
    store: Arc<dyn JobStore>,
    lock: Arc<dyn LockService>,
    runner: Arc<dyn JobRunner>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        store: Arc<dyn JobStore>,
        lock: Arc<dyn LockService>,
        runner: Arc<dyn JobRunner>,
    ) -> Self {
        Self {
            config,
            store,
            lock,
            runner,
        }
    }

    /// Runs sessions until `shutdown` is cancelled
    ///
    /// Each session runs in its own task so a panic ends only that session.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(holder_id = %self.config.holder_id, "Scheduler started");

        loop {
            let this = Arc::clone(&self);
            let token = shutdown.clone();
            let session = tokio::spawn(async move { this.run_session(token).await });

            match session.await {
                Ok(Ok(())) => debug!("Scheduler session ended"),
                Ok(Err(e)) => error!("Scheduler session failed: {}", e),
                Err(e) if e.is_panic() => {
                    error!("Scheduler session panicked: {}", panic_message(e.into_panic()))
                }
                Err(e) => error!("Scheduler session aborted: {}", e),
            }

            if shutdown.is_cancelled() {
                break;
            }

            info!("Restarting scheduler in {:?}", self.config.restart_backoff);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.restart_backoff) => {}
            }
        }

        info!("Scheduler stopped");
    }

    async fn run_session(&self, shutdown: CancellationToken) -> Result<(), LockError> {
        let key = &self.config.lock_key;
        let holder_id = &self.config.holder_id;

        info!(key = %key, "Acquiring scheduler lease");
        let mut lease = tokio::select! {
            res = self.lock.acquire(key, holder_id) => res?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        info!(key = %key, "Lease acquired, scheduler active");

        let session = Session::start(self, shutdown.child_token());
        session.recover().await;
        let reason = session.poll(&mut lease).await;

        match reason {
            StopReason::LeaseLost => warn!("Scheduler lease lost, shutting down session"),
            StopReason::Shutdown => info!("Shutdown requested, stopping session"),
        }
        session.shutdown().await;

        if let Err(e) = self.lock.release(lease).await {
            warn!("Failed to release scheduler lease: {}", e);
        }
        Ok(())
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// In-memory state of one lease term
struct Session {
    store: Arc<dyn JobStore>,
    runner: Arc<dyn JobRunner>,
    bus: Bus,
    bus_tasks: BusTasks,
    dispatches: TaskTracker,
    waits: TaskTracker,
    cancel: CancellationToken,
    poll_interval: std::time::Duration,
    batch_size: usize,
    /// Detaches every wait task if the session unwinds
    _cancel_on_drop: DropGuard,
}

impl Session {
    fn start(scheduler: &Scheduler, cancel: CancellationToken) -> Self {
        let waits = TaskTracker::new();
        let (bus, bus_tasks) = bus::spawn(scheduler.config.max_jobs_per_worker, |exited| {
            WaitContext {
                store: scheduler.store.clone(),
                runner: scheduler.runner.clone(),
                exited,
                cancel: cancel.clone(),
                retry_interval: scheduler.config.wait_retry_interval,
                tasks: waits.clone(),
            }
        });

        Self {
            store: scheduler.store.clone(),
            runner: scheduler.runner.clone(),
            bus,
            bus_tasks,
            dispatches: TaskTracker::new(),
            waits,
            _cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
            poll_interval: scheduler.config.poll_interval,
            batch_size: scheduler.config.batch_size,
        }
    }

    /// Reattaches to every job left running or claimed, without starting
    /// anything
    ///
    /// A claimed job whose step never started goes back to pending once its
    /// wait task finds no step on the runner.
    async fn recover(&self) {
        let mut jobs = Vec::new();
        for status in [JobStatus::Running, JobStatus::Assigning] {
            match self.store.find_by_status(status, &[], None).await {
                Ok(found) => jobs.extend(found),
                Err(e) => {
                    error!("Failed to query {} jobs for recovery: {}", status, e);
                    return;
                }
            }
        }

        let mut recovered = 0;
        for job in jobs {
            match self.bus.starting(job.clone(), true).await {
                Ok(Admission::Admitted) => {
                    let job_id = job.id.clone();
                    if let Err(e) = self.bus.started(job, true).await {
                        warn!(job_id = %job_id, "Cannot reattach to job: {}", e);
                        self.bus.exited(&job_id).await;
                        continue;
                    }
                    recovered += 1;
                }
                Ok(_) => debug!(job_id = %job.id, "Job already tracked, skipping"),
                Err(e) => {
                    warn!("Recovery interrupted: {}", e);
                    return;
                }
            }
        }

        info!("Recovered {} active job(s)", recovered);
        self.check_drift().await;
    }

    /// Warns about workers whose tracked count differs from the store
    async fn check_drift(&self) {
        let tracked = match self.bus.counters().await {
            Ok(counters) => counters,
            Err(_) => return,
        };
        let stored = match self.store.count_active_by_worker().await {
            Ok(counts) => counts,
            Err(e) => {
                warn!("Failed to count active jobs: {}", e);
                return;
            }
        };

        let workers: BTreeSet<&String> = tracked.keys().chain(stored.keys()).collect();
        for worker in workers {
            let (t, s) = (
                tracked.get(worker).copied().unwrap_or(0),
                stored.get(worker).copied().unwrap_or(0),
            );
            if t != s {
                warn!(
                    worker_id = %worker,
                    tracked = t,
                    stored = s,
                    "Capacity counter differs from active jobs in the store"
                );
            }
        }
    }

    async fn poll(&self, lease: &mut Lease) -> StopReason {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = lease.lost() => return StopReason::LeaseLost,
                _ = self.cancel.cancelled() => return StopReason::Shutdown,
                _ = ticker.tick() => self.poll_once().await,
            }
        }
    }

    /// Fetches one batch of pending jobs and dispatches each in its own task
    async fn poll_once(&self) {
        let saturated = match self.bus.saturated().await {
            Ok(workers) => workers,
            Err(e) => {
                warn!("Cannot read capacity: {}", e);
                return;
            }
        };

        let jobs = match self
            .store
            .find_by_status(JobStatus::Pending, &saturated, Some(self.batch_size))
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("Failed to query pending jobs: {}", e);
                return;
            }
        };

        if jobs.is_empty() {
            return;
        }
        debug!(
            saturated = saturated.len(),
            "Dispatching {} candidate job(s)",
            jobs.len()
        );

        for job in jobs {
            self.spawn_dispatch(job);
        }
    }

    fn spawn_dispatch(&self, job: Job) {
        let store = self.store.clone();
        let runner = self.runner.clone();
        let bus = self.bus.clone();

        self.dispatches.spawn(async move {
            let job_id = job.id.clone();
            let worker_id = job.worker_id.clone();
            match dispatch::dispatch(job, store.as_ref(), runner.as_ref(), &bus).await {
                Ok(()) => {}
                Err(e) if e.is_benign() => {
                    debug!(job_id = %job_id, worker_id = %worker_id, "Job not dispatched: {}", e)
                }
                Err(e) => error!(job_id = %job_id, worker_id = %worker_id, "Dispatch failed: {}", e),
            }
        });
    }

    /// Stops dispatch, detaches wait tasks and joins everything in
    /// producer-before-consumer order
    async fn shutdown(self) {
        let Session {
            bus,
            mut bus_tasks,
            dispatches,
            waits,
            cancel,
            _cancel_on_drop,
            ..
        } = self;

        if let Ok(tracked) = bus.tracked().await {
            if !tracked.is_empty() {
                info!("Detaching from {} tracked job(s)", tracked.len());
            }
        }
        cancel.cancel();

        dispatches.close();
        dispatches.wait().await;

        // Last `started` sender, the launcher ends once it is gone
        drop(bus);
        bus_tasks.join_launcher().await;

        waits.close();
        waits.wait().await;

        bus_tasks.join_tracker().await;
        info!("Scheduler session stopped");
    }
}

#[cfg(test)]
pub mod testing {
    //! Polling helpers for asynchronous assertions

    use super::*;
    use crate::store::memory::MemoryJobStore;
    use std::time::Duration;

    const ATTEMPTS: usize = 300;
    const STEP: Duration = Duration::from_millis(10);

    pub async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..ATTEMPTS {
            if check() {
                return;
            }
            tokio::time::sleep(STEP).await;
        }
        panic!("condition not reached");
    }

    pub async fn wait_for_status(store: &MemoryJobStore, job_id: &str, status: JobStatus) {
        for _ in 0..ATTEMPTS {
            if store.status(job_id).await == Some(status) {
                return;
            }
            tokio::time::sleep(STEP).await;
        }
        panic!(
            "job {} stuck in {:?}, expected {}",
            job_id,
            store.status(job_id).await,
            status
        );
    }

    pub async fn wait_for_untracked(bus: &Bus) {
        for _ in 0..ATTEMPTS {
            if bus.tracked().await.unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(STEP).await;
        }
        panic!("jobs still tracked: {:?}", bus.tracked().await);
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::error::StoreError;
    use crate::lease::MemoryLockService;
    use crate::runner::testing::ScriptedRunner;
    use crate::store::memory::{MemoryJobStore, job};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config(holder: &str, max: usize) -> Config {
        Config {
            holder_id: holder.to_string(),
            poll_interval: Duration::from_millis(10),
            max_jobs_per_worker: max,
            restart_backoff: Duration::from_secs(3600),
            wait_retry_interval: Duration::from_millis(10),
            ..Config::default()
        }
    }

    fn scheduler(
        config: Config,
        store: &MemoryJobStore,
        lock: &MemoryLockService,
        runner: &Arc<ScriptedRunner>,
    ) -> Scheduler {
        Scheduler::new(
            config,
            Arc::new(store.clone()),
            Arc::new(lock.clone()),
            runner.clone(),
        )
    }

    #[tokio::test]
    async fn test_poll_skips_saturated_workers() {
        let store = MemoryJobStore::default();
        store.insert(job("a1", "r1", JobStatus::Running)).await;
        store.insert(job("a2", "r1", JobStatus::Running)).await;
        store.insert(job("p1", "r1", JobStatus::Pending)).await;
        store.insert(job("p2", "r2", JobStatus::Pending)).await;

        let runner = Arc::new(ScriptedRunner::default());
        let lock = MemoryLockService::new();
        let sched = scheduler(config("a", 2), &store, &lock, &runner);
        let session = Session::start(&sched, CancellationToken::new());

        session.recover().await;
        session.poll_once().await;
        session.dispatches.close();
        session.dispatches.wait().await;

        assert_eq!(runner.started(), ["p2"]);
        assert_eq!(store.status("p1").await, Some(JobStatus::Pending));
        assert_eq!(store.status("p2").await, Some(JobStatus::Running));
        assert_eq!(session.bus.tracked().await.unwrap(), ["a1", "a2", "p2"]);

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_recovery_reattaches_without_starting() {
        let store = MemoryJobStore::default();
        for id in ["j1", "j2", "j3"] {
            store.insert(job(id, "r1", JobStatus::Running)).await;
        }
        store.insert(job("j4", "r1", JobStatus::Complete)).await;

        let runner = Arc::new(ScriptedRunner::default());
        let lock = MemoryLockService::new();
        let sched = scheduler(config("a", 1), &store, &lock, &runner);
        let session = Session::start(&sched, CancellationToken::new());

        session.recover().await;
        session.recover().await;

        assert_eq!(session.bus.tracked().await.unwrap(), ["j1", "j2", "j3"]);
        assert_eq!(session.bus.counters().await.unwrap().get("r1"), Some(&3));
        wait_until(|| runner.attached().len() == 3).await;
        assert!(runner.started().is_empty());

        session.shutdown().await;
        assert_eq!(runner.attached().len(), 3);
        for id in ["j1", "j2", "j3"] {
            assert_eq!(store.status(id).await, Some(JobStatus::Running));
        }
    }

    #[tokio::test]
    async fn test_recovered_job_finishes() {
        let store = MemoryJobStore::default();
        store.insert(job("j1", "r1", JobStatus::Running)).await;

        let runner = Arc::new(ScriptedRunner::default());
        let lock = MemoryLockService::new();
        let sched = scheduler(config("a", 1), &store, &lock, &runner);
        let session = Session::start(&sched, CancellationToken::new());

        session.recover().await;
        runner.finish("j1", 0, false);
        wait_for_status(&store, "j1", JobStatus::Complete).await;
        wait_for_untracked(&session.bus).await;

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_recovery_resolves_leftover_claims() {
        let store = MemoryJobStore::default();
        store.insert(job("c1", "r1", JobStatus::Assigning)).await;
        store.insert(job("c2", "r2", JobStatus::Assigning)).await;

        let runner = Arc::new(ScriptedRunner::default());
        runner.lose_step("c2");
        let lock = MemoryLockService::new();
        let sched = scheduler(config("a", 1), &store, &lock, &runner);
        let session = Session::start(&sched, CancellationToken::new());

        session.recover().await;

        // c1's step exists and is followed to its end
        wait_until(|| runner.attached().len() == 2).await;
        runner.finish("c1", 0, false);
        wait_for_status(&store, "c1", JobStatus::Complete).await;

        // c2 never started, it is dispatched again
        wait_for_status(&store, "c2", JobStatus::Pending).await;
        wait_for_untracked(&session.bus).await;
        session.poll_once().await;
        session.dispatches.close();
        session.dispatches.wait().await;
        assert_eq!(runner.started(), ["c2"]);
        assert_eq!(store.status("c2").await, Some(JobStatus::Running));

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_lease_loss_stops_dispatch() {
        let store = MemoryJobStore::default();
        store.insert(job("j1", "r1", JobStatus::Pending)).await;
        let lock = MemoryLockService::new();
        let shutdown = CancellationToken::new();

        let runner_a = Arc::new(ScriptedRunner::default());
        let runner_b = Arc::new(ScriptedRunner::default());
        let a = Arc::new(scheduler(config("a", 1), &store, &lock, &runner_a));
        let b = Arc::new(scheduler(config("b", 1), &store, &lock, &runner_b));

        let run_a = tokio::spawn(a.run(shutdown.clone()));
        wait_until(|| runner_a.started() == ["j1"]).await;
        let run_b = tokio::spawn(b.run(shutdown.clone()));

        // b cannot become active while a holds the lease
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runner_b.started().is_empty());
        assert!(runner_b.attached().is_empty());
        assert_eq!(lock.holder("stratum/scheduler").await.as_deref(), Some("a"));

        lock.revoke("stratum/scheduler").await;

        // b takes over and reattaches to the job a started
        wait_until(|| runner_b.attached() == ["j1"]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        store.insert(job("j2", "r2", JobStatus::Pending)).await;
        wait_until(|| runner_b.started() == ["j2"]).await;
        assert_eq!(runner_a.started(), ["j1"]);

        runner_b.finish("j1", 0, false);
        wait_for_status(&store, "j1", JobStatus::Complete).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), async {
            run_a.await.unwrap();
            run_b.await.unwrap();
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_lease() {
        let store = MemoryJobStore::default();
        store.insert(job("j1", "r1", JobStatus::Pending)).await;
        let lock = MemoryLockService::new();
        let runner = Arc::new(ScriptedRunner::default());
        let shutdown = CancellationToken::new();

        let sched = Arc::new(scheduler(config("a", 1), &store, &lock, &runner));
        let run = tokio::spawn(sched.run(shutdown.clone()));
        wait_until(|| runner.started() == ["j1"]).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();

        // The job keeps running, only the lease is gone
        assert_eq!(lock.holder("stratum/scheduler").await, None);
        assert_eq!(store.status("j1").await, Some(JobStatus::Running));
    }

    /// Panics on the first query, then behaves like an empty store
    struct PanickingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobStore for PanickingStore {
        async fn find_by_status(
            &self,
            _status: JobStatus,
            _exclude_workers: &[String],
            _limit: Option<usize>,
        ) -> Result<Vec<Job>, StoreError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("store exploded");
            }
            Ok(Vec::new())
        }

        async fn update_status(
            &self,
            _job_id: &str,
            _expected: JobStatus,
            _new: JobStatus,
        ) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn count_active_by_worker(&self) -> Result<HashMap<String, usize>, StoreError> {
            Ok(HashMap::new())
        }
    }

    #[tokio::test]
    async fn test_panicking_session_is_restarted() {
        let store = Arc::new(PanickingStore {
            calls: AtomicUsize::new(0),
        });
        let lock = MemoryLockService::new();
        let shutdown = CancellationToken::new();

        let mut cfg = config("a", 1);
        cfg.restart_backoff = Duration::from_millis(10);
        let sched = Arc::new(Scheduler::new(
            cfg,
            store.clone(),
            Arc::new(lock.clone()),
            Arc::new(ScriptedRunner::default()),
        ));

        let run = tokio::spawn(sched.run(shutdown.clone()));
        wait_until(|| store.calls.load(Ordering::SeqCst) >= 3).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("boom".to_string())), "boom");
        assert_eq!(panic_message(Box::new(42)), "unknown panic payload");
    }
}
