//! Lifecycle event bus
//!
//! One channel per event kind, each with a single consumer:
//! - `starting` and `exited` go to the tracker task, sole owner of the
//!   tracking map and the capacity counters
//! - `started` goes to the launcher task, sole producer of wait tasks
//!
//! Read-only queries go to the tracker on a fourth channel. The channels
//! close once every producer holding a sender is gone.

use std::collections::HashMap;
use stratum_core::domain::job::Job;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::admission::AdmissionController;
use super::dispatch::{self, WaitContext};
use crate::error::DispatchError;

const BUS_CAPACITY: usize = 256;

/// Answer of the tracker to a starting event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    AtCapacity,
    AlreadyTracked,
}

#[derive(Debug)]
struct Starting {
    job: Job,
    /// Already running, registered without a capacity check
    recovered: bool,
    reply: oneshot::Sender<Admission>,
}

#[derive(Debug)]
struct Started {
    job: Job,
    recovered: bool,
}

#[derive(Debug)]
enum Query {
    Saturated(oneshot::Sender<Vec<String>>),
    Tracked(oneshot::Sender<Vec<String>>),
    Counters(oneshot::Sender<HashMap<String, usize>>),
}

/// Sending side of the exited channel, the only handle wait tasks get
#[derive(Debug, Clone)]
pub struct ExitNotifier {
    tx: mpsc::Sender<String>,
}

impl ExitNotifier {
    pub async fn exited(&self, job_id: &str) {
        if self.tx.send(job_id.to_string()).await.is_err() {
            warn!(job_id, "Lifecycle bus closed, exited event dropped");
        }
    }
}

/// Producer handle of the bus
#[derive(Debug, Clone)]
pub struct Bus {
    starting: mpsc::Sender<Starting>,
    started: mpsc::Sender<Started>,
    exited: ExitNotifier,
    query: mpsc::Sender<Query>,
}

impl Bus {
    /// Asks the tracker to admit and register a job
    pub async fn starting(&self, job: Job, recovered: bool) -> Result<Admission, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.starting
            .send(Starting {
                job,
                recovered,
                reply,
            })
            .await
            .map_err(|_| DispatchError::BusClosed)?;
        rx.await.map_err(|_| DispatchError::BusClosed)
    }

    /// Hands a running job to the launcher, which spawns its wait task
    pub async fn started(&self, job: Job, recovered: bool) -> Result<(), DispatchError> {
        self.started
            .send(Started { job, recovered })
            .await
            .map_err(|_| DispatchError::BusClosed)
    }

    /// Frees the job's slot and forgets it
    pub async fn exited(&self, job_id: &str) {
        self.exited.exited(job_id).await
    }

    /// Workers that cannot take another job
    pub async fn saturated(&self) -> Result<Vec<String>, DispatchError> {
        self.ask(Query::Saturated).await
    }

    /// Ids of all tracked jobs, sorted
    pub async fn tracked(&self) -> Result<Vec<String>, DispatchError> {
        self.ask(Query::Tracked).await
    }

    /// Current capacity counters
    pub async fn counters(&self) -> Result<HashMap<String, usize>, DispatchError> {
        self.ask(Query::Counters).await
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Query) -> Result<T, DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.query
            .send(make(tx))
            .await
            .map_err(|_| DispatchError::BusClosed)?;
        rx.await.map_err(|_| DispatchError::BusClosed)
    }
}

/// Consumer tasks of the bus
pub struct BusTasks {
    tracker: JoinHandle<()>,
    launcher: JoinHandle<()>,
}

impl BusTasks {
    /// Waits for the launcher, it ends once no `started` sender is left
    pub async fn join_launcher(&mut self) {
        if let Err(e) = (&mut self.launcher).await {
            warn!("Launcher task failed: {}", e);
        }
    }

    /// Waits for the tracker, it ends once no sender of any kind is left
    pub async fn join_tracker(self) {
        if let Err(e) = self.tracker.await {
            warn!("Tracker task failed: {}", e);
        }
    }
}

/// Starts the tracker and launcher tasks
///
/// Wait tasks are spawned on `waits.tasks` and report their exit through
/// the returned bus.
pub fn spawn(max_per_worker: usize, waits: impl FnOnce(ExitNotifier) -> WaitContext) -> (Bus, BusTasks) {
    let (starting_tx, starting_rx) = mpsc::channel(BUS_CAPACITY);
    let (started_tx, started_rx) = mpsc::channel(BUS_CAPACITY);
    let (exited_tx, exited_rx) = mpsc::channel(BUS_CAPACITY);
    let (query_tx, query_rx) = mpsc::channel(BUS_CAPACITY);

    let exited = ExitNotifier { tx: exited_tx };

    let tracker = tokio::spawn(run_tracker(
        AdmissionController::new(max_per_worker),
        starting_rx,
        exited_rx,
        query_rx,
    ));
    let launcher = tokio::spawn(run_launcher(started_rx, waits(exited.clone())));

    let bus = Bus {
        starting: starting_tx,
        started: started_tx,
        exited,
        query: query_tx,
    };
    (bus, BusTasks { tracker, launcher })
}

async fn run_tracker(
    mut admission: AdmissionController,
    mut starting_rx: mpsc::Receiver<Starting>,
    mut exited_rx: mpsc::Receiver<String>,
    mut query_rx: mpsc::Receiver<Query>,
) {
    let mut jobs: HashMap<String, Job> = HashMap::new();

    loop {
        tokio::select! {
            Some(event) = starting_rx.recv() => {
                let answer = if jobs.contains_key(&event.job.id) {
                    Admission::AlreadyTracked
                } else if event.recovered {
                    admission.register(&event.job.worker_id);
                    Admission::Admitted
                } else if admission.try_admit(&event.job.worker_id) {
                    Admission::Admitted
                } else {
                    Admission::AtCapacity
                };

                let job_id = event.job.id.clone();
                let worker_id = event.job.worker_id.clone();
                if answer == Admission::Admitted {
                    debug!(
                        job_id = %job_id,
                        worker_id = %worker_id,
                        slots_used = admission.count(&worker_id),
                        "Job tracked"
                    );
                    jobs.insert(job_id.clone(), event.job);
                }

                // A sender that went away never learns about its slot
                if event.reply.send(answer).is_err() && answer == Admission::Admitted {
                    jobs.remove(&job_id);
                    admission.release(&worker_id);
                }
            }
            Some(job_id) = exited_rx.recv() => {
                match jobs.remove(&job_id) {
                    Some(job) => {
                        admission.release(&job.worker_id);
                        info!(job_id = %job_id, worker_id = %job.worker_id, "Job exited");
                    }
                    None => warn!(job_id = %job_id, "Exited event for unknown job"),
                }
            }
            Some(query) = query_rx.recv() => {
                match query {
                    Query::Saturated(reply) => {
                        let _ = reply.send(admission.saturated());
                    }
                    Query::Tracked(reply) => {
                        let mut ids: Vec<String> = jobs.keys().cloned().collect();
                        ids.sort();
                        let _ = reply.send(ids);
                    }
                    Query::Counters(reply) => {
                        let _ = reply.send(admission.counters());
                    }
                }
            }
            else => break,
        }
    }

    debug!(remaining = jobs.len(), "Tracker stopped");
}

async fn run_launcher(mut started_rx: mpsc::Receiver<Started>, ctx: WaitContext) {
    while let Some(event) = started_rx.recv().await {
        ctx.tasks
            .spawn(dispatch::wait_job(ctx.clone(), event.job, event.recovered));
    }
    debug!("Launcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::ScriptedRunner;
    use crate::store::memory::{MemoryJobStore, job};
    use std::sync::Arc;
    use std::time::Duration;
    use stratum_core::domain::job::JobStatus;
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    fn bus(max: usize) -> (Bus, BusTasks, TaskTracker, CancellationToken) {
        let tasks = TaskTracker::new();
        let cancel = CancellationToken::new();
        let (bus, consumers) = spawn(max, |exited| WaitContext {
            store: Arc::new(MemoryJobStore::default()),
            runner: Arc::new(ScriptedRunner::default()),
            exited,
            cancel: cancel.clone(),
            retry_interval: Duration::from_millis(10),
            tasks: tasks.clone(),
        });
        (bus, consumers, tasks, cancel)
    }

    #[tokio::test]
    async fn test_admission_through_the_tracker() {
        let (bus, _tasks, _, _) = bus(1);

        let j1 = job("j1", "r1", JobStatus::Pending);
        let j2 = job("j2", "r1", JobStatus::Pending);

        assert_eq!(bus.starting(j1.clone(), false).await.unwrap(), Admission::Admitted);
        assert_eq!(bus.starting(j1, false).await.unwrap(), Admission::AlreadyTracked);
        assert_eq!(bus.starting(j2.clone(), false).await.unwrap(), Admission::AtCapacity);
        assert_eq!(bus.saturated().await.unwrap(), ["r1"]);

        bus.exited("j1").await;
        assert_eq!(bus.starting(j2, false).await.unwrap(), Admission::Admitted);
        assert_eq!(bus.tracked().await.unwrap(), ["j2"]);
    }

    #[tokio::test]
    async fn test_recovered_jobs_bypass_capacity() {
        let (bus, _tasks, _, _) = bus(1);

        for id in ["j1", "j2"] {
            let answer = bus.starting(job(id, "r1", JobStatus::Running), true).await;
            assert_eq!(answer.unwrap(), Admission::Admitted);
        }
        assert_eq!(bus.counters().await.unwrap().get("r1"), Some(&2));
    }

    #[tokio::test]
    async fn test_unknown_exit_is_ignored() {
        let (bus, _tasks, _, _) = bus(1);
        bus.starting(job("j1", "r1", JobStatus::Pending), false)
            .await
            .unwrap();

        bus.exited("nope").await;
        bus.exited("nope").await;

        assert_eq!(bus.tracked().await.unwrap(), ["j1"]);
        assert_eq!(bus.counters().await.unwrap().get("r1"), Some(&1));
    }

    #[tokio::test]
    async fn test_consumers_stop_after_producers() {
        let (bus, mut consumers, tasks, cancel) = bus(1);

        bus.starting(job("j1", "r1", JobStatus::Running), true)
            .await
            .unwrap();
        bus.started(job("j1", "r1", JobStatus::Running), true)
            .await
            .unwrap();

        // Detach the wait task, then close the bus in shutdown order
        cancel.cancel();
        drop(bus);
        consumers.join_launcher().await;
        tasks.close();
        tasks.wait().await;

        tokio::time::timeout(Duration::from_secs(1), consumers.join_tracker())
            .await
            .unwrap();
    }
}
