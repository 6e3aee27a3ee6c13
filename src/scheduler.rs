//! Job manager: one cancellable recurring loop per (publication, stage).
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::model::Stage;
use crate::stages::StageRun;
use crate::trigger::{until, Trigger};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub publication: String,
    pub stage: Stage,
}

impl JobKey {
    pub fn new(publication: impl Into<String>, stage: Stage) -> Self {
        Self {
            publication: publication.into(),
            stage,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.publication, self.stage)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("unknown job {0}")]
    UnknownJob(JobKey),
}

/// Identifies one live schedule of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub key: JobKey,
    pub id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub key: JobKey,
    pub running: bool,
    pub interval_seconds: u64,
}

struct Live {
    id: Uuid,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Live {
    fn is_live(&self) -> bool {
        !self.token.is_cancelled() && !self.task.is_finished()
    }
}

struct Job {
    runner: Arc<dyn StageRun>,
    trigger: Trigger,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    live: Option<Live>,
}

#[derive(Default)]
struct Jobs {
    jobs: BTreeMap<JobKey, Job>,
    /// Loops that were stopped but may still be finishing a run.
    retired: Vec<JoinHandle<()>>,
}

/// Owns every (publication, stage) job and its schedule.
#[derive(Default)]
pub struct JobManager {
    inner: Mutex<Jobs>,
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Jobs> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the runner for `key`. Returns false when the key was already
    /// registered; the existing job is kept.
    pub fn register(&self, key: JobKey, runner: Arc<dyn StageRun>, interval_seconds: u64) -> bool {
        let mut inner = self.lock();
        if inner.jobs.contains_key(&key) {
            warn!(job = %key, "job already registered");
            return false;
        }
        debug!(job = %key, interval_seconds, "job registered");
        inner.jobs.insert(
            key,
            Job {
                runner,
                trigger: Trigger::new(interval_seconds),
                run_lock: Arc::new(tokio::sync::Mutex::new(())),
                live: None,
            },
        );
        true
    }

    pub fn keys(&self) -> Vec<JobKey> {
        self.lock().jobs.keys().cloned().collect()
    }

    /// Whether any job is registered for `publication`.
    pub fn has_publication(&self, publication: &str) -> bool {
        self.lock().jobs.keys().any(|k| k.publication == publication)
    }

    /// Start the recurring loop of `key`. Starting a live job returns its
    /// current handle without spawning anything.
    pub fn start(&self, key: &JobKey) -> Result<JobHandle, SchedulerError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(key)
            .ok_or_else(|| SchedulerError::UnknownJob(key.clone()))?;

        if let Some(live) = job.live.as_ref().filter(|l| l.is_live()) {
            debug!(job = %key, id = %live.id, "job already running");
            return Ok(JobHandle {
                key: key.clone(),
                id: live.id,
            });
        }

        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        let task = tokio::spawn(run_loop(
            key.to_string(),
            job.runner.clone(),
            job.trigger.clone(),
            job.run_lock.clone(),
            token.clone(),
        ));
        let previous = job.live.replace(Live { id, token, task });
        if let Some(previous) = previous {
            inner.retired.retain(|t| !t.is_finished());
            inner.retired.push(previous.task);
        }
        info!(job = %key, %id, "job started");
        Ok(JobHandle {
            key: key.clone(),
            id,
        })
    }

    /// Cancel the future runs of `key`. A run in flight completes. Returns
    /// whether a live schedule was cancelled.
    pub fn stop(&self, key: &JobKey) -> Result<bool, SchedulerError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(key)
            .ok_or_else(|| SchedulerError::UnknownJob(key.clone()))?;
        let Some(live) = job.live.take() else {
            return Ok(false);
        };
        let was_live = live.is_live();
        live.token.cancel();
        inner.retired.retain(|t| !t.is_finished());
        inner.retired.push(live.task);
        if was_live {
            info!(job = %key, id = %live.id, "job stopped");
        }
        Ok(was_live)
    }

    /// Stop by handle; a stale handle (job restarted since) is a no-op.
    pub fn stop_handle(&self, handle: &JobHandle) -> Result<bool, SchedulerError> {
        let current = {
            let inner = self.lock();
            let job = inner
                .jobs
                .get(&handle.key)
                .ok_or_else(|| SchedulerError::UnknownJob(handle.key.clone()))?;
            job.live.as_ref().map(|l| l.id)
        };
        if current != Some(handle.id) {
            return Ok(false);
        }
        self.stop(&handle.key)
    }

    /// Applies from the next scheduled run on.
    pub fn set_interval(&self, key: &JobKey, interval_seconds: u64) -> Result<(), SchedulerError> {
        let inner = self.lock();
        let job = inner
            .jobs
            .get(key)
            .ok_or_else(|| SchedulerError::UnknownJob(key.clone()))?;
        job.trigger.set_interval(interval_seconds);
        Ok(())
    }

    pub fn is_running(&self, key: &JobKey) -> Result<bool, SchedulerError> {
        let inner = self.lock();
        let job = inner
            .jobs
            .get(key)
            .ok_or_else(|| SchedulerError::UnknownJob(key.clone()))?;
        Ok(job.live.as_ref().is_some_and(Live::is_live))
    }

    pub fn live_count(&self) -> usize {
        self.lock()
            .jobs
            .values()
            .filter(|j| j.live.as_ref().is_some_and(Live::is_live))
            .count()
    }

    pub fn statuses(&self) -> Vec<JobStatus> {
        self.lock()
            .jobs
            .iter()
            .map(|(key, job)| JobStatus {
                key: key.clone(),
                running: job.live.as_ref().is_some_and(Live::is_live),
                interval_seconds: job.trigger.interval_seconds(),
            })
            .collect()
    }

    /// Cancel every job and wait up to `grace` for runs in flight.
    pub async fn shutdown(&self, grace: Duration) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut inner = self.lock();
            let mut tasks = std::mem::take(&mut inner.retired);
            for job in inner.jobs.values_mut() {
                if let Some(live) = job.live.take() {
                    live.token.cancel();
                    tasks.push(live.task);
                }
            }
            tasks
        };
        let count = tasks.len();
        info!(count, "shutting down jobs");
        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(?grace, "jobs still running after grace period");
        }
    }
}

/// Spawn a recurring loop outside of any `JobManager`.
pub fn spawn_recurring(
    label: impl Into<String>,
    runner: Arc<dyn StageRun>,
    trigger: Trigger,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run_loop(
        label.into(),
        runner,
        trigger,
        Arc::new(tokio::sync::Mutex::new(())),
        token,
    ))
}

async fn run_loop(
    label: String,
    runner: Arc<dyn StageRun>,
    trigger: Trigger,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    token: CancellationToken,
) {
    let mut interval_rx = trigger.subscribe();
    let mut last_completion: Option<DateTime<Utc>> = None;

    loop {
        let next = trigger.next_execution(last_completion);
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            changed = interval_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                // Recompute the fire time from the same last completion.
                continue;
            }
            _ = tokio::time::sleep(until(next)) => {}
        }

        // A loop stopped and restarted quickly must not overlap the old run.
        let _guard = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            guard = run_lock.lock() => guard,
        };

        let run_id = Uuid::new_v4();
        let span = info_span!("job_run", job = %label, %run_id);
        let started = Instant::now();
        let outcome = AssertUnwindSafe(runner.run().instrument(span))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => debug!(job = %label, %run_id, elapsed = ?started.elapsed(), "run finished"),
            Ok(Err(err)) => error!(job = %label, %run_id, error = ?err, "run failed"),
            Err(_) => error!(job = %label, %run_id, "run panicked"),
        }
        last_completion = Some(Utc::now());
    }
    debug!(job = %label, "loop exited");
}
