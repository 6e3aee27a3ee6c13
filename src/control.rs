//! Operator-facing operations: start/stop/reschedule jobs and read-only views.
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::failsafe::{FailSafeLog, Record, ReplayError, ALL_KINDS};
use crate::model::{JournalOp, Queue, QueuedItem, ScheduleConfig, SitemapSegment, Stage};
use crate::scheduler::{JobHandle, JobKey, JobManager, JobStatus, SchedulerError};
use crate::store::{ItemStore, ScheduleStore, SitemapStore, StoreError};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("interval must be greater than zero")]
    InvalidInterval,
    #[error("unknown publication {0}")]
    UnknownPublication(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("journal error: {0}")]
    Journal(#[from] ReplayError),
}

#[derive(Clone)]
pub struct ControlPlane {
    manager: Arc<JobManager>,
    items: Arc<dyn ItemStore>,
    sitemaps: Arc<dyn SitemapStore>,
    schedules: Arc<dyn ScheduleStore>,
    journal: Arc<FailSafeLog>,
}

impl ControlPlane {
    pub fn new(
        manager: Arc<JobManager>,
        items: Arc<dyn ItemStore>,
        sitemaps: Arc<dyn SitemapStore>,
        schedules: Arc<dyn ScheduleStore>,
        journal: Arc<FailSafeLog>,
    ) -> Self {
        Self {
            manager,
            items,
            sitemaps,
            schedules,
            journal,
        }
    }

    /// Starting does not change the stored `enabled` flag.
    pub fn start_stage(&self, publication: &str, stage: Stage) -> Result<JobHandle, ControlError> {
        Ok(self.manager.start(&JobKey::new(publication, stage))?)
    }

    pub fn stop_stage(&self, publication: &str, stage: Stage) -> Result<bool, ControlError> {
        Ok(self.manager.stop(&JobKey::new(publication, stage))?)
    }

    /// Persist the schedule, apply the interval, then start or stop the job
    /// to match `enabled`.
    pub async fn update_schedule(
        &self,
        publication: &str,
        stage: Stage,
        interval_seconds: u64,
        enabled: bool,
    ) -> Result<ScheduleConfig, ControlError> {
        if interval_seconds == 0 {
            return Err(ControlError::InvalidInterval);
        }
        let key = JobKey::new(publication, stage);
        let running = self.manager.is_running(&key)?;

        let schedule = ScheduleConfig {
            publication: publication.to_string(),
            stage,
            interval_seconds,
            enabled,
        };
        self.schedules.upsert_schedule(&schedule).await?;
        self.manager.set_interval(&key, interval_seconds)?;
        match (enabled, running) {
            (true, false) => {
                self.manager.start(&key)?;
            }
            (false, true) => {
                self.manager.stop(&key)?;
            }
            _ => {}
        }
        info!(job = %key, interval_seconds, enabled, "schedule updated");
        Ok(schedule)
    }

    pub async fn list_items(
        &self,
        queue: Queue,
        publication: &str,
        url_filter: Option<&str>,
    ) -> Result<Vec<QueuedItem>, ControlError> {
        Ok(self.items.list(queue, publication, url_filter).await?)
    }

    pub async fn count_current_month(&self, queue: Queue) -> Result<i64, ControlError> {
        Ok(self.items.count_current_month(queue).await?)
    }

    pub async fn list_segments(
        &self,
        publication: &str,
        url_filter: Option<&str>,
    ) -> Result<Vec<SitemapSegment>, ControlError> {
        Ok(self.sitemaps.list_segments(publication, url_filter).await?)
    }

    pub async fn schedules(&self) -> Result<Vec<ScheduleConfig>, ControlError> {
        Ok(self.schedules.schedules().await?)
    }

    pub fn job_statuses(&self) -> Vec<JobStatus> {
        self.manager.statuses()
    }

    fn ensure_publication(&self, publication: &str) -> Result<(), ControlError> {
        if self.manager.has_publication(publication) {
            Ok(())
        } else {
            Err(ControlError::UnknownPublication(publication.to_string()))
        }
    }

    /// Records waiting in the save and delete journals of one queue.
    pub async fn journal_backlog(&self, publication: &str, queue: Queue) -> Result<Vec<Record>, ControlError> {
        self.ensure_publication(publication)?;
        let mut records = self.journal.backlog(publication, queue, JournalOp::Delete).await?;
        records.extend(self.journal.backlog(publication, queue, JournalOp::Save).await?);
        Ok(records)
    }

    /// Replay every journal of a publication, deletes first.
    pub async fn drain_journals(&self, publication: &str) -> Result<usize, ControlError> {
        self.ensure_publication(publication)?;
        Ok(self
            .journal
            .drain(self.items.as_ref(), publication, &ALL_KINDS)
            .await)
    }
}
