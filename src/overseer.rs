//! Monthly quota control over every registered job.
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::model::Queue;
use crate::scheduler::{JobKey, JobManager};
use crate::stages::StageRun;
use crate::store::{ItemStore, ScheduleStore};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverseerReport {
    pub executed: i64,
    pub failed: i64,
    /// `None` when the pending count could not be read.
    pub pending: Option<i64>,
    pub cap_reached: bool,
    pub stopped: Vec<JobKey>,
    pub started: Vec<JobKey>,
    /// Stopped jobs left alone because their schedule is disabled.
    pub held: Vec<JobKey>,
}

pub struct Overseer {
    manager: Arc<JobManager>,
    items: Arc<dyn ItemStore>,
    schedules: Arc<dyn ScheduleStore>,
    monthly_cap: i64,
}

impl Overseer {
    pub fn new(
        manager: Arc<JobManager>,
        items: Arc<dyn ItemStore>,
        schedules: Arc<dyn ScheduleStore>,
        monthly_cap: i64,
    ) -> Self {
        Self {
            manager,
            items,
            schedules,
            monthly_cap,
        }
    }

    /// One pass: halt everything over the cap, otherwise resume enabled jobs.
    #[instrument(skip_all, fields(cap = self.monthly_cap))]
    pub async fn run_once(&self) -> Result<OverseerReport> {
        let executed = self
            .items
            .count_current_month(Queue::Executed)
            .await
            .context("failed to count executed items")?;
        let failed = self
            .items
            .count_current_month(Queue::Failed)
            .await
            .context("failed to count failed items")?;
        // Informational only; pending volume does not count toward the cap.
        let pending = match self.items.count_current_month(Queue::Pending).await {
            Ok(n) => Some(n),
            Err(err) => {
                warn!(%err, "failed to count pending items");
                None
            }
        };

        let mut report = OverseerReport {
            executed,
            failed,
            pending,
            cap_reached: executed + failed >= self.monthly_cap,
            ..Default::default()
        };

        for key in self.manager.keys() {
            let running = self.manager.is_running(&key)?;
            if report.cap_reached {
                if running && self.manager.stop(&key)? {
                    report.stopped.push(key);
                }
                continue;
            }
            if running {
                continue;
            }
            let schedule = self
                .schedules
                .schedule(&key.publication, key.stage)
                .await
                .with_context(|| format!("failed to read schedule of {key}"))?;
            match schedule {
                Some(s) if s.enabled => {
                    self.manager.set_interval(&key, s.interval_seconds)?;
                    self.manager.start(&key)?;
                    report.started.push(key);
                }
                Some(_) => {
                    warn!(job = %key, "job disabled; leaving it stopped");
                    report.held.push(key);
                }
                None => {
                    warn!(job = %key, "no schedule stored; leaving job stopped");
                    report.held.push(key);
                }
            }
        }

        info!(
            executed,
            failed,
            pending = ?pending,
            cap_reached = report.cap_reached,
            stopped = report.stopped.len(),
            started = report.started.len(),
            "overseer pass finished"
        );
        Ok(report)
    }
}

#[async_trait]
impl StageRun for Overseer {
    async fn run(&self) -> Result<()> {
        self.run_once().await.map(|_| ())
    }
}
