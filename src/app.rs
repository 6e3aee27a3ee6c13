//! Service wiring: stores, collaborators, jobs and the overseer.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::control::ControlPlane;
use crate::db::{Pool, SqliteStore};
use crate::enrich::client::{AnalyzerClient, PublisherClient, TaggerClient};
use crate::enrich::EnrichmentChain;
use crate::failsafe::FailSafeLog;
use crate::model::Stage;
use crate::overseer::Overseer;
use crate::scheduler::{spawn_recurring, JobKey, JobManager};
use crate::sitemap::{HttpSitemapSource, SitemapSource};
use crate::stages::{build_stage, DiscoverySettings, StageDeps};
use crate::store::{ItemStore, ScheduleStore, SitemapStore};
use crate::trigger::Trigger;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct App {
    pub manager: Arc<JobManager>,
    pub control: ControlPlane,
    pub overseer: Arc<Overseer>,
    pub journal: Arc<FailSafeLog>,
    overseer_interval_seconds: u64,
}

/// Build the HTTP collaborators from configuration.
pub fn http_collaborators(cfg: &Config) -> Result<(Arc<dyn SitemapSource>, EnrichmentChain)> {
    let source = Arc::new(HttpSitemapSource::new()?);
    let chain = EnrichmentChain::new(
        Arc::new(AnalyzerClient::from_config(&cfg.services.analyzer)?),
        Arc::new(TaggerClient::from_config(&cfg.services.tagger)?),
        Arc::new(PublisherClient::from_config(&cfg.services.publisher)?),
    );
    Ok((source, chain))
}

/// Wire the service over the SQLite pool with HTTP collaborators.
pub async fn build(cfg: &Config, pool: Pool) -> Result<App> {
    let (source, chain) = http_collaborators(cfg)?;
    build_with(cfg, Arc::new(SqliteStore::new(pool)), source, chain).await
}

/// Wire the service over any store implementation.
pub async fn build_with<S>(
    cfg: &Config,
    store: Arc<S>,
    source: Arc<dyn SitemapSource>,
    chain: EnrichmentChain,
) -> Result<App>
where
    S: ItemStore + SitemapStore + ScheduleStore + 'static,
{
    let items: Arc<dyn ItemStore> = store.clone();
    let sitemaps: Arc<dyn SitemapStore> = store.clone();
    let schedules: Arc<dyn ScheduleStore> = store;
    let journal = Arc::new(FailSafeLog::new(cfg.app.resolved_journal_dir()));

    let content_pattern = Regex::new(&cfg.app.content_url_pattern)
        .with_context(|| format!("invalid content_url_pattern {}", cfg.app.content_url_pattern))?;
    let deps = StageDeps {
        items: items.clone(),
        sitemaps: sitemaps.clone(),
        journal: journal.clone(),
        source,
        chain,
        discovery: DiscoverySettings {
            content_pattern,
            excluded_marker: cfg.app.excluded_segment_marker.clone(),
            backoff: Duration::from_secs(cfg.app.discovery_backoff_seconds),
        },
    };

    let manager = Arc::new(JobManager::new());
    for publication in &cfg.publications {
        for seed in publication.seed_schedules() {
            if schedules
                .seed_schedule(&seed)
                .await
                .with_context(|| format!("failed to seed schedule {}/{}", seed.publication, seed.stage))?
            {
                info!(publication = %seed.publication, stage = %seed.stage, "schedule seeded from config");
            }
        }
        for stage in Stage::ALL {
            let stored = schedules
                .schedule(&publication.name, stage)
                .await
                .with_context(|| format!("failed to read schedule {}/{stage}", publication.name))?;
            let interval = stored
                .map(|s| s.interval_seconds)
                .unwrap_or_else(|| publication.schedules.get(stage).interval_seconds);
            let runner = build_stage(stage, &publication.name, &publication.sitemap_index, &deps);
            manager.register(JobKey::new(publication.name.clone(), stage), runner, interval);
        }
    }

    let overseer = Arc::new(Overseer::new(
        manager.clone(),
        items.clone(),
        schedules.clone(),
        cfg.app.monthly_cap,
    ));
    let control = ControlPlane::new(manager.clone(), items, sitemaps, schedules.clone(), journal.clone());

    Ok(App {
        manager,
        control,
        overseer,
        journal,
        overseer_interval_seconds: cfg.app.overseer_interval_seconds,
    })
}

impl App {
    /// Start every job whose stored schedule is enabled.
    pub async fn start_enabled(&self) -> Result<usize> {
        let mut started = 0;
        for schedule in self.control.schedules().await? {
            let key = JobKey::new(schedule.publication.clone(), schedule.stage);
            if !schedule.enabled {
                info!(job = %key, "job disabled; not starting");
                continue;
            }
            match self.manager.start(&key) {
                Ok(_) => started += 1,
                // Schedules of publications no longer configured.
                Err(err) => warn!(job = %key, %err, "skipping stored schedule"),
            }
        }
        Ok(started)
    }

    pub fn spawn_overseer(&self, token: CancellationToken) -> JoinHandle<()> {
        spawn_recurring(
            "overseer",
            self.overseer.clone(),
            Trigger::new(self.overseer_interval_seconds),
            token,
        )
    }

    /// Run until Ctrl-C, then stop every job gracefully.
    pub async fn run(self) -> Result<()> {
        let started = self.start_enabled().await?;
        info!(started, jobs = self.manager.keys().len(), "jobs started");

        let token = CancellationToken::new();
        let overseer = self.spawn_overseer(token.clone());

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        info!("shutdown requested");

        token.cancel();
        self.manager.shutdown(SHUTDOWN_GRACE).await;
        if tokio::time::timeout(SHUTDOWN_GRACE, overseer).await.is_err() {
            warn!("overseer still running after grace period");
        }
        Ok(())
    }
}
