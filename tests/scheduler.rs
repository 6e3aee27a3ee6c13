use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

use autotagger::app::{self, App};
use autotagger::config::{self, Config};
use autotagger::control::ControlError;
use autotagger::db::{self, SqliteStore};
use autotagger::enrich::{Analyzer, EnrichmentChain, KeywordSet, Publisher, Tagger};
use autotagger::model::{Entry, Item, Queue, QueuedItem, ScheduleConfig, Stage};
use autotagger::overseer::Overseer;
use autotagger::scheduler::{JobKey, JobManager, SchedulerError};
use autotagger::sitemap::{SegmentRef, SitemapSource};
use autotagger::store::{ItemStore, ScheduleStore, StoreError, StoreResult};

const GRACE: Duration = Duration::from_secs(2);

struct StaticAnalyzer;

#[async_trait]
impl Analyzer for StaticAnalyzer {
    async fn analyze(&self, _url: &str) -> Result<String> {
        Ok("escenic-1".into())
    }
}

struct StaticTagger;

#[async_trait]
impl Tagger for StaticTagger {
    async fn tag(&self, _asset_id: &str) -> Result<KeywordSet> {
        Ok(KeywordSet::default())
    }
}

struct NullPublisher;

#[async_trait]
impl Publisher for NullPublisher {
    async fn push(&self, _article_id: &str, _keywords: &str) -> Result<()> {
        Ok(())
    }
}

struct EmptySitemap;

#[async_trait]
impl SitemapSource for EmptySitemap {
    async fn fetch_index(&self, _index_url: &str) -> Result<Vec<SegmentRef>> {
        Ok(Vec::new())
    }

    async fn fetch_segment(&self, _segment_url: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Item store whose pending count is unreadable.
struct PendingCountFails(Arc<SqliteStore>);

#[async_trait]
impl ItemStore for PendingCountFails {
    async fn top(&self, queue: Queue, publication: &str) -> StoreResult<Option<Item>> {
        self.0.top(queue, publication).await
    }

    async fn contains(&self, queue: Queue, publication: &str, url: &str) -> StoreResult<bool> {
        self.0.contains(queue, publication, url).await
    }

    async fn insert(&self, entry: &Entry) -> StoreResult<()> {
        self.0.insert(entry).await
    }

    async fn insert_all(&self, entries: &[Entry]) -> StoreResult<u64> {
        self.0.insert_all(entries).await
    }

    async fn remove(&self, queue: Queue, item: &Item) -> StoreResult<()> {
        self.0.remove(queue, item).await
    }

    async fn remove_all(&self, queue: Queue, items: &[Item]) -> StoreResult<u64> {
        self.0.remove_all(queue, items).await
    }

    async fn list(&self, queue: Queue, publication: &str, url_filter: Option<&str>) -> StoreResult<Vec<QueuedItem>> {
        self.0.list(queue, publication, url_filter).await
    }

    async fn count_current_month(&self, queue: Queue) -> StoreResult<i64> {
        match queue {
            Queue::Pending => Err(StoreError::Unavailable("database is locked".into())),
            _ => self.0.count_current_month(queue).await,
        }
    }
}

/// Two publications; discovery disabled so no job waits on a sitemap index.
fn test_config(journal_dir: &TempDir, monthly_cap: i64) -> Config {
    let mut cfg = config::parse(config::example()).unwrap();
    cfg.app.journal_dir = Some(journal_dir.path().display().to_string());
    cfg.app.monthly_cap = monthly_cap;
    cfg.publications[0].schedules.discovery.enabled = false;
    let mut second = cfg.publications[0].clone();
    second.name = "wp".into();
    second.sitemap_index = "https://www.wp.de/sitemaps/sitemap-index.xml".into();
    cfg.publications.push(second);
    cfg
}

async fn setup_store() -> Arc<SqliteStore> {
    let pool = db::init_memory_pool().await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    Arc::new(SqliteStore::new(pool))
}

async fn build(cfg: &Config, store: Arc<SqliteStore>) -> App {
    let chain = EnrichmentChain::new(Arc::new(StaticAnalyzer), Arc::new(StaticTagger), Arc::new(NullPublisher));
    app::build_with(cfg, store, Arc::new(EmptySitemap), chain)
        .await
        .unwrap()
}

#[tokio::test]
async fn build_registers_every_publication_stage() {
    let td = tempdir().unwrap();
    let store = setup_store().await;
    let app = build(&test_config(&td, 100), store.clone()).await;

    assert_eq!(app.manager.keys().len(), 6);
    assert_eq!(app.manager.live_count(), 0);
    assert_eq!(store.schedules().await.unwrap().len(), 6);

    let processing = store.schedule("wp", Stage::Processing).await.unwrap().unwrap();
    assert_eq!(processing.interval_seconds, 5);
    assert!(processing.enabled);
}

#[tokio::test]
async fn stored_schedule_wins_over_config() {
    let td = tempdir().unwrap();
    let store = setup_store().await;
    store
        .upsert_schedule(&ScheduleConfig {
            publication: "bmo".into(),
            stage: Stage::Processing,
            interval_seconds: 42,
            enabled: false,
        })
        .await
        .unwrap();

    let app = build(&test_config(&td, 100), store.clone()).await;
    let status = app
        .control
        .job_statuses()
        .into_iter()
        .find(|s| s.key == JobKey::new("bmo", Stage::Processing))
        .unwrap();
    assert_eq!(status.interval_seconds, 42);

    // bmo: retry only; wp: processing and retry.
    assert_eq!(app.start_enabled().await.unwrap(), 3);
    assert!(!app.manager.is_running(&JobKey::new("bmo", Stage::Processing)).unwrap());
    assert!(app.manager.is_running(&JobKey::new("wp", Stage::Processing)).unwrap());
    app.manager.shutdown(GRACE).await;
}

#[tokio::test]
async fn overseer_halts_every_job_at_cap() {
    let td = tempdir().unwrap();
    let store = setup_store().await;
    let app = build(&test_config(&td, 100), store.clone()).await;
    assert_eq!(app.start_enabled().await.unwrap(), 4);

    let executed: Vec<Entry> = (0..100)
        .map(|n| Entry::Executed {
            item: Item::new("bmo", format!("/a/{n}")),
            asset_id: format!("escenic-{n}"),
        })
        .collect();
    assert_eq!(store.insert_all(&executed).await.unwrap(), 100);

    let report = app.overseer.run_once().await.unwrap();
    assert!(report.cap_reached);
    assert_eq!(report.executed, 100);
    assert_eq!(report.stopped.len(), 4);
    assert!(report.started.is_empty());
    assert_eq!(app.manager.live_count(), 0);

    let again = app.overseer.run_once().await.unwrap();
    assert!(again.cap_reached);
    assert!(again.stopped.is_empty());
    assert!(again.started.is_empty());
    assert_eq!(app.manager.live_count(), 0);
    app.manager.shutdown(GRACE).await;
}

#[tokio::test]
async fn pending_volume_does_not_count_toward_cap() {
    let td = tempdir().unwrap();
    let store = setup_store().await;
    let app = build(&test_config(&td, 10), store.clone()).await;

    let pending: Vec<Entry> = (0..20)
        .map(|n| Entry::Pending(Item::new("wp", format!("/p/{n}"))))
        .collect();
    store.insert_all(&pending).await.unwrap();

    let report = app.overseer.run_once().await.unwrap();
    assert_eq!(report.pending, Some(20));
    assert!(!report.cap_reached);
    assert_eq!(report.started.len(), 4);
    app.manager.shutdown(GRACE).await;
}

#[tokio::test]
async fn overseer_resumes_only_enabled_jobs() {
    let td = tempdir().unwrap();
    let store = setup_store().await;
    let app = build(&test_config(&td, 100), store.clone()).await;

    let report = app.overseer.run_once().await.unwrap();
    assert!(!report.cap_reached);
    assert_eq!(report.started.len(), 4);
    assert_eq!(
        report.held,
        vec![JobKey::new("bmo", Stage::Discovery), JobKey::new("wp", Stage::Discovery)]
    );
    assert!(!app.manager.is_running(&JobKey::new("bmo", Stage::Discovery)).unwrap());

    let again = app.overseer.run_once().await.unwrap();
    assert!(again.started.is_empty());
    assert_eq!(app.manager.live_count(), 4);
    app.manager.shutdown(GRACE).await;
}

#[tokio::test]
async fn update_schedule_persists_and_applies() {
    let td = tempdir().unwrap();
    let store = setup_store().await;
    let app = build(&test_config(&td, 100), store.clone()).await;
    app.start_enabled().await.unwrap();
    let retry = JobKey::new("bmo", Stage::Retry);

    let err = app
        .control
        .update_schedule("bmo", Stage::Retry, 0, true)
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidInterval));

    let err = app
        .control
        .update_schedule("nope", Stage::Retry, 30, true)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControlError::Scheduler(SchedulerError::UnknownJob(ref key)) if key.publication == "nope"
    ));
    assert!(store.schedule("nope", Stage::Retry).await.unwrap().is_none());

    app.control
        .update_schedule("bmo", Stage::Retry, 30, false)
        .await
        .unwrap();
    assert!(!app.manager.is_running(&retry).unwrap());
    let stored = store.schedule("bmo", Stage::Retry).await.unwrap().unwrap();
    assert_eq!((stored.interval_seconds, stored.enabled), (30, false));

    // The overseer must not resume a job the operator disabled.
    let report = app.overseer.run_once().await.unwrap();
    assert!(report.held.contains(&retry));
    assert!(!app.manager.is_running(&retry).unwrap());

    app.control
        .update_schedule("bmo", Stage::Retry, 45, true)
        .await
        .unwrap();
    assert!(app.manager.is_running(&retry).unwrap());
    let status = app
        .control
        .job_statuses()
        .into_iter()
        .find(|s| s.key == retry)
        .unwrap();
    assert_eq!(status.interval_seconds, 45);
    app.manager.shutdown(GRACE).await;
}

#[tokio::test]
async fn start_and_stop_leave_stored_flag_untouched() {
    let td = tempdir().unwrap();
    let store = setup_store().await;
    let app = build(&test_config(&td, 100), store.clone()).await;

    let first = app.control.start_stage("wp", Stage::Processing).unwrap();
    let second = app.control.start_stage("wp", Stage::Processing).unwrap();
    assert_eq!(first, second);

    assert!(app.control.stop_stage("wp", Stage::Processing).unwrap());
    assert!(!app.control.stop_stage("wp", Stage::Processing).unwrap());
    assert!(store.schedule("wp", Stage::Processing).await.unwrap().unwrap().enabled);

    assert!(matches!(
        app.control.start_stage("wp-archive", Stage::Processing),
        Err(ControlError::Scheduler(SchedulerError::UnknownJob(_)))
    ));
    app.manager.shutdown(GRACE).await;
}

#[tokio::test]
async fn control_views_read_through_to_the_store() {
    let td = tempdir().unwrap();
    let store = setup_store().await;
    let app = build(&test_config(&td, 100), store.clone()).await;

    store
        .insert(&Entry::Failed(Item::new("bmo", "https://www.bmo.de/article-1.html")))
        .await
        .unwrap();
    store
        .insert(&Entry::Failed(Item::new("bmo", "https://www.bmo.de/video-2.html")))
        .await
        .unwrap();

    let failed = app
        .control
        .list_items(Queue::Failed, "bmo", Some("article"))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(app.control.count_current_month(Queue::Failed).await.unwrap(), 2);
    assert!(app.control.list_segments("bmo", None).await.unwrap().is_empty());

    app.journal
        .defer_save(&Entry::Pending(Item::new("bmo", "/a/9")))
        .await;
    assert_eq!(app.control.journal_backlog("bmo", Queue::Pending).await.unwrap().len(), 1);
    assert_eq!(app.control.drain_journals("bmo").await.unwrap(), 1);
    assert!(app.control.journal_backlog("bmo", Queue::Pending).await.unwrap().is_empty());
    assert_eq!(app.control.list_items(Queue::Pending, "bmo", None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn unreadable_pending_count_is_reported_as_unknown() {
    let store = setup_store().await;
    store
        .insert(&Entry::Failed(Item::new("bmo", "/a/1")))
        .await
        .unwrap();
    let overseer = Overseer::new(
        Arc::new(JobManager::new()),
        Arc::new(PendingCountFails(store.clone())),
        store,
        100,
    );

    let report = overseer.run_once().await.unwrap();
    assert_eq!(report.pending, None);
    assert_eq!(report.failed, 1);
    assert!(!report.cap_reached);
}

#[tokio::test]
async fn journal_operations_reject_unknown_publications() {
    let td = tempdir().unwrap();
    let store = setup_store().await;
    let app = build(&test_config(&td, 100), store).await;

    for publication in ["../etc", "nope"] {
        assert!(matches!(
            app.control.journal_backlog(publication, Queue::Failed).await,
            Err(ControlError::UnknownPublication(ref p)) if p == publication
        ));
        assert!(matches!(
            app.control.drain_journals(publication).await,
            Err(ControlError::UnknownPublication(_))
        ));
    }
    assert!(!td.path().join("nope").exists());
    assert!(app.control.journal_backlog("wp", Queue::Failed).await.unwrap().is_empty());
}
