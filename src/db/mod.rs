//! Database module: row models, SQL repositories and the SQLite-backed stores.
//!
//! - `model`: row structs returned by queries.
//! - `repo`: SQL-only functions over the pool.
//!
//! `SqliteStore` implements the store traits from `crate::store` on top of
//! `repo` and maps `sqlx` errors into `StoreError`.

pub mod model;
pub mod repo;

pub use repo::{init_memory_pool, init_pool, run_migrations, Pool};

use async_trait::async_trait;
use sqlx::error::ErrorKind;

use crate::model::{Entry, Item, NewSegment, Queue, QueuedItem, ScheduleConfig, SitemapSegment, Stage};
use crate::store::{ItemStore, ScheduleStore, SitemapStore, StoreError, StoreResult};

/// Map a driver error onto the store taxonomy.
pub fn classify(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::Database(db_err) => match db_err.kind() {
            ErrorKind::UniqueViolation => StoreError::Duplicate,
            ErrorKind::Other => StoreError::Unavailable(db_err.to_string()),
            _ => StoreError::Rejected(db_err.to_string()),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Protocol(_)
        | sqlx::Error::Tls(_) => StoreError::Unavailable(err.to_string()),
        other => StoreError::Rejected(other.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl ItemStore for SqliteStore {
    async fn top(&self, queue: Queue, publication: &str) -> StoreResult<Option<Item>> {
        repo::top_item(&self.pool, queue, publication)
            .await
            .map_err(classify)
    }

    async fn contains(&self, queue: Queue, publication: &str, url: &str) -> StoreResult<bool> {
        repo::item_exists(&self.pool, queue, publication, url)
            .await
            .map_err(classify)
    }

    async fn insert(&self, entry: &Entry) -> StoreResult<()> {
        repo::insert_item(&self.pool, entry).await.map_err(classify)
    }

    async fn insert_all(&self, entries: &[Entry]) -> StoreResult<u64> {
        if entries.is_empty() {
            return Ok(0);
        }
        repo::insert_items(&self.pool, entries)
            .await
            .map_err(classify)
    }

    async fn remove(&self, queue: Queue, item: &Item) -> StoreResult<()> {
        match repo::delete_item(&self.pool, queue, item).await {
            Ok(0) => Err(StoreError::NotFound),
            Ok(_) => Ok(()),
            Err(err) => Err(classify(err)),
        }
    }

    async fn remove_all(&self, queue: Queue, items: &[Item]) -> StoreResult<u64> {
        if items.is_empty() {
            return Ok(0);
        }
        repo::delete_items(&self.pool, queue, items)
            .await
            .map_err(classify)
    }

    async fn list(
        &self,
        queue: Queue,
        publication: &str,
        url_filter: Option<&str>,
    ) -> StoreResult<Vec<QueuedItem>> {
        let rows = repo::list_items(&self.pool, queue, publication, url_filter)
            .await
            .map_err(classify)?;
        Ok(rows.into_iter().map(QueuedItem::from).collect())
    }

    async fn count_current_month(&self, queue: Queue) -> StoreResult<i64> {
        repo::count_current_month(&self.pool, queue)
            .await
            .map_err(classify)
    }
}

#[async_trait]
impl SitemapStore for SqliteStore {
    async fn top_unexecuted(&self, publication: &str) -> StoreResult<Option<SitemapSegment>> {
        let row = repo::top_unexecuted_segment(&self.pool, publication)
            .await
            .map_err(classify)?;
        Ok(row.map(SitemapSegment::from))
    }

    async fn segment_count(&self, publication: &str) -> StoreResult<i64> {
        repo::count_segments(&self.pool, publication)
            .await
            .map_err(classify)
    }

    async fn insert_segments(&self, segments: &[NewSegment]) -> StoreResult<u64> {
        if segments.is_empty() {
            return Ok(0);
        }
        repo::insert_segments(&self.pool, segments)
            .await
            .map_err(classify)
    }

    async fn mark_executed(&self, publication: &str, url: &str) -> StoreResult<()> {
        match repo::mark_segment_executed(&self.pool, publication, url).await {
            Ok(0) => Err(StoreError::NotFound),
            Ok(_) => Ok(()),
            Err(err) => Err(classify(err)),
        }
    }

    async fn list_segments(
        &self,
        publication: &str,
        url_filter: Option<&str>,
    ) -> StoreResult<Vec<SitemapSegment>> {
        let rows = repo::list_segments(&self.pool, publication, url_filter)
            .await
            .map_err(classify)?;
        Ok(rows.into_iter().map(SitemapSegment::from).collect())
    }
}

#[async_trait]
impl ScheduleStore for SqliteStore {
    async fn schedule(&self, publication: &str, stage: Stage) -> StoreResult<Option<ScheduleConfig>> {
        let row = repo::get_schedule(&self.pool, publication, stage)
            .await
            .map_err(classify)?;
        Ok(row.and_then(|r| r.into_config()))
    }

    async fn schedules(&self) -> StoreResult<Vec<ScheduleConfig>> {
        let rows = repo::list_schedules(&self.pool).await.map_err(classify)?;
        Ok(rows.into_iter().filter_map(|r| r.into_config()).collect())
    }

    async fn upsert_schedule(&self, schedule: &ScheduleConfig) -> StoreResult<()> {
        repo::upsert_schedule(&self.pool, schedule)
            .await
            .map_err(classify)
    }

    async fn seed_schedule(&self, schedule: &ScheduleConfig) -> StoreResult<bool> {
        repo::seed_schedule(&self.pool, schedule)
            .await
            .map_err(classify)
    }
}
