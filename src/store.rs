//! Store interfaces injected into the stages, and the error taxonomy that
//! decides whether a failed write is journaled.
use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Entry, Item, NewSegment, Queue, QueuedItem, ScheduleConfig, SitemapSegment, Stage};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record already exists")]
    Duplicate,
    #[error("record not found")]
    NotFound,
    #[error("store rejected the write: {0}")]
    Rejected(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Transient failures are worth journaling and replaying later.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Pending / Executed / Failed queues keyed by (publication, url).
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Oldest item of `queue` for the publication.
    async fn top(&self, queue: Queue, publication: &str) -> StoreResult<Option<Item>>;

    async fn contains(&self, queue: Queue, publication: &str, url: &str) -> StoreResult<bool>;

    /// Insert one entry. Fails with `Duplicate` when the key is already queued.
    async fn insert(&self, entry: &Entry) -> StoreResult<()>;

    /// Insert many entries in one transaction, skipping keys already present.
    /// Returns the number of rows actually inserted.
    async fn insert_all(&self, entries: &[Entry]) -> StoreResult<u64>;

    /// Remove one item. Fails with `NotFound` when nothing was deleted.
    async fn remove(&self, queue: Queue, item: &Item) -> StoreResult<()>;

    /// Remove many items in one transaction. Returns the number of rows deleted.
    async fn remove_all(&self, queue: Queue, items: &[Item]) -> StoreResult<u64>;

    async fn list(
        &self,
        queue: Queue,
        publication: &str,
        url_filter: Option<&str>,
    ) -> StoreResult<Vec<QueuedItem>>;

    /// Rows recorded in the current calendar month (UTC), across publications.
    async fn count_current_month(&self, queue: Queue) -> StoreResult<i64>;
}

#[async_trait]
pub trait SitemapStore: Send + Sync {
    async fn top_unexecuted(&self, publication: &str) -> StoreResult<Option<SitemapSegment>>;

    async fn segment_count(&self, publication: &str) -> StoreResult<i64>;

    /// Insert segments not seen before; existing ones are left untouched.
    async fn insert_segments(&self, segments: &[NewSegment]) -> StoreResult<u64>;

    /// Flip `executed` to true. Never flips it back.
    async fn mark_executed(&self, publication: &str, url: &str) -> StoreResult<()>;

    async fn list_segments(
        &self,
        publication: &str,
        url_filter: Option<&str>,
    ) -> StoreResult<Vec<SitemapSegment>>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn schedule(&self, publication: &str, stage: Stage) -> StoreResult<Option<ScheduleConfig>>;

    async fn schedules(&self) -> StoreResult<Vec<ScheduleConfig>>;

    async fn upsert_schedule(&self, schedule: &ScheduleConfig) -> StoreResult<()>;

    /// Insert the row only when no schedule exists yet for (publication, stage).
    async fn seed_schedule(&self, schedule: &ScheduleConfig) -> StoreResult<bool>;
}
