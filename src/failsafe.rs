//! Fail-safe journal for queue writes that hit a transient store failure.
//!
//! Each (publication, queue, op) pair owns one append-only file under the
//! journal root: `{root}/{publication}/{queue}-{op}.log`. A replay reads the
//! whole file, performs one bulk write and removes the file only when that
//! write succeeded.
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::model::{Entry, Item, JournalOp, Queue};
use crate::store::{ItemStore, StoreError};

/// Result of a guarded queue write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The store accepted the write.
    Applied,
    /// Nothing to do: the row was already present (save) or already gone (delete).
    AlreadySettled,
    /// The store was unavailable and the write went to the journal.
    Journaled,
    /// The write was lost: permanent rejection, or the journal itself failed.
    Dropped,
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error during replay: {0}")]
    Store(#[from] StoreError),
}

/// One journaled operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Record {
    Save(Entry),
    Delete(Queue, Item),
}

impl Record {
    pub fn queue(&self) -> Queue {
        match self {
            Record::Save(entry) => entry.queue(),
            Record::Delete(queue, _) => *queue,
        }
    }

    pub fn op(&self) -> JournalOp {
        match self {
            Record::Save(_) => JournalOp::Save,
            Record::Delete(..) => JournalOp::Delete,
        }
    }

    pub fn item(&self) -> &Item {
        match self {
            Record::Save(entry) => entry.item(),
            Record::Delete(_, item) => item,
        }
    }

    /// The url always goes last so commas inside it survive the split.
    pub fn to_line(&self) -> String {
        match self {
            Record::Save(Entry::Executed { item, asset_id }) => {
                format!("{},{},{}", item.publication, asset_id, item.url)
            }
            other => {
                let item = other.item();
                format!("{},{}", item.publication, item.url)
            }
        }
    }

    pub fn parse_line(queue: Queue, op: JournalOp, line: &str) -> Option<Record> {
        let line = line.trim_end_matches(['\r', '\n']);
        let non_empty = |s: &str| !s.trim().is_empty();
        match (op, queue) {
            (JournalOp::Save, Queue::Executed) => {
                let mut parts = line.splitn(3, ',');
                let publication = parts.next().filter(|s| non_empty(s.trim()))?;
                let asset_id = parts.next().filter(|s| non_empty(s.trim()))?;
                let url = parts.next().filter(|s| non_empty(s.trim()))?;
                Some(Record::Save(Entry::Executed {
                    item: Item::new(publication, url),
                    asset_id: asset_id.to_string(),
                }))
            }
            _ => {
                let (publication, url) = line.split_once(',')?;
                if !non_empty(publication) || !non_empty(url) {
                    return None;
                }
                let item = Item::new(publication, url);
                Some(match (op, queue) {
                    (JournalOp::Delete, queue) => Record::Delete(queue, item),
                    (JournalOp::Save, Queue::Pending) => Record::Save(Entry::Pending(item)),
                    (JournalOp::Save, _) => Record::Save(Entry::Failed(item)),
                })
            }
        }
    }
}

/// Journal kinds drained at the start of a Processing run. `failed-delete`
/// is replayed ahead of `failed-save` because Retry may have journaled both
/// halves of a rotation.
pub const PROCESSING_DRAIN: [(Queue, JournalOp); 4] = [
    (Queue::Pending, JournalOp::Delete),
    (Queue::Failed, JournalOp::Delete),
    (Queue::Executed, JournalOp::Save),
    (Queue::Failed, JournalOp::Save),
];

/// Journal kinds drained at the start of a Retry run. The delete goes first
/// so a rotated item whose delete and re-insert were both journaled ends up
/// present exactly once.
pub const RETRY_DRAIN: [(Queue, JournalOp); 3] = [
    (Queue::Failed, JournalOp::Delete),
    (Queue::Executed, JournalOp::Save),
    (Queue::Failed, JournalOp::Save),
];

/// Journal kinds drained by Discovery before it expands a segment.
pub const DISCOVERY_DRAIN: [(Queue, JournalOp); 3] = [
    (Queue::Failed, JournalOp::Delete),
    (Queue::Executed, JournalOp::Save),
    (Queue::Failed, JournalOp::Save),
];

/// Every journal kind, deletes first.
pub const ALL_KINDS: [(Queue, JournalOp); 6] = [
    (Queue::Pending, JournalOp::Delete),
    (Queue::Executed, JournalOp::Delete),
    (Queue::Failed, JournalOp::Delete),
    (Queue::Pending, JournalOp::Save),
    (Queue::Executed, JournalOp::Save),
    (Queue::Failed, JournalOp::Save),
];

#[derive(Debug)]
pub struct FailSafeLog {
    root: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl FailSafeLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, publication: &str, queue: Queue, op: JournalOp) -> PathBuf {
        self.root
            .join(publication)
            .join(format!("{}-{}.log", queue.as_str(), op.as_str()))
    }

    fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Insert `entry`, journaling it when the store is unavailable.
    pub async fn save(&self, store: &dyn ItemStore, entry: &Entry) -> WriteOutcome {
        let item = entry.item();
        match store.insert(entry).await {
            Ok(()) => WriteOutcome::Applied,
            Err(StoreError::Duplicate) => {
                warn!(publication = %item.publication, url = %item.url, queue = %entry.queue(), "item already queued");
                WriteOutcome::AlreadySettled
            }
            Err(err) if err.is_transient() => {
                warn!(publication = %item.publication, url = %item.url, queue = %entry.queue(), %err, "save failed; journaling");
                self.journal(&Record::Save(entry.clone())).await
            }
            Err(err) => {
                error!(publication = %item.publication, url = %item.url, queue = %entry.queue(), %err, "save rejected");
                WriteOutcome::Dropped
            }
        }
    }

    /// Remove `item` from `queue`, journaling the delete when the store is unavailable.
    pub async fn remove(&self, store: &dyn ItemStore, queue: Queue, item: &Item) -> WriteOutcome {
        match store.remove(queue, item).await {
            Ok(()) => WriteOutcome::Applied,
            Err(StoreError::NotFound) => {
                warn!(publication = %item.publication, url = %item.url, %queue, "item already removed");
                WriteOutcome::AlreadySettled
            }
            Err(err) if err.is_transient() => {
                warn!(publication = %item.publication, url = %item.url, %queue, %err, "delete failed; journaling");
                self.journal(&Record::Delete(queue, item.clone())).await
            }
            Err(err) => {
                error!(publication = %item.publication, url = %item.url, %queue, %err, "delete rejected");
                WriteOutcome::Dropped
            }
        }
    }

    /// Journal a save without touching the store.
    pub async fn defer_save(&self, entry: &Entry) -> WriteOutcome {
        self.journal(&Record::Save(entry.clone())).await
    }

    async fn journal(&self, record: &Record) -> WriteOutcome {
        match self.append(record).await {
            Ok(path) => {
                debug!(path = %path.display(), "journal record appended");
                WriteOutcome::Journaled
            }
            Err(err) => {
                let item = record.item();
                error!(publication = %item.publication, url = %item.url, queue = %record.queue(), ?err, "failed to write fail-safe journal");
                WriteOutcome::Dropped
            }
        }
    }

    /// Append one record to its journal file.
    pub async fn append(&self, record: &Record) -> std::io::Result<PathBuf> {
        let item = record.item();
        let path = self.path(&item.publication, record.queue(), record.op());
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let mut line = record.to_line();
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(path)
    }

    async fn read_records(&self, path: &Path, queue: Queue, op: JournalOp) -> std::io::Result<Option<Vec<Record>>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match Record::parse_line(queue, op, line) {
                Some(record) => {
                    if seen.insert(record.clone()) {
                        records.push(record);
                    }
                }
                None => warn!(path = %path.display(), line = lineno + 1, "skipping malformed journal line"),
            }
        }
        Ok(Some(records))
    }

    /// Parsed, de-duplicated records of one journal, without replaying it.
    pub async fn backlog(&self, publication: &str, queue: Queue, op: JournalOp) -> Result<Vec<Record>, ReplayError> {
        let path = self.path(publication, queue, op);
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;
        Ok(self.read_records(&path, queue, op).await?.unwrap_or_default())
    }

    /// Flush one journal into the store and delete it. Returns the number of
    /// distinct records flushed; a missing journal flushes nothing.
    pub async fn replay(
        &self,
        store: &dyn ItemStore,
        publication: &str,
        queue: Queue,
        op: JournalOp,
    ) -> Result<usize, ReplayError> {
        let path = self.path(publication, queue, op);
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;

        let Some(records) = self.read_records(&path, queue, op).await? else {
            return Ok(0);
        };

        if !records.is_empty() {
            match op {
                JournalOp::Save => {
                    let entries: Vec<Entry> = records
                        .iter()
                        .filter_map(|r| match r {
                            Record::Save(entry) => Some(entry.clone()),
                            Record::Delete(..) => None,
                        })
                        .collect();
                    store.insert_all(&entries).await?;
                }
                JournalOp::Delete => {
                    let items: Vec<Item> = records.iter().map(|r| r.item().clone()).collect();
                    store.remove_all(queue, &items).await?;
                }
            }
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        info!(publication, %queue, op = op.as_str(), replayed = records.len(), "fail-safe journal replayed");
        Ok(records.len())
    }

    /// Replay several journals in order. Failures are logged and the journal
    /// stays for the next attempt. When a queue's delete journal fails to
    /// replay, that queue's save journal is held back too: it may re-insert
    /// an item the pending delete is about to remove.
    pub async fn drain(&self, store: &dyn ItemStore, publication: &str, kinds: &[(Queue, JournalOp)]) -> usize {
        let mut total = 0;
        let mut blocked: Vec<Queue> = Vec::new();
        for (queue, op) in kinds {
            if *op == JournalOp::Save && blocked.contains(queue) {
                warn!(publication, queue = %queue, "delete backlog pending; holding save journal");
                continue;
            }
            match self.replay(store, publication, *queue, *op).await {
                Ok(n) => total += n,
                Err(err) => {
                    error!(publication, queue = %queue, op = op.as_str(), %err, "fail-safe replay failed; keeping journal");
                    if *op == JournalOp::Delete {
                        blocked.push(*queue);
                    }
                }
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory_pool, run_migrations, SqliteStore};
    use tempfile::tempdir;

    async fn setup_store() -> SqliteStore {
        let pool = init_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    #[test]
    fn executed_line_keeps_commas_in_url() {
        let record = Record::Save(Entry::Executed {
            item: Item::new("bmo", "https://x.de/a,b/article-1.html"),
            asset_id: "escenic-1".into(),
        });
        let line = record.to_line();
        assert_eq!(line, "bmo,escenic-1,https://x.de/a,b/article-1.html");
        assert_eq!(
            Record::parse_line(Queue::Executed, JournalOp::Save, &line),
            Some(record)
        );
    }

    #[test]
    fn malformed_lines_do_not_parse() {
        assert_eq!(Record::parse_line(Queue::Pending, JournalOp::Save, "no-comma"), None);
        assert_eq!(Record::parse_line(Queue::Failed, JournalOp::Delete, ",/a/1"), None);
        assert_eq!(Record::parse_line(Queue::Executed, JournalOp::Save, "bmo,/a/1"), None);
        assert_eq!(
            Record::parse_line(Queue::Failed, JournalOp::Delete, "bmo,/a/1"),
            Some(Record::Delete(Queue::Failed, Item::new("bmo", "/a/1")))
        );
    }

    #[test]
    fn path_layout() {
        let log = FailSafeLog::new("/var/journal");
        assert_eq!(
            log.path("bmo", Queue::Pending, JournalOp::Delete),
            PathBuf::from("/var/journal/bmo/pending-delete.log")
        );
    }

    #[tokio::test]
    async fn missing_journal_is_noop() {
        let td = tempdir().unwrap();
        let log = FailSafeLog::new(td.path());
        let store = setup_store().await;
        let n = log
            .replay(&store, "bmo", Queue::Failed, JournalOp::Save)
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn replay_dedupes_and_removes_file() {
        let td = tempdir().unwrap();
        let log = FailSafeLog::new(td.path());
        let store = setup_store().await;

        for url in ["/a/1", "/a/2", "/a/1"] {
            let outcome = log.defer_save(&Entry::Failed(Item::new("bmo", url))).await;
            assert_eq!(outcome, WriteOutcome::Journaled);
        }
        let path = log.path("bmo", Queue::Failed, JournalOp::Save);
        assert!(path.exists());
        assert_eq!(log.backlog("bmo", Queue::Failed, JournalOp::Save).await.unwrap().len(), 2);

        let n = log
            .replay(&store, "bmo", Queue::Failed, JournalOp::Save)
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert!(!path.exists());
        assert_eq!(store.list(Queue::Failed, "bmo", None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn malformed_line_is_skipped_during_replay() {
        let td = tempdir().unwrap();
        let log = FailSafeLog::new(td.path());
        let store = setup_store().await;
        let path = log.path("bmo", Queue::Pending, JournalOp::Save);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "garbage\nbmo,/a/1\n\n").unwrap();

        let n = log
            .replay(&store, "bmo", Queue::Pending, JournalOp::Save)
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert!(store.contains(Queue::Pending, "bmo", "/a/1").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_save_and_missing_delete_are_settled() {
        let td = tempdir().unwrap();
        let log = FailSafeLog::new(td.path());
        let store = setup_store().await;
        let entry = Entry::Pending(Item::new("bmo", "/a/1"));

        assert_eq!(log.save(&store, &entry).await, WriteOutcome::Applied);
        assert_eq!(log.save(&store, &entry).await, WriteOutcome::AlreadySettled);
        assert_eq!(
            log.remove(&store, Queue::Pending, entry.item()).await,
            WriteOutcome::Applied
        );
        assert_eq!(
            log.remove(&store, Queue::Pending, entry.item()).await,
            WriteOutcome::AlreadySettled
        );
        assert!(!log.path("bmo", Queue::Pending, JournalOp::Save).exists());
    }
}
