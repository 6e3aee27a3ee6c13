use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Recurring unit of work scheduled per publication.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Discovery,
    Processing,
    Retry,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Discovery, Stage::Processing, Stage::Retry];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Discovery => "discovery",
            Stage::Processing => "processing",
            Stage::Retry => "retry",
        }
    }

    pub fn parse_stage(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "discovery" => Some(Stage::Discovery),
            "processing" => Some(Stage::Processing),
            "retry" => Some(Stage::Retry),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three item queues. An item lives in at most one of them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Queue {
    Pending,
    Executed,
    Failed,
}

impl Queue {
    pub const ALL: [Queue; 3] = [Queue::Pending, Queue::Executed, Queue::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Queue::Pending => "pending",
            Queue::Executed => "executed",
            Queue::Failed => "failed",
        }
    }

    pub fn parse_queue(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(Queue::Pending),
            "executed" => Some(Queue::Executed),
            "failed" => Some(Queue::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of store write captured by the fail-safe journal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JournalOp {
    Save,
    Delete,
}

impl JournalOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalOp::Save => "save",
            JournalOp::Delete => "delete",
        }
    }
}

/// Natural key of a queued item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Item {
    pub publication: String,
    pub url: String,
}

impl Item {
    pub fn new(publication: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            publication: publication.into(),
            url: url.into(),
        }
    }
}

/// A row to be written into one of the queues. Timestamps are assigned by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Entry {
    Pending(Item),
    Executed { item: Item, asset_id: String },
    Failed(Item),
}

impl Entry {
    pub fn queue(&self) -> Queue {
        match self {
            Entry::Pending(_) => Queue::Pending,
            Entry::Executed { .. } => Queue::Executed,
            Entry::Failed(_) => Queue::Failed,
        }
    }

    pub fn item(&self) -> &Item {
        match self {
            Entry::Pending(item) | Entry::Failed(item) => item,
            Entry::Executed { item, .. } => item,
        }
    }
}

/// A row read back from a queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuedItem {
    pub id: i64,
    pub publication: String,
    pub url: String,
    /// Only set for executed items.
    pub asset_id: Option<String>,
    /// discovered_at, executed_at or failed_at depending on the queue.
    pub recorded_at: DateTime<Utc>,
}

impl QueuedItem {
    pub fn item(&self) -> Item {
        Item::new(self.publication.clone(), self.url.clone())
    }
}

/// One sub-sitemap referenced from a publication's sitemap index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SitemapSegment {
    pub id: i64,
    pub publication: String,
    pub url: String,
    pub last_modified: String,
    pub executed: bool,
    pub loaded_at: DateTime<Utc>,
}

/// Segment discovered in the index, not yet stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NewSegment {
    pub publication: String,
    pub url: String,
    pub last_modified: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub publication: String,
    pub stage: Stage,
    pub interval_seconds: u64,
    pub enabled: bool,
}
