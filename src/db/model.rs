//! Row types returned by the SQL repositories.
//!
//! Keep these structs focused on the data returned by queries. Conversions into
//! the domain types in `crate::model` live here too.

use chrono::{DateTime, Utc};

use crate::model::{QueuedItem, ScheduleConfig, SitemapSegment, Stage};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ItemRow {
    pub id: i64,
    pub publication: String,
    pub url: String,
    pub asset_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl From<ItemRow> for QueuedItem {
    fn from(row: ItemRow) -> Self {
        QueuedItem {
            id: row.id,
            publication: row.publication,
            url: row.url,
            asset_id: row.asset_id,
            recorded_at: row.recorded_at,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SegmentRow {
    pub id: i64,
    pub publication: String,
    pub url: String,
    pub last_modified: String,
    pub executed: bool,
    pub loaded_at: DateTime<Utc>,
}

impl From<SegmentRow> for SitemapSegment {
    fn from(row: SegmentRow) -> Self {
        SitemapSegment {
            id: row.id,
            publication: row.publication,
            url: row.url,
            last_modified: row.last_modified,
            executed: row.executed,
            loaded_at: row.loaded_at,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScheduleRow {
    pub publication: String,
    pub stage: String,
    pub interval_seconds: i64,
    pub enabled: bool,
}

impl ScheduleRow {
    /// `None` when the stored stage name is not one we schedule.
    pub fn into_config(self) -> Option<ScheduleConfig> {
        let stage = Stage::parse_stage(&self.stage)?;
        Some(ScheduleConfig {
            publication: self.publication,
            stage,
            interval_seconds: u64::try_from(self.interval_seconds).ok()?,
            enabled: self.enabled,
        })
    }
}
