use super::model::{ItemRow, ScheduleRow, SegmentRow};
use crate::model::{Entry, Item, NewSegment, Queue, ScheduleConfig, Stage};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid database url {database_url}"))?
        .create_if_missing(true)
        // Enable WAL and stricter durability.
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open {database_url}"))?;
    Ok(pool)
}

/// Single-connection in-memory database. The connection is never recycled,
/// otherwise the data would vanish with it.
pub async fn init_memory_pool() -> Result<Pool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn table(queue: Queue) -> &'static str {
    match queue {
        Queue::Pending => "pending_items",
        Queue::Executed => "executed_items",
        Queue::Failed => "failed_items",
    }
}

fn like_pattern(filter: &str) -> String {
    format!("%{}%", filter)
}

#[instrument(skip_all)]
pub async fn top_item(pool: &Pool, queue: Queue, publication: &str) -> sqlx::Result<Option<Item>> {
    let sql = format!(
        "SELECT publication, url FROM {} WHERE publication = ? ORDER BY id ASC LIMIT 1",
        table(queue)
    );
    let row = sqlx::query(&sql)
        .bind(publication)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| Item::new(r.get::<String, _>("publication"), r.get::<String, _>("url"))))
}

#[instrument(skip_all)]
pub async fn item_exists(pool: &Pool, queue: Queue, publication: &str, url: &str) -> sqlx::Result<bool> {
    let sql = format!(
        "SELECT EXISTS(SELECT 1 FROM {} WHERE publication = ? AND url = ?)",
        table(queue)
    );
    let exists: bool = sqlx::query_scalar(&sql)
        .bind(publication)
        .bind(url)
        .fetch_one(pool)
        .await?;
    Ok(exists)
}

async fn insert_entry(
    conn: &mut SqliteConnection,
    entry: &Entry,
    recorded_at: DateTime<Utc>,
    ignore_existing: bool,
) -> sqlx::Result<u64> {
    let verb = if ignore_existing {
        "INSERT OR IGNORE"
    } else {
        "INSERT"
    };
    let item = entry.item();
    let done = match entry {
        Entry::Executed { asset_id, .. } => {
            let sql = format!(
                "{verb} INTO executed_items (publication, url, asset_id, recorded_at) VALUES (?, ?, ?, ?)"
            );
            sqlx::query(&sql)
                .bind(&item.publication)
                .bind(&item.url)
                .bind(asset_id)
                .bind(recorded_at)
                .execute(&mut *conn)
                .await?
        }
        Entry::Pending(_) | Entry::Failed(_) => {
            let sql = format!(
                "{verb} INTO {} (publication, url, recorded_at) VALUES (?, ?, ?)",
                table(entry.queue())
            );
            sqlx::query(&sql)
                .bind(&item.publication)
                .bind(&item.url)
                .bind(recorded_at)
                .execute(&mut *conn)
                .await?
        }
    };
    Ok(done.rows_affected())
}

#[instrument(skip_all)]
pub async fn insert_item(pool: &Pool, entry: &Entry) -> sqlx::Result<()> {
    let mut conn = pool.acquire().await?;
    insert_entry(&mut *conn, entry, Utc::now(), false).await?;
    Ok(())
}

/// Bulk insert in one transaction; keys already present are skipped.
#[instrument(skip_all, fields(count = entries.len()))]
pub async fn insert_items(pool: &Pool, entries: &[Entry]) -> sqlx::Result<u64> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();
    let mut inserted = 0;
    for entry in entries {
        inserted += insert_entry(&mut *tx, entry, now, true).await?;
    }
    tx.commit().await?;
    Ok(inserted)
}

#[instrument(skip_all)]
pub async fn delete_item(pool: &Pool, queue: Queue, item: &Item) -> sqlx::Result<u64> {
    let sql = format!("DELETE FROM {} WHERE publication = ? AND url = ?", table(queue));
    let done = sqlx::query(&sql)
        .bind(&item.publication)
        .bind(&item.url)
        .execute(pool)
        .await?;
    Ok(done.rows_affected())
}

#[instrument(skip_all, fields(count = items.len()))]
pub async fn delete_items(pool: &Pool, queue: Queue, items: &[Item]) -> sqlx::Result<u64> {
    let sql = format!("DELETE FROM {} WHERE publication = ? AND url = ?", table(queue));
    let mut tx = pool.begin().await?;
    let mut deleted = 0;
    for item in items {
        deleted += sqlx::query(&sql)
            .bind(&item.publication)
            .bind(&item.url)
            .execute(&mut *tx)
            .await?
            .rows_affected();
    }
    tx.commit().await?;
    Ok(deleted)
}

#[instrument(skip_all)]
pub async fn list_items(
    pool: &Pool,
    queue: Queue,
    publication: &str,
    url_filter: Option<&str>,
) -> sqlx::Result<Vec<ItemRow>> {
    let asset = match queue {
        Queue::Executed => "asset_id",
        Queue::Pending | Queue::Failed => "NULL AS asset_id",
    };
    let mut sql = format!(
        "SELECT id, publication, url, {asset}, recorded_at FROM {} WHERE publication = ?",
        table(queue)
    );
    if url_filter.is_some() {
        sql.push_str(" AND url LIKE ?");
    }
    sql.push_str(" ORDER BY id ASC");

    let mut query = sqlx::query_as::<_, ItemRow>(&sql).bind(publication);
    if let Some(filter) = url_filter {
        query = query.bind(like_pattern(filter));
    }
    query.fetch_all(pool).await
}

/// Rows whose timestamp falls in the current UTC month, across publications.
#[instrument(skip_all)]
pub async fn count_current_month(pool: &Pool, queue: Queue) -> sqlx::Result<i64> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE substr(recorded_at, 1, 7) = ?",
        table(queue)
    );
    sqlx::query_scalar(&sql)
        .bind(Utc::now().format("%Y-%m").to_string())
        .fetch_one(pool)
        .await
}

#[instrument(skip_all)]
pub async fn top_unexecuted_segment(pool: &Pool, publication: &str) -> sqlx::Result<Option<SegmentRow>> {
    sqlx::query_as::<_, SegmentRow>(
        "SELECT id, publication, url, last_modified, executed, loaded_at FROM sitemap_segments WHERE publication = ? AND executed = 0 ORDER BY id ASC LIMIT 1",
    )
    .bind(publication)
    .fetch_optional(pool)
    .await
}

#[instrument(skip_all)]
pub async fn count_segments(pool: &Pool, publication: &str) -> sqlx::Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM sitemap_segments WHERE publication = ?")
        .bind(publication)
        .fetch_one(pool)
        .await
}

#[instrument(skip_all, fields(count = segments.len()))]
pub async fn insert_segments(pool: &Pool, segments: &[NewSegment]) -> sqlx::Result<u64> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();
    let mut inserted = 0;
    for segment in segments {
        inserted += sqlx::query(
            "INSERT OR IGNORE INTO sitemap_segments (publication, url, last_modified, executed, loaded_at) VALUES (?, ?, ?, 0, ?)",
        )
        .bind(&segment.publication)
        .bind(&segment.url)
        .bind(&segment.last_modified)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }
    tx.commit().await?;
    Ok(inserted)
}

#[instrument(skip_all)]
pub async fn mark_segment_executed(pool: &Pool, publication: &str, url: &str) -> sqlx::Result<u64> {
    let done = sqlx::query(
        "UPDATE sitemap_segments SET executed = 1 WHERE publication = ? AND url = ?",
    )
    .bind(publication)
    .bind(url)
    .execute(pool)
    .await?;
    Ok(done.rows_affected())
}

#[instrument(skip_all)]
pub async fn list_segments(
    pool: &Pool,
    publication: &str,
    url_filter: Option<&str>,
) -> sqlx::Result<Vec<SegmentRow>> {
    let mut sql = String::from(
        "SELECT id, publication, url, last_modified, executed, loaded_at FROM sitemap_segments WHERE publication = ?",
    );
    if url_filter.is_some() {
        sql.push_str(" AND url LIKE ?");
    }
    sql.push_str(" ORDER BY id ASC");

    let mut query = sqlx::query_as::<_, SegmentRow>(&sql).bind(publication);
    if let Some(filter) = url_filter {
        query = query.bind(like_pattern(filter));
    }
    query.fetch_all(pool).await
}

#[instrument(skip_all)]
pub async fn get_schedule(pool: &Pool, publication: &str, stage: Stage) -> sqlx::Result<Option<ScheduleRow>> {
    sqlx::query_as::<_, ScheduleRow>(
        "SELECT publication, stage, interval_seconds, enabled FROM schedules WHERE publication = ? AND stage = ?",
    )
    .bind(publication)
    .bind(stage.as_str())
    .fetch_optional(pool)
    .await
}

#[instrument(skip_all)]
pub async fn list_schedules(pool: &Pool) -> sqlx::Result<Vec<ScheduleRow>> {
    sqlx::query_as::<_, ScheduleRow>(
        "SELECT publication, stage, interval_seconds, enabled FROM schedules ORDER BY publication, stage",
    )
    .fetch_all(pool)
    .await
}

fn interval_column(schedule: &ScheduleConfig) -> i64 {
    i64::try_from(schedule.interval_seconds).unwrap_or(i64::MAX)
}

#[instrument(skip_all)]
pub async fn upsert_schedule(pool: &Pool, schedule: &ScheduleConfig) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO schedules (publication, stage, interval_seconds, enabled) VALUES (?, ?, ?, ?) \
         ON CONFLICT (publication, stage) DO UPDATE SET interval_seconds = excluded.interval_seconds, enabled = excluded.enabled",
    )
    .bind(&schedule.publication)
    .bind(schedule.stage.as_str())
    .bind(interval_column(schedule))
    .bind(schedule.enabled)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn seed_schedule(pool: &Pool, schedule: &ScheduleConfig) -> sqlx::Result<bool> {
    let done = sqlx::query(
        "INSERT OR IGNORE INTO schedules (publication, stage, interval_seconds, enabled) VALUES (?, ?, ?, ?)",
    )
    .bind(&schedule.publication)
    .bind(schedule.stage.as_str())
    .bind(interval_column(schedule))
    .bind(schedule.enabled)
    .execute(pool)
    .await?;
    Ok(done.rows_affected() > 0)
}
