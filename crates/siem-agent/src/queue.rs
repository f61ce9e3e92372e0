//! Durable store-and-forward queue (spec §4.2), backed by an embedded
//! SQLite database via `sqlx`. A single-writer discipline is enforced by
//! routing all mutation through one `DurableQueue` instance shared behind
//! an `Arc` — the dispatcher and drainer never open their own connections.

use crate::error::{AgentError, Result};
use crate::event::{Event, QueueEntry};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

/// On-disk FIFO of pending events with retry bookkeeping.
pub struct DurableQueue {
    pool: SqlitePool,
}

impl DurableQueue {
    /// Opens (creating if absent) the queue database at `path` and runs
    /// migrations. Fails fatally — per spec §4.2/§7 — if the store exists
    /// but is unreadable/corrupt in a way sqlite cannot recover from.
    pub async fn init(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| AgentError::QueueCorrupted {
                message: format!("invalid queue path {}: {e}", path.display()),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| AgentError::QueueCorrupted {
                message: format!("unable to open durable queue: {e}"),
            })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_entries (
                id TEXT PRIMARY KEY,
                cached_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_retry_at TEXT,
                event_json TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| AgentError::QueueCorrupted {
            message: format!("unable to initialize queue schema: {e}"),
        })?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_queue_cached_at ON queue_entries (cached_at)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Appends one entry. Returns `Ok(false)` ("full") when the queue is
    /// at `max_cached_events` capacity rather than an error — callers
    /// (the dispatcher) decide what eviction policy applies.
    pub async fn enqueue(&self, event: Event, max_cached_events: u32) -> Result<bool> {
        let current = self.count().await?;
        if current >= max_cached_events as i64 {
            return Ok(false);
        }

        let cached_at = Utc::now();
        let entry = QueueEntry::new(event, cached_at);
        let event_json = serde_json::to_string(&entry.event)?;

        sqlx::query(
            "INSERT INTO queue_entries (id, cached_at, retry_count, last_retry_at, event_json) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entry.event.id.to_string())
        .bind(entry.cached_at.to_rfc3339())
        .bind(entry.retry_count as i64)
        .bind(entry.last_retry_at.map(|t| t.to_rfc3339()))
        .bind(event_json)
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    /// Returns the oldest `n` entries by `cached_at`, without removing them.
    pub async fn peek_batch(&self, n: u32) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query(
            "SELECT cached_at, retry_count, last_retry_at, event_json FROM queue_entries \
             ORDER BY cached_at ASC LIMIT ?",
        )
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_entry).collect()
    }

    /// Removes the named entries transactionally (all-or-nothing).
    pub async fn remove(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("DELETE FROM queue_entries WHERE id = ?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Increments `retry_count` and sets `last_retry_at = now` for each id.
    pub async fn bump_retry(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query(
                "UPDATE queue_entries SET retry_count = retry_count + 1, last_retry_at = ? \
                 WHERE id = ?",
            )
            .bind(&now)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Removes entries older than `max_age`, returning the count removed.
    pub async fn evict_expired(&self, max_age: chrono::Duration) -> Result<u64> {
        let cutoff = (Utc::now() - max_age).to_rfc3339();
        let result = sqlx::query("DELETE FROM queue_entries WHERE cached_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Current entry count.
    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM queue_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    /// Removes every entry. Used only by explicit operator action; not
    /// called in the normal dispatch/drain path.
    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM queue_entries").execute(&self.pool).await?;
        Ok(())
    }

    /// Retry counts for the given ids that now exceed `max_retries`
    /// (helper used by the drainer to decide per-entry eviction).
    pub async fn retry_counts(&self, ids: &[Uuid]) -> Result<Vec<(Uuid, u32)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query("SELECT retry_count FROM queue_entries WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                let retry_count: i64 = row.try_get("retry_count")?;
                out.push((*id, retry_count as u32));
            }
        }
        Ok(out)
    }
}

fn row_to_entry(row: sqlx::sqlite::SqliteRow) -> Result<QueueEntry> {
    let event_json: String = row.try_get("event_json")?;
    let event: Event = serde_json::from_str(&event_json)?;
    let cached_at_text: String = row.try_get("cached_at")?;
    let cached_at = DateTime::parse_from_rfc3339(&cached_at_text)
        .map_err(|e| AgentError::queue(format!("corrupt cached_at timestamp: {e}")))?
        .with_timezone(&Utc);
    let retry_count: i64 = row.try_get("retry_count")?;
    let last_retry_at_text: Option<String> = row.try_get("last_retry_at")?;
    let last_retry_at = last_retry_at_text
        .map(|t| DateTime::parse_from_rfc3339(&t).map(|d| d.with_timezone(&Utc)))
        .transpose()
        .map_err(|e| AgentError::queue(format!("corrupt last_retry_at timestamp: {e}")))?;

    Ok(QueueEntry {
        event,
        cached_at,
        retry_count: retry_count as u32,
        last_retry_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventType;
    use siem_agent_shared::Severity;
    use tempfile::tempdir;

    async fn open_queue() -> (DurableQueue, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let queue = DurableQueue::init(&dir.path().join("queue.sqlite"))
            .await
            .expect("init queue");
        (queue, dir)
    }

    fn sample_event() -> Event {
        Event::new(
            "host-1",
            EventType::FileLog,
            Severity::High,
            "ERROR something broke",
            "ERROR something broke",
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn enqueue_and_count_roundtrip() {
        let (queue, _dir) = open_queue().await;
        assert_eq!(queue.count().await.unwrap(), 0);
        assert!(queue.enqueue(sample_event(), 10).await.unwrap());
        assert_eq!(queue.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn enqueue_reports_full_at_capacity() {
        let (queue, _dir) = open_queue().await;
        assert!(queue.enqueue(sample_event(), 1).await.unwrap());
        assert!(!queue.enqueue(sample_event(), 1).await.unwrap());
    }

    #[tokio::test]
    async fn remove_excludes_from_next_peek() {
        let (queue, _dir) = open_queue().await;
        queue.enqueue(sample_event(), 10).await.unwrap();
        let batch = queue.peek_batch(10).await.unwrap();
        let ids: Vec<Uuid> = batch.iter().map(|e| e.event.id).collect();
        queue.remove(&ids).await.unwrap();
        let remaining = queue.peek_batch(10).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn bump_retry_increments_count() {
        let (queue, _dir) = open_queue().await;
        queue.enqueue(sample_event(), 10).await.unwrap();
        let batch = queue.peek_batch(10).await.unwrap();
        let id = batch[0].event.id;
        queue.bump_retry(&[id]).await.unwrap();
        let counts = queue.retry_counts(&[id]).await.unwrap();
        assert_eq!(counts[0].1, 1);
    }

    #[tokio::test]
    async fn evict_expired_removes_only_old_entries() {
        let (queue, _dir) = open_queue().await;
        queue.enqueue(sample_event(), 10).await.unwrap();
        let removed = queue.evict_expired(chrono::Duration::days(7)).await.unwrap();
        assert_eq!(removed, 0);
        let removed = queue.evict_expired(chrono::Duration::seconds(-1)).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn clear_empties_the_queue() {
        let (queue, _dir) = open_queue().await;
        queue.enqueue(sample_event(), 10).await.unwrap();
        queue.clear().await.unwrap();
        assert_eq!(queue.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let (queue, _dir) = open_queue().await;
        let first = sample_event();
        let first_id = first.id;
        queue.enqueue(first, 10).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        queue.enqueue(sample_event(), 10).await.unwrap();
        let batch = queue.peek_batch(1).await.unwrap();
        assert_eq!(batch[0].event.id, first_id);
    }
}
