//! Outbound queue repository: messages awaiting dispatch or retry.

use crate::domain_types::{OutboundEntryId, OutboundStatus, Priority};
use crate::error::StorageResult;
use crate::operation_queue::{OpPriority, OperationQueue};
use crate::time_provider::TimeProvider;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// A queued outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEntry {
    /// Row id.
    pub id: OutboundEntryId,
    /// Destination address.
    pub recipient: String,
    /// Message body.
    pub body: String,
    /// Owning campaign, if any.
    pub campaign_id: Option<String>,
    /// Template variant used, if any.
    pub variant_id: Option<String>,
    /// Dispatch priority.
    pub priority: Priority,
    /// SIM slot this entry must be sent from.
    pub sim_slot: u8,
    /// Row id of the corresponding `messages` entry, if one was already
    /// created, so the retry worker can reconcile its status.
    pub db_message_id: Option<i64>,
    /// Lifecycle status.
    pub status: OutboundStatus,
    /// Number of failed dispatch attempts so far.
    pub retry_count: u32,
    /// Most recent transport error, if any.
    pub last_error: Option<String>,
    /// Epoch millis this entry was enqueued.
    pub enqueued_at: i64,
}

/// Aggregate counts across the outbound queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundStats {
    /// Entries awaiting dispatch.
    pub pending: i64,
    /// Entries dispatched successfully.
    pub sent: i64,
    /// Entries that failed but still have retry budget.
    pub failed: i64,
    /// Entries that exhausted their retry budget.
    pub exhausted: i64,
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> StorageResult<OutboundEntry> {
    let status_str: String = row.try_get("status")?;
    Ok(OutboundEntry {
        id: OutboundEntryId::from(row.try_get::<i64, _>("id")?),
        recipient: row.try_get("recipient")?,
        body: row.try_get("body")?,
        campaign_id: row.try_get("campaign_id")?,
        variant_id: row.try_get("variant_id")?,
        priority: Priority::from_i64(row.try_get("priority")?),
        sim_slot: u8::try_from(row.try_get::<i64, _>("sim_slot")?).unwrap_or(1),
        db_message_id: row.try_get("db_message_id")?,
        status: OutboundStatus::parse(&status_str).unwrap_or(OutboundStatus::Pending),
        retry_count: u32::try_from(row.try_get::<i64, _>("retry_count")?).unwrap_or(0),
        last_error: row.try_get("last_error")?,
        enqueued_at: row.try_get("enqueued_at")?,
    })
}

/// Outbound queue operations.
#[async_trait]
pub trait OutboundQueueRepository: Send + Sync {
    /// Enqueues a message, unless an identical `(recipient, body, sim_slot)`
    /// triple was enqueued within `dedup_window` — in which case the
    /// existing entry id is returned and no new row is inserted.
    #[allow(clippy::too_many_arguments)]
    async fn enqueue(
        &self,
        recipient: &str,
        body: &str,
        campaign_id: Option<&str>,
        variant_id: Option<&str>,
        priority: Priority,
        sim_slot: u8,
        db_message_id: Option<i64>,
        dedup_window: Duration,
    ) -> StorageResult<OutboundEntryId>;

    /// Fetches up to `limit` pending entries, ordered by priority
    /// descending then enqueue time ascending, excluding exhausted ones.
    async fn get_pending(&self, limit: i64) -> StorageResult<Vec<OutboundEntry>>;

    /// Marks an entry sent.
    async fn mark_sent(&self, id: OutboundEntryId) -> StorageResult<()>;

    /// Records a failed attempt, incrementing `retry_count` and
    /// transitioning to `Exhausted` once `max_retries` is reached.
    async fn mark_failed(
        &self,
        id: OutboundEntryId,
        error: &str,
        max_retries: u32,
    ) -> StorageResult<()>;

    /// Current aggregate counts.
    async fn get_stats(&self) -> StorageResult<OutboundStats>;

    /// Deletes every exhausted entry.
    async fn clear_exhausted(&self) -> StorageResult<u64>;

    /// Deletes every sent entry.
    async fn clear_sent(&self) -> StorageResult<u64>;
}

/// `SQLite`-backed outbound queue repository, every call routed through
/// [`OperationQueue`] so retry-worker writes and campaign writes never
/// race each other directly against the pool.
pub struct SqliteOutboundQueueRepository {
    queue: OperationQueue,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteOutboundQueueRepository {
    /// Builds a repository over an already-migrated queue.
    #[must_use]
    pub fn new(queue: OperationQueue, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self { queue, time_provider }
    }
}

#[async_trait]
impl OutboundQueueRepository for SqliteOutboundQueueRepository {
    #[instrument(skip(self, body))]
    async fn enqueue(
        &self,
        recipient: &str,
        body: &str,
        campaign_id: Option<&str>,
        variant_id: Option<&str>,
        priority: Priority,
        sim_slot: u8,
        db_message_id: Option<i64>,
        dedup_window: Duration,
    ) -> StorageResult<OutboundEntryId> {
        let recipient = recipient.to_string();
        let body = body.to_string();
        let campaign_id = campaign_id.map(str::to_string);
        let variant_id = variant_id.map(str::to_string);
        let time_provider = self.time_provider.clone();
        self.queue
            .write_value(OpPriority::Normal, move |pool| async move {
                let now = time_provider.unix_millis();
                let window_start = now - i64::try_from(dedup_window.as_millis()).unwrap_or(i64::MAX);

                let existing: Option<i64> = sqlx::query_scalar(
                    "SELECT id FROM outbound_queue
                     WHERE recipient = ?1 AND body = ?2 AND sim_slot = ?3 AND enqueued_at >= ?4
                     ORDER BY enqueued_at DESC LIMIT 1",
                )
                .bind(&recipient)
                .bind(&body)
                .bind(i64::from(sim_slot))
                .bind(window_start)
                .fetch_optional(&pool)
                .await?;

                if let Some(id) = existing {
                    return Ok(OutboundEntryId::from(id));
                }

                let id: i64 = sqlx::query_scalar(
                    "INSERT INTO outbound_queue
                        (recipient, body, campaign_id, variant_id, priority, sim_slot, db_message_id,
                         status, retry_count, enqueued_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0, ?8)
                     RETURNING id",
                )
                .bind(&recipient)
                .bind(&body)
                .bind(&campaign_id)
                .bind(&variant_id)
                .bind(priority.as_i64())
                .bind(i64::from(sim_slot))
                .bind(db_message_id)
                .bind(now)
                .fetch_one(&pool)
                .await?;

                Ok(OutboundEntryId::from(id))
            })
            .await
    }

    async fn get_pending(&self, limit: i64) -> StorageResult<Vec<OutboundEntry>> {
        self.queue
            .read_value(move |pool| async move {
                let rows = sqlx::query(
                    "SELECT * FROM outbound_queue
                     WHERE status IN ('pending', 'failed')
                     ORDER BY priority DESC, enqueued_at ASC
                     LIMIT ?1",
                )
                .bind(limit)
                .fetch_all(&pool)
                .await?;
                rows.iter().map(row_to_entry).collect()
            })
            .await
    }

    async fn mark_sent(&self, id: OutboundEntryId) -> StorageResult<()> {
        let time_provider = self.time_provider.clone();
        self.queue
            .write_value(OpPriority::Normal, move |pool| async move {
                let now = time_provider.unix_millis();
                sqlx::query("UPDATE outbound_queue SET status = 'sent', sent_at = ?1, last_attempt_at = ?1 WHERE id = ?2")
                    .bind(now)
                    .bind(id.into_inner())
                    .execute(&pool)
                    .await?;
                Ok(())
            })
            .await
    }

    async fn mark_failed(
        &self,
        id: OutboundEntryId,
        error: &str,
        max_retries: u32,
    ) -> StorageResult<()> {
        let error = error.to_string();
        let time_provider = self.time_provider.clone();
        self.queue
            .write_value(OpPriority::Normal, move |pool| async move {
                let now = time_provider.unix_millis();
                let mut tx = pool.begin().await?;

                sqlx::query(
                    "UPDATE outbound_queue SET
                        retry_count = retry_count + 1,
                        last_error = ?1,
                        last_attempt_at = ?2
                     WHERE id = ?3",
                )
                .bind(&error)
                .bind(now)
                .bind(id.into_inner())
                .execute(&mut *tx)
                .await?;

                let retry_count: i64 = sqlx::query_scalar("SELECT retry_count FROM outbound_queue WHERE id = ?1")
                    .bind(id.into_inner())
                    .fetch_one(&mut *tx)
                    .await?;

                let new_status = if u32::try_from(retry_count).unwrap_or(u32::MAX) >= max_retries {
                    "exhausted"
                } else {
                    "failed"
                };
                sqlx::query("UPDATE outbound_queue SET status = ?1 WHERE id = ?2")
                    .bind(new_status)
                    .bind(id.into_inner())
                    .execute(&mut *tx)
                    .await?;

                tx.commit().await?;
                Ok(())
            })
            .await
    }

    async fn get_stats(&self) -> StorageResult<OutboundStats> {
        self.queue
            .read_value(move |pool| async move {
                let rows: Vec<(String, i64)> =
                    sqlx::query_as("SELECT status, COUNT(*) FROM outbound_queue GROUP BY status")
                        .fetch_all(&pool)
                        .await?;

                let mut stats = OutboundStats::default();
                for (status, count) in rows {
                    match status.as_str() {
                        "pending" => stats.pending = count,
                        "sent" => stats.sent = count,
                        "failed" => stats.failed = count,
                        "exhausted" => stats.exhausted = count,
                        _ => {}
                    }
                }
                Ok(stats)
            })
            .await
    }

    async fn clear_exhausted(&self) -> StorageResult<u64> {
        self.queue
            .write_value(OpPriority::Low, move |pool| async move {
                let result = sqlx::query("DELETE FROM outbound_queue WHERE status = 'exhausted'")
                    .execute(&pool)
                    .await?;
                Ok(result.rows_affected())
            })
            .await
    }

    async fn clear_sent(&self) -> StorageResult<u64> {
        self.queue
            .write_value(OpPriority::Low, move |pool| async move {
                let result = sqlx::query("DELETE FROM outbound_queue WHERE status = 'sent'")
                    .execute(&pool)
                    .await?;
                Ok(result.rows_affected())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DatabaseConfig, DatabasePath, StorageEngine};
    use crate::time_provider::MockTimeProvider;
    use tempfile::tempdir;

    async fn repository() -> (SqliteOutboundQueueRepository, tempfile::TempDir) {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("outbound.db");
        let path = DatabasePath::new(db_path).unwrap();
        let config = DatabaseConfig::for_testing(path);
        let time_provider: Arc<dyn TimeProvider> = Arc::new(MockTimeProvider::new());
        let engine = StorageEngine::open(config, time_provider.as_ref()).await.unwrap();
        (
            SqliteOutboundQueueRepository::new(engine.queue().clone(), time_provider),
            temp_dir,
        )
    }

    #[tokio::test]
    async fn test_should_dedup_identical_enqueue_within_window() {
        let (repo, _dir) = repository().await;
        let first = repo
            .enqueue("+254700000001", "hi", None, None, Priority::Normal, 1, None, Duration::from_secs(60))
            .await
            .unwrap();
        let second = repo
            .enqueue("+254700000001", "hi", None, None, Priority::Normal, 1, None, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(first, second);

        let stats = repo.get_stats().await.unwrap();
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn test_should_not_dedup_same_recipient_and_body_on_different_sim_slots() {
        let (repo, _dir) = repository().await;
        let first = repo
            .enqueue("+254700000099", "hi", None, None, Priority::Normal, 1, None, Duration::from_secs(60))
            .await
            .unwrap();
        let second = repo
            .enqueue("+254700000099", "hi", None, None, Priority::Normal, 2, None, Duration::from_secs(60))
            .await
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(repo.get_stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_should_order_pending_by_priority_then_age() {
        let (repo, _dir) = repository().await;
        repo.enqueue("+254700000002", "low", None, None, Priority::Low, 1, None, Duration::ZERO)
            .await
            .unwrap();
        repo.enqueue("+254700000003", "urgent", None, None, Priority::Urgent, 1, None, Duration::ZERO)
            .await
            .unwrap();
        repo.enqueue("+254700000004", "normal", None, None, Priority::Normal, 1, None, Duration::ZERO)
            .await
            .unwrap();

        let pending = repo.get_pending(10).await.unwrap();
        assert_eq!(pending[0].body, "urgent");
        assert_eq!(pending[1].body, "normal");
        assert_eq!(pending[2].body, "low");
    }

    #[tokio::test]
    async fn test_should_exhaust_after_max_retries() {
        let (repo, _dir) = repository().await;
        let id = repo
            .enqueue("+254700000005", "retry me", None, None, Priority::Normal, 1, None, Duration::ZERO)
            .await
            .unwrap();

        repo.mark_failed(id, "timeout", 3).await.unwrap();
        repo.mark_failed(id, "timeout", 3).await.unwrap();
        let stats_before = repo.get_stats().await.unwrap();
        assert_eq!(stats_before.failed, 1);

        repo.mark_failed(id, "timeout", 3).await.unwrap();
        let stats_after = repo.get_stats().await.unwrap();
        assert_eq!(stats_after.exhausted, 1);
        assert_eq!(stats_after.failed, 0);
    }

    #[tokio::test]
    async fn test_should_clear_exhausted_entries() {
        let (repo, _dir) = repository().await;
        let id = repo
            .enqueue("+254700000006", "gone", None, None, Priority::Normal, 1, None, Duration::ZERO)
            .await
            .unwrap();
        repo.mark_failed(id, "e", 1).await.unwrap();

        let cleared = repo.clear_exhausted().await.unwrap();
        assert_eq!(cleared, 1);
        assert_eq!(repo.get_stats().await.unwrap().exhausted, 0);
    }

    #[tokio::test]
    async fn test_should_carry_db_message_id_through_round_trip() {
        let (repo, _dir) = repository().await;
        let id = repo
            .enqueue("+254700000007", "hi", None, None, Priority::Normal, 1, Some(42), Duration::ZERO)
            .await
            .unwrap();
        let pending = repo.get_pending(10).await.unwrap();
        let entry = pending.iter().find(|e| e.id == id).unwrap();
        assert_eq!(entry.db_message_id, Some(42));
        assert_eq!(entry.sim_slot, 1);
    }
}
