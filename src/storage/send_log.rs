//! Send log repository: durable dedup/rate-limit source of truth.

use crate::error::StorageResult;
use crate::operation_queue::{OpPriority, OperationQueue};
use crate::time_provider::TimeProvider;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

fn hash_body(body: &str) -> String {
    let digest = Sha256::digest(body.as_bytes());
    format!("{digest:x}")
}

/// Append-only log of every message actually dispatched, used to suppress
/// near-duplicate sends and to enforce a rate limit per recipient.
#[async_trait]
pub trait SendLogRepository: Send + Sync {
    /// Records a successful send.
    async fn record(&self, recipient: &str, body: &str, campaign_id: Option<&str>) -> StorageResult<()>;

    /// True if an identical `(recipient, body)` pair was sent within
    /// `window`.
    async fn was_recently_sent(&self, recipient: &str, body: &str, window: Duration) -> StorageResult<bool>;

    /// Number of sends to `recipient` within `window`, for rate limiting.
    async fn recent_send_count(&self, recipient: &str, window: Duration) -> StorageResult<i64>;
}

/// `SQLite`-backed send log repository.
pub struct SqliteSendLogRepository {
    queue: OperationQueue,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteSendLogRepository {
    /// Builds a repository over an already-migrated queue.
    #[must_use]
    pub fn new(queue: OperationQueue, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self { queue, time_provider }
    }
}

#[async_trait]
impl SendLogRepository for SqliteSendLogRepository {
    async fn record(&self, recipient: &str, body: &str, campaign_id: Option<&str>) -> StorageResult<()> {
        let recipient = recipient.to_string();
        let body_hash = hash_body(body);
        let campaign_id = campaign_id.map(str::to_string);
        let time_provider = self.time_provider.clone();
        self.queue
            .write_value(OpPriority::Normal, move |pool| async move {
                let now = time_provider.unix_millis();
                sqlx::query(
                    "INSERT INTO send_log (recipient, body_hash, campaign_id, sent_at) VALUES (?1, ?2, ?3, ?4)",
                )
                .bind(&recipient)
                .bind(&body_hash)
                .bind(&campaign_id)
                .bind(now)
                .execute(&pool)
                .await?;
                Ok(())
            })
            .await
    }

    async fn was_recently_sent(&self, recipient: &str, body: &str, window: Duration) -> StorageResult<bool> {
        let recipient = recipient.to_string();
        let body_hash = hash_body(body);
        let time_provider = self.time_provider.clone();
        self.queue
            .read_value(move |pool| async move {
                let now = time_provider.unix_millis();
                let window_start = now - i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
                let count: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM send_log WHERE recipient = ?1 AND body_hash = ?2 AND sent_at >= ?3",
                )
                .bind(&recipient)
                .bind(&body_hash)
                .bind(window_start)
                .fetch_one(&pool)
                .await?;
                Ok(count > 0)
            })
            .await
    }

    async fn recent_send_count(&self, recipient: &str, window: Duration) -> StorageResult<i64> {
        let recipient = recipient.to_string();
        let time_provider = self.time_provider.clone();
        self.queue
            .read_value(move |pool| async move {
                let now = time_provider.unix_millis();
                let window_start = now - i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
                let count: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM send_log WHERE recipient = ?1 AND sent_at >= ?2",
                )
                .bind(&recipient)
                .bind(window_start)
                .fetch_one(&pool)
                .await?;
                Ok(count)
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

    async fn repository() -> (SqliteSendLogRepository, tempfile::TempDir) {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("send_log.db");
        let path = DatabasePath::new(db_path).unwrap();
        let config = DatabaseConfig::for_testing(path);
        let time_provider: Arc<dyn TimeProvider> = Arc::new(MockTimeProvider::new());
        let engine = StorageEngine::open(config, time_provider.as_ref()).await.unwrap();
        (
            SqliteSendLogRepository::new(engine.queue().clone(), time_provider),
            temp_dir,
        )
    }

    #[tokio::test]
    async fn test_should_detect_recent_duplicate_send() {
        let (repo, _dir) = repository().await;
        repo.record("+254700000001", "hello", None).await.unwrap();

        let duplicate = repo
            .was_recently_sent("+254700000001", "hello", Duration::from_secs(300))
            .await
            .unwrap();
        assert!(duplicate);

        let different_body = repo
            .was_recently_sent("+254700000001", "goodbye", Duration::from_secs(300))
            .await
            .unwrap();
        assert!(!different_body);
    }

    #[tokio::test]
    async fn test_should_count_recent_sends_for_rate_limiting() {
        let (repo, _dir) = repository().await;
        repo.record("+254700000002", "a", None).await.unwrap();
        repo.record("+254700000002", "b", None).await.unwrap();
        repo.record("+254700000002", "c", None).await.unwrap();

        let count = repo
            .recent_send_count("+254700000002", Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(count, 3);
    }
}
