//! Audit log repository: append-only record of entitlement-relevant
//! transitions (activation, tamper discard, trial start).

use crate::error::StorageResult;
use crate::operation_queue::{OpPriority, OperationQueue};
use crate::time_provider::TimeProvider;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One recorded audit event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Database row id.
    pub id: i64,
    /// Short machine-readable event kind, e.g. `subscription_activated`.
    pub event_kind: String,
    /// Free-form human-readable detail.
    pub detail: String,
    /// Unix millis when the event occurred.
    pub occurred_at: i64,
}

/// Append-only sink for entitlement audit events. Never gates the
/// operation it records; a failure to write is logged and swallowed by
/// the caller.
#[async_trait]
pub trait AuditLogRepository: Send + Sync {
    /// Appends one event.
    async fn record(&self, event_kind: &str, detail: &str) -> StorageResult<()>;

    /// Returns the most recent `limit` events, newest first.
    async fn recent(&self, limit: i64) -> StorageResult<Vec<AuditEntry>>;
}

/// `SQLite`-backed audit log repository.
pub struct SqliteAuditLogRepository {
    queue: OperationQueue,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteAuditLogRepository {
    /// Builds a repository over an already-migrated queue.
    #[must_use]
    pub fn new(queue: OperationQueue, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self { queue, time_provider }
    }
}

#[async_trait]
impl AuditLogRepository for SqliteAuditLogRepository {
    async fn record(&self, event_kind: &str, detail: &str) -> StorageResult<()> {
        let event_kind = event_kind.to_string();
        let detail = detail.to_string();
        let time_provider = self.time_provider.clone();
        self.queue
            .write_value(OpPriority::Low, move |pool| async move {
                let now = time_provider.unix_millis();
                sqlx::query(
                    "INSERT INTO audit_log (event_kind, detail, occurred_at) VALUES (?1, ?2, ?3)",
                )
                .bind(&event_kind)
                .bind(&detail)
                .bind(now)
                .execute(&pool)
                .await?;
                Ok(())
            })
            .await
    }

    async fn recent(&self, limit: i64) -> StorageResult<Vec<AuditEntry>> {
        self.queue
            .read_value(move |pool| async move {
                let rows: Vec<(i64, String, String, i64)> = sqlx::query_as(
                    "SELECT id, event_kind, detail, occurred_at FROM audit_log
                     ORDER BY occurred_at DESC LIMIT ?1",
                )
                .bind(limit)
                .fetch_all(&pool)
                .await?;
                Ok(rows
                    .into_iter()
                    .map(|(id, event_kind, detail, occurred_at)| AuditEntry {
                        id,
                        event_kind,
                        detail,
                        occurred_at,
                    })
                    .collect())
            })
            .await
    }
}
