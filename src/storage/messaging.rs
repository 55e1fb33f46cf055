//! Messaging repository: conversations and the messages within them.

use crate::domain_types::{
    stable_color, truncate_body, ConversationFilter, ConversationId, ConversationSort, Direction,
    MessageId, MessageStatus, PhoneNumber,
};
use crate::error::{StorageError, StorageResult};
use crate::operation_queue::{OpPriority, OperationQueue};
use crate::time_provider::TimeProvider;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};
use std::sync::Arc;
use tracing::{info, instrument};

/// A conversation thread with one counterparty address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Row id.
    pub id: ConversationId,
    /// Platform thread correlation id.
    pub thread_id: String,
    /// Counterparty address (phone number or sender id).
    pub address: String,
    /// Display name, if known.
    pub display_name: Option<String>,
    /// Stable avatar colour derived from the address.
    pub color: String,
    /// True if archived.
    pub is_archived: bool,
    /// True if pinned to the top of the list.
    pub is_pinned: bool,
    /// Count of unread incoming messages.
    pub unread_count: i64,
    /// Snippet of the most recent message body.
    pub last_message_snippet: Option<String>,
    /// Epoch millis of the most recent message.
    pub last_message_timestamp: Option<i64>,
    /// In-progress draft body, if any.
    pub draft_body: Option<String>,
}

/// A single message within a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Row id.
    pub id: MessageId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Native platform message id, when synced from the OS inbox.
    pub native_message_id: Option<String>,
    /// Incoming or outgoing.
    pub direction: Direction,
    /// Lifecycle status.
    pub status: MessageStatus,
    /// Stored body, possibly truncated.
    pub body: String,
    /// True if `body` was truncated on insert.
    pub was_truncated: bool,
    /// Campaign this message belongs to, if sent via a campaign.
    pub campaign_id: Option<String>,
    /// Epoch millis the message was sent, if applicable.
    pub sent_at: Option<i64>,
    /// Epoch millis the row was created.
    pub created_at: i64,
}

fn row_to_conversation(row: &sqlx::sqlite::SqliteRow) -> StorageResult<Conversation> {
    Ok(Conversation {
        id: ConversationId::from(row.try_get::<i64, _>("id")?),
        thread_id: row.try_get("thread_id")?,
        address: row.try_get("address")?,
        display_name: row.try_get("display_name")?,
        color: row.try_get("color")?,
        is_archived: row.try_get::<i64, _>("is_archived")? != 0,
        is_pinned: row.try_get::<i64, _>("is_pinned")? != 0,
        unread_count: row.try_get("unread_count")?,
        last_message_snippet: row.try_get("last_message_snippet")?,
        last_message_timestamp: row.try_get("last_message_timestamp")?,
        draft_body: row.try_get("draft_body")?,
    })
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> StorageResult<Message> {
    let direction_str: String = row.try_get("direction")?;
    let status_str: String = row.try_get("status")?;
    Ok(Message {
        id: MessageId::from(row.try_get::<i64, _>("id")?),
        conversation_id: ConversationId::from(row.try_get::<i64, _>("conversation_id")?),
        native_message_id: row.try_get("native_message_id")?,
        direction: Direction::parse(&direction_str).ok_or_else(|| {
            StorageError::Database(sqlx::Error::Decode(
                format!("unknown direction: {direction_str}").into(),
            ))
        })?,
        status: MessageStatus::parse(&status_str).ok_or_else(|| {
            StorageError::Database(sqlx::Error::Decode(format!("unknown status: {status_str}").into()))
        })?,
        body: row.try_get("body")?,
        was_truncated: row.try_get::<i64, _>("was_truncated")? != 0,
        campaign_id: row.try_get("campaign_id")?,
        sent_at: row.try_get("sent_at")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Snippet length for a conversation's `last_message_snippet` column.
const SNIPPET_LEN: usize = 120;

async fn find_by_thread(pool: &Pool<Sqlite>, address: &PhoneNumber) -> StorageResult<Option<Conversation>> {
    let row = sqlx::query("SELECT * FROM conversations WHERE address = ?1")
        .bind(address.as_str())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_conversation).transpose()
}

async fn find_by_suffix(pool: &Pool<Sqlite>, address: &PhoneNumber) -> StorageResult<Option<Conversation>> {
    if !address.is_suffix_matchable() {
        return Ok(None);
    }
    let suffix = address.suffix9();
    let pattern = format!("%{suffix}");
    let row = sqlx::query("SELECT * FROM conversations WHERE address LIKE ?1")
        .bind(pattern)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_conversation).transpose()
}

/// Conversations and the messages within them.
#[async_trait]
pub trait MessagingRepository: Send + Sync {
    /// Finds a conversation for `address`, merging with a formatting
    /// variant of the same 9-digit suffix if one exists, or creates a new
    /// one.
    async fn get_or_create_conversation(
        &self,
        address: &PhoneNumber,
        display_name: Option<&str>,
    ) -> StorageResult<Conversation>;

    /// Lists conversations matching `filter`, sorted by `sort`, optionally
    /// filtered by a display-name/address substring `query`.
    async fn get_conversations(
        &self,
        filter: ConversationFilter,
        sort: ConversationSort,
        query: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> StorageResult<Vec<Conversation>>;

    /// Lists messages in a conversation, newest first.
    async fn get_messages(
        &self,
        conversation_id: ConversationId,
        limit: i64,
        offset: i64,
    ) -> StorageResult<Vec<Message>>;

    /// Inserts a message, truncating the body if needed, and updates the
    /// owning conversation's snippet/timestamp/unread-count.
    async fn insert_message(
        &self,
        conversation_id: ConversationId,
        direction: Direction,
        body: &str,
        campaign_id: Option<&str>,
        max_body_length: usize,
    ) -> StorageResult<Message>;

    /// Updates a message's lifecycle status.
    async fn update_message_status(
        &self,
        message_id: MessageId,
        status: MessageStatus,
    ) -> StorageResult<()>;

    /// Atomically zeroes a conversation's unread count.
    async fn mark_conversation_as_read(&self, conversation_id: ConversationId) -> StorageResult<()>;

    /// Idempotently syncs a message observed in the native inbox: a second
    /// call with the same `(conversation_id, native_message_id)` pair is a
    /// no-op.
    async fn sync_message_from_native(
        &self,
        conversation_id: ConversationId,
        native_message_id: &str,
        direction: Direction,
        status: MessageStatus,
        body: &str,
        sent_at: i64,
        max_body_length: usize,
    ) -> StorageResult<Message>;

    /// Archives multiple conversations in one transaction.
    async fn archive_multiple(&self, ids: &[ConversationId]) -> StorageResult<()>;

    /// Deletes multiple conversations (and their messages, via cascade) in
    /// one transaction.
    async fn delete_multiple(&self, ids: &[ConversationId]) -> StorageResult<()>;

    /// Marks multiple conversations as read in one transaction.
    async fn mark_multiple_as_read(&self, ids: &[ConversationId]) -> StorageResult<()>;

    /// Saves (or clears, with `None`) a conversation's draft body.
    async fn save_draft(&self, conversation_id: ConversationId, draft: Option<&str>) -> StorageResult<()>;
}

/// `SQLite`-backed messaging repository. Every read and write is submitted
/// through [`OperationQueue`] rather than touching a pool directly, so a
/// check-then-insert like [`get_or_create_conversation`](MessagingRepository::get_or_create_conversation)
/// can't race another writer.
pub struct SqliteMessagingRepository {
    queue: OperationQueue,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteMessagingRepository {
    /// Builds a repository over an already-migrated queue.
    #[must_use]
    pub fn new(queue: OperationQueue, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self { queue, time_provider }
    }
}

#[async_trait]
impl MessagingRepository for SqliteMessagingRepository {
    #[instrument(skip(self, display_name), fields(address = %address))]
    async fn get_or_create_conversation(
        &self,
        address: &PhoneNumber,
        display_name: Option<&str>,
    ) -> StorageResult<Conversation> {
        let address = address.clone();
        let display_name = display_name.map(str::to_string);
        let time_provider = self.time_provider.clone();
        self.queue
            .write_value(OpPriority::Normal, move |pool| async move {
                if let Some(existing) = find_by_thread(&pool, &address).await? {
                    return Ok(existing);
                }
                if let Some(existing) = find_by_suffix(&pool, &address).await? {
                    return Ok(existing);
                }

                let now = time_provider.unix_millis();
                let thread_id = format!("thread-{now}-{address}");
                let color = stable_color(address.as_str());

                let id: i64 = sqlx::query_scalar(
                    "INSERT INTO conversations
                        (thread_id, address, display_name, color, is_archived, is_pinned,
                         unread_count, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 0, 0, 0, ?5, ?5)
                     RETURNING id",
                )
                .bind(&thread_id)
                .bind(address.as_str())
                .bind(&display_name)
                .bind(&color)
                .bind(now)
                .fetch_one(&pool)
                .await?;

                info!(conversation_id = id, "created conversation");

                Ok(Conversation {
                    id: ConversationId::from(id),
                    thread_id,
                    address: address.as_str().to_string(),
                    display_name,
                    color,
                    is_archived: false,
                    is_pinned: false,
                    unread_count: 0,
                    last_message_snippet: None,
                    last_message_timestamp: None,
                    draft_body: None,
                })
            })
            .await
    }

    async fn get_conversations(
        &self,
        filter: ConversationFilter,
        sort: ConversationSort,
        query: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> StorageResult<Vec<Conversation>> {
        let query = query.map(str::to_string);
        self.queue
            .read_value(move |pool| async move {
                let mut sql = "SELECT * FROM conversations WHERE 1=1".to_string();
                match filter {
                    ConversationFilter::All => {}
                    ConversationFilter::Unread => sql.push_str(" AND unread_count > 0"),
                    ConversationFilter::Archived => sql.push_str(" AND is_archived = 1"),
                }
                if query.is_some() {
                    sql.push_str(" AND (address LIKE ?1 OR display_name LIKE ?1)");
                }
                sql.push_str(match sort {
                    ConversationSort::Recent => " ORDER BY last_message_timestamp DESC",
                    ConversationSort::UnreadFirst => {
                        " ORDER BY (unread_count > 0) DESC, last_message_timestamp DESC"
                    }
                    ConversationSort::Alphabetical => " ORDER BY COALESCE(display_name, address) ASC",
                    ConversationSort::PinnedFirst => " ORDER BY is_pinned DESC, last_message_timestamp DESC",
                });
                sql.push_str(" LIMIT ?2 OFFSET ?3");

                let mut q = sqlx::query(&sql);
                q = if let Some(term) = &query {
                    q.bind(format!("%{term}%")).bind(limit).bind(offset)
                } else {
                    q.bind(limit).bind(offset)
                };
                let rows = q.fetch_all(&pool).await?;
                rows.iter().map(row_to_conversation).collect()
            })
            .await
    }

    async fn get_messages(
        &self,
        conversation_id: ConversationId,
        limit: i64,
        offset: i64,
    ) -> StorageResult<Vec<Message>> {
        self.queue
            .read_value(move |pool| async move {
                let rows = sqlx::query(
                    "SELECT * FROM messages WHERE conversation_id = ?1
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                )
                .bind(conversation_id.into_inner())
                .bind(limit)
                .bind(offset)
                .fetch_all(&pool)
                .await?;
                rows.iter().map(row_to_message).collect()
            })
            .await
    }

    #[instrument(skip(self, body))]
    async fn insert_message(
        &self,
        conversation_id: ConversationId,
        direction: Direction,
        body: &str,
        campaign_id: Option<&str>,
        max_body_length: usize,
    ) -> StorageResult<Message> {
        let body = body.to_string();
        let campaign_id = campaign_id.map(str::to_string);
        let time_provider = self.time_provider.clone();
        self.queue
            .write_value(OpPriority::Normal, move |pool| async move {
                let (stored_body, was_truncated) = truncate_body(&body, max_body_length);
                let now = time_provider.unix_millis();
                let status = if was_truncated {
                    MessageStatus::Truncated
                } else if direction == Direction::Incoming {
                    MessageStatus::Received
                } else {
                    MessageStatus::Pending
                };

                let mut tx = pool.begin().await?;

                let id: i64 = sqlx::query_scalar(
                    "INSERT INTO messages
                        (conversation_id, direction, status, body, was_truncated, campaign_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     RETURNING id",
                )
                .bind(conversation_id.into_inner())
                .bind(direction.as_str())
                .bind(status.as_str())
                .bind(&stored_body)
                .bind(i64::from(was_truncated))
                .bind(&campaign_id)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;

                let snippet: String = stored_body.chars().take(SNIPPET_LEN).collect();
                let unread_increment = i64::from(direction == Direction::Incoming);
                sqlx::query(
                    "UPDATE conversations SET
                        last_message_snippet = ?1,
                        last_message_timestamp = ?2,
                        unread_count = unread_count + ?3,
                        updated_at = ?2
                     WHERE id = ?4",
                )
                .bind(&snippet)
                .bind(now)
                .bind(unread_increment)
                .bind(conversation_id.into_inner())
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;

                Ok(Message {
                    id: MessageId::from(id),
                    conversation_id,
                    native_message_id: None,
                    direction,
                    status,
                    body: stored_body,
                    was_truncated,
                    campaign_id,
                    sent_at: None,
                    created_at: now,
                })
            })
            .await
    }

    async fn update_message_status(
        &self,
        message_id: MessageId,
        status: MessageStatus,
    ) -> StorageResult<()> {
        let time_provider = self.time_provider.clone();
        self.queue
            .write_value(OpPriority::Normal, move |pool| async move {
                let now = time_provider.unix_millis();
                let sent_at = matches!(status, MessageStatus::Sent).then_some(now);
                sqlx::query("UPDATE messages SET status = ?1, sent_at = COALESCE(?2, sent_at) WHERE id = ?3")
                    .bind(status.as_str())
                    .bind(sent_at)
                    .bind(message_id.into_inner())
                    .execute(&pool)
                    .await?;
                Ok(())
            })
            .await
    }

    async fn mark_conversation_as_read(&self, conversation_id: ConversationId) -> StorageResult<()> {
        self.queue
            .write_value(OpPriority::Normal, move |pool| async move {
                sqlx::query("UPDATE conversations SET unread_count = 0 WHERE id = ?1")
                    .bind(conversation_id.into_inner())
                    .execute(&pool)
                    .await?;
                Ok(())
            })
            .await
    }

    async fn sync_message_from_native(
        &self,
        conversation_id: ConversationId,
        native_message_id: &str,
        direction: Direction,
        status: MessageStatus,
        body: &str,
        sent_at: i64,
        max_body_length: usize,
    ) -> StorageResult<Message> {
        let native_message_id = native_message_id.to_string();
        let body = body.to_string();
        self.queue
            .write_value(OpPriority::Normal, move |pool| async move {
                let existing = sqlx::query(
                    "SELECT * FROM messages WHERE conversation_id = ?1 AND native_message_id = ?2",
                )
                .bind(conversation_id.into_inner())
                .bind(&native_message_id)
                .fetch_optional(&pool)
                .await?;
                if let Some(row) = existing {
                    return row_to_message(&row);
                }

                let (stored_body, was_truncated) = truncate_body(&body, max_body_length);
                let id: i64 = sqlx::query_scalar(
                    "INSERT INTO messages
                        (conversation_id, native_message_id, direction, status, body, was_truncated, sent_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                     RETURNING id",
                )
                .bind(conversation_id.into_inner())
                .bind(&native_message_id)
                .bind(direction.as_str())
                .bind(status.as_str())
                .bind(&stored_body)
                .bind(i64::from(was_truncated))
                .bind(sent_at)
                .fetch_one(&pool)
                .await?;

                Ok(Message {
                    id: MessageId::from(id),
                    conversation_id,
                    native_message_id: Some(native_message_id),
                    direction,
                    status,
                    body: stored_body,
                    was_truncated,
                    campaign_id: None,
                    sent_at: Some(sent_at),
                    created_at: sent_at,
                })
            })
            .await
    }

    async fn archive_multiple(&self, ids: &[ConversationId]) -> StorageResult<()> {
        let ids = ids.to_vec();
        self.queue
            .write_value(OpPriority::Normal, move |pool| async move {
                let mut tx = pool.begin().await?;
                for id in ids {
                    sqlx::query("UPDATE conversations SET is_archived = 1 WHERE id = ?1")
                        .bind(id.into_inner())
                        .execute(&mut *tx)
                        .await?;
                }
                tx.commit().await?;
                Ok(())
            })
            .await
    }

    async fn delete_multiple(&self, ids: &[ConversationId]) -> StorageResult<()> {
        let ids = ids.to_vec();
        self.queue
            .write_value(OpPriority::Normal, move |pool| async move {
                let mut tx = pool.begin().await?;
                for id in ids {
                    sqlx::query("DELETE FROM conversations WHERE id = ?1")
                        .bind(id.into_inner())
                        .execute(&mut *tx)
                        .await?;
                }
                tx.commit().await?;
                Ok(())
            })
            .await
    }

    async fn mark_multiple_as_read(&self, ids: &[ConversationId]) -> StorageResult<()> {
        let ids = ids.to_vec();
        self.queue
            .write_value(OpPriority::Normal, move |pool| async move {
                let mut tx = pool.begin().await?;
                for id in ids {
                    sqlx::query("UPDATE conversations SET unread_count = 0 WHERE id = ?1")
                        .bind(id.into_inner())
                        .execute(&mut *tx)
                        .await?;
                }
                tx.commit().await?;
                Ok(())
            })
            .await
    }

    async fn save_draft(&self, conversation_id: ConversationId, draft: Option<&str>) -> StorageResult<()> {
        let draft = draft.map(str::to_string);
        self.queue
            .write_value(OpPriority::Normal, move |pool| async move {
                sqlx::query("UPDATE conversations SET draft_body = ?1 WHERE id = ?2")
                    .bind(&draft)
                    .bind(conversation_id.into_inner())
                    .execute(&pool)
                    .await?;
                Ok(())
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

    async fn repository() -> (SqliteMessagingRepository, tempfile::TempDir) {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("messaging.db");
        let path = DatabasePath::new(db_path).unwrap();
        let config = DatabaseConfig::for_testing(path);
        let time_provider: Arc<dyn TimeProvider> = Arc::new(MockTimeProvider::new());
        let engine = StorageEngine::open(config, time_provider.as_ref()).await.unwrap();
        (
            SqliteMessagingRepository::new(engine.queue().clone(), time_provider),
            temp_dir,
        )
    }

    #[tokio::test]
    async fn test_should_create_conversation_once_for_repeated_address() {
        let (repo, _dir) = repository().await;
        let address = PhoneNumber::try_new("+254712345678").unwrap();

        let first = repo.get_or_create_conversation(&address, None).await.unwrap();
        let second = repo.get_or_create_conversation(&address, None).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_should_merge_formatting_variant_via_suffix_match() {
        let (repo, _dir) = repository().await;
        let canonical = PhoneNumber::try_new("+254712345678").unwrap();
        let variant = PhoneNumber::try_new("0712 345 678").unwrap();

        let first = repo.get_or_create_conversation(&canonical, None).await.unwrap();
        let second = repo.get_or_create_conversation(&variant, None).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_should_truncate_oversized_message_body() {
        let (repo, _dir) = repository().await;
        let address = PhoneNumber::try_new("+254712345678").unwrap();
        let conversation = repo.get_or_create_conversation(&address, None).await.unwrap();

        let body = "x".repeat(50);
        let message = repo
            .insert_message(conversation.id, Direction::Outgoing, &body, None, 10)
            .await
            .unwrap();
        assert!(message.was_truncated);
        assert_eq!(message.body.chars().count(), 10);
        assert_eq!(message.status, MessageStatus::Truncated);
    }

    #[tokio::test]
    async fn test_should_increment_unread_count_on_incoming_message() {
        let (repo, _dir) = repository().await;
        let address = PhoneNumber::try_new("+254700000001").unwrap();
        let conversation = repo.get_or_create_conversation(&address, None).await.unwrap();

        repo.insert_message(conversation.id, Direction::Incoming, "hi", None, 1600)
            .await
            .unwrap();
        repo.insert_message(conversation.id, Direction::Incoming, "again", None, 1600)
            .await
            .unwrap();

        let conversations = repo
            .get_conversations(ConversationFilter::All, ConversationSort::Recent, None, 10, 0)
            .await
            .unwrap();
        assert_eq!(conversations[0].unread_count, 2);
    }

    #[tokio::test]
    async fn test_should_zero_unread_count_on_mark_as_read() {
        let (repo, _dir) = repository().await;
        let address = PhoneNumber::try_new("+254700000002").unwrap();
        let conversation = repo.get_or_create_conversation(&address, None).await.unwrap();
        repo.insert_message(conversation.id, Direction::Incoming, "hi", None, 1600)
            .await
            .unwrap();

        repo.mark_conversation_as_read(conversation.id).await.unwrap();

        let conversations = repo
            .get_conversations(ConversationFilter::All, ConversationSort::Recent, None, 10, 0)
            .await
            .unwrap();
        assert_eq!(conversations[0].unread_count, 0);
    }

    #[tokio::test]
    async fn test_should_be_idempotent_syncing_same_native_message_twice() {
        let (repo, _dir) = repository().await;
        let address = PhoneNumber::try_new("+254700000003").unwrap();
        let conversation = repo.get_or_create_conversation(&address, None).await.unwrap();

        let first = repo
            .sync_message_from_native(
                conversation.id,
                "native-1",
                Direction::Incoming,
                MessageStatus::Received,
                "hello",
                1_000,
                1600,
            )
            .await
            .unwrap();
        let second = repo
            .sync_message_from_native(
                conversation.id,
                "native-1",
                Direction::Incoming,
                MessageStatus::Received,
                "hello",
                1_000,
                1600,
            )
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        let messages = repo.get_messages(conversation.id, 10, 0).await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn test_should_archive_multiple_conversations_atomically() {
        let (repo, _dir) = repository().await;
        let a = repo
            .get_or_create_conversation(&PhoneNumber::try_new("+254700000010").unwrap(), None)
            .await
            .unwrap();
        let b = repo
            .get_or_create_conversation(&PhoneNumber::try_new("+254700000011").unwrap(), None)
            .await
            .unwrap();

        repo.archive_multiple(&[a.id, b.id]).await.unwrap();

        let archived = repo
            .get_conversations(ConversationFilter::Archived, ConversationSort::Recent, None, 10, 0)
            .await
            .unwrap();
        assert_eq!(archived.len(), 2);
    }

    #[tokio::test]
    async fn test_should_save_and_clear_draft() {
        let (repo, _dir) = repository().await;
        let conversation = repo
            .get_or_create_conversation(&PhoneNumber::try_new("+254700000020").unwrap(), None)
            .await
            .unwrap();

        repo.save_draft(conversation.id, Some("hello there")).await.unwrap();
        let conversations = repo
            .get_conversations(ConversationFilter::All, ConversationSort::Recent, None, 10, 0)
            .await
            .unwrap();
        assert_eq!(conversations[0].draft_body.as_deref(), Some("hello there"));

        repo.save_draft(conversation.id, None).await.unwrap();
        let conversations = repo
            .get_conversations(ConversationFilter::All, ConversationSort::Recent, None, 10, 0)
            .await
            .unwrap();
        assert_eq!(conversations[0].draft_body, None);
    }
}
