//! In-memory repository fakes for pipeline, retry worker, and entitlement
//! tests that don't need a real `SQLite` file.

use super::{Conversation, Message, MessagingRepository, OutboundEntry, OutboundQueueRepository, OutboundStats, SendLogRepository};
use crate::domain_types::{
    stable_color, truncate_body, ConversationFilter, ConversationId, ConversationSort, Direction,
    MessageId, MessageStatus, OutboundEntryId, OutboundStatus, Priority,
};
use crate::error::StorageResult;
use crate::time_provider::TimeProvider;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// An in-memory `MessagingRepository` for pipeline/entitlement tests.
pub struct InMemoryMessagingRepository {
    conversations: Mutex<HashMap<i64, Conversation>>,
    messages: Mutex<Vec<Message>>,
    next_conversation_id: AtomicI64,
    next_message_id: AtomicI64,
    time_provider: Arc<dyn TimeProvider>,
}

impl InMemoryMessagingRepository {
    /// Builds an empty repository.
    #[must_use]
    pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            conversations: Mutex::new(HashMap::new()),
            messages: Mutex::new(Vec::new()),
            next_conversation_id: AtomicI64::new(1),
            next_message_id: AtomicI64::new(1),
            time_provider,
        }
    }
}

#[async_trait]
impl MessagingRepository for InMemoryMessagingRepository {
    async fn get_or_create_conversation(
        &self,
        address: &crate::domain_types::PhoneNumber,
        display_name: Option<&str>,
    ) -> StorageResult<Conversation> {
        let mut conversations = self.conversations.lock().expect("lock poisoned");
        if let Some(existing) = conversations.values().find(|c| c.address == address.as_str()) {
            return Ok(existing.clone());
        }
        let id = self.next_conversation_id.fetch_add(1, Ordering::SeqCst);
        let conversation = Conversation {
            id: ConversationId::from(id),
            thread_id: format!("thread-{id}"),
            address: address.as_str().to_string(),
            display_name: display_name.map(str::to_string),
            color: stable_color(address.as_str()),
            is_archived: false,
            is_pinned: false,
            unread_count: 0,
            last_message_snippet: None,
            last_message_timestamp: None,
            draft_body: None,
        };
        conversations.insert(id, conversation.clone());
        Ok(conversation)
    }

    async fn get_conversations(
        &self,
        filter: ConversationFilter,
        _sort: ConversationSort,
        _query: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> StorageResult<Vec<Conversation>> {
        let conversations = self.conversations.lock().expect("lock poisoned");
        let mut matching: Vec<Conversation> = conversations
            .values()
            .filter(|c| match filter {
                ConversationFilter::All => true,
                ConversationFilter::Unread => c.unread_count > 0,
                ConversationFilter::Archived => c.is_archived,
            })
            .cloned()
            .collect();
        matching.sort_by_key(|c| c.id.into_inner());
        let start = usize::try_from(offset).unwrap_or(0).min(matching.len());
        let end = (start + usize::try_from(limit).unwrap_or(usize::MAX)).min(matching.len());
        Ok(matching[start..end].to_vec())
    }

    async fn get_messages(
        &self,
        conversation_id: ConversationId,
        limit: i64,
        offset: i64,
    ) -> StorageResult<Vec<Message>> {
        let messages = self.messages.lock().expect("lock poisoned");
        let mut matching: Vec<Message> = messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        matching.sort_by_key(|m| std::cmp::Reverse(m.created_at));
        let start = usize::try_from(offset).unwrap_or(0).min(matching.len());
        let end = (start + usize::try_from(limit).unwrap_or(usize::MAX)).min(matching.len());
        Ok(matching[start..end].to_vec())
    }

    async fn insert_message(
        &self,
        conversation_id: ConversationId,
        direction: Direction,
        body: &str,
        campaign_id: Option<&str>,
        max_body_length: usize,
    ) -> StorageResult<Message> {
        let (stored_body, was_truncated) = truncate_body(body, max_body_length);
        let now = self.time_provider.unix_millis();
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let status = if was_truncated {
            MessageStatus::Truncated
        } else if direction == Direction::Incoming {
            MessageStatus::Received
        } else {
            MessageStatus::Pending
        };
        let message = Message {
            id: MessageId::from(id),
            conversation_id,
            native_message_id: None,
            direction,
            status,
            body: stored_body,
            was_truncated,
            campaign_id: campaign_id.map(str::to_string),
            sent_at: None,
            created_at: now,
        };
        self.messages.lock().expect("lock poisoned").push(message.clone());

        if let Some(conversation) = self
            .conversations
            .lock()
            .expect("lock poisoned")
            .get_mut(&conversation_id.into_inner())
        {
            conversation.last_message_snippet = Some(message.body.clone());
            conversation.last_message_timestamp = Some(now);
            if direction == Direction::Incoming {
                conversation.unread_count += 1;
            }
        }
        Ok(message)
    }

    async fn update_message_status(&self, message_id: MessageId, status: MessageStatus) -> StorageResult<()> {
        if let Some(message) = self
            .messages
            .lock()
            .expect("lock poisoned")
            .iter_mut()
            .find(|m| m.id == message_id)
        {
            message.status = status;
            if status == MessageStatus::Sent {
                message.sent_at = Some(self.time_provider.unix_millis());
            }
        }
        Ok(())
    }

    async fn mark_conversation_as_read(&self, conversation_id: ConversationId) -> StorageResult<()> {
        if let Some(conversation) = self
            .conversations
            .lock()
            .expect("lock poisoned")
            .get_mut(&conversation_id.into_inner())
        {
            conversation.unread_count = 0;
        }
        Ok(())
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
        if let Some(existing) = self
            .messages
            .lock()
            .expect("lock poisoned")
            .iter()
            .find(|m| m.conversation_id == conversation_id && m.native_message_id.as_deref() == Some(native_message_id))
        {
            return Ok(existing.clone());
        }
        let (stored_body, was_truncated) = truncate_body(body, max_body_length);
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let message = Message {
            id: MessageId::from(id),
            conversation_id,
            native_message_id: Some(native_message_id.to_string()),
            direction,
            status,
            body: stored_body,
            was_truncated,
            campaign_id: None,
            sent_at: Some(sent_at),
            created_at: sent_at,
        };
        self.messages.lock().expect("lock poisoned").push(message.clone());
        Ok(message)
    }

    async fn archive_multiple(&self, ids: &[ConversationId]) -> StorageResult<()> {
        let mut conversations = self.conversations.lock().expect("lock poisoned");
        for id in ids {
            if let Some(c) = conversations.get_mut(&id.into_inner()) {
                c.is_archived = true;
            }
        }
        Ok(())
    }

    async fn delete_multiple(&self, ids: &[ConversationId]) -> StorageResult<()> {
        let mut conversations = self.conversations.lock().expect("lock poisoned");
        for id in ids {
            conversations.remove(&id.into_inner());
        }
        Ok(())
    }

    async fn mark_multiple_as_read(&self, ids: &[ConversationId]) -> StorageResult<()> {
        let mut conversations = self.conversations.lock().expect("lock poisoned");
        for id in ids {
            if let Some(c) = conversations.get_mut(&id.into_inner()) {
                c.unread_count = 0;
            }
        }
        Ok(())
    }

    async fn save_draft(&self, conversation_id: ConversationId, draft: Option<&str>) -> StorageResult<()> {
        if let Some(c) = self
            .conversations
            .lock()
            .expect("lock poisoned")
            .get_mut(&conversation_id.into_inner())
        {
            c.draft_body = draft.map(str::to_string);
        }
        Ok(())
    }
}

/// An in-memory `OutboundQueueRepository` for pipeline/retry worker tests.
pub struct InMemoryOutboundQueueRepository {
    entries: Mutex<Vec<OutboundEntry>>,
    next_id: AtomicI64,
    time_provider: Arc<dyn TimeProvider>,
}

impl InMemoryOutboundQueueRepository {
    /// Builds an empty repository.
    #[must_use]
    pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            time_provider,
        }
    }
}

#[async_trait]
impl OutboundQueueRepository for InMemoryOutboundQueueRepository {
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
        let now = self.time_provider.unix_millis();
        let window_start = now - i64::try_from(dedup_window.as_millis()).unwrap_or(i64::MAX);
        let mut entries = self.entries.lock().expect("lock poisoned");
        if let Some(existing) = entries.iter().find(|e| {
            e.recipient == recipient && e.body == body && e.sim_slot == sim_slot && e.enqueued_at >= window_start
        }) {
            return Ok(existing.id);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        entries.push(OutboundEntry {
            id: OutboundEntryId::from(id),
            recipient: recipient.to_string(),
            body: body.to_string(),
            campaign_id: campaign_id.map(str::to_string),
            variant_id: variant_id.map(str::to_string),
            priority,
            sim_slot,
            db_message_id,
            status: OutboundStatus::Pending,
            retry_count: 0,
            last_error: None,
            enqueued_at: now,
        });
        Ok(OutboundEntryId::from(id))
    }

    async fn get_pending(&self, limit: i64) -> StorageResult<Vec<OutboundEntry>> {
        let entries = self.entries.lock().expect("lock poisoned");
        let mut matching: Vec<OutboundEntry> = entries
            .iter()
            .filter(|e| matches!(e.status, OutboundStatus::Pending | OutboundStatus::Failed))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.enqueued_at.cmp(&b.enqueued_at)));
        matching.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(matching)
    }

    async fn mark_sent(&self, id: OutboundEntryId) -> StorageResult<()> {
        if let Some(entry) = self.entries.lock().expect("lock poisoned").iter_mut().find(|e| e.id == id) {
            entry.status = OutboundStatus::Sent;
        }
        Ok(())
    }

    async fn mark_failed(&self, id: OutboundEntryId, error: &str, max_retries: u32) -> StorageResult<()> {
        if let Some(entry) = self.entries.lock().expect("lock poisoned").iter_mut().find(|e| e.id == id) {
            entry.retry_count += 1;
            entry.last_error = Some(error.to_string());
            entry.status = if entry.retry_count >= max_retries {
                OutboundStatus::Exhausted
            } else {
                OutboundStatus::Failed
            };
        }
        Ok(())
    }

    async fn get_stats(&self) -> StorageResult<OutboundStats> {
        let entries = self.entries.lock().expect("lock poisoned");
        let mut stats = OutboundStats::default();
        for entry in entries.iter() {
            match entry.status {
                OutboundStatus::Pending => stats.pending += 1,
                OutboundStatus::Sent => stats.sent += 1,
                OutboundStatus::Failed => stats.failed += 1,
                OutboundStatus::Exhausted => stats.exhausted += 1,
            }
        }
        Ok(stats)
    }

    async fn clear_exhausted(&self) -> StorageResult<u64> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        let before = entries.len();
        entries.retain(|e| e.status != OutboundStatus::Exhausted);
        Ok(u64::try_from(before - entries.len()).unwrap_or(0))
    }

    async fn clear_sent(&self) -> StorageResult<u64> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        let before = entries.len();
        entries.retain(|e| e.status != OutboundStatus::Sent);
        Ok(u64::try_from(before - entries.len()).unwrap_or(0))
    }
}

/// An in-memory `SendLogRepository` for pipeline/retry worker tests.
pub struct InMemorySendLogRepository {
    records: Mutex<Vec<(String, String, i64)>>,
    time_provider: Arc<dyn TimeProvider>,
}

impl InMemorySendLogRepository {
    /// Builds an empty repository.
    #[must_use]
    pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            time_provider,
        }
    }
}

#[async_trait]
impl SendLogRepository for InMemorySendLogRepository {
    async fn record(&self, recipient: &str, body: &str, _campaign_id: Option<&str>) -> StorageResult<()> {
        let now = self.time_provider.unix_millis();
        self.records
            .lock()
            .expect("lock poisoned")
            .push((recipient.to_string(), body.to_string(), now));
        Ok(())
    }

    async fn was_recently_sent(&self, recipient: &str, body: &str, window: Duration) -> StorageResult<bool> {
        let now = self.time_provider.unix_millis();
        let window_start = now - i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        Ok(self
            .records
            .lock()
            .expect("lock poisoned")
            .iter()
            .any(|(r, b, t)| r == recipient && b == body && *t >= window_start))
    }

    async fn recent_send_count(&self, recipient: &str, window: Duration) -> StorageResult<i64> {
        let now = self.time_provider.unix_millis();
        let window_start = now - i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        Ok(self
            .records
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|(r, _, t)| r == recipient && *t >= window_start)
            .count() as i64)
    }
}
