//! Repository traits and `SQLite` implementations for the campaign database.
//!
//! Each repository is a thin, async-trait-bounded interface over the
//! [`crate::operation_queue::OperationQueue`], the same seam the teacher
//! drew between its `AgentStorage` trait and `SqliteAgentStorage`
//! implementation — trait for testability, one concrete backend for
//! production.

mod audit_log;
mod messaging;
mod outbound_queue;
mod send_log;
#[cfg(test)]
pub mod test_utils;

pub use audit_log::{AuditEntry, AuditLogRepository, SqliteAuditLogRepository};
pub use messaging::{Conversation, Message, MessagingRepository, SqliteMessagingRepository};
pub use outbound_queue::{
    OutboundEntry, OutboundQueueRepository, OutboundStats, SqliteOutboundQueueRepository,
};
pub use send_log::{SendLogRepository, SqliteSendLogRepository};
