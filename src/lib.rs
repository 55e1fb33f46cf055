//! # sms-engine
//!
//! A device-resident bulk SMS campaign engine: a `SQLite`-backed message
//! store, a single-writer operation queue, a cooperative send pipeline
//! with pause/resume/cancel, a background retry worker gated by a
//! circuit breaker, and an offline-capable entitlement manager.
//!
//! The engine never touches the OS, a radio, or a payment rail directly —
//! every external dependency is a trait in [`transport`], implemented by
//! a host application and driven by fakes in tests.
//!
//! ## Architecture
//!
//! - [`database`] / [`migration`]: opens and migrates the embedded store.
//! - [`operation_queue`]: the single writer every mutation serialises
//!   through, with bounded concurrent reads.
//! - [`storage`]: repository traits (`MessagingRepository`,
//!   `OutboundQueueRepository`, `SendLogRepository`) and their `SQLite`
//!   implementations.
//! - [`send_pipeline`]: dispatches one campaign's recipients.
//! - [`retry_worker`] / [`circuit_breaker`]: drains failed sends
//!   independently of any campaign.
//! - [`incoming_worker`]: drains inbound messages into the message store
//!   independently of any campaign.
//! - [`entitlement`]: the access gate (trial, payment, license key).
//! - [`events`]: the `EngineEvent` surface a host UI subscribes to.
//! - [`config`]: every tunable knob, in one validated struct.

pub mod circuit_breaker;
pub mod config;
pub mod database;
pub mod domain_types;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod incoming_worker;
pub mod migration;
pub mod operation_queue;
pub mod retry_worker;
pub mod send_pipeline;
pub mod storage;
pub mod template;
pub mod time_provider;
pub mod transport;

pub use config::EngineConfig;
pub use error::{CoreError, CoreResult};
pub use events::{EngineEvent, EventBus};
