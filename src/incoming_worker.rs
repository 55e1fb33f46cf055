//! Incoming SMS worker: drains [`SmsTransport::poll_incoming`] into the
//! messaging store independently of any running campaign.
//!
//! Same fixed-interval `tokio::select!` shape as the retry worker: wake on
//! a timer or on cancellation, whichever comes first. Each observed
//! message is synced idempotently (a native id already seen is a no-op)
//! and, once stored, published on the [`EventBus`] for a host UI.

use crate::domain_types::{Direction, MessageStatus, PhoneNumber};
use crate::events::{EngineEvent, EventBus};
use crate::storage::MessagingRepository;
use crate::transport::SmsTransport;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

/// Builds the dedup key `sync_message_from_native` keys its idempotency
/// check on: conversation, timestamp, direction, and body all have to match
/// for two polls to collapse into one stored message.
fn native_id(phone: &str, timestamp: i64, body: &str) -> String {
    let body_hash = format!("{:x}", Sha256::digest(body.as_bytes()));
    format!("{phone}:{timestamp}:{body_hash}")
}

/// Handle to a running incoming-sms worker.
pub struct IncomingWorkerHandle {
    cancellation: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl IncomingWorkerHandle {
    /// Stops the worker after its current poll cycle (if any) completes.
    pub fn stop(&self) {
        self.cancellation.cancel();
    }

    /// Awaits worker shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker task panicked.
    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        self.join.await
    }
}

/// Spawns a worker that polls `transport` for new inbound messages and
/// syncs them into `messaging` on a fixed `poll_interval`.
#[must_use]
pub fn spawn_incoming_worker(
    messaging: Arc<dyn MessagingRepository>,
    transport: Arc<dyn SmsTransport>,
    poll_interval: Duration,
    max_body_length: usize,
    events: EventBus,
) -> IncomingWorkerHandle {
    let cancellation = CancellationToken::new();
    let task_cancellation = cancellation.clone();

    let join = tokio::spawn(async move {
        run_worker(messaging, transport, poll_interval, max_body_length, events, task_cancellation).await;
    });

    IncomingWorkerHandle { cancellation, join }
}

async fn run_worker(
    messaging: Arc<dyn MessagingRepository>,
    transport: Arc<dyn SmsTransport>,
    poll_interval: Duration,
    max_body_length: usize,
    events: EventBus,
    cancellation: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancellation.cancelled() => break,
            () = tokio::time::sleep(poll_interval) => {}
        }
        if cancellation.is_cancelled() {
            break;
        }
        poll_once(&messaging, &transport, max_body_length, &events).await;
    }
}

#[instrument(skip_all)]
async fn poll_once(
    messaging: &Arc<dyn MessagingRepository>,
    transport: &Arc<dyn SmsTransport>,
    max_body_length: usize,
    events: &EventBus,
) {
    for incoming in transport.poll_incoming().await {
        let phone = match PhoneNumber::try_new(incoming.phone.clone()) {
            Ok(phone) => phone,
            Err(error) => {
                warn!(%error, "discarding incoming sms with unparseable sender");
                continue;
            }
        };
        let conversation = match messaging.get_or_create_conversation(&phone, None).await {
            Ok(conversation) => conversation,
            Err(error) => {
                warn!(%error, "failed to resolve conversation for incoming sms");
                continue;
            }
        };
        let native_id = native_id(&incoming.phone, incoming.timestamp, &incoming.body);
        let synced = messaging
            .sync_message_from_native(
                conversation.id,
                &native_id,
                Direction::Incoming,
                MessageStatus::Received,
                &incoming.body,
                incoming.timestamp,
                max_body_length,
            )
            .await;
        match synced {
            Ok(_message) => events.publish(EngineEvent::IncomingSms {
                phone: incoming.phone,
                body: incoming.body,
                timestamp: incoming.timestamp,
            }),
            Err(error) => warn!(%error, "failed to sync incoming sms"),
        }
    }
}
