//! Send pipeline: dispatches one campaign's recipients as a single
//! cooperative task.
//!
//! One message is in flight at a time — the transport and message
//! ordering are inherently serial per SIM, so there is no parallel
//! dispatch to coordinate. Pause/resume/cancel are exposed through a
//! [`CampaignHandle`]; the actual send loop runs under `tokio::spawn` and
//! is driven entirely by a `watch` gate and a `CancellationToken`,
//! mirroring the reference codebase's background-task/handle split.

use crate::config::EngineConfig;
use crate::domain_types::{CampaignId, Direction, MessageId, MessageStatus, PhoneNumber, Priority};
use crate::entitlement::EntitlementManager;
use crate::events::{EngineEvent, EventBus};
use crate::storage::{MessagingRepository, OutboundQueueRepository, SendLogRepository};
use crate::template::{render, Recipient};
use crate::transport::SmsTransport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Final tally of a completed (or cancelled/exited) campaign run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CampaignCounters {
    /// Messages accepted by the transport.
    pub sent: u64,
    /// Messages the transport rejected (now queued for retry).
    pub failed: u64,
    /// Messages skipped as exact recent duplicates.
    pub skipped: u64,
    /// Messages skipped for having an unparseable address.
    pub invalid: u64,
    /// Messages refused because entitlement access was not active.
    pub denied: u64,
}

struct Counters {
    sent: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    invalid: AtomicU64,
    denied: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            invalid: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> CampaignCounters {
        CampaignCounters {
            sent: self.sent.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            invalid: self.invalid.load(Ordering::SeqCst),
            denied: self.denied.load(Ordering::SeqCst),
        }
    }

    fn processed(&self) -> u64 {
        self.sent.load(Ordering::SeqCst) + self.failed.load(Ordering::SeqCst)
    }
}

/// Handle to a running (or finished) campaign send.
pub struct CampaignHandle {
    campaign_id: CampaignId,
    pause_tx: watch::Sender<bool>,
    cancellation: CancellationToken,
    join: tokio::task::JoinHandle<CampaignCounters>,
}

impl CampaignHandle {
    /// The campaign this handle controls.
    #[must_use]
    pub fn campaign_id(&self) -> CampaignId {
        self.campaign_id
    }

    /// Pauses dispatch; the in-flight send (if any) still completes.
    pub fn pause(&self) {
        let _ = self.pause_tx.send(true);
    }

    /// Resumes a paused campaign.
    pub fn resume(&self) {
        let _ = self.pause_tx.send(false);
    }

    /// Cancels the campaign cooperatively; the pipeline wakes from any
    /// pause or timeout wait and exits after flushing final counters.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Awaits campaign completion and returns its final counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline task panicked.
    pub async fn join(self) -> Result<CampaignCounters, tokio::task::JoinError> {
        self.join.await
    }
}

/// Spawns a send pipeline for `recipients` against `template`, returning a
/// handle to control and observe it.
#[must_use]
pub fn spawn_campaign(
    campaign_id: CampaignId,
    recipients: Vec<Recipient>,
    template: String,
    sim_slot: u8,
    messaging: Arc<dyn MessagingRepository>,
    outbound_queue: Arc<dyn OutboundQueueRepository>,
    send_log: Arc<dyn SendLogRepository>,
    transport: Arc<dyn SmsTransport>,
    entitlement: Arc<EntitlementManager>,
    config: Arc<EngineConfig>,
    events: EventBus,
) -> CampaignHandle {
    let (pause_tx, pause_rx) = watch::channel(false);
    let cancellation = CancellationToken::new();
    let task_cancellation = cancellation.clone();

    let join = tokio::spawn(async move {
        run_campaign(
            campaign_id,
            recipients,
            template,
            sim_slot,
            messaging,
            outbound_queue,
            send_log,
            transport,
            entitlement,
            config,
            events,
            pause_rx,
            task_cancellation,
        )
        .await
    });

    CampaignHandle {
        campaign_id,
        pause_tx,
        cancellation,
        join,
    }
}

/// Blocks until `pause_rx` reports false, or `cancellation` fires.
///
/// Returns `true` if cancellation won the race.
async fn wait_if_paused(pause_rx: &mut watch::Receiver<bool>, cancellation: &CancellationToken) -> bool {
    if !*pause_rx.borrow() {
        return false;
    }
    tokio::select! {
        () = cancellation.cancelled() => true,
        result = pause_rx.wait_for(|paused| !paused) => {
            result.is_err()
        }
    }
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(campaign_id = %campaign_id, recipients = recipients.len()))]
async fn run_campaign(
    campaign_id: CampaignId,
    recipients: Vec<Recipient>,
    template: String,
    sim_slot: u8,
    messaging: Arc<dyn MessagingRepository>,
    outbound_queue: Arc<dyn OutboundQueueRepository>,
    send_log: Arc<dyn SendLogRepository>,
    transport: Arc<dyn SmsTransport>,
    entitlement: Arc<EntitlementManager>,
    config: Arc<EngineConfig>,
    events: EventBus,
    mut pause_rx: watch::Receiver<bool>,
    cancellation: CancellationToken,
) -> CampaignCounters {
    let total = recipients.len() as u64;
    let counters = Counters::new();
    let flush_interval = config.flush_interval_for_batch(recipients.len());
    let mut last_flush = Instant::now();

    for recipient in &recipients {
        if cancellation.is_cancelled() {
            break;
        }
        if wait_if_paused(&mut pause_rx, &cancellation).await {
            break;
        }

        if !entitlement.has_active_access().await {
            counters.denied.fetch_add(1, Ordering::SeqCst);
            warn!("campaign dispatch refused; entitlement access is not active");
            continue;
        }

        let Ok(phone) = PhoneNumber::try_new(recipient.phone.clone()) else {
            counters.invalid.fetch_add(1, Ordering::SeqCst);
            continue;
        };

        let body = render(&template, recipient);

        match send_log.was_recently_sent(phone.as_str(), &body, config.duplicate_window).await {
            Ok(true) => {
                counters.skipped.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            Ok(false) => {}
            Err(error) => {
                warn!(%error, "send log lookup failed; proceeding without dedup");
            }
        }

        let Ok(conversation) = messaging.get_or_create_conversation(&phone, recipient.name.as_deref()).await else {
            counters.failed.fetch_add(1, Ordering::SeqCst);
            continue;
        };
        let Ok(message) = messaging
            .insert_message(
                conversation.id,
                Direction::Outgoing,
                &body,
                Some(campaign_id.to_string().as_str()),
                config.max_body_length,
            )
            .await
        else {
            counters.failed.fetch_add(1, Ordering::SeqCst);
            continue;
        };

        dispatch_one(
            message.id,
            phone.as_str(),
            &body,
            sim_slot,
            campaign_id,
            &messaging,
            &outbound_queue,
            &send_log,
            &transport,
            &config,
            &events,
            &counters,
            &cancellation,
        )
        .await;

        if counters.processed() % u64::try_from(config.flush_every_n_messages).unwrap_or(u64::MAX) == 0
            || last_flush.elapsed() >= flush_interval
        {
            publish_progress(&events, campaign_id, &counters, total);
            last_flush = Instant::now();
        }

        if cancellation.is_cancelled() {
            break;
        }
        tokio::select! {
            () = cancellation.cancelled() => break,
            () = tokio::time::sleep(config.send_speed_default) => {}
        }
    }

    publish_progress(&events, campaign_id, &counters, total);
    info!(counters = ?counters.snapshot(), "campaign run finished");
    counters.snapshot()
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_one(
    message_id: MessageId,
    to: &str,
    body: &str,
    sim_slot: u8,
    campaign_id: CampaignId,
    messaging: &Arc<dyn MessagingRepository>,
    outbound_queue: &Arc<dyn OutboundQueueRepository>,
    send_log: &Arc<dyn SendLogRepository>,
    transport: &Arc<dyn SmsTransport>,
    config: &Arc<EngineConfig>,
    events: &EventBus,
    counters: &Counters,
    cancellation: &CancellationToken,
) {
    let timeout = config.transport_timeout_for_attempt(0);

    let outcome = tokio::select! {
        () = cancellation.cancelled() => {
            return;
        }
        result = tokio::time::timeout(timeout, transport.send(to, body, sim_slot)) => result,
    };

    match outcome {
        Ok(outcome) if outcome.success => {
            let _ = messaging.update_message_status(message_id, MessageStatus::Sent).await;
            let _ = send_log.record(to, body, Some(campaign_id.to_string().as_str())).await;
            counters.sent.fetch_add(1, Ordering::SeqCst);
            events.publish(EngineEvent::SmsSent {
                message_id,
                campaign_id: Some(campaign_id),
            });
        }
        Ok(outcome) => {
            let error = outcome.error.unwrap_or_else(|| "transport rejected message".to_string());
            let _ = messaging.update_message_status(message_id, MessageStatus::Failed).await;
            let _ = outbound_queue
                .enqueue(
                    to,
                    body,
                    Some(campaign_id.to_string().as_str()),
                    None,
                    Priority::Normal,
                    sim_slot,
                    Some(i64::from(message_id)),
                    config.enqueue_dedup_window,
                )
                .await;
            counters.failed.fetch_add(1, Ordering::SeqCst);
            warn!(%error, "dispatch failed; queued for retry");
        }
        Err(_elapsed) => {
            let _ = messaging.update_message_status(message_id, MessageStatus::Failed).await;
            let _ = outbound_queue
                .enqueue(
                    to,
                    body,
                    Some(campaign_id.to_string().as_str()),
                    None,
                    Priority::Normal,
                    sim_slot,
                    Some(i64::from(message_id)),
                    config.enqueue_dedup_window,
                )
                .await;
            counters.failed.fetch_add(1, Ordering::SeqCst);
            warn!("dispatch timed out; queued for retry");
        }
    }
}

fn publish_progress(events: &EventBus, campaign_id: CampaignId, counters: &Counters, total: u64) {
    let snapshot = counters.snapshot();
    events.publish(EngineEvent::CampaignProgress {
        campaign_id,
        sent: snapshot.sent,
        failed: snapshot.failed,
        total,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_utils::{
        InMemoryMessagingRepository, InMemoryOutboundQueueRepository, InMemorySendLogRepository,
    };
    use crate::time_provider::MockTimeProvider;
    use crate::transport::fakes::{FixedDeviceBinding, InMemoryKeystore, ScriptedTransport};
    use std::time::Duration;

    fn always_entitled() -> Arc<EntitlementManager> {
        let manager = EntitlementManager::new(
            Arc::new(InMemoryKeystore::default()),
            Arc::new(FixedDeviceBinding::new("test-device")),
            Arc::new(MockTimeProvider::new()),
            Duration::from_secs(3 * 86_400),
            Duration::from_secs(2 * 86_400),
            [7, 3, 1],
        );
        manager.set_bypass(true);
        Arc::new(manager)
    }

    fn harness(transport: ScriptedTransport) -> (
        Arc<dyn MessagingRepository>,
        Arc<dyn OutboundQueueRepository>,
        Arc<dyn SendLogRepository>,
        Arc<dyn SmsTransport>,
        Arc<EngineConfig>,
    ) {
        let time_provider: Arc<dyn crate::time_provider::TimeProvider> = Arc::new(MockTimeProvider::new());
        (
            Arc::new(InMemoryMessagingRepository::new(time_provider.clone())),
            Arc::new(InMemoryOutboundQueueRepository::new(time_provider.clone())),
            Arc::new(InMemorySendLogRepository::new(time_provider)),
            Arc::new(transport),
            Arc::new(EngineConfig::for_testing()),
        )
    }

    #[tokio::test]
    async fn test_should_send_every_recipient_in_order() {
        let (messaging, outbound, send_log, transport, config) = harness(ScriptedTransport::always_succeeds());
        let recipients = vec![
            Recipient::new("+254700000001").with_name("A"),
            Recipient::new("+254700000002").with_name("B"),
        ];
        let handle = spawn_campaign(
            CampaignId::generate(),
            recipients,
            "Hi {name}".to_string(),
            1,
            messaging,
            outbound,
            send_log,
            transport,
            always_entitled(),
            config,
            EventBus::new(),
        );
        let counters = handle.join().await.unwrap();
        assert_eq!(counters.sent, 2);
        assert_eq!(counters.failed, 0);
    }

    #[tokio::test]
    async fn test_should_queue_failed_sends_for_retry() {
        let (messaging, outbound, send_log, transport, config) =
            harness(ScriptedTransport::always_fails("carrier rejected"));
        let handle = spawn_campaign(
            CampaignId::generate(),
            vec![Recipient::new("+254700000003")],
            "hi".to_string(),
            1,
            messaging,
            outbound.clone(),
            send_log,
            transport,
            always_entitled(),
            config,
            EventBus::new(),
        );
        let counters = handle.join().await.unwrap();
        assert_eq!(counters.failed, 1);
        assert_eq!(outbound.get_stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_should_skip_invalid_address_without_failing_campaign() {
        let (messaging, outbound, send_log, transport, config) = harness(ScriptedTransport::always_succeeds());
        let handle = spawn_campaign(
            CampaignId::generate(),
            vec![Recipient::new(""), Recipient::new("+254700000004")],
            "hi".to_string(),
            1,
            messaging,
            outbound,
            send_log,
            transport,
            always_entitled(),
            config,
            EventBus::new(),
        );
        let counters = handle.join().await.unwrap();
        assert_eq!(counters.invalid, 1);
        assert_eq!(counters.sent, 1);
    }

    #[tokio::test]
    async fn test_should_skip_recent_duplicate_without_counting_as_failed() {
        let (messaging, outbound, send_log, transport, config) = harness(ScriptedTransport::always_succeeds());
        send_log.record("+254700000005", "hi", None).await.unwrap();

        let handle = spawn_campaign(
            CampaignId::generate(),
            vec![Recipient::new("+254700000005")],
            "hi".to_string(),
            1,
            messaging,
            outbound,
            send_log,
            transport,
            always_entitled(),
            config,
            EventBus::new(),
        );
        let counters = handle.join().await.unwrap();
        assert_eq!(counters.skipped, 1);
        assert_eq!(counters.sent, 0);
        assert_eq!(counters.failed, 0);
    }

    #[tokio::test]
    async fn test_should_stop_dispatch_once_cancelled() {
        let (messaging, outbound, send_log, transport, config) = harness(ScriptedTransport::always_succeeds());
        let recipients = (0..50).map(|n| Recipient::new(format!("+25470000{n:04}"))).collect();
        let handle = spawn_campaign(
            CampaignId::generate(),
            recipients,
            "hi".to_string(),
            1,
            messaging,
            outbound,
            send_log,
            transport,
            always_entitled(),
            Arc::new(EngineConfig {
                send_speed_default: Duration::from_millis(50),
                ..EngineConfig::for_testing()
            }),
            EventBus::new(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        let counters = handle.join().await.unwrap();
        assert!(counters.sent < 50, "cancellation should stop dispatch before completing all recipients");
    }

    #[tokio::test]
    async fn test_should_wake_from_pause_on_cancel() {
        let (messaging, outbound, send_log, transport, config) = harness(ScriptedTransport::always_succeeds());
        let handle = spawn_campaign(
            CampaignId::generate(),
            vec![Recipient::new("+254700000006"), Recipient::new("+254700000007")],
            "hi".to_string(),
            1,
            messaging,
            outbound,
            send_log,
            transport,
            always_entitled(),
            config,
            EventBus::new(),
        );
        handle.pause();
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        let counters = handle.join().await.unwrap();
        assert_eq!(counters.sent, 0);
    }

    #[tokio::test]
    async fn test_should_emit_progress_events() {
        let (messaging, outbound, send_log, transport, config) = harness(ScriptedTransport::always_succeeds());
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let handle = spawn_campaign(
            CampaignId::generate(),
            vec![Recipient::new("+254700000008")],
            "hi".to_string(),
            1,
            messaging,
            outbound,
            send_log,
            transport,
            always_entitled(),
            config,
            events,
        );
        let _ = handle.join().await.unwrap();
        let mut saw_progress = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, EngineEvent::CampaignProgress { .. }) {
                saw_progress = true;
            }
        }
        assert!(saw_progress);
    }

    #[tokio::test]
    async fn test_should_deny_dispatch_without_active_entitlement() {
        let (messaging, outbound, send_log, transport, config) = harness(ScriptedTransport::always_succeeds());
        let entitlement = Arc::new(EntitlementManager::new(
            Arc::new(InMemoryKeystore::default()),
            Arc::new(FixedDeviceBinding::new("test-device")),
            Arc::new(MockTimeProvider::new()),
            Duration::from_secs(3 * 86_400),
            Duration::from_secs(2 * 86_400),
            [7, 3, 1],
        ));
        let handle = spawn_campaign(
            CampaignId::generate(),
            vec![Recipient::new("+254700000009")],
            "hi".to_string(),
            1,
            messaging,
            outbound,
            send_log,
            transport,
            entitlement,
            config,
            EventBus::new(),
        );
        let counters = handle.join().await.unwrap();
        assert_eq!(counters.denied, 1);
        assert_eq!(counters.sent, 0);
        assert_eq!(counters.failed, 0);
    }
}
