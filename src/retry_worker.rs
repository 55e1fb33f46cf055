//! Retry worker: drains the outbound queue independently of any running
//! campaign.
//!
//! Runs as a background task behind a `tokio::select!` loop, the same
//! shape as the reference codebase's batch-processor task: wake on a
//! fixed interval, or immediately when the send pipeline signals a
//! failure via `notify_failure`, whichever comes first. Every dispatch
//! attempt passes through a [`CircuitBreaker`] so a failing transport
//! doesn't get hammered while it recovers.

use crate::circuit_breaker::CircuitBreaker;
use crate::config::EngineConfig;
use crate::domain_types::{MessageId, MessageStatus};
use crate::events::{EngineEvent, EventBus};
use crate::storage::{MessagingRepository, OutboundQueueRepository};
use crate::transport::SmsTransport;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Handle to a running retry worker.
pub struct RetryWorkerHandle {
    notify: Arc<Notify>,
    cancellation: CancellationToken,
    join: tokio::task::JoinHandle<()>,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl RetryWorkerHandle {
    /// Wakes the worker immediately instead of waiting for the next
    /// scheduled drain cycle. Called by the send pipeline when a dispatch
    /// fails.
    pub fn notify_failure(&self) {
        self.notify.notify_one();
    }

    /// Stops the worker after its current drain cycle (if any) completes.
    pub fn stop(&self) {
        self.cancellation.cancel();
    }

    /// The circuit breaker this worker dispatches through, for
    /// diagnostics (`cooldown_remaining_millis`, `state`).
    #[must_use]
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
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

/// Spawns a retry worker draining `outbound_queue` through `transport`.
#[must_use]
pub fn spawn_retry_worker(
    outbound_queue: Arc<dyn OutboundQueueRepository>,
    messaging: Arc<dyn MessagingRepository>,
    transport: Arc<dyn SmsTransport>,
    config: Arc<EngineConfig>,
    circuit_breaker: Arc<CircuitBreaker>,
    events: EventBus,
) -> RetryWorkerHandle {
    let notify = Arc::new(Notify::new());
    let cancellation = CancellationToken::new();

    let task_notify = notify.clone();
    let task_cancellation = cancellation.clone();
    let task_breaker = circuit_breaker.clone();

    let join = tokio::spawn(async move {
        run_worker(
            outbound_queue,
            messaging,
            transport,
            config,
            task_breaker,
            events,
            task_notify,
            task_cancellation,
        )
        .await;
    });

    RetryWorkerHandle {
        notify,
        cancellation,
        join,
        circuit_breaker,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    outbound_queue: Arc<dyn OutboundQueueRepository>,
    messaging: Arc<dyn MessagingRepository>,
    transport: Arc<dyn SmsTransport>,
    config: Arc<EngineConfig>,
    circuit_breaker: Arc<CircuitBreaker>,
    events: EventBus,
    notify: Arc<Notify>,
    cancellation: CancellationToken,
) {
    let mut was_open = circuit_breaker.is_active();
    loop {
        tokio::select! {
            () = cancellation.cancelled() => break,
            () = tokio::time::sleep(config.retry_drain_interval) => {}
            () = notify.notified() => {}
        }
        if cancellation.is_cancelled() {
            break;
        }

        drain_once(&outbound_queue, &messaging, &transport, &config, &circuit_breaker).await;

        let is_open = circuit_breaker.is_active();
        if is_open != was_open {
            events.publish(EngineEvent::CircuitBreakerStateChanged { is_open });
            was_open = is_open;
        }
    }
    info!("retry worker stopped");
}

#[instrument(skip_all)]
async fn drain_once(
    outbound_queue: &Arc<dyn OutboundQueueRepository>,
    messaging: &Arc<dyn MessagingRepository>,
    transport: &Arc<dyn SmsTransport>,
    config: &Arc<EngineConfig>,
    circuit_breaker: &Arc<CircuitBreaker>,
) {
    if !circuit_breaker.try_acquire() {
        if let Some(remaining) = circuit_breaker.cooldown_remaining_millis() {
            info!(cooldown_remaining_ms = remaining, "circuit breaker open; skipping drain cycle");
        }
        return;
    }
    // try_acquire already granted permission for the first attempt below
    // (either the closed state's free pass, or the half-open state's
    // single probe); record its outcome immediately so a half-open
    // probe's result is known before any further entry is attempted.

    let pending = match outbound_queue.get_pending(config.retry_batch_size).await {
        Ok(pending) => pending,
        Err(error) => {
            warn!(%error, "failed to fetch pending outbound entries");
            circuit_breaker.record_outcome(false);
            return;
        }
    };

    if pending.is_empty() {
        circuit_breaker.record_outcome(true);
        return;
    }

    let mut entries = pending.into_iter();
    let Some(first) = entries.next() else {
        circuit_breaker.record_outcome(true);
        return;
    };
    let first_succeeded = dispatch_entry(&first, outbound_queue, messaging, transport, config).await;
    circuit_breaker.record_outcome(first_succeeded);

    if circuit_breaker.state() != crate::circuit_breaker::BreakerState::Closed {
        return;
    }

    for entry in entries {
        if !circuit_breaker.try_acquire() {
            break;
        }
        let succeeded = dispatch_entry(&entry, outbound_queue, messaging, transport, config).await;
        circuit_breaker.record_outcome(succeeded);
        if circuit_breaker.state() != crate::circuit_breaker::BreakerState::Closed {
            break;
        }
    }
}

/// Dispatches a single outbound entry, writing back its outcome and
/// reconciling the originating message's status if it carries one. Returns
/// true on success.
async fn dispatch_entry(
    entry: &crate::storage::OutboundEntry,
    outbound_queue: &Arc<dyn OutboundQueueRepository>,
    messaging: &Arc<dyn MessagingRepository>,
    transport: &Arc<dyn SmsTransport>,
    config: &Arc<EngineConfig>,
) -> bool {
    let timeout = config.transport_timeout_for_attempt(entry.retry_count);

    let outcome = tokio::time::timeout(timeout, transport.send(&entry.recipient, &entry.body, entry.sim_slot)).await;

    match outcome {
        Ok(outcome) if outcome.success => {
            let _ = outbound_queue.mark_sent(entry.id).await;
            reconcile_message_status(entry, messaging, MessageStatus::Sent).await;
            true
        }
        Ok(outcome) => {
            let error = outcome.error.unwrap_or_else(|| "transport rejected message".to_string());
            let exhausted = entry.retry_count + 1 >= config.max_retries;
            let _ = outbound_queue.mark_failed(entry.id, &error, config.max_retries).await;
            if exhausted {
                reconcile_message_status(entry, messaging, MessageStatus::Failed).await;
            }
            false
        }
        Err(_elapsed) => {
            let exhausted = entry.retry_count + 1 >= config.max_retries;
            let _ = outbound_queue.mark_failed(entry.id, "transport timed out", config.max_retries).await;
            if exhausted {
                reconcile_message_status(entry, messaging, MessageStatus::Failed).await;
            }
            false
        }
    }
}

async fn reconcile_message_status(
    entry: &crate::storage::OutboundEntry,
    messaging: &Arc<dyn MessagingRepository>,
    status: MessageStatus,
) {
    let Some(db_message_id) = entry.db_message_id else { return };
    if let Err(error) = messaging.update_message_status(MessageId::from(db_message_id), status).await {
        warn!(%error, "failed to reconcile message status after retry dispatch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_utils::{InMemoryMessagingRepository, InMemoryOutboundQueueRepository};
    use crate::time_provider::MockTimeProvider;
    use crate::transport::fakes::ScriptedTransport;
    use std::time::Duration;

    fn messaging() -> Arc<dyn MessagingRepository> {
        let time_provider: Arc<dyn crate::time_provider::TimeProvider> = Arc::new(MockTimeProvider::new());
        Arc::new(InMemoryMessagingRepository::new(time_provider))
    }

    fn breaker(config: &EngineConfig) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            config.circuit_breaker_window,
            config.circuit_breaker_min_samples,
            config.circuit_breaker_threshold,
            config.circuit_breaker_cooldown,
            Arc::new(MockTimeProvider::new()),
        ))
    }

    #[tokio::test]
    async fn test_should_drain_pending_entries_on_notify() {
        let time_provider: Arc<dyn crate::time_provider::TimeProvider> = Arc::new(MockTimeProvider::new());
        let outbound = Arc::new(InMemoryOutboundQueueRepository::new(time_provider));
        outbound
            .enqueue("+254700000001", "hi", None, None, crate::domain_types::Priority::Normal, 1, None, Duration::ZERO)
            .await
            .unwrap();
        let transport: Arc<dyn SmsTransport> = Arc::new(ScriptedTransport::always_succeeds());
        let config = Arc::new(EngineConfig {
            retry_drain_interval: Duration::from_secs(3600),
            ..EngineConfig::for_testing()
        });
        let cb = breaker(&config);

        let handle = spawn_retry_worker(outbound.clone(), messaging(), transport, config, cb, EventBus::new());
        handle.notify_failure();
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.stop();
        handle.join().await.unwrap();

        assert_eq!(outbound.get_stats().await.unwrap().sent, 1);
    }

    #[tokio::test]
    async fn test_should_mark_exhausted_after_max_retries_across_cycles() {
        let time_provider: Arc<dyn crate::time_provider::TimeProvider> = Arc::new(MockTimeProvider::new());
        let outbound = Arc::new(InMemoryOutboundQueueRepository::new(time_provider));
        let id = outbound
            .enqueue("+254700000002", "hi", None, None, crate::domain_types::Priority::Normal, 1, None, Duration::ZERO)
            .await
            .unwrap();
        let transport: Arc<dyn SmsTransport> = Arc::new(ScriptedTransport::always_fails("down"));
        let config = Arc::new(EngineConfig {
            retry_drain_interval: Duration::from_millis(10),
            max_retries: 2,
            circuit_breaker_min_samples: 100,
            ..EngineConfig::for_testing()
        });
        let cb = breaker(&config);

        let handle = spawn_retry_worker(outbound.clone(), messaging(), transport, config, cb, EventBus::new());
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.stop();
        handle.join().await.unwrap();

        let entry = outbound.get_pending(10).await.unwrap();
        assert!(entry.is_empty() || entry.iter().all(|e| e.id != id));
        assert_eq!(outbound.get_stats().await.unwrap().exhausted, 1);
    }

    #[tokio::test]
    async fn test_should_skip_drain_while_circuit_breaker_open() {
        let time_provider: Arc<dyn crate::time_provider::TimeProvider> = Arc::new(MockTimeProvider::new());
        let outbound = Arc::new(InMemoryOutboundQueueRepository::new(time_provider));
        outbound
            .enqueue("+254700000003", "hi", None, None, crate::domain_types::Priority::Normal, 1, None, Duration::ZERO)
            .await
            .unwrap();
        let transport: Arc<dyn SmsTransport> = Arc::new(ScriptedTransport::always_succeeds());
        let config = Arc::new(EngineConfig::for_testing());
        let cb = breaker(&config);
        cb.record_outcome(false);
        cb.record_outcome(false);
        cb.record_outcome(false);
        cb.record_outcome(false);
        cb.record_outcome(false);
        assert_eq!(cb.state(), crate::circuit_breaker::BreakerState::Open);

        drain_once(&outbound, &messaging(), &transport, &config, &cb).await;

        assert_eq!(outbound.get_stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_should_publish_state_change_event_on_open() {
        let time_provider: Arc<dyn crate::time_provider::TimeProvider> = Arc::new(MockTimeProvider::new());
        let outbound = Arc::new(InMemoryOutboundQueueRepository::new(time_provider));
        for n in 0..5 {
            outbound
                .enqueue(&format!("+25470000{n:04}"), "hi", None, None, crate::domain_types::Priority::Normal, 1, None, Duration::ZERO)
                .await
                .unwrap();
        }
        let transport: Arc<dyn SmsTransport> = Arc::new(ScriptedTransport::always_fails("down"));
        let config = Arc::new(EngineConfig {
            retry_drain_interval: Duration::from_millis(10),
            circuit_breaker_min_samples: 1,
            circuit_breaker_threshold: 0.1,
            max_retries: 10,
            ..EngineConfig::for_testing()
        });
        let cb = breaker(&config);
        let events = EventBus::new();
        let mut rx = events.subscribe();

        let handle = spawn_retry_worker(outbound, messaging(), transport, config, cb, events);
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.stop();
        handle.join().await.unwrap();

        let mut saw_open_event = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::CircuitBreakerStateChanged { is_open } = event {
                if is_open {
                    saw_open_event = true;
                }
            }
        }
        assert!(saw_open_event);
    }
}
