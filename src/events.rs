//! Event surface for host applications.
//!
//! The pipeline, retry worker, and circuit breaker never know who (if
//! anyone) is watching — they publish to an [`EventBus`] and move on. A
//! host UI calls [`EventBus::subscribe`] to get its own receiver and sees
//! every event published from that point forward, without polling.
//! Grounded in the reference codebase's lifecycle-event channel
//! (`mpsc::unbounded_channel` feeding a dedicated consumer); generalised
//! here into a small sender registry so more than one subscriber can
//! attach, since a single `mpsc` channel only ever has one consumer.

use crate::domain_types::{CampaignId, MessageId};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

/// A status change or progress tick a host application might want to
/// react to.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// An SMS arrived on the device's radio.
    IncomingSms {
        /// Sender's address, platform-formatted.
        phone: String,
        /// Message body as delivered.
        body: String,
        /// Epoch millis the platform recorded receipt.
        timestamp: i64,
    },
    /// An outbound message was handed to the transport and accepted.
    SmsSent {
        /// The message row this outcome belongs to.
        message_id: MessageId,
        /// Campaign the message was sent as part of, if any.
        campaign_id: Option<CampaignId>,
    },
    /// An outbound message reached a terminal delivered state.
    SmsDelivered {
        /// The message row this outcome belongs to.
        message_id: MessageId,
    },
    /// A running campaign advanced its send/fail counters.
    CampaignProgress {
        /// The campaign reporting progress.
        campaign_id: CampaignId,
        /// Messages sent so far.
        sent: u64,
        /// Messages failed so far.
        failed: u64,
        /// Total recipients targeted.
        total: u64,
    },
    /// The retry worker's circuit breaker changed state.
    CircuitBreakerStateChanged {
        /// True if the breaker is now refusing dispatch.
        is_open: bool,
    },
}

/// Fan-out publisher for [`EngineEvent`]s.
///
/// Cloning an `EventBus` shares the same subscriber registry; every
/// clone's `publish` reaches every live subscriber.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: std::sync::Arc<Mutex<Vec<mpsc::UnboundedSender<EngineEvent>>>>,
}

impl EventBus {
    /// Builds an `EventBus` with no subscribers yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber, returning a receiver that sees every
    /// event published from this point forward.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().expect("lock poisoned").push(tx);
        rx
    }

    /// Publishes an event to every live subscriber, dropping any whose
    /// receiver has gone away.
    pub fn publish(&self, event: EngineEvent) {
        let mut subscribers = self.subscribers.lock().expect("lock poisoned");
        if subscribers.is_empty() {
            trace!(?event, "no subscribers for event");
            return;
        }
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of currently-registered subscribers. Exposed for tests and
    /// diagnostics, not for gating publish decisions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_deliver_published_event_to_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::CircuitBreakerStateChanged { is_open: true });
        let event = rx.try_recv().expect("event should be delivered");
        assert_eq!(event, EngineEvent::CircuitBreakerStateChanged { is_open: true });
    }

    #[test]
    fn test_should_fan_out_to_every_subscriber() {
        let bus = EventBus::new();
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();
        bus.publish(EngineEvent::IncomingSms {
            phone: "+15551234567".to_string(),
            body: "hello".to_string(),
            timestamp: 0,
        });
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_should_not_panic_when_publishing_with_no_subscribers() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::CircuitBreakerStateChanged { is_open: false });
    }

    #[test]
    fn test_should_drop_subscriber_whose_receiver_was_dropped() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        bus.publish(EngineEvent::CircuitBreakerStateChanged { is_open: true });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_should_deliver_campaign_progress_across_await_points() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let campaign_id = CampaignId::generate();
        bus.publish(EngineEvent::CampaignProgress {
            campaign_id,
            sent: 3,
            failed: 1,
            total: 10,
        });
        let event = rx.recv().await.expect("channel should still be open");
        match event {
            EngineEvent::CampaignProgress { sent, failed, total, .. } => {
                assert_eq!((sent, failed, total), (3, 1, 10));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
