//! Clock abstraction used everywhere the engine needs "now": migrations,
//! the entitlement manager's expiry math, dedup windows, and the circuit
//! breaker's rolling window. Tests inject [`MockTimeProvider`] so rate
//! limits, retry backoff, and subscription expiry can be exercised without
//! sleeping for real.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::time::sleep as tokio_sleep;

/// A source of time, injected rather than read from `SystemTime`/`Instant`
/// directly so tests can run entitlement and retry timing instantly.
#[async_trait]
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Sleeps for `duration`, or returns immediately in a test provider
    /// configured to skip delays.
    async fn sleep(&self, duration: Duration);

    /// The current wall-clock time.
    #[must_use]
    fn now(&self) -> SystemTime;

    /// A monotonic instant, for measuring elapsed durations (migration
    /// timeouts, circuit breaker cooldowns).
    #[must_use]
    fn instant(&self) -> Instant;

    /// True for a test provider configured to collapse sleeps.
    #[must_use]
    fn should_skip_delays(&self) -> bool {
        false
    }

    /// Current time in milliseconds since the Unix epoch, the timestamp
    /// representation used throughout the persisted schema (message
    /// timestamps, subscription expiry, audit log entries).
    #[must_use]
    fn unix_millis(&self) -> i64 {
        self.now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

/// Wall-clock time provider used outside tests.
#[derive(Debug, Clone, Default)]
pub struct RealTimeProvider;

impl RealTimeProvider {
    /// Builds a real time provider.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TimeProvider for RealTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio_sleep(duration).await;
    }

    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// Time provider for tests: collapses every sleep to at most 1ms by
/// default so retry backoff and drain intervals don't slow the suite down,
/// while `with_real_delays` opts a specific test back into real timing.
#[derive(Debug, Clone, Default)]
pub struct MockTimeProvider {
    skip_delays: bool,
}

impl MockTimeProvider {
    /// Builds a provider that collapses sleeps.
    #[must_use]
    pub fn new() -> Self {
        Self { skip_delays: true }
    }

    /// Builds a provider that sleeps for real, for tests asserting on
    /// actual elapsed time (e.g. circuit breaker cooldown, migration
    /// timeout).
    #[must_use]
    pub fn with_real_delays() -> Self {
        Self { skip_delays: false }
    }
}

#[async_trait]
impl TimeProvider for MockTimeProvider {
    async fn sleep(&self, duration: Duration) {
        if !self.skip_delays {
            tokio_sleep(duration).await;
        } else if duration > Duration::from_millis(1) {
            // still yield briefly so dependent tasks get scheduled
            tokio_sleep(Duration::from_millis(1)).await;
        }
    }

    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }

    fn should_skip_delays(&self) -> bool {
        self.skip_delays
    }
}

/// Builds the production time provider used by the CLI and any host
/// embedding the engine.
#[must_use]
pub fn production_time_provider() -> Arc<dyn TimeProvider> {
    Arc::new(RealTimeProvider::new())
}
