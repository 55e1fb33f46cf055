//! Failure-ratio circuit breaker guarding the retry worker's dispatch loop.
//!
//! Three states: closed (dispatching normally), open (refusing dispatch
//! until a cooldown elapses), half-open (a single probe attempt decides
//! whether to close or re-open). The rolling window of recent outcomes is
//! a fixed-capacity ring behind a mutex; `record_outcome` is the only
//! mutating call on the hot path, so contention stays low even though the
//! retry worker and any campaign reporting failures both call in.

use crate::time_provider::TimeProvider;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Current breaker state, as reported to an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Dispatch proceeds normally.
    Closed,
    /// Dispatch is refused until the cooldown elapses.
    Open,
    /// Cooldown elapsed; the next single attempt decides close or re-open.
    HalfOpen,
}

struct Inner {
    window: VecDeque<bool>,
    window_capacity: usize,
    min_samples: usize,
    threshold: f64,
    cooldown: Duration,
    open_until_millis: Option<i64>,
    half_open_probe_in_flight: bool,
}

impl Inner {
    fn failure_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|success| !**success).count();
        #[allow(clippy::cast_precision_loss)]
        let ratio = failures as f64 / self.window.len() as f64;
        ratio
    }
}

/// Tracks dispatch outcomes and gates whether the retry worker may attempt
/// another send.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    time_provider: Arc<dyn TimeProvider>,
    is_open: AtomicBool,
}

impl CircuitBreaker {
    /// Builds a breaker evaluating the last `window` attempts, opening once
    /// `threshold` of them fail (once at least `min_samples` exist), for
    /// `cooldown` before half-opening.
    #[must_use]
    pub fn new(window: usize, min_samples: usize, threshold: f64, cooldown: Duration, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                window: VecDeque::with_capacity(window),
                window_capacity: window.max(1),
                min_samples,
                threshold,
                cooldown,
                open_until_millis: None,
                half_open_probe_in_flight: false,
            }),
            time_provider,
            is_open: AtomicBool::new(false),
        }
    }

    /// Current state, reconciling an elapsed cooldown into half-open.
    pub fn state(&self) -> BreakerState {
        let inner = self.inner.lock().expect("lock poisoned");
        self.state_locked(&inner)
    }

    fn state_locked(&self, inner: &Inner) -> BreakerState {
        match inner.open_until_millis {
            None => BreakerState::Closed,
            Some(open_until) => {
                if self.time_provider.unix_millis() >= open_until {
                    BreakerState::HalfOpen
                } else {
                    BreakerState::Open
                }
            }
        }
    }

    /// Milliseconds remaining in the open cooldown, if currently open.
    pub fn cooldown_remaining_millis(&self) -> Option<i64> {
        let inner = self.inner.lock().expect("lock poisoned");
        match self.state_locked(&inner) {
            BreakerState::Open => inner.open_until_millis.map(|until| (until - self.time_provider.unix_millis()).max(0)),
            BreakerState::Closed | BreakerState::HalfOpen => None,
        }
    }

    /// True when the breaker currently refuses dispatch.
    pub fn is_active(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    /// Whether the caller may attempt a dispatch right now. In the
    /// half-open state this grants exactly one caller permission to probe
    /// (subsequent callers are refused until that probe resolves).
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().expect("lock poisoned");
        match self.state_locked(&inner) {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if inner.half_open_probe_in_flight {
                    false
                } else {
                    inner.half_open_probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Records the outcome of a dispatch attempt, evaluating whether the
    /// breaker should open (from closed) or close/re-open (from half-open).
    pub fn record_outcome(&self, success: bool) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let was_half_open = inner.half_open_probe_in_flight;
        inner.half_open_probe_in_flight = false;

        if was_half_open {
            if success {
                inner.open_until_millis = None;
                inner.window.clear();
                self.is_open.store(false, Ordering::SeqCst);
                info!("circuit breaker closed after successful probe");
            } else {
                let cooldown_millis = i64::try_from(inner.cooldown.as_millis()).unwrap_or(i64::MAX);
                inner.open_until_millis = Some(self.time_provider.unix_millis() + cooldown_millis);
                self.is_open.store(true, Ordering::SeqCst);
                warn!("circuit breaker re-opened after failed probe");
            }
            return;
        }

        if inner.window.len() == inner.window_capacity {
            inner.window.pop_front();
        }
        inner.window.push_back(success);

        if inner.window.len() >= inner.min_samples && inner.failure_ratio() >= inner.threshold {
            let cooldown_millis = i64::try_from(inner.cooldown.as_millis()).unwrap_or(i64::MAX);
            inner.open_until_millis = Some(self.time_provider.unix_millis() + cooldown_millis);
            self.is_open.store(true, Ordering::SeqCst);
            warn!(failure_ratio = inner.failure_ratio(), "circuit breaker opened");
        }
    }
}
