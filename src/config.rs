//! Engine-wide configuration knobs.
//!
//! Mirrors the enumerated configuration surface of the bulk SMS engine:
//! every numeric constant a host application might reasonably want to tune
//! lives here, with the spec's defaults baked in, validated on
//! construction the way the reference codebase validates its router
//! configuration.

use std::time::Duration;
use thiserror::Error;

/// Errors raised validating an [`EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed its validation constraint.
    #[error("invalid configuration: {field} - {reason}")]
    Validation {
        /// Offending field name.
        field: String,
        /// Explanation of the violated constraint.
        reason: String,
    },
}

/// Complete engine configuration.
///
/// Field names follow spec §6's enumerated knobs so the mapping from
/// specification to code is direct.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Maximum stored message body length before truncation.
    pub max_body_length: usize,
    /// Length of a single SMS part for multi-part accounting.
    pub sms_part_length: usize,
    /// `SendLog` duplicate-suppression window.
    pub duplicate_window: Duration,
    /// Outbound queue enqueue dedup window.
    pub enqueue_dedup_window: Duration,
    /// Maximum retry attempts before an outbound entry is exhausted.
    pub max_retries: u32,
    /// Default inter-message pacing delay.
    pub send_speed_default: Duration,
    /// Base transport timeout for the first send attempt.
    pub transport_timeout: Duration,
    /// Database open timeout.
    pub db_open_timeout: Duration,
    /// Per-migration timeout.
    pub migration_timeout: Duration,
    /// Grace period after subscription expiry during which access is kept.
    pub grace_period: Duration,
    /// Trial duration for first-time device trials.
    pub trial_duration: Duration,
    /// Days-remaining values that trigger a renewal reminder flag.
    pub renewal_reminder_days: [u32; 3],
    /// Row batch size for bulk inserts.
    pub bulk_batch_size: usize,
    /// Maximum concurrent reads the operation queue will fan out.
    pub max_concurrent_reads: usize,
    /// Cooperative yield interval for the operation queue worker.
    pub queue_tick: Duration,
    /// Flush pipeline counters after this many processed messages.
    pub flush_every_n_messages: usize,
    /// Flush pipeline counters after this much wall time.
    pub flush_every_ms: Duration,
    /// Flush interval used once a campaign exceeds 1000 recipients.
    pub flush_every_ms_large_batch: Duration,
    /// Recipient count above which the larger flush interval applies.
    pub large_batch_threshold: usize,
    /// Database size, in megabytes, above which a warning is logged.
    pub size_warn_mb: u64,
    /// Idle drain cadence of the retry worker.
    pub retry_drain_interval: Duration,
    /// Maximum pending entries pulled per retry-worker drain cycle.
    pub retry_batch_size: i64,
    /// Rolling window size (attempts) the circuit breaker evaluates.
    pub circuit_breaker_window: usize,
    /// Minimum attempts in the window before the breaker can open.
    pub circuit_breaker_min_samples: usize,
    /// Failure ratio (0.0-1.0) at or above which the breaker opens.
    pub circuit_breaker_threshold: f64,
    /// How long the breaker stays open before half-opening.
    pub circuit_breaker_cooldown: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_body_length: 1600,
            sms_part_length: 160,
            duplicate_window: Duration::from_millis(300_000),
            enqueue_dedup_window: Duration::from_millis(60_000),
            max_retries: 3,
            send_speed_default: Duration::from_millis(400),
            transport_timeout: Duration::from_millis(10_000),
            db_open_timeout: Duration::from_millis(5_000),
            migration_timeout: Duration::from_millis(60_000),
            grace_period: Duration::from_secs(3 * 86_400),
            trial_duration: Duration::from_secs(2 * 86_400),
            renewal_reminder_days: [7, 3, 1],
            bulk_batch_size: 100,
            max_concurrent_reads: 3,
            queue_tick: Duration::from_millis(10),
            flush_every_n_messages: 20,
            flush_every_ms: Duration::from_millis(500),
            flush_every_ms_large_batch: Duration::from_millis(1000),
            large_batch_threshold: 1000,
            size_warn_mb: 100,
            retry_drain_interval: Duration::from_secs(30),
            retry_batch_size: 20,
            circuit_breaker_window: 20,
            circuit_breaker_min_samples: 5,
            circuit_breaker_threshold: 0.5,
            circuit_breaker_cooldown: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Validates internal consistency of the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any field is zero where a
    /// positive value is required, or `max_retries` is unreasonably large.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_body_length == 0 {
            return Err(ConfigError::Validation {
                field: "max_body_length".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.bulk_batch_size == 0 {
            return Err(ConfigError::Validation {
                field: "bulk_batch_size".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.max_concurrent_reads == 0 {
            return Err(ConfigError::Validation {
                field: "max_concurrent_reads".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.max_retries > 100 {
            return Err(ConfigError::Validation {
                field: "max_retries".to_string(),
                reason: "unreasonably large retry budget".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.circuit_breaker_threshold) {
            return Err(ConfigError::Validation {
                field: "circuit_breaker_threshold".to_string(),
                reason: "must be between 0.0 and 1.0".to_string(),
            });
        }
        if self.circuit_breaker_window == 0 {
            return Err(ConfigError::Validation {
                field: "circuit_breaker_window".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Progressive transport timeout for a given retry attempt (0-indexed,
    /// where 0 is the first attempt).
    ///
    /// Matches spec §4.6: base 10s, then 15/20/25s on retries.
    #[must_use]
    pub fn transport_timeout_for_attempt(&self, attempt: u32) -> Duration {
        match attempt {
            0 => self.transport_timeout,
            n => self.transport_timeout + Duration::from_millis(5_000) * n,
        }
    }

    /// Counter flush interval appropriate for a campaign of the given size.
    #[must_use]
    pub fn flush_interval_for_batch(&self, recipient_count: usize) -> Duration {
        if recipient_count > self.large_batch_threshold {
            self.flush_every_ms_large_batch
        } else {
            self.flush_every_ms
        }
    }

    /// A configuration tuned for fast, deterministic tests: short timeouts,
    /// no cooperative yields worth waiting on.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            duplicate_window: Duration::from_millis(50),
            enqueue_dedup_window: Duration::from_millis(20),
            send_speed_default: Duration::from_millis(1),
            transport_timeout: Duration::from_millis(50),
            db_open_timeout: Duration::from_millis(2_000),
            migration_timeout: Duration::from_millis(2_000),
            queue_tick: Duration::from_millis(1),
            flush_every_ms: Duration::from_millis(5),
            flush_every_ms_large_batch: Duration::from_millis(5),
            retry_drain_interval: Duration::from_millis(20),
            circuit_breaker_cooldown: Duration::from_millis(50),
            ..Self::default()
        }
    }
}
