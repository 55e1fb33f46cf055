//! Crate-wide error taxonomy.
//!
//! Each subsystem defines its own `thiserror` enum so call sites can match on
//! precise failure modes; [`CoreError`] aggregates them for the public API
//! surface so a host application has a single type to propagate.

use thiserror::Error;

/// Errors raised by the storage engine (connection, pragmas, integrity, recovery).
#[derive(Error, Debug)]
pub enum StorageError {
    /// Opening the database did not complete within the configured timeout.
    #[error("database open timed out after {0:?}")]
    InitTimeout(std::time::Duration),

    /// The configured database path was not valid UTF-8 or otherwise
    /// unusable.
    #[error("invalid database path: {0}")]
    InvalidPath(String),

    /// Integrity verification failed even after recovery attempts.
    #[error("database integrity check failed after {attempts} recovery attempts: {reason}")]
    IntegrityFailure {
        /// Number of recovery attempts made before giving up.
        attempts: u32,
        /// Human-readable description of the failure.
        reason: String,
    },

    /// The operation queue backing a repository could not service a call.
    #[error("operation queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Underlying `SQLx` error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// File system error encountered while preparing the database path.
    #[error("file system error: {0}")]
    FileSystem(#[from] std::io::Error),
}

/// Errors raised by the operation queue.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The queue was cleared by an administrative action; pending work was
    /// abandoned.
    #[error("operation queue was cleared")]
    QueueCleared,

    /// A transaction rolled back; carries the primary cause.
    #[error("transaction failed: {0}")]
    TxFailure(#[source] Box<StorageError>),

    /// A queued operation's result could not be converted to/from JSON.
    #[error("queue value serialization failed: {0}")]
    Serialization(String),

    /// Underlying storage error for a non-transactional operation.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors raised while applying schema migrations.
#[derive(Error, Debug)]
pub enum MigrationError {
    /// A migration did not complete within its timeout budget.
    #[error("migration {version} ({name}) timed out after {elapsed:?}")]
    Timeout {
        /// Migration version.
        version: i64,
        /// Migration name.
        name: String,
        /// Elapsed time before the timeout fired.
        elapsed: std::time::Duration,
    },

    /// A migration's statements or `run` function failed.
    #[error("migration {version} ({name}) failed: {reason}")]
    Failed {
        /// Migration version.
        version: i64,
        /// Migration name.
        name: String,
        /// Underlying failure description.
        reason: String,
    },

    /// Underlying storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors surfaced by the send pipeline for a single recipient or campaign.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The transport did not respond within the progressive timeout budget.
    #[error("transport timed out after {0:?}")]
    TransportTimeout(std::time::Duration),

    /// The transport reported a failure.
    #[error("transport failed: {0}")]
    TransportFailed(String),

    /// The send was cancelled cooperatively; no state was corrupted.
    #[error("send cancelled")]
    TransportCancelled,

    /// The host OS denied the SMS/Phone permission required to send.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Underlying storage error while persisting pipeline state.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Underlying queue error.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Errors raised by entitlement activation and verification.
#[derive(Error, Debug)]
pub enum EntitlementError {
    /// A payment amount did not map to any configured plan within
    /// tolerance.
    #[error("no plan matches amount {0}")]
    PlanUnknown(rust_decimal::Decimal),

    /// The transaction code was already used for a prior activation.
    #[error("transaction code already used: {0}")]
    DuplicateTransaction(String),

    /// The license key was already redeemed on this device.
    #[error("license key already used: {0}")]
    DuplicateLicenseKey(String),

    /// The subscription token's signature or device binding did not
    /// verify; the record was discarded.
    #[error("tamper detected: {0}")]
    TamperDetected(String),

    /// The license key failed checksum or format validation.
    #[error("invalid license key: {0}")]
    InvalidLicenseKey(String),

    /// A trial was requested on a device that already used one.
    #[error("trial already used on this device")]
    TrialAlreadyUsed,

    /// Underlying storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Aggregate error type for the public crate API.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Storage subsystem error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Operation queue error.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Migration error.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// Send pipeline error.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Entitlement error.
    #[error(transparent)]
    Entitlement(#[from] EntitlementError),

    /// Configuration was invalid.
    #[error("configuration error: {field} - {reason}")]
    Configuration {
        /// Name of the offending field.
        field: String,
        /// Explanation of the violated constraint.
        reason: String,
    },
}

/// Result alias for storage-level operations.
pub type StorageResult<T> = Result<T, StorageError>;
/// Result alias for queue-level operations.
pub type QueueResult<T> = Result<T, QueueError>;
/// Result alias for migration operations.
pub type MigrationResult<T> = Result<T, MigrationError>;
/// Result alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
/// Result alias for entitlement operations.
pub type EntitlementResult<T> = Result<T, EntitlementError>;
/// Result alias for the aggregate public API.
pub type CoreResult<T> = Result<T, CoreError>;
