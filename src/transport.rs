//! Platform collaborator traits.
//!
//! The engine never talks to the OS, a radio, or a payment rail directly —
//! every external dependency is expressed as a trait here so the send
//! pipeline, retry worker, and entitlement manager can be driven by fakes in
//! tests and by real platform bindings in a host application.

use async_trait::async_trait;
use std::collections::HashMap;

/// Outcome of a single transport send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    /// True if the transport accepted the message for delivery.
    pub success: bool,
    /// Human-readable failure reason, when `success` is false.
    pub error: Option<String>,
    /// Transport-specific error code, when available.
    pub error_code: Option<String>,
}

impl SendOutcome {
    /// Builds a successful outcome.
    #[must_use]
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
            error_code: None,
        }
    }

    /// Builds a failed outcome.
    #[must_use]
    pub fn failure(error: impl Into<String>, error_code: Option<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            error_code,
        }
    }
}

/// A single inbound SMS observed by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingSms {
    /// Sender's address, platform-formatted.
    pub phone: String,
    /// Message body as delivered.
    pub body: String,
    /// Epoch millis the platform recorded receipt.
    pub timestamp: i64,
}

/// The device's SMS radio, one per active SIM slot.
#[async_trait]
pub trait SmsTransport: Send + Sync {
    /// Sends a single message on the given SIM slot.
    async fn send(&self, to: &str, body: &str, sim_slot: u8) -> SendOutcome;

    /// True if the platform currently reports the radio as usable (airplane
    /// mode off, SIM present, permission granted).
    async fn can_send(&self) -> bool;

    /// Drains any incoming messages observed since the last call.
    async fn poll_incoming(&self) -> Vec<IncomingSms>;
}

/// A contact known to the platform address book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    /// Contact's phone number, platform-formatted.
    pub phone: String,
    /// Display name, if set.
    pub name: Option<String>,
}

/// Read-only access to the platform contacts store.
#[async_trait]
pub trait ContactsProvider: Send + Sync {
    /// Lists every contact visible to the app.
    async fn get_all(&self) -> Vec<Contact>;

    /// Looks up a display name by phone number.
    async fn get_name(&self, phone: &str) -> Option<String>;
}

/// A single row parsed from an uploaded recipient spreadsheet, keyed by
/// column header.
pub type ParsedRow = HashMap<String, String>;

/// Parses CSV/XLSX recipient documents into header-keyed rows.
#[async_trait]
pub trait DocumentParser: Send + Sync {
    /// Parses `path` (a file with display name `file_name`) into rows.
    ///
    /// # Errors
    ///
    /// Returns an error description if the file cannot be read or its
    /// format is unrecognised.
    async fn parse(&self, path: &str, file_name: &str) -> Result<Vec<ParsedRow>, String>;
}

/// The platform's secure key-value store, used to hold the entitlement
/// signing key outside the SQLite file.
#[async_trait]
pub trait Keystore: Send + Sync {
    /// Reads a previously stored value for `service`, if any.
    async fn get(&self, service: &str) -> Option<Vec<u8>>;

    /// Stores (overwriting) a value for `service`.
    async fn set(&self, service: &str, value: Vec<u8>);
}

/// The device's trial-eligibility and hardware-fingerprint binding.
#[async_trait]
pub trait DeviceBinding: Send + Sync {
    /// A stable identifier derived from hardware/installation state.
    async fn get_fingerprint(&self) -> String;

    /// Whether a trial has already been consumed, and when it started.
    async fn get_trial_status(&self) -> TrialStatus;

    /// True if this device is still eligible to start a trial.
    async fn can_start_trial(&self) -> bool;

    /// Records that a trial has started now.
    async fn start_trial(&self);

    /// Verifies a subscription's bound fingerprint still matches this
    /// device.
    async fn verify_subscription_binding(&self, fingerprint: &str) -> bool;
}

/// Trial consumption state held by the device binding service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct TrialStatus {
    /// True once a trial has been started on this device.
    pub used: bool,
    /// Epoch millis the trial started, if `used`.
    pub start_time: Option<i64>,
}

/// A keystore that persists values as a JSON map alongside the database
/// file. Not a substitute for a platform secure-storage API, but keeps the
/// signing key and entitlement state durable across CLI invocations without
/// pulling in a native dependency this engine has no other use for.
pub struct FileKeystore {
    path: std::path::PathBuf,
    values: tokio::sync::Mutex<HashMap<String, Vec<u8>>>,
}

impl FileKeystore {
    /// Opens (or creates) the JSON store at `path`.
    #[must_use]
    pub fn open(path: std::path::PathBuf) -> Self {
        let values = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self { path, values: tokio::sync::Mutex::new(values) }
    }

    fn flush(&self, values: &HashMap<String, Vec<u8>>) {
        if let Ok(bytes) = serde_json::to_vec(values) {
            let _ = std::fs::write(&self.path, bytes);
        }
    }
}

#[async_trait]
impl Keystore for FileKeystore {
    async fn get(&self, service: &str) -> Option<Vec<u8>> {
        self.values.lock().await.get(service).cloned()
    }

    async fn set(&self, service: &str, value: Vec<u8>) {
        let mut values = self.values.lock().await;
        values.insert(service.to_string(), value);
        self.flush(&values);
    }
}

/// A device binding whose fingerprint is a UUID persisted alongside the
/// database file on first run, and whose trial state lives in the same
/// `FileKeystore` used for entitlement signing.
pub struct FileDeviceBinding {
    fingerprint: String,
    keystore: std::sync::Arc<FileKeystore>,
}

const TRIAL_STATUS_KEY: &str = "device_binding_trial_status";

impl FileDeviceBinding {
    /// Loads (or generates and persists) this device's fingerprint from
    /// `fingerprint_path`, sharing `keystore` for trial state.
    #[must_use]
    pub fn open(fingerprint_path: std::path::PathBuf, keystore: std::sync::Arc<FileKeystore>) -> Self {
        let fingerprint = std::fs::read_to_string(&fingerprint_path).ok().filter(|s| !s.trim().is_empty());
        let fingerprint = fingerprint.unwrap_or_else(|| {
            let generated = uuid::Uuid::new_v4().to_string();
            let _ = std::fs::write(&fingerprint_path, &generated);
            generated
        });
        Self { fingerprint, keystore }
    }
}

#[async_trait]
impl DeviceBinding for FileDeviceBinding {
    async fn get_fingerprint(&self) -> String {
        self.fingerprint.clone()
    }

    async fn get_trial_status(&self) -> TrialStatus {
        match self.keystore.get(TRIAL_STATUS_KEY).await {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            None => TrialStatus::default(),
        }
    }

    async fn can_start_trial(&self) -> bool {
        !self.get_trial_status().await.used
    }

    async fn start_trial(&self) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        let status = TrialStatus { used: true, start_time: Some(now) };
        if let Ok(bytes) = serde_json::to_vec(&status) {
            self.keystore.set(TRIAL_STATUS_KEY, bytes).await;
        }
    }

    async fn verify_subscription_binding(&self, fingerprint: &str) -> bool {
        fingerprint == self.fingerprint
    }
}
