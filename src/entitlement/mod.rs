//! The access gate: subscription persistence, activation, and status
//! derivation.
//!
//! Entitlement state lives outside the SQLite file, in the platform
//! keystore, signed the way [`signing`] describes. Local state is always
//! authoritative — a best-effort server sync may run in the background, but
//! its failure never blocks activation or revokes access.

mod signing;

use crate::error::{EntitlementError, EntitlementResult};
use crate::storage::AuditLogRepository;
use crate::time_provider::TimeProvider;
use crate::transport::{DeviceBinding, Keystore};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

const SUBSCRIPTION_TOKEN_KEY: &str = "entitlement_subscription_token";
const USED_TRANSACTION_CODES_KEY: &str = "entitlement_used_transaction_codes";
const USED_LICENSE_KEYS_KEY: &str = "entitlement_used_license_keys";
const MAX_USED_TRANSACTION_CODES: usize = 100;
const MAX_USED_LICENSE_KEYS: usize = 50;
const LICENSE_KEY_SECRET: &[u8] = b"sms-engine-offline-license-v1";

/// One entry in the built-in pricing table.
#[derive(Debug, Clone, Copy)]
pub struct PlanDef {
    /// Single-character code embedded in license keys.
    pub code: char,
    /// Stable plan id, matching `subscription_plans.id`.
    pub id: &'static str,
    /// Price in Kenyan shillings.
    pub price_kes: i64,
    /// Subscription period granted on activation.
    pub duration: Duration,
}

/// Pricing table, mirroring the rows seeded by the `subscription_plans`
/// migration.
pub const PLAN_CATALOG: &[PlanDef] = &[
    PlanDef { code: 'W', id: "weekly", price_kes: 50, duration: Duration::from_secs(7 * 86_400) },
    PlanDef { code: 'M', id: "monthly", price_kes: 150, duration: Duration::from_secs(30 * 86_400) },
    PlanDef { code: 'A', id: "annual", price_kes: 1500, duration: Duration::from_secs(365 * 86_400) },
];

/// Selects the highest-priced plan a payment of `amount` qualifies for,
/// allowing up to 5% underpayment.
fn match_plan_by_amount(amount: Decimal) -> Option<&'static PlanDef> {
    PLAN_CATALOG
        .iter()
        .filter(|plan| amount >= Decimal::from(plan.price_kes) * Decimal::new(95, 2))
        .max_by_key(|plan| plan.price_kes)
}

fn plan_by_code(code: char) -> Option<&'static PlanDef> {
    PLAN_CATALOG.iter().find(|plan| plan.code == code)
}

/// The signed payload persisted in the keystore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SubscriptionRecord {
    plan_id: String,
    source: String,
    device_fingerprint: String,
    activated_at: i64,
    expires_at: i64,
    extended_from: Option<i64>,
    transaction_code: Option<String>,
}

/// Overall access status, in the derivation order the spec fixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingStatus {
    /// An admin/developer override is in effect; always grants access.
    Bypass,
    /// A signed subscription is active.
    Active,
    /// An active free trial is in effect.
    Trial,
    /// The subscription expired but is within its grace period.
    Grace,
    /// The subscription (or trial) has expired outside any grace period.
    Expired,
    /// No subscription, trial, or bypass has ever been established.
    None,
}

impl BillingStatus {
    /// Whether this status grants sending access.
    #[must_use]
    pub fn grants_access(self) -> bool {
        matches!(self, Self::Bypass | Self::Active | Self::Trial | Self::Grace)
    }
}

/// Full billing state as reported to a host UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingState {
    /// Current status.
    pub status: BillingStatus,
    /// Active plan, when a subscription or trial is in effect.
    pub plan_id: Option<String>,
    /// Days remaining until expiry (or grace-period end), when known.
    pub days_remaining: Option<i64>,
    /// True when `days_remaining` is exactly 7, 3, or 1 — a renewal nudge.
    pub renewal_reminder: bool,
}

impl BillingState {
    fn none() -> Self {
        Self { status: BillingStatus::None, plan_id: None, days_remaining: None, renewal_reminder: false }
    }
}

/// Best-effort remote registration of an activation. Local state never
/// depends on this succeeding.
#[async_trait]
pub trait ServerSync: Send + Sync {
    /// Attempts to register an activation with the remote licensing server.
    ///
    /// # Errors
    ///
    /// Returns a description of the failure; callers retry with backoff.
    async fn register(&self, plan_id: &str, device_fingerprint: &str) -> Result<(), String>;
}

/// The access gate.
pub struct EntitlementManager {
    keystore: Arc<dyn Keystore>,
    device_binding: Arc<dyn DeviceBinding>,
    time_provider: Arc<dyn TimeProvider>,
    server_sync: Option<Arc<dyn ServerSync>>,
    audit_log: Option<Arc<dyn AuditLogRepository>>,
    grace_period: Duration,
    trial_duration: Duration,
    renewal_reminder_days: [u32; 3],
    bypass: AtomicBool,
    signing_key: Mutex<Option<Vec<u8>>>,
}

impl EntitlementManager {
    /// Builds a manager with no server-sync collaborator.
    #[must_use]
    pub fn new(
        keystore: Arc<dyn Keystore>,
        device_binding: Arc<dyn DeviceBinding>,
        time_provider: Arc<dyn TimeProvider>,
        grace_period: Duration,
        trial_duration: Duration,
        renewal_reminder_days: [u32; 3],
    ) -> Self {
        Self {
            keystore,
            device_binding,
            time_provider,
            server_sync: None,
            audit_log: None,
            grace_period,
            trial_duration,
            renewal_reminder_days,
            bypass: AtomicBool::new(false),
            signing_key: Mutex::new(None),
        }
    }

    /// Attaches a server-sync collaborator used for best-effort remote
    /// registration after activation.
    #[must_use]
    pub fn with_server_sync(mut self, server_sync: Arc<dyn ServerSync>) -> Self {
        self.server_sync = Some(server_sync);
        self
    }

    /// Attaches an audit log sink. Activation, trial start, and tamper
    /// discard are appended here; a write failure is logged and never
    /// blocks the entitlement flow it records.
    #[must_use]
    pub fn with_audit_log(mut self, audit_log: Arc<dyn AuditLogRepository>) -> Self {
        self.audit_log = Some(audit_log);
        self
    }

    async fn audit(&self, event_kind: &str, detail: &str) {
        let Some(audit_log) = self.audit_log.as_ref() else { return };
        if let Err(reason) = audit_log.record(event_kind, detail).await {
            warn!(event_kind, %reason, "failed to append audit log entry");
        }
    }

    /// Enables or disables the admin/developer bypass override.
    pub fn set_bypass(&self, enabled: bool) {
        self.bypass.store(enabled, Ordering::SeqCst);
    }

    async fn signing_key(&self) -> Vec<u8> {
        let mut guard = self.signing_key.lock().await;
        if let Some(key) = guard.as_ref() {
            return key.clone();
        }
        let key = match self.keystore.get(signing::SIGNING_KEY_SERVICE).await {
            Some(existing) => existing,
            None => {
                let fresh = signing::generate_signing_key();
                self.keystore.set(signing::SIGNING_KEY_SERVICE, fresh.clone()).await;
                fresh
            }
        };
        *guard = Some(key.clone());
        key
    }

    async fn load_subscription(&self) -> Option<SubscriptionRecord> {
        let token_bytes = self.keystore.get(SUBSCRIPTION_TOKEN_KEY).await?;
        let token = String::from_utf8(token_bytes).ok()?;
        let key = self.signing_key().await;
        let record: SubscriptionRecord = signing::verify(&key, &token)?;

        let current_fingerprint = self.device_binding.get_fingerprint().await;
        if record.device_fingerprint != current_fingerprint {
            warn!("subscription device fingerprint mismatch; discarding record");
            self.audit("subscription_discarded", "device fingerprint mismatch").await;
            return None;
        }
        if !self.device_binding.verify_subscription_binding(&record.device_fingerprint).await {
            warn!("subscription binding verification failed; discarding record");
            self.audit("subscription_discarded", "device binding verification failed").await;
            return None;
        }
        Some(record)
    }

    async fn store_subscription(&self, record: &SubscriptionRecord) {
        let key = self.signing_key().await;
        let token = signing::sign(&key, record);
        self.keystore.set(SUBSCRIPTION_TOKEN_KEY, token.into_bytes()).await;
    }

    async fn used_list(&self, keystore_key: &str) -> VecDeque<String> {
        match self.keystore.get(keystore_key).await {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            None => VecDeque::new(),
        }
    }

    async fn record_used(&self, keystore_key: &str, value: String, cap: usize) {
        let mut list = self.used_list(keystore_key).await;
        list.push_back(value);
        while list.len() > cap {
            list.pop_front();
        }
        let bytes = serde_json::to_vec(&list).unwrap_or_default();
        self.keystore.set(keystore_key, bytes).await;
    }

    /// Whether the current state grants sending access.
    pub async fn has_active_access(&self) -> bool {
        self.get_state().await.status.grants_access()
    }

    /// Derives the full billing state: bypass, then active subscription,
    /// then trial, then grace, then expired, then none.
    pub async fn get_state(&self) -> BillingState {
        if self.bypass.load(Ordering::SeqCst) {
            return BillingState { status: BillingStatus::Bypass, plan_id: None, days_remaining: None, renewal_reminder: false };
        }

        let now = self.time_provider.unix_millis();

        if let Some(record) = self.load_subscription().await {
            let days_remaining = (record.expires_at - now) / 86_400_000;
            if record.expires_at > now {
                return self.build_state(BillingStatus::Active, Some(record.plan_id), days_remaining);
            }
            let grace_end = record.expires_at + i64::try_from(self.grace_period.as_millis()).unwrap_or(i64::MAX);
            if grace_end > now {
                let grace_days_remaining = (grace_end - now) / 86_400_000;
                return self.build_state(BillingStatus::Grace, Some(record.plan_id), grace_days_remaining);
            }
            return self.build_state(BillingStatus::Expired, Some(record.plan_id), 0);
        }

        let trial = self.device_binding.get_trial_status().await;
        if trial.used {
            if let Some(start) = trial.start_time {
                let trial_end = start + i64::try_from(self.trial_duration.as_millis()).unwrap_or(i64::MAX);
                if trial_end > now {
                    let days_remaining = (trial_end - now) / 86_400_000;
                    return self.build_state(BillingStatus::Trial, None, days_remaining);
                }
            }
            return self.build_state(BillingStatus::Expired, None, 0);
        }

        BillingState::none()
    }

    fn build_state(&self, status: BillingStatus, plan_id: Option<String>, days_remaining: i64) -> BillingState {
        let renewal_reminder = self.renewal_reminder_days.contains(&u32::try_from(days_remaining.max(0)).unwrap_or(u32::MAX));
        BillingState { status, plan_id, days_remaining: Some(days_remaining), renewal_reminder }
    }

    /// Activates (or extends) a subscription from a mobile-money payment.
    ///
    /// # Errors
    ///
    /// Returns [`EntitlementError::PlanUnknown`] if `amount` doesn't match
    /// any plan within tolerance, or [`EntitlementError::DuplicateTransaction`]
    /// if `transaction_code` was already used.
    pub async fn activate_via_payment(&self, amount: Decimal, transaction_code: &crate::domain_types::TransactionCode) -> EntitlementResult<BillingState> {
        let transaction_code = transaction_code.as_str();
        let used = self.used_list(USED_TRANSACTION_CODES_KEY).await;
        if used.iter().any(|code| code == transaction_code) {
            return Err(EntitlementError::DuplicateTransaction(transaction_code.to_string()));
        }
        let plan = match_plan_by_amount(amount).ok_or(EntitlementError::PlanUnknown(amount))?;

        let now = self.time_provider.unix_millis();
        let existing = self.load_subscription().await;
        let extends_from = existing.as_ref().filter(|r| r.expires_at > now).map(|r| r.expires_at);
        let period_start = extends_from.unwrap_or(now);
        let expires_at = period_start + i64::try_from(plan.duration.as_millis()).unwrap_or(i64::MAX);

        let fingerprint = self.device_binding.get_fingerprint().await;
        let record = SubscriptionRecord {
            plan_id: plan.id.to_string(),
            source: crate::domain_types::SubscriptionSource::Mpesa.as_str().to_string(),
            device_fingerprint: fingerprint.clone(),
            activated_at: now,
            expires_at,
            extended_from: extends_from,
            transaction_code: Some(transaction_code.to_string()),
        };
        self.store_subscription(&record).await;
        self.record_used(USED_TRANSACTION_CODES_KEY, transaction_code.to_string(), MAX_USED_TRANSACTION_CODES).await;
        self.spawn_server_sync(plan.id, &fingerprint);
        self.audit("subscription_activated", &format!("plan={} source=mpesa transaction={transaction_code}", plan.id)).await;

        info!(plan = plan.id, "subscription activated via payment");
        Ok(self.get_state().await)
    }

    /// Activates a subscription from a 20-character license key.
    ///
    /// # Errors
    ///
    /// Returns [`EntitlementError::InvalidLicenseKey`] on checksum/format
    /// failure or a device-hash mismatch, or
    /// [`EntitlementError::DuplicateLicenseKey`] if already redeemed on this
    /// device.
    pub async fn activate_via_license_key(&self, key: &crate::domain_types::LicenseKeyCode) -> EntitlementResult<BillingState> {
        let used = self.used_list(USED_LICENSE_KEYS_KEY).await;
        if used.iter().any(|used_key| used_key == key.as_str()) {
            return Err(EntitlementError::DuplicateLicenseKey(key.as_str().to_string()));
        }

        let fingerprint = self.device_binding.get_fingerprint().await;
        let plan = decode_license_key(key.as_str(), &fingerprint)
            .ok_or_else(|| EntitlementError::InvalidLicenseKey(key.as_str().to_string()))?;

        let now = self.time_provider.unix_millis();
        let record = SubscriptionRecord {
            plan_id: plan.id.to_string(),
            source: crate::domain_types::SubscriptionSource::LicenseKey.as_str().to_string(),
            device_fingerprint: fingerprint.clone(),
            activated_at: now,
            expires_at: now + i64::try_from(plan.duration.as_millis()).unwrap_or(i64::MAX),
            extended_from: None,
            transaction_code: None,
        };
        self.store_subscription(&record).await;
        self.record_used(USED_LICENSE_KEYS_KEY, key.as_str().to_string(), MAX_USED_LICENSE_KEYS).await;
        self.spawn_server_sync(plan.id, &fingerprint);
        self.audit("subscription_activated", &format!("plan={} source=license_key", plan.id)).await;

        info!(plan = plan.id, "subscription activated via license key");
        Ok(self.get_state().await)
    }

    /// Starts a one-shot trial, if this device hasn't used one.
    ///
    /// # Errors
    ///
    /// Returns [`EntitlementError::TrialAlreadyUsed`] otherwise.
    pub async fn start_trial(&self) -> EntitlementResult<BillingState> {
        if !self.device_binding.can_start_trial().await {
            return Err(EntitlementError::TrialAlreadyUsed);
        }
        self.device_binding.start_trial().await;
        self.audit("trial_started", &self.device_binding.get_fingerprint().await).await;
        Ok(self.get_state().await)
    }

    fn spawn_server_sync(&self, plan_id: &str, fingerprint: &str) {
        let Some(sync) = self.server_sync.clone() else { return };
        let plan_id = plan_id.to_string();
        let fingerprint = fingerprint.to_string();
        let time_provider = Arc::clone(&self.time_provider);
        tokio::spawn(async move {
            sync_with_backoff(sync.as_ref(), &plan_id, &fingerprint, time_provider.as_ref()).await;
        });
    }
}

/// Retries `sync.register` up to 3 times with exponential backoff
/// (1s, 2s, 4s, capped at 10s), logging but never propagating failure.
async fn sync_with_backoff(sync: &dyn ServerSync, plan_id: &str, fingerprint: &str, time_provider: &dyn TimeProvider) {
    let mut delay = Duration::from_secs(1);
    for attempt in 1..=3 {
        match sync.register(plan_id, fingerprint).await {
            Ok(()) => {
                info!(attempt, "entitlement server sync succeeded");
                return;
            }
            Err(reason) => {
                warn!(attempt, %reason, "entitlement server sync attempt failed");
                if attempt < 3 {
                    time_provider.sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(10));
                }
            }
        }
    }
    warn!("entitlement server sync exhausted all attempts; local state remains authoritative");
}

fn hash_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

/// Encodes a 20-character license key: 1-char plan code, 5-char base36
/// expiry (days since epoch), 8-char device hash, 6-char checksum.
#[must_use]
pub fn encode_license_key(plan_code: char, expiry_unix_millis: i64, device_fingerprint: &str) -> String {
    let expiry_days = u64::try_from(expiry_unix_millis / 86_400_000).unwrap_or(0);
    let expiry_b36 = to_base36(expiry_days, 5);
    let device_hash = &hash_hex(device_fingerprint)[..8];
    let checksum_input = format!("{plan_code}{expiry_b36}{device_hash}");
    let checksum = &hash_hex(&format!("{checksum_input}{}", String::from_utf8_lossy(LICENSE_KEY_SECRET)))[..6];
    format!("{plan_code}{expiry_b36}{device_hash}{checksum}").to_uppercase()
}

fn decode_license_key(key: &str, device_fingerprint: &str) -> Option<&'static PlanDef> {
    if key.len() != 20 {
        return None;
    }
    let key_lower = key.to_lowercase();
    let plan_code = key.chars().next()?.to_ascii_uppercase();
    let expiry_b36 = &key_lower[1..6];
    let device_hash = &key_lower[6..14];
    let checksum = &key_lower[14..20];

    let expected_device_hash = &hash_hex(device_fingerprint)[..8];
    if device_hash != expected_device_hash {
        return None;
    }

    let checksum_input = format!("{plan_code}{expiry_b36}{device_hash}");
    let expected_checksum = &hash_hex(&format!("{checksum_input}{}", String::from_utf8_lossy(LICENSE_KEY_SECRET)))[..6];
    if checksum != expected_checksum {
        return None;
    }

    plan_by_code(plan_code)
}

fn to_base36(mut value: u64, width: usize) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".repeat(width);
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    while out.len() < width {
        out.push(b'0');
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ASCII")
}
