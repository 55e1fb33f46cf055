//! Domain types for the bulk SMS campaign engine.
//!
//! Strongly-typed newtypes keep primitive obsession (raw `String`/`i64`)
//! out of the repositories, pipeline, and entitlement manager, and let
//! validation happen once, at the boundary, rather than being re-checked at
//! every call site.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a conversation row.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct ConversationId(i64);

/// Unique identifier for a message row.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct MessageId(i64);

/// Unique identifier for an outbound queue entry.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct OutboundEntryId(i64);

/// Opaque, unique thread identifier correlating a conversation with the
/// platform's native messaging thread.
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct ThreadId(String);

/// A campaign identifier, correlating outgoing messages dispatched in the
/// same send-pipeline run.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct CampaignId(Uuid);

impl CampaignId {
    /// Generates a new random campaign id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// A/B template variant identifier within a campaign.
#[nutype(
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct VariantId(String);

/// A phone number or alphanumeric sender id, normalised for storage and
/// lookup.
///
/// Normalisation strips formatting punctuation from digit-dominant
/// addresses (spaces, dashes, parentheses) while leaving alphanumeric
/// short codes untouched, matching spec §4.4's conversation merge rules.
#[nutype(
    sanitize(with = |s: String| PhoneNumber::normalize(&s)),
    validate(len_char_min = 1, len_char_max = 32),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// String representation of the normalised address.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }

    fn normalize(raw: &str) -> String {
        let trimmed = raw.trim();
        let digit_count = trimmed.chars().filter(char::is_ascii_digit).count();
        let is_digit_dominant = digit_count > 0
            && digit_count >= trimmed.chars().filter(|c| !c.is_whitespace()).count() / 2;

        if is_digit_dominant {
            let mut normalized: String = trimmed
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '+')
                .collect();
            if normalized.starts_with('+') {
                let rest: String = normalized.chars().skip(1).collect();
                normalized = format!("+{rest}");
            }
            normalized
        } else {
            trimmed.to_string()
        }
    }

    /// True when the number is digit-dominant (a real phone number, as
    /// opposed to an alphanumeric short code) with enough digits to be
    /// eligible for suffix-match merging.
    #[must_use]
    pub fn is_suffix_matchable(&self) -> bool {
        let digits = self.as_str().chars().filter(char::is_ascii_digit).count();
        let alpha = self.as_str().chars().any(char::is_alphabetic);
        !alpha && digits >= 9
    }

    /// Last 9 digits, used for suffix-match merging of formatting variants.
    #[must_use]
    pub fn suffix9(&self) -> String {
        let digits: String = self.as_str().chars().filter(char::is_ascii_digit).collect();
        if digits.len() <= 9 {
            digits
        } else {
            digits[digits.len() - 9..].to_string()
        }
    }
}

/// Direction of a message relative to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Received by the device.
    Incoming,
    /// Sent from the device.
    Outgoing,
}

impl Direction {
    /// Database column representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        }
    }

    /// Parses the database column representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "incoming" => Some(Self::Incoming),
            "outgoing" => Some(Self::Outgoing),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Written ahead, dispatch not yet attempted or not yet resolved.
    Pending,
    /// Transport accepted the message.
    Sent,
    /// Delivery receipt confirmed by the carrier.
    Delivered,
    /// Recipient has read the message (rare, carrier-dependent).
    Read,
    /// Transport reported failure.
    Failed,
    /// An incoming message that has been received and stored.
    Received,
    /// Body exceeded the maximum length and was truncated on insert.
    Truncated,
}

impl MessageStatus {
    /// Database column representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
            Self::Received => "received",
            Self::Truncated => "truncated",
        }
    }

    /// Parses the database column representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            "received" => Some(Self::Received),
            "truncated" => Some(Self::Truncated),
            _ => None,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an outbound queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutboundStatus {
    /// Waiting for the send pipeline or retry worker to dispatch it.
    Pending,
    /// Transport accepted the message; terminal success state.
    Sent,
    /// A dispatch attempt failed; still eligible for retry.
    Failed,
    /// Retry budget consumed without success; terminal failure state.
    Exhausted,
}

impl OutboundStatus {
    /// Database column representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Exhausted => "exhausted",
        }
    }

    /// Parses the database column representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            "exhausted" => Some(Self::Exhausted),
            _ => None,
        }
    }
}

impl fmt::Display for OutboundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch priority for an outbound queue entry, ordered high-to-low by
/// discriminant for `priority DESC` queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum Priority {
    /// Dispatched only once nothing else is pending.
    Low = -1,
    /// Default priority.
    Normal = 0,
    /// Elevated priority; dispatched ahead of normal entries.
    High = 1,
    /// Highest priority; dispatched ahead of everything else.
    Urgent = 2,
}

impl Priority {
    /// Integer value stored in the database.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    /// Parses the database integer representation, defaulting to `Normal`
    /// for unrecognised values rather than failing the read path.
    #[must_use]
    pub fn from_i64(v: i64) -> Self {
        match v {
            2 => Self::Urgent,
            1 => Self::High,
            -1 => Self::Low,
            _ => Self::Normal,
        }
    }
}

/// Conversation list filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationFilter {
    /// No filtering.
    All,
    /// Only conversations with `unread_count > 0`.
    Unread,
    /// Only archived conversations.
    Archived,
}

/// Conversation list sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationSort {
    /// Most recently active first.
    Recent,
    /// Unread conversations first, then recent.
    UnreadFirst,
    /// Alphabetical by recipient name/number.
    Alphabetical,
    /// Pinned conversations first, then recent.
    PinnedFirst,
}

/// Source of a subscription activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionSource {
    /// Activated via a mobile-money payment (M-Pesa).
    Mpesa,
    /// Activated by redeeming a license key.
    LicenseKey,
    /// Started as a free trial.
    Trial,
    /// Manually granted (support/admin action).
    Manual,
}

impl SubscriptionSource {
    /// Stable string representation for persistence and signing.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mpesa => "mpesa",
            Self::LicenseKey => "license_key",
            Self::Trial => "trial",
            Self::Manual => "manual",
        }
    }

    /// Parses the stable string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mpesa" => Some(Self::Mpesa),
            "license_key" => Some(Self::LicenseKey),
            "trial" => Some(Self::Trial),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Device-derived fingerprint binding a subscription to one device.
#[nutype(
    validate(len_char_min = 1, len_char_max = 256),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct DeviceFingerprint(String);

/// Identifier of a subscription plan in the pricing table.
#[nutype(
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct PlanId(String);

/// Mobile-money transaction code backing a payment activation.
#[nutype(
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct TransactionCode(String);

impl TransactionCode {
    /// String representation of the transaction code.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// A 20-character license key code.
#[nutype(
    validate(len_char_min = 20, len_char_max = 20),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct LicenseKeyCode(String);

impl LicenseKeyCode {
    /// String representation of the license key code.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Derives a stable, deterministic hex colour from an identifier, used to
/// give a conversation a consistent avatar colour across syncs.
#[must_use]
pub fn stable_color(seed: &str) -> String {
    let mut hash: u32 = 5381;
    for byte in seed.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(u32::from(byte));
    }
    format!("#{:06X}", hash & 0x00FF_FFFF)
}

/// Truncates a message body to the configured maximum length, returning the
/// possibly-truncated body and whether truncation occurred.
///
/// Matches spec invariant I7: bodies over the limit are stored at exactly
/// `max_len` characters, ending with the truncation marker.
#[must_use]
pub fn truncate_body(body: &str, max_len: usize) -> (String, bool) {
    const MARKER: &str = "...";
    let char_count = body.chars().count();
    if char_count <= max_len {
        return (body.to_string(), false);
    }
    if max_len <= MARKER.len() {
        let truncated: String = body.chars().take(max_len).collect();
        return (truncated, true);
    }
    let keep = max_len - MARKER.len();
    let mut truncated: String = body.chars().take(keep).collect();
    truncated.push_str(MARKER);
    (truncated, true)
}

/// Formats an integer amount with thousands separators, used to render the
/// `{amount}` template placeholder.
#[must_use]
pub fn format_amount_thousands(amount: i64) -> String {
    let negative = amount < 0;
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::new();
    for (i, c) in digits.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    let grouped: String = grouped.chars().rev().collect();
    if negative {
        format!("-{grouped}")
    } else {
        grouped
    }
}
