//! HS256-signed subscription token format.
//!
//! A signed token is `base64(payload_json).base64(signature)`, the
//! signature being HMAC-SHA256 over the payload bytes keyed by
//! `offline_billing_integrity_key`. The key is generated once and kept in
//! the platform keystore; it never leaves the device, so there is no
//! rotation or multi-key verification to support.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{de::DeserializeOwned, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Name under which the signing key is stored in the platform keystore.
pub const SIGNING_KEY_SERVICE: &str = "offline_billing_integrity_key";

/// Generates a fresh 32-byte signing key.
#[must_use]
pub fn generate_signing_key() -> Vec<u8> {
    let mut key = vec![0_u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Signs `payload` with `key`, producing a `payload.signature` token.
///
/// # Panics
///
/// Never panics for a non-empty `key`; `HMAC` accepts keys of any length.
pub fn sign<T: Serialize>(key: &[u8], payload: &T) -> String {
    let payload_json = serde_json::to_vec(payload).expect("payload is always serializable");
    let payload_b64 = URL_SAFE_NO_PAD.encode(&payload_json);

    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(payload_b64.as_bytes());
    let signature = mac.finalize().into_bytes();
    let signature_b64 = URL_SAFE_NO_PAD.encode(signature);

    format!("{payload_b64}.{signature_b64}")
}

/// Verifies and decodes a token produced by [`sign`].
///
/// Returns `None` on any malformed token, signature mismatch, or payload
/// that doesn't deserialize as `T` — the caller treats every failure mode
/// identically: discard the record.
pub fn verify<T: DeserializeOwned>(key: &[u8], token: &str) -> Option<T> {
    let (payload_b64, signature_b64) = token.split_once('.')?;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).ok()?;
    mac.update(payload_b64.as_bytes());
    let expected_signature = URL_SAFE_NO_PAD.decode(signature_b64).ok()?;
    mac.verify_slice(&expected_signature).ok()?;

    let payload_json = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
    serde_json::from_slice(&payload_json).ok()
}
