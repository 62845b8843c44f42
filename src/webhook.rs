//! Signed webhook verification.
//!
//! A sender signs `"<timestamp>.<raw body>"` with HMAC-SHA256 under the shared
//! secret and sends the hex digest in `x-signature`, with the unix-ms
//! timestamp in `x-timestamp`. The MAC covers the timestamp's canonical
//! decimal form, so `"0170..."` and `"170..."` sign the same. Requests whose timestamp is outside the drift
//! window are rejected before the signature is even looked at, so a captured
//! request cannot be replayed later.

use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::WebhookConfig;
use crate::error::WebhookError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";

/// Compute the hex signature for `body` sent at `timestamp_ms`.
pub fn sign(secret: &[u8], timestamp_ms: i64, body: &[u8]) -> String {
    hex::encode(mac_for(secret, &timestamp_ms.to_string(), body).finalize().into_bytes())
}

fn mac_for(secret: &[u8], timestamp: &str, body: &[u8]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    mac
}

/// Constant-time comparison of `signature_hex` against the expected MAC.
pub fn check_signature(secret: &[u8], timestamp: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(provided) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    mac_for(secret, timestamp, body).verify_slice(&provided).is_ok()
}

/// Verify a webhook request at `now_ms`.
pub fn verify(
    secret: &[u8],
    body: &[u8],
    signature: Option<&str>,
    timestamp: Option<&str>,
    drift: Duration,
    now_ms: i64,
) -> Result<(), WebhookError> {
    let timestamp = timestamp.map(str::trim).ok_or(WebhookError::MissingTimestamp)?;
    let sent_ms: i64 = timestamp
        .parse()
        .map_err(|_| WebhookError::MissingTimestamp)?;
    let drift_ms = now_ms.saturating_sub(sent_ms);
    let window = i64::try_from(drift.as_millis()).unwrap_or(i64::MAX);
    if drift_ms.unsigned_abs() > window.unsigned_abs() {
        return Err(WebhookError::StaleTimestamp { drift_ms });
    }

    let signature = signature
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(WebhookError::MissingSignature)?;
    if check_signature(secret, &sent_ms.to_string(), body, signature) {
        Ok(())
    } else {
        Err(WebhookError::BadSignature)
    }
}

/// Verifier bound to the configured secret and drift window.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Vec<u8>,
    drift: Duration,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<Vec<u8>>, drift: Duration) -> Self {
        Self {
            secret: secret.into(),
            drift,
        }
    }

    pub fn from_config(config: &WebhookConfig) -> Self {
        Self::new(config.secret().as_bytes().to_vec(), config.drift)
    }

    pub fn verify(
        &self,
        body: &[u8],
        signature: Option<&str>,
        timestamp: Option<&str>,
    ) -> Result<(), WebhookError> {
        self.verify_at(body, signature, timestamp, Utc::now().timestamp_millis())
    }

    pub fn verify_at(
        &self,
        body: &[u8],
        signature: Option<&str>,
        timestamp: Option<&str>,
        now_ms: i64,
    ) -> Result<(), WebhookError> {
        verify(&self.secret, body, signature, timestamp, self.drift, now_ms)
    }

    /// Header values for `body` signed now.
    pub fn sign_now(&self, body: &[u8]) -> (String, String) {
        let ts = Utc::now().timestamp_millis();
        (ts.to_string(), sign(&self.secret, ts, body))
    }
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secret", &"[REDACTED]")
            .field("drift", &self.drift)
            .finish()
    }
}
