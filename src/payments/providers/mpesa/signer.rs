//! STK request signing
//!
//! Every push and status query carries a `Timestamp` in provider local time and
//! a `Password` of `base64(shortcode + passkey + timestamp)`. The pair must be
//! recomputed for each request.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, FixedOffset, Offset, Utc};

/// The provider reads timestamps as East Africa Time (UTC+3).
const PROVIDER_UTC_OFFSET_SECS: i32 = 3 * 3600;

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Timestamp and password for one outgoing request
#[derive(Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub timestamp: String,
    pub password: String,
}

impl std::fmt::Debug for SignedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedRequest")
            .field("timestamp", &self.timestamp)
            .field("password", &"<redacted>")
            .finish()
    }
}

fn provider_offset() -> FixedOffset {
    FixedOffset::east_opt(PROVIDER_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// Current provider-local time as `YYYYMMDDHHmmss`
pub fn timestamp() -> String {
    timestamp_at(Utc::now())
}

pub fn timestamp_at(instant: DateTime<Utc>) -> String {
    instant
        .with_timezone(&provider_offset())
        .format(TIMESTAMP_FORMAT)
        .to_string()
}

pub fn password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    STANDARD.encode(format!("{}{}{}", shortcode, passkey, timestamp))
}

pub fn sign_at(shortcode: &str, passkey: &str, instant: DateTime<Utc>) -> SignedRequest {
    let timestamp = timestamp_at(instant);
    let password = password(shortcode, passkey, &timestamp);
    SignedRequest {
        timestamp,
        password,
    }
}

pub fn sign(shortcode: &str, passkey: &str) -> SignedRequest {
    sign_at(shortcode, passkey, Utc::now())
}
