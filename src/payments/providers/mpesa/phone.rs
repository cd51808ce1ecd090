//! Payer phone normalization
//!
//! Converts the formats people type into the donation form (`0712 345 678`,
//! `+254-712-345678`, `712345678`) into the `2547XXXXXXXX` / `2541XXXXXXXX`
//! form the STK push endpoint expects.

use crate::error::ValidationError;
use regex::Regex;
use std::sync::LazyLock;

pub const COUNTRY_CODE: &str = "254";

/// Country code, a `7` or `1` subscriber prefix, then eight digits.
const CANONICAL_PATTERN: &str = r"^254[17]\d{8}$";

static CANONICAL: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(CANONICAL_PATTERN));

fn invalid(raw: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidPhone {
        input: raw.to_string(),
        reason: reason.into(),
    }
}

/// Normalize a payer phone number to the canonical international form.
pub fn normalize(raw: &str) -> Result<String, ValidationError> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.is_empty() {
        return Err(invalid(raw, "no digits found"));
    }

    let candidate = if let Some(rest) = digits.strip_prefix('0') {
        format!("{}{}", COUNTRY_CODE, rest)
    } else if digits.starts_with(COUNTRY_CODE) {
        digits
    } else if digits.starts_with('7') || digits.starts_with('1') {
        format!("{}{}", COUNTRY_CODE, digits)
    } else {
        digits
    };

    let pattern = match &*CANONICAL {
        Ok(pattern) => pattern,
        Err(e) => return Err(invalid(raw, format!("phone pattern unavailable: {}", e))),
    };

    if pattern.is_match(&candidate) {
        Ok(candidate)
    } else {
        Err(invalid(
            raw,
            "expected a Safaricom number such as 0712345678 or 254712345678",
        ))
    }
}
