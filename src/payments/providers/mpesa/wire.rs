//! Daraja JSON shapes
//!
//! Field names follow the provider's casing. Result codes arrive as numbers in
//! callbacks but as strings in some query responses, so they go through
//! [`flexible_i64`].

use crate::payments::types::CallbackResult;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const TOKEN_PATH: &str = "/oauth/v1/generate?grant_type=client_credentials";
pub const STK_PUSH_PATH: &str = "/mpesa/stkpush/v1/processrequest";
pub const STK_QUERY_PATH: &str = "/mpesa/stkpushquery/v1/query";

pub const TRANSACTION_TYPE: &str = "CustomerPayBillOnline";

/// Error code the query endpoint uses while the payer has not answered yet
pub const STILL_PROCESSING_ERROR_CODE: &str = "500.001.1001";

/// Query result code meaning the payment is still being processed
pub const STILL_PROCESSING_RESULT_CODE: i64 = 4999;

pub const ACCOUNT_REFERENCE_MAX_LEN: usize = 12;
pub const TRANSACTION_DESC_MAX_LEN: usize = 13;

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(i64),
    Float(f64),
    Text(String),
}

fn to_i64(value: NumberOrText) -> Option<i64> {
    match value {
        NumberOrText::Number(n) => Some(n),
        NumberOrText::Float(f) if f.fract() == 0.0 => Some(f as i64),
        NumberOrText::Float(_) => None,
        NumberOrText::Text(s) => s.trim().parse().ok(),
    }
}

fn flexible_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = NumberOrText::deserialize(deserializer)?;
    to_i64(value).ok_or_else(|| serde::de::Error::custom("expected an integer code"))
}

fn flexible_opt_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    let value = Option::<NumberOrText>::deserialize(deserializer)?;
    Ok(value.and_then(to_i64))
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(deserialize_with = "flexible_i64")]
    pub expires_in: i64,
}

/// Error body returned with non-2xx statuses
#[derive(Debug, Default, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "requestId", default)]
    pub request_id: Option<String>,
    #[serde(rename = "errorCode", default)]
    pub error_code: Option<String>,
    #[serde(rename = "errorMessage", default)]
    pub error_message: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StkPushPayload {
    pub business_short_code: String,
    pub password: String,
    pub timestamp: String,
    pub transaction_type: &'static str,
    pub amount: i64,
    pub party_a: String,
    pub party_b: String,
    pub phone_number: String,
    #[serde(rename = "CallBackURL")]
    pub call_back_url: String,
    pub account_reference: String,
    pub transaction_desc: String,
}

#[derive(Debug, Deserialize)]
pub struct StkPushResponse {
    #[serde(rename = "MerchantRequestID", default)]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID", default)]
    pub checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription", default)]
    pub response_description: String,
    #[serde(rename = "CustomerMessage", default)]
    pub customer_message: Option<String>,
}

#[derive(Serialize)]
pub struct StkQueryPayload {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StkQueryResponse {
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription", default)]
    pub response_description: String,
    #[serde(rename = "MerchantRequestID", default)]
    pub merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID", default)]
    pub checkout_request_id: Option<String>,
    #[serde(rename = "ResultCode", default, deserialize_with = "flexible_opt_i64")]
    pub result_code: Option<i64>,
    #[serde(rename = "ResultDesc", default)]
    pub result_desc: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: CallbackBody,
}

#[derive(Debug, Deserialize)]
pub struct CallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode", deserialize_with = "flexible_i64")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc", default)]
    pub result_desc: String,
    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize)]
pub struct MetadataItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value", default)]
    pub value: Option<Value>,
}

impl CallbackMetadata {
    /// Value of the named item as text. Missing items and items without a
    /// value are both absent.
    pub fn text(&self, name: &str) -> Option<String> {
        self.items
            .iter()
            .find(|item| item.name == name)
            .and_then(|item| item.value.as_ref())
            .and_then(|value| match value {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }
}

/// Parse a raw callback body into a [`CallbackResult`].
///
/// A blank `CheckoutRequestID` is rejected: it is the only key a callback can
/// be matched on.
pub fn parse_callback(raw: &[u8]) -> Result<CallbackResult, serde_json::Error> {
    let envelope: CallbackEnvelope = serde_json::from_slice(raw)?;
    let callback = envelope.body.stk_callback;
    if callback.checkout_request_id.trim().is_empty() {
        return Err(serde_json::Error::custom("CheckoutRequestID is blank"));
    }
    let metadata = callback.callback_metadata.unwrap_or_default();

    Ok(CallbackResult {
        checkout_request_id: callback.checkout_request_id,
        merchant_request_id: callback.merchant_request_id,
        result_code: callback.result_code,
        result_description: callback.result_desc,
        amount: metadata.text("Amount"),
        receipt_number: metadata.text("MpesaReceiptNumber"),
        transaction_time: metadata.text("TransactionDate"),
        payer_phone: metadata.text("PhoneNumber"),
    })
}

/// Account reference shown on the payer's prompt: alphanumerics from the
/// purpose, cut to the provider limit.
pub fn account_reference(purpose: &str, fallback: &str) -> String {
    let cleaned: String = purpose
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(ACCOUNT_REFERENCE_MAX_LEN)
        .collect();

    if cleaned.is_empty() {
        fallback.chars().take(ACCOUNT_REFERENCE_MAX_LEN).collect()
    } else {
        cleaned
    }
}

pub fn transaction_desc(purpose: &str) -> String {
    let trimmed = purpose.trim();
    if trimmed.is_empty() {
        return "Payment".to_string();
    }
    trimmed.chars().take(TRANSACTION_DESC_MAX_LEN).collect::<String>().trim_end().to_string()
}
