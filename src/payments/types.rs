//! Payment provider types and data structures
//!
//! Provider-neutral requests and responses used by the initiation, callback and
//! status paths.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Smallest amount the provider accepts, in whole shillings
pub const MINIMUM_AMOUNT: i64 = 1;

/// Payment request for initiating an STK push
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Payer phone number as typed by the payer
    pub phone: String,
    /// Whole shillings
    pub amount: i64,
    /// What the payment is for (tithe, offering, building fund...)
    pub purpose: String,
    pub payer_name: String,
    pub payer_email: Option<String>,
}

impl PaymentRequest {
    /// Check amount and required fields. Phone format is checked separately by
    /// the provider's normalizer.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.phone.trim().is_empty() {
            return Err(ValidationError::MissingField { field: "phone" });
        }
        if self.amount < MINIMUM_AMOUNT {
            return Err(ValidationError::AmountTooSmall {
                amount: self.amount,
                minimum: MINIMUM_AMOUNT,
            });
        }
        if self.purpose.trim().is_empty() {
            return Err(ValidationError::MissingField { field: "purpose" });
        }
        if self.payer_name.trim().is_empty() {
            return Err(ValidationError::MissingField { field: "name" });
        }
        if let Some(email) = self.email() {
            if !email.contains('@') {
                return Err(ValidationError::InvalidField {
                    field: "email",
                    message: format!("'{}' is not an email address", email),
                });
            }
        }
        Ok(())
    }

    /// Payer email, treating blank input as absent
    pub fn email(&self) -> Option<&str> {
        self.payer_email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
    }
}

/// Provider-issued identifiers joining initiation to its callback and queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationPair {
    pub merchant_request_id: String,
    pub checkout_request_id: String,
}

/// Accepted initiation. The payer has been prompted; nothing is paid yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentResponse {
    /// Locally generated id for caller-side bookkeeping
    pub transaction_id: Uuid,
    pub correlation: CorrelationPair,
    /// Canonical phone the prompt was sent to
    pub phone: String,
    pub customer_message: Option<String>,
}

/// Provider view of a payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderState {
    Pending,
    Completed,
    Failed,
}

/// Answer to a status query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderStatus {
    pub checkout_request_id: String,
    pub merchant_request_id: Option<String>,
    pub state: ProviderState,
    pub result_code: Option<i64>,
    pub description: String,
}

impl ProviderStatus {
    pub fn pending(checkout_request_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            checkout_request_id: checkout_request_id.into(),
            merchant_request_id: None,
            state: ProviderState::Pending,
            result_code: None,
            description: description.into(),
        }
    }
}

/// Outcome parsed from one inbound provider notification
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackResult {
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    /// 0 is success; anything else is a provider failure code
    pub result_code: i64,
    pub result_description: String,
    pub amount: Option<String>,
    pub receipt_number: Option<String>,
    pub transaction_time: Option<String>,
    pub payer_phone: Option<String>,
}

impl CallbackResult {
    pub fn is_success(&self) -> bool {
        self.result_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> PaymentRequest {
        PaymentRequest {
            phone: "0712345678".to_string(),
            amount: 500,
            purpose: "Tithe".to_string(),
            payer_name: "Jane".to_string(),
            payer_email: None,
        }
    }

    #[test]
    fn test_valid_request() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn test_amount_below_minimum() {
        for amount in [0, -5] {
            let req = PaymentRequest { amount, ..request() };
            assert_eq!(
                req.validate(),
                Err(ValidationError::AmountTooSmall {
                    amount,
                    minimum: MINIMUM_AMOUNT
                })
            );
        }
    }

    #[test]
    fn test_missing_fields() {
        let req = PaymentRequest {
            payer_name: "  ".to_string(),
            ..request()
        };
        assert_eq!(
            req.validate(),
            Err(ValidationError::MissingField { field: "name" })
        );

        let req = PaymentRequest {
            purpose: String::new(),
            ..request()
        };
        assert_eq!(
            req.validate(),
            Err(ValidationError::MissingField { field: "purpose" })
        );

        let req = PaymentRequest {
            phone: String::new(),
            ..request()
        };
        assert_eq!(
            req.validate(),
            Err(ValidationError::MissingField { field: "phone" })
        );
    }

    #[test]
    fn test_blank_email_is_absent() {
        let req = PaymentRequest {
            payer_email: Some("   ".to_string()),
            ..request()
        };
        assert!(req.validate().is_ok());
        assert_eq!(req.email(), None);
    }

    #[test]
    fn test_malformed_email() {
        let req = PaymentRequest {
            payer_email: Some("jane.example.com".to_string()),
            ..request()
        };
        assert!(matches!(
            req.validate(),
            Err(ValidationError::InvalidField { field: "email", .. })
        ));
    }
}
