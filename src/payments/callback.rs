//! Callback receiver
//!
//! Entry point for the provider's asynchronous result notification. The
//! provider gets the same acknowledgement whatever happens inside; processing
//! failures are logged and kept in the callback audit log instead.

use crate::database::{
    CallbackEvent, OutcomeSource, TerminalOutcome, TerminalStatus, TransactionStore,
    TransitionOutcome,
};
use crate::payments::providers::mpesa::wire;
use crate::payments::types::CallbackResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Body returned to the provider for every delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i32,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

impl CallbackAck {
    pub fn accepted() -> Self {
        Self {
            result_code: 0,
            result_desc: "Accepted".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardRejection {
    MissingSecret,
    WrongSecret,
    UnknownSource(Option<IpAddr>),
}

impl fmt::Display for GuardRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardRejection::MissingSecret => write!(f, "callback secret missing"),
            GuardRejection::WrongSecret => write!(f, "callback secret mismatch"),
            GuardRejection::UnknownSource(Some(ip)) => write!(f, "source {} not allowed", ip),
            GuardRejection::UnknownSource(None) => write!(f, "source address unknown"),
        }
    }
}

/// Origin checks for inbound callbacks
///
/// The base protocol carries no authentication, so deployments can require a
/// secret path segment and/or restrict source addresses.
#[derive(Clone, Default)]
pub struct CallbackGuard {
    secret_digest: Option<[u8; 32]>,
    allowed_ips: Vec<IpAddr>,
}

impl fmt::Debug for CallbackGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackGuard")
            .field("requires_secret", &self.secret_digest.is_some())
            .field("allowed_ips", &self.allowed_ips)
            .finish()
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

impl CallbackGuard {
    pub fn new(secret: Option<&str>, allowed_ips: Vec<IpAddr>) -> Self {
        Self {
            secret_digest: secret.filter(|s| !s.is_empty()).map(digest),
            allowed_ips,
        }
    }

    pub fn requires_secret(&self) -> bool {
        self.secret_digest.is_some()
    }

    pub fn check(&self, path_secret: Option<&str>, source: Option<IpAddr>) -> Result<(), GuardRejection> {
        if let Some(expected) = &self.secret_digest {
            let provided = path_secret.ok_or(GuardRejection::MissingSecret)?;
            // Equal-length digests keep the comparison time independent of the input.
            let diff = expected
                .iter()
                .zip(digest(provided).iter())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b));
            if diff != 0 {
                return Err(GuardRejection::WrongSecret);
            }
        }

        if !self.allowed_ips.is_empty() {
            match source {
                Some(ip) if self.allowed_ips.contains(&ip) => {}
                other => return Err(GuardRejection::UnknownSource(other)),
            }
        }

        Ok(())
    }
}

/// One inbound delivery as seen by the HTTP layer
#[derive(Debug, Clone, Copy)]
pub struct CallbackDelivery<'a> {
    pub body: &'a [u8],
    pub path_secret: Option<&'a str>,
    pub source: Option<IpAddr>,
}

pub fn terminal_outcome(result: &CallbackResult) -> TerminalOutcome {
    let success = result.is_success();
    TerminalOutcome {
        checkout_request_id: result.checkout_request_id.clone(),
        merchant_request_id: result.merchant_request_id.clone(),
        status: if success {
            TerminalStatus::Completed
        } else {
            TerminalStatus::Failed
        },
        result_code: result.result_code,
        result_desc: result.result_description.clone(),
        amount: result.amount.clone(),
        receipt_number: result.receipt_number.clone().filter(|_| success),
        provider_transaction_time: result.transaction_time.clone(),
        payer_phone: result.payer_phone.clone(),
        source: OutcomeSource::Callback,
    }
}

fn checkout_id_hint(raw: &[u8]) -> Option<String> {
    serde_json::from_slice::<serde_json::Value>(raw)
        .ok()?
        .pointer("/Body/stkCallback/CheckoutRequestID")?
        .as_str()
        .filter(|id| !id.trim().is_empty())
        .map(str::to_string)
}

pub struct CallbackReceiver {
    store: Arc<dyn TransactionStore>,
    guard: CallbackGuard,
}

impl CallbackReceiver {
    pub fn new(store: Arc<dyn TransactionStore>) -> Self {
        Self {
            store,
            guard: CallbackGuard::default(),
        }
    }

    pub fn with_guard(mut self, guard: CallbackGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn guard(&self) -> &CallbackGuard {
        &self.guard
    }

    /// Check the delivery's origin, then process it.
    pub async fn receive(&self, delivery: CallbackDelivery<'_>) -> CallbackAck {
        if let Err(rejection) = self.guard.check(delivery.path_secret, delivery.source) {
            warn!(
                alert = "callback_rejected",
                source = ?delivery.source,
                "Ignoring M-Pesa callback: {}", rejection
            );
            self.audit(CallbackEvent::new(
                checkout_id_hint(delivery.body),
                "rejected",
                Some(rejection.to_string()),
                String::from_utf8_lossy(delivery.body),
            ))
            .await;
            return CallbackAck::accepted();
        }

        self.handle(delivery.body).await
    }

    /// Apply one notification to the store. Always acknowledges.
    pub async fn handle(&self, raw: &[u8]) -> CallbackAck {
        let payload = String::from_utf8_lossy(raw).into_owned();

        let result = match wire::parse_callback(raw) {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    alert = "callback_parse_error",
                    "Malformed M-Pesa callback acknowledged without processing: {}", e
                );
                self.audit(CallbackEvent::new(
                    checkout_id_hint(raw),
                    "parse_error",
                    Some(e.to_string()),
                    payload,
                ))
                .await;
                return CallbackAck::accepted();
            }
        };

        let outcome = terminal_outcome(&result);
        let checkout_request_id = Some(result.checkout_request_id.clone());

        match self.store.apply_outcome(&outcome).await {
            Ok(transition) => {
                self.log_transition(&result, &transition);
                self.audit(CallbackEvent::new(
                    checkout_request_id,
                    transition.label(),
                    None,
                    payload,
                ))
                .await;
            }
            Err(e) => {
                error!(
                    alert = "callback_store_error",
                    checkout_request_id = %result.checkout_request_id,
                    merchant_request_id = %result.merchant_request_id,
                    result_code = result.result_code,
                    "Failed to record M-Pesa callback outcome: {}", e
                );
                self.audit(CallbackEvent::new(
                    checkout_request_id,
                    "store_error",
                    Some(e.to_string()),
                    payload,
                ))
                .await;
            }
        }

        CallbackAck::accepted()
    }

    fn log_transition(&self, result: &CallbackResult, transition: &TransitionOutcome) {
        let record = transition.record();
        match transition {
            TransitionOutcome::Applied(_) => info!(
                checkout_request_id = %record.checkout_request_id,
                transaction_id = %record.transaction_id,
                status = %record.status,
                result_code = result.result_code,
                receipt_number = ?record.receipt_number,
                "M-Pesa transaction settled by callback"
            ),
            TransitionOutcome::Inserted(_) => warn!(
                checkout_request_id = %record.checkout_request_id,
                status = %record.status,
                "M-Pesa callback arrived before the pending record; created from callback"
            ),
            TransitionOutcome::AlreadyFinal(_) => info!(
                checkout_request_id = %record.checkout_request_id,
                status = %record.status,
                "Duplicate M-Pesa callback ignored"
            ),
        }
    }

    async fn audit(&self, event: CallbackEvent) {
        if let Err(e) = self.store.record_callback_event(&event).await {
            warn!(
                checkout_request_id = ?event.checkout_request_id,
                outcome = %event.outcome,
                "Failed to store callback audit event: {}", e
            );
        }
    }
}
