//! Payment provider trait definitions

use crate::error::AppResult;
use crate::payments::types::{PaymentRequest, PaymentResponse, ProviderStatus};
use async_trait::async_trait;

/// Trait for push-payment provider implementations
///
/// The initiation and status services hold a `dyn PaymentProvider` so they can
/// be exercised against a scripted provider in tests.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Provider name used in logs and errors
    fn name(&self) -> &'static str;

    /// Ask the provider to prompt the payer.
    ///
    /// Success means only that the prompt was accepted. It is not proof of
    /// payment. Implementations must not retry this call on their own.
    async fn initiate_payment(&self, request: &PaymentRequest) -> AppResult<PaymentResponse>;

    /// Ask the provider for the current outcome of a prompt.
    async fn query_status(&self, checkout_request_id: &str) -> AppResult<ProviderStatus>;
}
