//! Payment initiation
//!
//! Sends the push through the provider, then persists the Pending record keyed
//! by the checkout request id the provider returned.

use crate::database::{NewPendingTransaction, TransactionStore};
use crate::error::AppResult;
use crate::payments::traits::PaymentProvider;
use crate::payments::types::{PaymentRequest, PaymentResponse};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct PaymentService {
    provider: Arc<dyn PaymentProvider>,
    store: Arc<dyn TransactionStore>,
}

impl PaymentService {
    pub fn new(provider: Arc<dyn PaymentProvider>, store: Arc<dyn TransactionStore>) -> Self {
        Self { provider, store }
    }

    /// Prompt the payer and record the pending payment.
    ///
    /// A storage failure after the provider accepted the push does not fail
    /// the call: the payer is already being prompted. It is logged as an
    /// inconsistent-state alert and the callback upsert recreates the record.
    pub async fn initiate(&self, request: PaymentRequest) -> AppResult<PaymentResponse> {
        let response = self.provider.initiate_payment(&request).await?;

        let pending = NewPendingTransaction {
            transaction_id: response.transaction_id,
            checkout_request_id: response.correlation.checkout_request_id.clone(),
            merchant_request_id: response.correlation.merchant_request_id.clone(),
            phone: response.phone.clone(),
            amount: request.amount.to_string(),
            purpose: request.purpose.trim().to_string(),
            payer_name: request.payer_name.trim().to_string(),
            payer_email: request.email().map(str::to_string),
        };

        let mut result = self.store.create_pending(&pending).await;
        if let Err(e) = &result {
            if e.is_retryable() {
                warn!(
                    checkout_request_id = %pending.checkout_request_id,
                    "Retrying pending record write: {}", e
                );
                result = self.store.create_pending(&pending).await;
            }
        }

        match result {
            Ok(record) => info!(
                transaction_id = %response.transaction_id,
                checkout_request_id = %record.checkout_request_id,
                status = %record.status,
                "Pending M-Pesa transaction recorded"
            ),
            Err(e) => error!(
                alert = "inconsistent_state",
                transaction_id = %response.transaction_id,
                merchant_request_id = %pending.merchant_request_id,
                checkout_request_id = %pending.checkout_request_id,
                amount = %pending.amount,
                phone = %pending.phone,
                "Provider accepted STK push but the pending record was not persisted: {}", e
            ),
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::error::{DatabaseError, DatabaseErrorKind, DbResult};
    use crate::database::{
        CallbackEvent, MemoryTransactionStore, TerminalOutcome, TransactionRecord,
        TransactionStatus, TransitionOutcome,
    };
    use crate::error::AppError;
    use crate::payments::types::{CorrelationPair, ProviderStatus};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct AcceptingProvider;

    #[async_trait]
    impl PaymentProvider for AcceptingProvider {
        fn name(&self) -> &'static str {
            "test"
        }

        async fn initiate_payment(&self, request: &PaymentRequest) -> AppResult<PaymentResponse> {
            request.validate()?;
            Ok(PaymentResponse {
                transaction_id: Uuid::new_v4(),
                correlation: CorrelationPair {
                    merchant_request_id: "m-1".to_string(),
                    checkout_request_id: "ws_CO_1".to_string(),
                },
                phone: "254712345678".to_string(),
                customer_message: None,
            })
        }

        async fn query_status(&self, checkout_request_id: &str) -> AppResult<ProviderStatus> {
            Ok(ProviderStatus::pending(checkout_request_id, "pending"))
        }
    }

    /// Fails every write a fixed number of times before delegating.
    struct FlakyStore {
        inner: MemoryTransactionStore,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl TransactionStore for FlakyStore {
        async fn create_pending(
            &self,
            pending: &NewPendingTransaction,
        ) -> DbResult<TransactionRecord> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(DatabaseError::new(DatabaseErrorKind::ConnectionTimeout));
            }
            self.inner.create_pending(pending).await
        }

        async fn find_by_checkout_id(&self, id: &str) -> DbResult<Option<TransactionRecord>> {
            self.inner.find_by_checkout_id(id).await
        }

        async fn apply_outcome(&self, outcome: &TerminalOutcome) -> DbResult<TransitionOutcome> {
            self.inner.apply_outcome(outcome).await
        }

        async fn find_stale_pending(
            &self,
            older_than: DateTime<Utc>,
            max_attempts: i32,
            limit: i64,
        ) -> DbResult<Vec<TransactionRecord>> {
            self.inner
                .find_stale_pending(older_than, max_attempts, limit)
                .await
        }

        async fn record_sweep_attempt(&self, id: &str) -> DbResult<Option<i32>> {
            self.inner.record_sweep_attempt(id).await
        }

        async fn record_callback_event(&self, event: &CallbackEvent) -> DbResult<()> {
            self.inner.record_callback_event(event).await
        }
    }

    fn request() -> PaymentRequest {
        PaymentRequest {
            phone: "0712345678".to_string(),
            amount: 500,
            purpose: " Tithe ".to_string(),
            payer_name: "Jane".to_string(),
            payer_email: Some("".to_string()),
        }
    }

    #[tokio::test]
    async fn test_initiate_records_pending() {
        let store = Arc::new(MemoryTransactionStore::new());
        let service = PaymentService::new(Arc::new(AcceptingProvider), store.clone());

        let response = service.initiate(request()).await.unwrap();

        let record = store.find_by_checkout_id("ws_CO_1").await.unwrap().unwrap();
        assert_eq!(record.status, TransactionStatus::Pending);
        assert_eq!(record.transaction_id, response.transaction_id);
        assert_eq!(record.amount.as_deref(), Some("500"));
        assert_eq!(record.purpose.as_deref(), Some("Tithe"));
        assert_eq!(record.payer_email, None);
    }

    #[tokio::test]
    async fn test_rejected_request_creates_no_record() {
        let store = Arc::new(MemoryTransactionStore::new());
        let service = PaymentService::new(Arc::new(AcceptingProvider), store.clone());

        let err: AppError = service
            .initiate(PaymentRequest {
                amount: 0,
                ..request()
            })
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_transient_write_failure_is_retried_once() {
        let store = Arc::new(FlakyStore {
            inner: MemoryTransactionStore::new(),
            failures_left: AtomicUsize::new(1),
        });
        let service = PaymentService::new(Arc::new(AcceptingProvider), store.clone());

        service.initiate(request()).await.unwrap();
        assert!(store.inner.find_by_checkout_id("ws_CO_1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_persistent_write_failure_still_returns_correlation() {
        let store = Arc::new(FlakyStore {
            inner: MemoryTransactionStore::new(),
            failures_left: AtomicUsize::new(5),
        });
        let service = PaymentService::new(Arc::new(AcceptingProvider), store.clone());

        let response = service.initiate(request()).await.unwrap();
        assert_eq!(response.correlation.checkout_request_id, "ws_CO_1");
        assert!(store.inner.is_empty().await);
    }
}
