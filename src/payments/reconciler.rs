//! Status reconciliation
//!
//! Answers "what happened to this push?" synchronously. Terminal records are
//! answered from the store; otherwise the provider is queried and a terminal
//! answer is written with the same conditional transition the callback uses.
//! [`PendingSweeper`] runs the same path for records whose callback never came.

use crate::database::{
    OutcomeSource, TerminalOutcome, TerminalStatus, TransactionRecord, TransactionStatus,
    TransactionStore,
};
use crate::error::{AppError, AppResult, ValidationError};
use crate::payments::providers::mpesa::config::parse_var;
use crate::payments::traits::PaymentProvider;
use crate::payments::types::{ProviderState, ProviderStatus};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Where a status answer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusSource {
    Store,
    Provider,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub checkout_request_id: String,
    pub status: TransactionStatus,
    pub result_code: Option<i64>,
    pub result_desc: Option<String>,
    pub receipt_number: Option<String>,
    pub source: StatusSource,
}

impl StatusReport {
    fn from_record(record: &TransactionRecord, source: StatusSource) -> Self {
        Self {
            checkout_request_id: record.checkout_request_id.clone(),
            status: record.status,
            result_code: record.result_code,
            result_desc: record.result_desc.clone(),
            receipt_number: record.receipt_number.clone(),
            source,
        }
    }
}

pub struct StatusReconciler {
    provider: Arc<dyn PaymentProvider>,
    store: Arc<dyn TransactionStore>,
    retry_delay: Duration,
}

impl StatusReconciler {
    pub fn new(provider: Arc<dyn PaymentProvider>, store: Arc<dyn TransactionStore>) -> Self {
        Self {
            provider,
            store,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Current status of a push, settling the record when the provider has a
    /// terminal answer.
    #[instrument(skip(self))]
    pub async fn query(&self, checkout_request_id: &str) -> AppResult<StatusReport> {
        let checkout_request_id = checkout_request_id.trim();
        if checkout_request_id.is_empty() {
            return Err(ValidationError::MissingField {
                field: "checkout_request_id",
            }
            .into());
        }

        if let Some(record) = self.store.find_by_checkout_id(checkout_request_id).await? {
            if record.status.is_terminal() {
                debug!(status = %record.status, "Answering status from store");
                return Ok(StatusReport::from_record(&record, StatusSource::Store));
            }
        }

        let status = self.query_with_retry(checkout_request_id).await?;
        self.reconcile(status).await
    }

    /// One bounded retry for retryable failures. The query is a read, so
    /// repeating it is safe.
    async fn query_with_retry(&self, checkout_request_id: &str) -> AppResult<ProviderStatus> {
        match self.provider.query_status(checkout_request_id).await {
            Ok(status) => Ok(status),
            Err(e) if e.is_retryable() => {
                warn!(
                    "Status query for {} failed, retrying in {:?}: {}",
                    checkout_request_id, self.retry_delay, e
                );
                tokio::time::sleep(self.retry_delay).await;
                self.provider.query_status(checkout_request_id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn reconcile(&self, status: ProviderStatus) -> AppResult<StatusReport> {
        let terminal = match status.state {
            ProviderState::Pending => {
                return Ok(StatusReport {
                    checkout_request_id: status.checkout_request_id,
                    status: TransactionStatus::Pending,
                    result_code: status.result_code,
                    result_desc: Some(status.description),
                    receipt_number: None,
                    source: StatusSource::Provider,
                });
            }
            ProviderState::Completed => TerminalStatus::Completed,
            ProviderState::Failed => TerminalStatus::Failed,
        };

        let outcome = TerminalOutcome {
            checkout_request_id: status.checkout_request_id.clone(),
            merchant_request_id: status.merchant_request_id.clone().unwrap_or_default(),
            status: terminal,
            result_code: status.result_code.unwrap_or_default(),
            result_desc: status.description.clone(),
            amount: None,
            receipt_number: None,
            provider_transaction_time: None,
            payer_phone: None,
            source: OutcomeSource::StatusQuery,
        };

        let transition = self.store.apply_outcome(&outcome).await?;
        let record = transition.record();
        info!(
            checkout_request_id = %record.checkout_request_id,
            status = %record.status,
            transition = transition.label(),
            "M-Pesa transaction reconciled from status query"
        );

        // A callback may have won the race; the stored state is the answer.
        Ok(StatusReport::from_record(record, StatusSource::Provider))
    }
}

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Zero disables the sweeper
    pub interval: Duration,
    /// Pending records younger than this are left for the callback
    pub stale_after: Duration,
    pub batch_size: i64,
    /// Sweeps per record before it is left for an operator
    pub max_attempts: i32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            stale_after: Duration::from_secs(90),
            batch_size: 50,
            max_attempts: 10,
        }
    }
}

impl SweeperConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();

        let config = Self {
            interval: Duration::from_secs(parse_var(
                "MPESA_SWEEP_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )?),
            stale_after: Duration::from_secs(parse_var(
                "MPESA_SWEEP_STALE_AFTER_SECS",
                defaults.stale_after.as_secs(),
            )?),
            batch_size: parse_var("MPESA_SWEEP_BATCH_SIZE", defaults.batch_size)?,
            max_attempts: parse_var("MPESA_SWEEP_MAX_ATTEMPTS", defaults.max_attempts)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.batch_size < 1 {
            return Err(AppError::configuration(
                "MPESA_SWEEP_BATCH_SIZE must be at least 1",
            ));
        }
        if self.max_attempts < 1 {
            return Err(AppError::configuration(
                "MPESA_SWEEP_MAX_ATTEMPTS must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }
}

/// Background repair of payments whose callback never arrived
pub struct PendingSweeper {
    reconciler: Arc<StatusReconciler>,
    store: Arc<dyn TransactionStore>,
    config: SweeperConfig,
}

impl PendingSweeper {
    pub fn new(
        reconciler: Arc<StatusReconciler>,
        store: Arc<dyn TransactionStore>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            reconciler,
            store,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        if !self.config.is_enabled() {
            info!("Pending sweep disabled");
            return;
        }

        info!(
            interval_secs = self.config.interval.as_secs(),
            stale_after_secs = self.config.stale_after.as_secs(),
            "Starting M-Pesa pending sweeper"
        );

        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cycle().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Pending sweeper received shutdown signal");
                        break;
                    }
                }
            }
        }

        info!("Pending sweeper stopped");
    }

    /// Reconcile one batch of stale pending records. Returns how many reached
    /// a terminal state.
    #[instrument(skip(self), name = "mpesa_pending_sweep")]
    pub async fn run_cycle(&self) -> usize {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));
        let cutoff = Utc::now() - stale_after;

        let stale = match self
            .store
            .find_stale_pending(cutoff, self.config.max_attempts, self.config.batch_size)
            .await
        {
            Ok(stale) => stale,
            Err(e) => {
                error!(error = %e, "Failed to load stale pending transactions");
                return 0;
            }
        };

        if stale.is_empty() {
            debug!("No stale pending transactions");
            return 0;
        }

        let mut settled = 0;
        for record in stale {
            let checkout_request_id = record.checkout_request_id.as_str();

            // Counted before the query so failing records move to the back.
            let attempts = match self.store.record_sweep_attempt(checkout_request_id).await {
                Ok(Some(attempts)) => attempts,
                Ok(None) => continue,
                Err(e) => {
                    warn!(checkout_request_id, "Failed to record sweep attempt: {}", e);
                    continue;
                }
            };

            match self.reconciler.query(checkout_request_id).await {
                Ok(report) if report.status.is_terminal() => {
                    settled += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => warn!(
                    checkout_request_id,
                    attempts,
                    "Sweep status query failed: {}", e
                ),
            }

            if attempts >= self.config.max_attempts {
                error!(
                    alert = "sweep_exhausted",
                    checkout_request_id,
                    transaction_id = %record.transaction_id,
                    attempts,
                    "Pending M-Pesa transaction left for manual review"
                );
            }
        }

        info!(settled, "Pending sweep cycle finished");
        settled
    }
}
