use crate::database::error::DbResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Persisted lifecycle of one STK push.
///
/// A push is `Initiated` only between provider acceptance and the first write,
/// so that state never reaches storage. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Completed | TransactionStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn from_db_status(status: &str) -> Option<Self> {
        match status {
            "pending" => Some(TransactionStatus::Pending),
            "completed" => Some(TransactionStatus::Completed),
            "failed" => Some(TransactionStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two states a pending record may move to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Completed,
    Failed,
}

impl From<TerminalStatus> for TransactionStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Completed => TransactionStatus::Completed,
            TerminalStatus::Failed => TransactionStatus::Failed,
        }
    }
}

/// Which path observed the terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeSource {
    Callback,
    StatusQuery,
}

impl OutcomeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeSource::Callback => "callback",
            OutcomeSource::StatusQuery => "status_query",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "callback" => Some(OutcomeSource::Callback),
            "status_query" => Some(OutcomeSource::StatusQuery),
            _ => None,
        }
    }
}

/// Durable record of one STK push, keyed by checkout request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub checkout_request_id: String,
    pub transaction_id: Uuid,
    pub merchant_request_id: String,
    pub status: TransactionStatus,
    pub phone: Option<String>,
    /// Whole shillings, kept as text like every other amount in the store
    pub amount: Option<String>,
    pub purpose: Option<String>,
    pub payer_name: Option<String>,
    pub payer_email: Option<String>,
    pub result_code: Option<i64>,
    pub result_desc: Option<String>,
    pub receipt_number: Option<String>,
    pub provider_transaction_time: Option<String>,
    pub payer_phone: Option<String>,
    pub resolved_by: Option<OutcomeSource>,
    /// Status queries issued by the pending sweep
    pub sweep_attempts: i32,
    pub last_swept_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Everything known about a push at the moment the provider accepts it.
#[derive(Debug, Clone)]
pub struct NewPendingTransaction {
    pub transaction_id: Uuid,
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    pub phone: String,
    pub amount: String,
    pub purpose: String,
    pub payer_name: String,
    pub payer_email: Option<String>,
}

/// A terminal observation from either the callback or a status query.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalOutcome {
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    pub status: TerminalStatus,
    pub result_code: i64,
    pub result_desc: String,
    pub amount: Option<String>,
    pub receipt_number: Option<String>,
    pub provider_transaction_time: Option<String>,
    pub payer_phone: Option<String>,
    pub source: OutcomeSource,
}

/// Result of applying a [`TerminalOutcome`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// A pending record moved to its terminal state.
    Applied(TransactionRecord),
    /// No record existed yet (the outcome raced ahead of the pending write);
    /// a terminal record was created from the outcome alone.
    Inserted(TransactionRecord),
    /// The record was already terminal. Nothing changed except, at most, a
    /// receipt backfill on a completed record that had none.
    AlreadyFinal(TransactionRecord),
}

impl TransitionOutcome {
    pub fn record(&self) -> &TransactionRecord {
        match self {
            TransitionOutcome::Applied(r)
            | TransitionOutcome::Inserted(r)
            | TransitionOutcome::AlreadyFinal(r) => r,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TransitionOutcome::Applied(_) => "applied",
            TransitionOutcome::Inserted(_) => "inserted",
            TransitionOutcome::AlreadyFinal(_) => "duplicate",
        }
    }
}

/// Raw inbound callback kept for operator follow-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackEvent {
    pub id: Uuid,
    pub checkout_request_id: Option<String>,
    pub outcome: String,
    pub error: Option<String>,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

impl CallbackEvent {
    pub fn new(
        checkout_request_id: Option<String>,
        outcome: impl Into<String>,
        error: Option<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            checkout_request_id,
            outcome: outcome.into(),
            error,
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// Durable store of payment outcomes.
///
/// Implementations guarantee that a checkout request id leaves `Pending` at
/// most once, even under concurrent writers. The check and the write must be
/// a single atomic step (compare-and-set or a conditional upsert), never a
/// read followed by a write.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Record a push the provider has just accepted.
    ///
    /// If an outcome already created the record, the payer details are filled
    /// in and the terminal status is kept.
    async fn create_pending(&self, pending: &NewPendingTransaction)
        -> DbResult<TransactionRecord>;

    async fn find_by_checkout_id(
        &self,
        checkout_request_id: &str,
    ) -> DbResult<Option<TransactionRecord>>;

    /// Move a record to its terminal state, or upsert it if missing.
    async fn apply_outcome(&self, outcome: &TerminalOutcome) -> DbResult<TransitionOutcome>;

    /// Pending records created before `older_than` and swept fewer than
    /// `max_attempts` times. Never-swept records come first, then the least
    /// recently swept, so records the provider cannot resolve rotate out of
    /// the batch.
    async fn find_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> DbResult<Vec<TransactionRecord>>;

    /// Count one sweep of a pending record. Returns the attempts so far, or
    /// `None` when the record is missing or no longer pending.
    async fn record_sweep_attempt(&self, checkout_request_id: &str) -> DbResult<Option<i32>>;

    async fn record_callback_event(&self, event: &CallbackEvent) -> DbResult<()>;
}
