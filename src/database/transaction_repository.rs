use crate::database::error::{DatabaseError, DatabaseErrorKind, DbResult};
use crate::database::repository::{
    CallbackEvent, NewPendingTransaction, OutcomeSource, TerminalOutcome, TerminalStatus,
    TransactionRecord, TransactionStatus, TransactionStore, TransitionOutcome,
};
use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use tracing::debug;
use uuid::Uuid;

const COLUMNS: &str = "checkout_request_id, transaction_id, merchant_request_id, status, phone, \
     amount, purpose, payer_name, payer_email, result_code, result_desc, receipt_number, \
     provider_transaction_time, payer_phone, resolved_by, sweep_attempts, last_swept_at, \
     created_at, updated_at, completed_at";

/// Row shape of `mpesa_transactions`
#[derive(Debug, Clone, FromRow)]
pub struct TransactionRow {
    pub checkout_request_id: String,
    pub transaction_id: Uuid,
    pub merchant_request_id: String,
    pub status: String,
    pub phone: Option<String>,
    pub amount: Option<String>,
    pub purpose: Option<String>,
    pub payer_name: Option<String>,
    pub payer_email: Option<String>,
    pub result_code: Option<i64>,
    pub result_desc: Option<String>,
    pub receipt_number: Option<String>,
    pub provider_transaction_time: Option<String>,
    pub payer_phone: Option<String>,
    pub resolved_by: Option<String>,
    pub sweep_attempts: i32,
    pub last_swept_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, FromRow)]
struct UpsertRow {
    #[sqlx(flatten)]
    row: TransactionRow,
    inserted: bool,
}

impl TryFrom<TransactionRow> for TransactionRecord {
    type Error = DatabaseError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let status = TransactionStatus::from_db_status(&row.status).ok_or_else(|| {
            DatabaseError::new(DatabaseErrorKind::Unknown {
                message: format!("Unknown transaction status '{}'", row.status),
            })
            .with_context(row.checkout_request_id.clone())
        })?;

        Ok(TransactionRecord {
            checkout_request_id: row.checkout_request_id,
            transaction_id: row.transaction_id,
            merchant_request_id: row.merchant_request_id,
            status,
            phone: row.phone,
            amount: row.amount,
            purpose: row.purpose,
            payer_name: row.payer_name,
            payer_email: row.payer_email,
            result_code: row.result_code,
            result_desc: row.result_desc,
            receipt_number: row.receipt_number,
            provider_transaction_time: row.provider_transaction_time,
            payer_phone: row.payer_phone,
            resolved_by: row.resolved_by.as_deref().and_then(OutcomeSource::from_db),
            sweep_attempts: row.sweep_attempts,
            last_swept_at: row.last_swept_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

/// Postgres-backed store for M-Pesa transactions and callback events.
///
/// `checkout_request_id` is the primary key, so both the pending write and
/// the terminal transition are single `INSERT ... ON CONFLICT` statements.
pub struct TransactionRepository {
    pool: PgPool,
}

impl TransactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fill in the receipt of a completed record that was settled without one.
    async fn backfill_receipt(&self, outcome: &TerminalOutcome) -> DbResult<Option<TransactionRow>> {
        sqlx::query_as::<_, TransactionRow>(&format!(
            "UPDATE mpesa_transactions
             SET receipt_number = $2, provider_transaction_time = $3, payer_phone = $4,
                 updated_at = NOW()
             WHERE checkout_request_id = $1 AND status = 'completed' AND receipt_number IS NULL
             RETURNING {COLUMNS}"
        ))
        .bind(&outcome.checkout_request_id)
        .bind(&outcome.receipt_number)
        .bind(&outcome.provider_transaction_time)
        .bind(&outcome.payer_phone)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn require_by_checkout_id(&self, checkout_request_id: &str) -> DbResult<TransactionRecord> {
        self.find_by_checkout_id(checkout_request_id)
            .await?
            .ok_or_else(|| {
                DatabaseError::new(DatabaseErrorKind::NotFound {
                    entity: "MpesaTransaction".to_string(),
                    id: checkout_request_id.to_string(),
                })
            })
    }
}

#[async_trait]
impl TransactionStore for TransactionRepository {
    async fn create_pending(
        &self,
        pending: &NewPendingTransaction,
    ) -> DbResult<TransactionRecord> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "INSERT INTO mpesa_transactions
             (checkout_request_id, transaction_id, merchant_request_id, status, phone, amount,
              purpose, payer_name, payer_email, created_at, updated_at)
             VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7, $8, NOW(), NOW())
             ON CONFLICT (checkout_request_id) DO UPDATE
             SET transaction_id = EXCLUDED.transaction_id,
                 phone = COALESCE(mpesa_transactions.phone, EXCLUDED.phone),
                 amount = COALESCE(mpesa_transactions.amount, EXCLUDED.amount),
                 purpose = EXCLUDED.purpose,
                 payer_name = EXCLUDED.payer_name,
                 payer_email = EXCLUDED.payer_email,
                 updated_at = NOW()
             RETURNING {COLUMNS}"
        ))
        .bind(&pending.checkout_request_id)
        .bind(pending.transaction_id)
        .bind(&pending.merchant_request_id)
        .bind(&pending.phone)
        .bind(&pending.amount)
        .bind(&pending.purpose)
        .bind(&pending.payer_name)
        .bind(&pending.payer_email)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        row.try_into()
    }

    async fn find_by_checkout_id(
        &self,
        checkout_request_id: &str,
    ) -> DbResult<Option<TransactionRecord>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {COLUMNS} FROM mpesa_transactions WHERE checkout_request_id = $1"
        ))
        .bind(checkout_request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        row.map(TransactionRecord::try_from).transpose()
    }

    async fn apply_outcome(&self, outcome: &TerminalOutcome) -> DbResult<TransitionOutcome> {
        let status: TransactionStatus = outcome.status.into();

        // The WHERE clause on the conflict arm is the compare-and-set: a
        // concurrent writer that already left 'pending' makes this a no-op.
        let upserted = sqlx::query_as::<_, UpsertRow>(&format!(
            "INSERT INTO mpesa_transactions
             (checkout_request_id, transaction_id, merchant_request_id, status, amount,
              result_code, result_desc, receipt_number, provider_transaction_time, payer_phone,
              resolved_by, created_at, updated_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW(), NOW())
             ON CONFLICT (checkout_request_id) DO UPDATE
             SET status = EXCLUDED.status,
                 amount = COALESCE(EXCLUDED.amount, mpesa_transactions.amount),
                 result_code = EXCLUDED.result_code,
                 result_desc = EXCLUDED.result_desc,
                 receipt_number = EXCLUDED.receipt_number,
                 provider_transaction_time = EXCLUDED.provider_transaction_time,
                 payer_phone = EXCLUDED.payer_phone,
                 resolved_by = EXCLUDED.resolved_by,
                 updated_at = NOW(),
                 completed_at = NOW()
             WHERE mpesa_transactions.status = 'pending'
             RETURNING {COLUMNS}, (xmax = 0) AS inserted"
        ))
        .bind(&outcome.checkout_request_id)
        .bind(Uuid::new_v4())
        .bind(&outcome.merchant_request_id)
        .bind(status.as_str())
        .bind(&outcome.amount)
        .bind(outcome.result_code)
        .bind(&outcome.result_desc)
        .bind(&outcome.receipt_number)
        .bind(&outcome.provider_transaction_time)
        .bind(&outcome.payer_phone)
        .bind(outcome.source.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if let Some(UpsertRow { row, inserted }) = upserted {
            let record = TransactionRecord::try_from(row)?;
            return Ok(if inserted {
                TransitionOutcome::Inserted(record)
            } else {
                TransitionOutcome::Applied(record)
            });
        }

        debug!(
            checkout_request_id = %outcome.checkout_request_id,
            "Transaction already final, ignoring outcome"
        );

        if outcome.status == TerminalStatus::Completed && outcome.receipt_number.is_some() {
            if let Some(row) = self.backfill_receipt(outcome).await? {
                return Ok(TransitionOutcome::AlreadyFinal(row.try_into()?));
            }
        }

        let current = self
            .require_by_checkout_id(&outcome.checkout_request_id)
            .await?;
        Ok(TransitionOutcome::AlreadyFinal(current))
    }

    async fn find_stale_pending(
        &self,
        older_than: chrono::DateTime<chrono::Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> DbResult<Vec<TransactionRecord>> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {COLUMNS} FROM mpesa_transactions
             WHERE status = 'pending' AND created_at < $1 AND sweep_attempts < $2
             ORDER BY last_swept_at ASC NULLS FIRST, created_at ASC LIMIT $3"
        ))
        .bind(older_than)
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        rows.into_iter().map(TransactionRecord::try_from).collect()
    }

    async fn record_sweep_attempt(&self, checkout_request_id: &str) -> DbResult<Option<i32>> {
        sqlx::query_scalar::<_, i32>(
            "UPDATE mpesa_transactions
             SET sweep_attempts = sweep_attempts + 1, last_swept_at = NOW(), updated_at = NOW()
             WHERE checkout_request_id = $1 AND status = 'pending'
             RETURNING sweep_attempts",
        )
        .bind(checkout_request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn record_callback_event(&self, event: &CallbackEvent) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO mpesa_callback_events
             (id, checkout_request_id, outcome, error, payload, received_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(event.id)
        .bind(&event.checkout_request_id)
        .bind(&event.outcome)
        .bind(&event.error)
        .bind(&event.payload)
        .bind(event.received_at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str) -> TransactionRow {
        TransactionRow {
            checkout_request_id: "ws_CO_191220191020363925".to_string(),
            transaction_id: Uuid::new_v4(),
            merchant_request_id: "29115-34620561-1".to_string(),
            status: status.to_string(),
            phone: Some("254712345678".to_string()),
            amount: Some("500".to_string()),
            purpose: Some("Tithe".to_string()),
            payer_name: Some("Jane".to_string()),
            payer_email: None,
            result_code: None,
            result_desc: None,
            receipt_number: None,
            provider_transaction_time: None,
            payer_phone: None,
            resolved_by: Some("status_query".to_string()),
            sweep_attempts: 0,
            last_swept_at: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn test_row_conversion() {
        let record = TransactionRecord::try_from(row("pending")).unwrap();
        assert_eq!(record.status, TransactionStatus::Pending);
        assert_eq!(record.resolved_by, Some(OutcomeSource::StatusQuery));
    }

    #[test]
    fn test_row_conversion_rejects_unknown_status() {
        let err = TransactionRecord::try_from(row("processing")).unwrap_err();
        assert!(err.to_string().contains("processing"));
    }

    #[tokio::test]
    #[ignore] // Requires database running
    async fn test_outcome_applies_once() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = crate::database::init_pool(&url, None).await.unwrap();
        crate::database::ensure_schema(&pool).await.unwrap();
        let repo = TransactionRepository::new(pool);

        let checkout = format!("ws_CO_test_{}", Uuid::new_v4());
        repo.create_pending(&NewPendingTransaction {
            transaction_id: Uuid::new_v4(),
            checkout_request_id: checkout.clone(),
            merchant_request_id: "29115-34620561-1".to_string(),
            phone: "254712345678".to_string(),
            amount: "500".to_string(),
            purpose: "Tithe".to_string(),
            payer_name: "Jane".to_string(),
            payer_email: None,
        })
        .await
        .unwrap();

        let outcome = TerminalOutcome {
            checkout_request_id: checkout.clone(),
            merchant_request_id: "29115-34620561-1".to_string(),
            status: TerminalStatus::Completed,
            result_code: 0,
            result_desc: "The service request is processed successfully.".to_string(),
            amount: Some("500".to_string()),
            receipt_number: Some("NLJ7RT61SV".to_string()),
            provider_transaction_time: Some("20191219102115".to_string()),
            payer_phone: Some("254712345678".to_string()),
            source: OutcomeSource::Callback,
        };

        let first = repo.apply_outcome(&outcome).await.unwrap();
        let second = repo.apply_outcome(&outcome).await.unwrap();
        assert!(matches!(first, TransitionOutcome::Applied(_)));
        assert!(matches!(second, TransitionOutcome::AlreadyFinal(_)));
    }
}
