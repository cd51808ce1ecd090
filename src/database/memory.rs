//! In-process transaction store
//!
//! Used by the test suites and for local development without Postgres. A single
//! mutex guards the map, which makes every check-and-write atomic.

use crate::database::error::DbResult;
use crate::database::repository::{
    CallbackEvent, NewPendingTransaction, TerminalOutcome, TerminalStatus, TransactionRecord,
    TransactionStatus, TransactionStore, TransitionOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryTransactionStore {
    records: Mutex<HashMap<String, TransactionRecord>>,
    events: Mutex<Vec<CallbackEvent>>,
}

impl MemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    pub async fn callback_events(&self) -> Vec<CallbackEvent> {
        self.events.lock().await.clone()
    }

    /// Insert a record as-is. Test setup only needs this to backdate records.
    pub async fn insert_record(&self, record: TransactionRecord) {
        self.records
            .lock()
            .await
            .insert(record.checkout_request_id.clone(), record);
    }
}

fn record_from_outcome(outcome: &TerminalOutcome, now: DateTime<Utc>) -> TransactionRecord {
    TransactionRecord {
        checkout_request_id: outcome.checkout_request_id.clone(),
        transaction_id: Uuid::new_v4(),
        merchant_request_id: outcome.merchant_request_id.clone(),
        status: outcome.status.into(),
        phone: None,
        amount: outcome.amount.clone(),
        purpose: None,
        payer_name: None,
        payer_email: None,
        result_code: Some(outcome.result_code),
        result_desc: Some(outcome.result_desc.clone()),
        receipt_number: outcome.receipt_number.clone(),
        provider_transaction_time: outcome.provider_transaction_time.clone(),
        payer_phone: outcome.payer_phone.clone(),
        resolved_by: Some(outcome.source),
        sweep_attempts: 0,
        last_swept_at: None,
        created_at: now,
        updated_at: now,
        completed_at: Some(now),
    }
}

fn finalize(record: &mut TransactionRecord, outcome: &TerminalOutcome, now: DateTime<Utc>) {
    record.status = outcome.status.into();
    if outcome.amount.is_some() {
        record.amount = outcome.amount.clone();
    }
    record.result_code = Some(outcome.result_code);
    record.result_desc = Some(outcome.result_desc.clone());
    record.receipt_number = outcome.receipt_number.clone();
    record.provider_transaction_time = outcome.provider_transaction_time.clone();
    record.payer_phone = outcome.payer_phone.clone();
    record.resolved_by = Some(outcome.source);
    record.updated_at = now;
    record.completed_at = Some(now);
}

/// A completed record settled by a status query has no receipt; a later
/// callback for the same payment may still supply it.
fn backfill_receipt(record: &mut TransactionRecord, outcome: &TerminalOutcome, now: DateTime<Utc>) {
    if record.status == TransactionStatus::Completed
        && outcome.status == TerminalStatus::Completed
        && record.receipt_number.is_none()
        && outcome.receipt_number.is_some()
    {
        record.receipt_number = outcome.receipt_number.clone();
        record.provider_transaction_time = outcome.provider_transaction_time.clone();
        record.payer_phone = outcome.payer_phone.clone();
        record.updated_at = now;
    }
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn create_pending(
        &self,
        pending: &NewPendingTransaction,
    ) -> DbResult<TransactionRecord> {
        let now = Utc::now();
        let mut records = self.records.lock().await;

        let record = records
            .entry(pending.checkout_request_id.clone())
            .and_modify(|existing| {
                existing.transaction_id = pending.transaction_id;
                existing.phone = existing.phone.take().or_else(|| Some(pending.phone.clone()));
                existing.amount = existing.amount.take().or_else(|| Some(pending.amount.clone()));
                existing.purpose = Some(pending.purpose.clone());
                existing.payer_name = Some(pending.payer_name.clone());
                existing.payer_email = pending.payer_email.clone();
                existing.updated_at = now;
            })
            .or_insert_with(|| TransactionRecord {
                checkout_request_id: pending.checkout_request_id.clone(),
                transaction_id: pending.transaction_id,
                merchant_request_id: pending.merchant_request_id.clone(),
                status: TransactionStatus::Pending,
                phone: Some(pending.phone.clone()),
                amount: Some(pending.amount.clone()),
                purpose: Some(pending.purpose.clone()),
                payer_name: Some(pending.payer_name.clone()),
                payer_email: pending.payer_email.clone(),
                result_code: None,
                result_desc: None,
                receipt_number: None,
                provider_transaction_time: None,
                payer_phone: None,
                resolved_by: None,
                sweep_attempts: 0,
                last_swept_at: None,
                created_at: now,
                updated_at: now,
                completed_at: None,
            });

        Ok(record.clone())
    }

    async fn find_by_checkout_id(
        &self,
        checkout_request_id: &str,
    ) -> DbResult<Option<TransactionRecord>> {
        Ok(self.records.lock().await.get(checkout_request_id).cloned())
    }

    async fn apply_outcome(&self, outcome: &TerminalOutcome) -> DbResult<TransitionOutcome> {
        let now = Utc::now();
        let mut records = self.records.lock().await;

        match records.get_mut(&outcome.checkout_request_id) {
            Some(record) if record.status == TransactionStatus::Pending => {
                finalize(record, outcome, now);
                Ok(TransitionOutcome::Applied(record.clone()))
            }
            Some(record) => {
                backfill_receipt(record, outcome, now);
                Ok(TransitionOutcome::AlreadyFinal(record.clone()))
            }
            None => {
                let record = record_from_outcome(outcome, now);
                records.insert(record.checkout_request_id.clone(), record.clone());
                Ok(TransitionOutcome::Inserted(record))
            }
        }
    }

    async fn find_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> DbResult<Vec<TransactionRecord>> {
        let records = self.records.lock().await;
        let mut stale: Vec<TransactionRecord> = records
            .values()
            .filter(|r| {
                r.status == TransactionStatus::Pending
                    && r.created_at < older_than
                    && r.sweep_attempts < max_attempts
            })
            .cloned()
            .collect();
        // None sorts before Some: never-swept records lead.
        stale.sort_by_key(|r| (r.last_swept_at, r.created_at));
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn record_sweep_attempt(&self, checkout_request_id: &str) -> DbResult<Option<i32>> {
        let now = Utc::now();
        let mut records = self.records.lock().await;

        Ok(records
            .get_mut(checkout_request_id)
            .filter(|r| r.status == TransactionStatus::Pending)
            .map(|record| {
                record.sweep_attempts += 1;
                record.last_swept_at = Some(now);
                record.updated_at = now;
                record.sweep_attempts
            }))
    }

    async fn record_callback_event(&self, event: &CallbackEvent) -> DbResult<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repository::OutcomeSource;
    use chrono::Duration;
    use std::sync::Arc;

    fn pending(checkout: &str) -> NewPendingTransaction {
        NewPendingTransaction {
            transaction_id: Uuid::new_v4(),
            checkout_request_id: checkout.to_string(),
            merchant_request_id: "29115-34620561-1".to_string(),
            phone: "254712345678".to_string(),
            amount: "500".to_string(),
            purpose: "Tithe".to_string(),
            payer_name: "Jane".to_string(),
            payer_email: None,
        }
    }

    fn completed(checkout: &str, receipt: Option<&str>, source: OutcomeSource) -> TerminalOutcome {
        TerminalOutcome {
            checkout_request_id: checkout.to_string(),
            merchant_request_id: "29115-34620561-1".to_string(),
            status: TerminalStatus::Completed,
            result_code: 0,
            result_desc: "The service request is processed successfully.".to_string(),
            amount: Some("500".to_string()),
            receipt_number: receipt.map(str::to_string),
            provider_transaction_time: receipt.map(|_| "20191219102115".to_string()),
            payer_phone: receipt.map(|_| "254712345678".to_string()),
            source,
        }
    }

    fn cancelled(checkout: &str) -> TerminalOutcome {
        TerminalOutcome {
            checkout_request_id: checkout.to_string(),
            merchant_request_id: "29115-34620561-1".to_string(),
            status: TerminalStatus::Failed,
            result_code: 1032,
            result_desc: "Request cancelled by user".to_string(),
            amount: None,
            receipt_number: None,
            provider_transaction_time: None,
            payer_phone: None,
            source: OutcomeSource::Callback,
        }
    }

    #[tokio::test]
    async fn test_pending_then_completed() {
        let store = MemoryTransactionStore::new();
        store.create_pending(&pending("ws_CO_1")).await.unwrap();

        let outcome = store
            .apply_outcome(&completed("ws_CO_1", Some("NLJ7RT61SV"), OutcomeSource::Callback))
            .await
            .unwrap();

        assert!(matches!(outcome, TransitionOutcome::Applied(_)));
        let record = outcome.record();
        assert_eq!(record.status, TransactionStatus::Completed);
        assert_eq!(record.receipt_number.as_deref(), Some("NLJ7RT61SV"));
        assert_eq!(record.payer_name.as_deref(), Some("Jane"));
    }

    #[tokio::test]
    async fn test_terminal_state_is_sticky() {
        let store = MemoryTransactionStore::new();
        store.create_pending(&pending("ws_CO_2")).await.unwrap();
        store.apply_outcome(&cancelled("ws_CO_2")).await.unwrap();

        let second = store
            .apply_outcome(&completed("ws_CO_2", Some("NLJ7RT61SV"), OutcomeSource::Callback))
            .await
            .unwrap();

        assert!(matches!(second, TransitionOutcome::AlreadyFinal(_)));
        assert_eq!(second.record().status, TransactionStatus::Failed);
        assert_eq!(second.record().receipt_number, None);
        assert_eq!(second.record().result_code, Some(1032));
    }

    #[tokio::test]
    async fn test_outcome_before_pending_write() {
        let store = MemoryTransactionStore::new();
        let inserted = store
            .apply_outcome(&completed("ws_CO_3", Some("NLJ7RT61SV"), OutcomeSource::Callback))
            .await
            .unwrap();
        assert!(matches!(inserted, TransitionOutcome::Inserted(_)));

        let request = pending("ws_CO_3");
        let record = store.create_pending(&request).await.unwrap();

        assert_eq!(record.status, TransactionStatus::Completed);
        assert_eq!(record.transaction_id, request.transaction_id);
        assert_eq!(record.payer_name.as_deref(), Some("Jane"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_receipt_backfill_after_status_query() {
        let store = MemoryTransactionStore::new();
        store.create_pending(&pending("ws_CO_4")).await.unwrap();
        store
            .apply_outcome(&completed("ws_CO_4", None, OutcomeSource::StatusQuery))
            .await
            .unwrap();

        let late = store
            .apply_outcome(&completed("ws_CO_4", Some("NLJ7RT61SV"), OutcomeSource::Callback))
            .await
            .unwrap();

        assert!(matches!(late, TransitionOutcome::AlreadyFinal(_)));
        assert_eq!(late.record().receipt_number.as_deref(), Some("NLJ7RT61SV"));
        assert_eq!(late.record().resolved_by, Some(OutcomeSource::StatusQuery));
    }

    #[tokio::test]
    async fn test_concurrent_outcomes_apply_once() {
        let store = Arc::new(MemoryTransactionStore::new());
        store.create_pending(&pending("ws_CO_5")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let outcome = if i % 2 == 0 {
                    completed("ws_CO_5", Some("NLJ7RT61SV"), OutcomeSource::Callback)
                } else {
                    completed("ws_CO_5", None, OutcomeSource::StatusQuery)
                };
                store.apply_outcome(&outcome).await.unwrap()
            }));
        }

        let mut applied = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), TransitionOutcome::Applied(_)) {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn test_find_stale_pending() {
        let store = MemoryTransactionStore::new();
        let mut old = store.create_pending(&pending("ws_CO_old")).await.unwrap();
        old.created_at = Utc::now() - Duration::minutes(10);
        store.insert_record(old).await;
        store.create_pending(&pending("ws_CO_new")).await.unwrap();
        store.create_pending(&pending("ws_CO_done")).await.unwrap();
        store.apply_outcome(&cancelled("ws_CO_done")).await.unwrap();

        let stale = store
            .find_stale_pending(Utc::now() - Duration::minutes(5), 3, 10)
            .await
            .unwrap();

        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].checkout_request_id, "ws_CO_old");
    }

    #[tokio::test]
    async fn test_swept_records_rotate_and_retire() {
        let store = MemoryTransactionStore::new();
        for (id, age) in [("ws_CO_a", 20), ("ws_CO_b", 10)] {
            let mut record = store.create_pending(&pending(id)).await.unwrap();
            record.created_at = Utc::now() - Duration::minutes(age);
            store.insert_record(record).await;
        }
        let cutoff = Utc::now() - Duration::minutes(5);

        let first = store.find_stale_pending(cutoff, 2, 1).await.unwrap();
        assert_eq!(first[0].checkout_request_id, "ws_CO_a");
        assert_eq!(store.record_sweep_attempt("ws_CO_a").await.unwrap(), Some(1));

        let next = store.find_stale_pending(cutoff, 2, 1).await.unwrap();
        assert_eq!(next[0].checkout_request_id, "ws_CO_b");

        assert_eq!(store.record_sweep_attempt("ws_CO_a").await.unwrap(), Some(2));
        let remaining = store.find_stale_pending(cutoff, 2, 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].checkout_request_id, "ws_CO_b");
    }

    #[tokio::test]
    async fn test_sweep_attempt_ignores_settled_records() {
        let store = MemoryTransactionStore::new();
        store.create_pending(&pending("ws_CO_s")).await.unwrap();
        store.apply_outcome(&cancelled("ws_CO_s")).await.unwrap();

        assert_eq!(store.record_sweep_attempt("ws_CO_s").await.unwrap(), None);
        assert_eq!(store.record_sweep_attempt("ws_CO_missing").await.unwrap(), None);
    }
}
