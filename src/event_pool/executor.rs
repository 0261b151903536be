//! Transfer execution stage
//!
//! Runs only for the worker that won `checking → approved`, so the ledger sees
//! each record at most once (plus bounded re-attempts of transient errors).

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::adapters::TransferExecutor;
use super::channel::TerminalNotifier;
use super::error::{ExecutionError, PoolResult};
use super::state::TransferStatus;
use super::store::TransferStore;
use super::types::{ExecutionRequest, Metadata, PendingTransfer, RejectReason, meta_keys, now_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Rejected(RejectReason),
    /// Ledger call succeeded but the record was settled elsewhere first
    CompletionLost,
    /// The record left APPROVED before the outcome could be written
    Superseded,
}

pub struct ExecutionStage {
    store: Arc<dyn TransferStore>,
    executor: Arc<dyn TransferExecutor>,
    notifier: TerminalNotifier,
    attempts: u32,
    pause: Duration,
}

impl ExecutionStage {
    /// `attempts` counts every call to the ledger; `pause` is the wait before
    /// re-attempting a transient error.
    pub fn new(
        store: Arc<dyn TransferStore>,
        executor: Arc<dyn TransferExecutor>,
        notifier: TerminalNotifier,
        attempts: u32,
        pause: Duration,
    ) -> Self {
        Self {
            store,
            executor,
            notifier,
            attempts: attempts.max(1),
            pause,
        }
    }

    /// Execute an APPROVED record and settle it
    pub async fn run(&self, record: &PendingTransfer) -> PoolResult<ExecutionOutcome> {
        if record.is_expired_at(now_ms()) {
            warn!(transfer_id = %record.id, "Approved record expired before execution");
            return self
                .reject(record, RejectReason::Expired, Metadata::new())
                .await;
        }

        let req = ExecutionRequest::from(record);
        match self.call_ledger(&req).await {
            Ok(()) => self.complete(record).await,
            Err(e) => {
                warn!(
                    transfer_id = %record.id,
                    executor = self.executor.name(),
                    error = %e,
                    "Transfer execution failed"
                );
                let mut detail = Metadata::new();
                detail.insert(meta_keys::EXECUTION_ERROR.to_string(), e.to_string());
                detail.insert(meta_keys::EXECUTION_ERROR_KIND.to_string(), e.kind().to_string());
                self.reject(record, RejectReason::ExecutionFailed, detail).await
            }
        }
    }

    async fn call_ledger(&self, req: &ExecutionRequest) -> Result<(), ExecutionError> {
        let mut attempt = 1;
        loop {
            match self.executor.execute(req).await {
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    warn!(
                        transfer_id = %req.id,
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "Transient execution error, re-attempting"
                    );
                    tokio::time::sleep(self.pause).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn complete(&self, record: &PendingTransfer) -> PoolResult<ExecutionOutcome> {
        if self
            .store
            .compare_and_set_status(record.id, TransferStatus::Approved, TransferStatus::Completed)
            .await?
        {
            info!(
                transfer_id = %record.id,
                scope = %record.scope,
                amount = record.amount,
                "Transfer completed"
            );
            self.notifier.completed(record.id, &record.scope);
            return Ok(ExecutionOutcome::Completed);
        }

        // Funds moved but the record reads otherwise
        let current = self.store.get(record.id).await?;
        error!(
            transfer_id = %record.id,
            status = %current.status,
            reason = ?current.reason,
            amount = record.amount,
            "Transfer executed but completion was not recorded, needs reconciliation"
        );
        Ok(ExecutionOutcome::CompletionLost)
    }

    async fn reject(
        &self,
        record: &PendingTransfer,
        reason: RejectReason,
        detail: Metadata,
    ) -> PoolResult<ExecutionOutcome> {
        if self
            .store
            .reject(record.id, TransferStatus::Approved, reason, detail)
            .await?
        {
            info!(transfer_id = %record.id, %reason, "Transfer rejected");
            self.notifier.rejected(record.id, &record.scope, reason);
            Ok(ExecutionOutcome::Rejected(reason))
        } else {
            Ok(ExecutionOutcome::Superseded)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_pool::adapters::RecordingExecutor;
    use crate::event_pool::store::{CreatePolicy, MemoryStore};
    use crate::event_pool::types::NewTransfer;

    async fn approved(store: &MemoryStore) -> PendingTransfer {
        let record = store
            .create(
                NewTransfer::new("g1", "u1", "u2", 75, Duration::from_secs(60)),
                &CreatePolicy::default(),
            )
            .await
            .unwrap();
        for (from, to) in [
            (TransferStatus::Pending, TransferStatus::Checking),
            (TransferStatus::Checking, TransferStatus::Approved),
        ] {
            assert!(store.compare_and_set_status(record.id, from, to).await.unwrap());
        }
        store.get(record.id).await.unwrap()
    }

    fn stage(store: Arc<MemoryStore>, executor: Arc<RecordingExecutor>, attempts: u32) -> ExecutionStage {
        ExecutionStage::new(
            store,
            executor,
            TerminalNotifier::new(8),
            attempts,
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn test_successful_execution_completes() {
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(RecordingExecutor::new());
        let record = approved(&store).await;

        let outcome = stage(store.clone(), executor.clone(), 1).run(&record).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);
        assert_eq!(store.get(record.id).await.unwrap().status, TransferStatus::Completed);
        assert_eq!(executor.executions_for(record.id), 1);
    }

    #[tokio::test]
    async fn test_failed_execution_rejects_with_error_detail() {
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(RecordingExecutor::new());
        executor.fail_with(ExecutionError::InsufficientFunds);
        let record = approved(&store).await;

        let outcome = stage(store.clone(), executor, 1).run(&record).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Rejected(RejectReason::ExecutionFailed));

        let stored = store.get(record.id).await.unwrap();
        assert_eq!(stored.reason, Some(RejectReason::ExecutionFailed));
        assert_eq!(
            stored.metadata.get(meta_keys::EXECUTION_ERROR_KIND).map(String::as_str),
            Some(ExecutionError::InsufficientFunds.kind())
        );
        assert!(stored.metadata.contains_key(meta_keys::EXECUTION_ERROR));
    }

    #[tokio::test]
    async fn test_transient_errors_reattempted_only_when_configured() {
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(RecordingExecutor::new());

        executor.fail_transiently(1);
        let single = approved(&store).await;
        let outcome = stage(store.clone(), executor.clone(), 1).run(&single).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Rejected(RejectReason::ExecutionFailed));

        executor.fail_transiently(2);
        let retried = approved(&store).await;
        let outcome = stage(store.clone(), executor.clone(), 3).run(&retried).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);
        assert_eq!(executor.executions_for(retried.id), 3);
    }

    #[tokio::test]
    async fn test_expired_approved_record_is_not_executed() {
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(RecordingExecutor::new());
        let mut record = approved(&store).await;
        record.expires_at = now_ms() - 1;

        let outcome = stage(store.clone(), executor.clone(), 1).run(&record).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Rejected(RejectReason::Expired));
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test]
    async fn test_completion_lost_to_reaper() {
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(RecordingExecutor::new());
        executor.set_delay(Duration::from_millis(30));
        let record = approved(&store).await;

        let stage = Arc::new(stage(store.clone(), executor, 1));
        let run = tokio::spawn({
            let stage = stage.clone();
            let record = record.clone();
            async move { stage.run(&record).await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        store
            .reject(record.id, TransferStatus::Approved, RejectReason::Expired, Metadata::new())
            .await
            .unwrap();

        assert_eq!(run.await.unwrap(), ExecutionOutcome::CompletionLost);
    }
}
