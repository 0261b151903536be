//! Event Listener
//!
//! Consumes predicate results, merges them into the store and routes the
//! consequences: a fresh failure to the retry coordinator, a complete set of
//! passes to the approval CAS. Out-of-round events are dropped. A redelivery
//! that finds its round settled but never acted on (the process died or the
//! store failed between the merge and the next step) resumes that step.

use std::sync::Arc;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::channel::{EventSubscriber, PoolEvent};
use super::error::{PoolError, PoolResult};
use super::executor::{ExecutionOutcome, ExecutionStage};
use super::retry::{RetryCoordinator, RetryDecision};
use super::state::TransferStatus;
use super::store::TransferStore;
use super::types::{CheckOutcome, PendingTransfer, Predicate};

/// What handling one event did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Stale round, duplicate, terminal record, or approval already taken
    Ignored,
    Merged,
    Retry(RetryDecision),
    Executed(ExecutionOutcome),
}

pub struct EventListener {
    store: Arc<dyn TransferStore>,
    retry: Arc<RetryCoordinator>,
    execution: Arc<ExecutionStage>,
    concurrency: usize,
}

impl EventListener {
    pub fn new(
        store: Arc<dyn TransferStore>,
        retry: Arc<RetryCoordinator>,
        execution: Arc<ExecutionStage>,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            retry,
            execution,
            concurrency: concurrency.max(1),
        }
    }

    /// Consume events until shutdown or until every publisher is gone, then
    /// wait for in-flight handlers.
    pub async fn run(self: Arc<Self>, mut subscriber: EventSubscriber, mut shutdown: watch::Receiver<bool>) {
        info!(concurrency = self.concurrency, "Starting event listener");
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Event handler panicked");
                    }
                }
                event = subscriber.recv() => {
                    let Some(event) = event else {
                        info!("Event channel closed");
                        break;
                    };
                    let Ok(permit) = permits.clone().acquire_owned().await else {
                        break;
                    };
                    let listener = self.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        let id = event.id();
                        match listener.handle(event).await {
                            Ok(handled) => debug!(transfer_id = %id, ?handled, "Event handled"),
                            Err(PoolError::NotFound(_)) => {
                                warn!(transfer_id = %id, "Event for unknown transfer dropped")
                            }
                            Err(e) => error!(transfer_id = %id, error = %e, "Event handling failed"),
                        }
                    });
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Event handler panicked");
            }
        }
        info!("Event listener stopped");
    }

    pub async fn handle(&self, event: PoolEvent) -> PoolResult<Handled> {
        match event {
            PoolEvent::PredicateResult {
                id,
                predicate,
                outcome,
                round,
                hard,
            } => {
                let merge = self
                    .store
                    .set_check_result(id, predicate, outcome, round)
                    .await?;
                if !merge.changed {
                    if merge.record.retry_count != round {
                        debug!(transfer_id = %id, %predicate, round, "Stale check result dropped");
                        return Ok(Handled::Ignored);
                    }
                    let resumed = self.resume(&merge.record, Some((predicate, hard))).await?;
                    if resumed.is_none() {
                        debug!(transfer_id = %id, %predicate, round, "Check result caused no change");
                    }
                    return Ok(resumed.unwrap_or(Handled::Ignored));
                }

                match outcome {
                    CheckOutcome::Fail => {
                        let decision = self.retry.on_failure(&merge.record, predicate, hard).await?;
                        Ok(Handled::Retry(decision))
                    }
                    CheckOutcome::Pass if merge.record.checks.all_passed() => {
                        self.approve(&merge.record).await
                    }
                    _ => Ok(Handled::Merged),
                }
            }
            PoolEvent::AllChecksPassed { id } => {
                let record = self.store.get(id).await?;
                if record.status != TransferStatus::Checking || !record.checks.all_passed() {
                    debug!(
                        transfer_id = %id,
                        status = %record.status,
                        "All-checks-passed signal does not match stored checks"
                    );
                    return Ok(Handled::Ignored);
                }
                self.approve(&record).await
            }
        }
    }

    /// Run the step a settled round still owes: a retry for a failure whose
    /// round never advanced, or the approval for a full set of passes. Returns
    /// None while the round is still open.
    ///
    /// Safe to repeat; the round guard on `increment_retry` and the approval
    /// CAS turn a step that already happened into a no-op. `report` is the
    /// predicate result that found the round settled, if any.
    pub async fn resume(
        &self,
        record: &PendingTransfer,
        report: Option<(Predicate, bool)>,
    ) -> PoolResult<Option<Handled>> {
        if record.status != TransferStatus::Checking {
            return Ok(None);
        }

        let failed = record.checks.failed();
        if let Some(&first) = failed.first() {
            let (predicate, hard) = match report {
                Some((p, hard)) if failed.contains(&p) => (p, hard),
                _ => (first, false),
            };
            let decision = self.retry.on_failure(record, predicate, hard).await?;
            if decision == RetryDecision::Superseded {
                return Ok(Some(Handled::Ignored));
            }
            warn!(
                transfer_id = %record.id,
                %predicate,
                round = record.retry_count,
                ?decision,
                "Resumed failed round that had no retry"
            );
            return Ok(Some(Handled::Retry(decision)));
        }

        if record.checks.all_passed() {
            return self.approve(record).await.map(Some);
        }
        Ok(None)
    }

    async fn approve(&self, record: &PendingTransfer) -> PoolResult<Handled> {
        if !self
            .store
            .compare_and_set_status(record.id, TransferStatus::Checking, TransferStatus::Approved)
            .await?
        {
            debug!(transfer_id = %record.id, "Approval already taken or record expired");
            return Ok(Handled::Ignored);
        }

        info!(transfer_id = %record.id, retry_count = record.retry_count, "Transfer approved");
        let mut approved = record.clone();
        approved.status = TransferStatus::Approved;
        let outcome = self.execution.run(&approved).await?;
        Ok(Handled::Executed(outcome))
    }
}
