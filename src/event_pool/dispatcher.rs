//! Check Dispatcher
//!
//! Moves a record into CHECKING and submits every outstanding predicate to the
//! check runner. Submission is fire-and-forget; results come back on the
//! event channel.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use super::adapters::CheckRunner;
use super::error::PoolResult;
use super::state::TransferStatus;
use super::store::TransferStore;
use super::types::{Predicate, TransferId, now_ms};

pub struct CheckDispatcher {
    store: Arc<dyn TransferStore>,
    checks: Arc<dyn CheckRunner>,
}

impl CheckDispatcher {
    pub fn new(store: Arc<dyn TransferStore>, checks: Arc<dyn CheckRunner>) -> Self {
        Self { store, checks }
    }

    /// Start checking a PENDING record.
    ///
    /// Returns false without invoking any check if another worker already
    /// claimed the record or it has expired.
    pub async fn dispatch(&self, id: TransferId) -> PoolResult<bool> {
        if !self
            .store
            .compare_and_set_status(id, TransferStatus::Pending, TransferStatus::Checking)
            .await?
        {
            debug!(transfer_id = %id, "Dispatch lost, record already claimed");
            return Ok(false);
        }

        let record = self.store.get(id).await?;
        self.submit(id, record.retry_count, &Predicate::ALL).await;
        Ok(true)
    }

    /// Submit the predicates still outstanding in the current round.
    ///
    /// Slots cleared by the retry round (per the recheck policy) read as
    /// unknown here, so passed predicates are only re-evaluated under
    /// `RecheckPolicy::All`. Returns the number of submissions.
    pub async fn redispatch(&self, id: TransferId) -> PoolResult<usize> {
        let record = self.store.get(id).await?;
        if record.status != TransferStatus::Checking {
            debug!(transfer_id = %id, status = %record.status, "Skipping re-dispatch");
            return Ok(0);
        }
        if record.is_expired_at(now_ms()) {
            debug!(transfer_id = %id, "Skipping re-dispatch of expired record");
            return Ok(0);
        }

        let outstanding = record.checks.outstanding();
        info!(
            transfer_id = %id,
            round = record.retry_count,
            predicates = outstanding.len(),
            "Re-dispatching checks"
        );
        self.submit(id, record.retry_count, &outstanding).await;
        Ok(outstanding.len())
    }

    async fn submit(&self, id: TransferId, round: u32, predicates: &[Predicate]) {
        let submissions = predicates
            .iter()
            .map(|&p| async move { (p, self.checks.evaluate(id, p, round).await) });

        for (predicate, result) in join_all(submissions).await {
            // The slot stays unknown; retry or the reaper settles the record
            if let Err(e) = result {
                warn!(
                    transfer_id = %id,
                    %predicate,
                    round,
                    runner = self.checks.name(),
                    error = %e,
                    "Check submission refused"
                );
            }
        }
    }
}
