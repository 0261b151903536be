//! Retry Coordinator
//!
//! Decides what happens after a predicate fails: reject now, or start the next
//! check round after an exponential backoff. Delayed re-dispatch goes through
//! an explicit queue owned by one scheduler task.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::channel::TerminalNotifier;
use super::dispatcher::CheckDispatcher;
use super::error::{PoolError, PoolResult};
use super::state::TransferStatus;
use super::store::TransferStore;
use super::types::{
    Metadata, PendingTransfer, Predicate, RecheckPolicy, RejectReason, TransferId, meta_keys,
    now_ms,
};

// ============================================================================
// Backoff
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the delay, applied symmetrically
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^k, cap)` without jitter
    pub fn base_delay(&self, k: u32) -> Duration {
        2u32.checked_pow(k)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |d| d.min(self.cap))
    }

    /// Delay before retry round `k + 1`, jittered and never above the cap
    pub fn delay(&self, k: u32) -> Duration {
        let base = self.base_delay(k);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64(factor).min(self.cap)
    }
}

// ============================================================================
// Retry queue
// ============================================================================

#[derive(Debug)]
struct ScheduledRetry {
    due: Instant,
    id: TransferId,
}

/// Handle for scheduling delayed re-dispatch
#[derive(Clone)]
pub struct RetryQueue {
    tx: mpsc::UnboundedSender<ScheduledRetry>,
}

impl RetryQueue {
    pub fn schedule(&self, id: TransferId, delay: Duration) -> PoolResult<()> {
        self.tx
            .send(ScheduledRetry {
                due: Instant::now() + delay,
                id,
            })
            .map_err(|_| PoolError::ChannelClosed)
    }
}

/// Owns the pending retries; fires `redispatch` at each deadline
pub struct RetryScheduler {
    rx: mpsc::UnboundedReceiver<ScheduledRetry>,
}

pub fn retry_queue() -> (RetryQueue, RetryScheduler) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RetryQueue { tx }, RetryScheduler { rx })
}

impl RetryScheduler {
    /// Run until shutdown, or until every queue handle is dropped and no
    /// retry is left. Retries still queued at shutdown are picked up again by
    /// startup recovery since their records stay CHECKING.
    pub async fn run(mut self, dispatcher: Arc<CheckDispatcher>, mut shutdown: watch::Receiver<bool>) {
        info!("Starting retry scheduler");
        let mut heap: BinaryHeap<Reverse<(Instant, TransferId)>> = BinaryHeap::new();
        let mut inflight = JoinSet::new();
        let mut closed = false;

        loop {
            if closed && heap.is_empty() {
                break;
            }
            let next_due = heap.peek().map(|Reverse((due, _))| *due);

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                item = self.rx.recv(), if !closed => match item {
                    Some(retry) => heap.push(Reverse((retry.due, retry.id))),
                    None => closed = true,
                },
                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    let now = Instant::now();
                    while heap.peek().is_some_and(|Reverse((due, _))| *due <= now) {
                        let Some(Reverse((_, id))) = heap.pop() else { break };
                        let dispatcher = dispatcher.clone();
                        inflight.spawn(async move {
                            if let Err(e) = dispatcher.redispatch(id).await {
                                warn!(transfer_id = %id, error = %e, "Retry re-dispatch failed");
                            }
                        });
                    }
                }
                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Re-dispatch task panicked");
                    }
                }
            }
        }

        if !heap.is_empty() {
            info!(pending = heap.len(), "Retry scheduler stopping with queued retries");
        }
        while inflight.join_next().await.is_some() {}
        info!("Retry scheduler stopped");
    }
}

// ============================================================================
// Coordinator
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Next round started and queued
    Scheduled { attempt: u32, delay: Duration },
    Rejected(RejectReason),
    /// Another worker already advanced the round or finished the record
    Superseded,
}

pub struct RetryCoordinator {
    store: Arc<dyn TransferStore>,
    queue: RetryQueue,
    notifier: TerminalNotifier,
    backoff: BackoffPolicy,
    max_retries: u32,
    recheck: RecheckPolicy,
}

impl RetryCoordinator {
    pub fn new(
        store: Arc<dyn TransferStore>,
        queue: RetryQueue,
        notifier: TerminalNotifier,
        backoff: BackoffPolicy,
        max_retries: u32,
        recheck: RecheckPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            notifier,
            backoff,
            max_retries,
            recheck,
        }
    }

    /// Handle a newly merged failure of `predicate` on `record`
    ///
    /// `record` is the snapshot returned by the merge; every write below is
    /// guarded by the store, so a stale snapshot only loses races.
    pub async fn on_failure(
        &self,
        record: &PendingTransfer,
        predicate: Predicate,
        hard: bool,
    ) -> PoolResult<RetryDecision> {
        if hard {
            return self
                .reject(record, predicate.failure_reason(), Some(predicate))
                .await;
        }

        if record.retry_count >= self.max_retries {
            return self
                .reject(record, RejectReason::RetryExhausted, Some(predicate))
                .await;
        }

        let delay = self.backoff.delay(record.retry_count);
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        if now_ms().saturating_add(delay_ms) >= record.expires_at {
            return self.reject(record, RejectReason::Expired, Some(predicate)).await;
        }

        let Some(attempt) = self
            .store
            .increment_retry(record.id, record.retry_count, self.recheck)
            .await?
        else {
            debug!(
                transfer_id = %record.id,
                round = record.retry_count,
                "Retry already scheduled for this round"
            );
            return Ok(RetryDecision::Superseded);
        };

        // The round has advanced; a lost schedule leaves the record CHECKING
        // with its failed slots cleared, which startup recovery re-dispatches
        if let Err(e) = self.queue.schedule(record.id, delay) {
            error!(
                transfer_id = %record.id,
                attempt,
                error = %e,
                "Retry round started but could not be scheduled"
            );
            return Err(e);
        }
        info!(
            transfer_id = %record.id,
            %predicate,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Check failed, retry scheduled"
        );
        Ok(RetryDecision::Scheduled { attempt, delay })
    }

    async fn reject(
        &self,
        record: &PendingTransfer,
        reason: RejectReason,
        predicate: Option<Predicate>,
    ) -> PoolResult<RetryDecision> {
        let mut detail = Metadata::new();
        if let Some(p) = predicate {
            detail.insert(meta_keys::FAILED_PREDICATE.to_string(), p.as_str().to_string());
        }
        detail.insert(
            meta_keys::REJECT_DETAIL.to_string(),
            format!("rejected after {} retries", record.retry_count),
        );

        if self
            .store
            .reject(record.id, TransferStatus::Checking, reason, detail)
            .await?
        {
            info!(transfer_id = %record.id, %reason, retry_count = record.retry_count, "Transfer rejected");
            self.notifier.rejected(record.id, &record.scope, reason);
            Ok(RetryDecision::Rejected(reason))
        } else {
            debug!(transfer_id = %record.id, %reason, "Rejection lost to a concurrent transition");
            Ok(RetryDecision::Superseded)
        }
    }
}
