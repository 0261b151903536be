//! Pending Transfer Store
//!
//! The store is the only shared mutable resource of the pool. Every
//! coordination decision goes through one of its atomic single-record
//! primitives; workers never cache a record beyond one event.
//!
//! The record mutations themselves live in this module as plain functions so
//! that the in-memory and PostgreSQL backends apply identical rules.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgTransferStore;

use std::time::Duration;

use async_trait::async_trait;

use super::error::{PoolError, PoolResult};
use super::state::TransferStatus;
use super::types::{
    CheckMerge, CheckOutcome, Metadata, NewTransfer, PendingTransfer, Predicate, RecheckPolicy,
    RejectReason, TransferId, meta_keys,
};

/// Account-model policy applied at creation
#[derive(Debug, Clone, Copy, Default)]
pub struct CreatePolicy {
    /// Permit `initiator == target`
    pub allow_self_transfer: bool,
}

#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Validate and insert a new record in PENDING with all checks unknown
    async fn create(&self, req: NewTransfer, policy: &CreatePolicy)
    -> PoolResult<PendingTransfer>;

    /// Fails with `NotFound` if absent
    async fn get(&self, id: TransferId) -> PoolResult<PendingTransfer>;

    /// One page for a scope, newest first
    async fn list(
        &self,
        scope: &str,
        status: Option<TransferStatus>,
        limit: usize,
        offset: usize,
    ) -> PoolResult<Vec<PendingTransfer>>;

    /// Atomic status CAS. Returns false (no-op) if the current status is not
    /// `expected`, or if `next` is not `Rejected` and the record has expired.
    async fn compare_and_set_status(
        &self,
        id: TransferId,
        expected: TransferStatus,
        next: TransferStatus,
    ) -> PoolResult<bool>;

    /// CAS `expected → Rejected`, recording the reason and detail in metadata
    async fn reject(
        &self,
        id: TransferId,
        expected: TransferStatus,
        reason: RejectReason,
        detail: Metadata,
    ) -> PoolResult<bool>;

    /// Idempotent merge of one predicate report for check round `round`
    async fn set_check_result(
        &self,
        id: TransferId,
        predicate: Predicate,
        outcome: CheckOutcome,
        round: u32,
    ) -> PoolResult<CheckMerge>;

    /// Start the next check round if the record is still CHECKING at
    /// `expected_round`, clearing the slots `recheck` selects. Returns the new
    /// count, or None if another worker already advanced the round.
    async fn increment_retry(
        &self,
        id: TransferId,
        expected_round: u32,
        recheck: RecheckPolicy,
    ) -> PoolResult<Option<u32>>;

    /// Non-terminal records with `expires_at < now`, oldest deadline first
    async fn find_expired(&self, now: i64, limit: usize) -> PoolResult<Vec<PendingTransfer>>;

    /// Non-terminal records still within their deadline, ordered by
    /// `(created_at, id)` and starting strictly after `after`
    async fn find_recoverable(
        &self,
        now: i64,
        after: Option<RecoveryCursor>,
        limit: usize,
    ) -> PoolResult<Vec<PendingTransfer>>;
}

/// Keyset position for paging `find_recoverable`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecoveryCursor {
    pub created_at: i64,
    pub id: TransferId,
}

impl RecoveryCursor {
    pub fn of(record: &PendingTransfer) -> Self {
        Self {
            created_at: record.created_at,
            id: record.id,
        }
    }
}

// ============================================================================
// Shared record rules
// ============================================================================

/// Creation-time validation
pub fn validate_new(req: &NewTransfer, policy: &CreatePolicy) -> PoolResult<()> {
    if req.scope.trim().is_empty() {
        return Err(PoolError::EmptyField("scope"));
    }
    if req.initiator.trim().is_empty() {
        return Err(PoolError::EmptyField("initiator"));
    }
    if req.target.trim().is_empty() {
        return Err(PoolError::EmptyField("target"));
    }
    if req.amount <= 0 {
        return Err(PoolError::InvalidAmount);
    }
    if req.initiator == req.target && !policy.allow_self_transfer {
        return Err(PoolError::SameAccount);
    }
    // Whole milliseconds, so that `expires_at > created_at`
    if req.ttl < Duration::from_millis(1) {
        return Err(PoolError::InvalidTtl);
    }
    Ok(())
}

fn ensure_transition(expected: TransferStatus, next: TransferStatus) -> PoolResult<()> {
    if expected.can_transition_to(next) {
        Ok(())
    } else {
        Err(PoolError::InvalidStateTransition(format!(
            "{} -> {}",
            expected, next
        )))
    }
}

pub(crate) fn apply_status_cas(
    record: &mut PendingTransfer,
    expected: TransferStatus,
    next: TransferStatus,
    now: i64,
) -> PoolResult<bool> {
    ensure_transition(expected, next)?;
    if record.status != expected {
        return Ok(false);
    }
    // Past the deadline only rejection may land
    if next != TransferStatus::Rejected && record.is_expired_at(now) {
        return Ok(false);
    }
    record.status = next;
    record.updated_at = now;
    Ok(true)
}

pub(crate) fn apply_reject(
    record: &mut PendingTransfer,
    expected: TransferStatus,
    reason: RejectReason,
    detail: Metadata,
    now: i64,
) -> PoolResult<bool> {
    if !apply_status_cas(record, expected, TransferStatus::Rejected, now)? {
        return Ok(false);
    }
    record.reason = Some(reason);
    record
        .metadata
        .insert(meta_keys::REJECT_REASON.to_string(), reason.code().to_string());
    record.metadata.extend(detail);
    Ok(true)
}

pub(crate) fn apply_check_result(
    record: &mut PendingTransfer,
    predicate: Predicate,
    outcome: CheckOutcome,
    round: u32,
    now: i64,
) -> bool {
    if record.status != TransferStatus::Checking || record.retry_count != round {
        return false;
    }
    let changed = record.checks.merge(predicate, outcome);
    if changed {
        record.updated_at = now;
    }
    changed
}

pub(crate) fn apply_increment_retry(
    record: &mut PendingTransfer,
    expected_round: u32,
    recheck: RecheckPolicy,
    now: i64,
) -> Option<u32> {
    if record.status != TransferStatus::Checking || record.retry_count != expected_round {
        return None;
    }
    // Computed under the record lock so a failure merged by a concurrent
    // worker in the same round is cleared too
    let reset = recheck.reset_set(&record.checks);
    record.retry_count += 1;
    record.checks.reset(&reset);
    record.updated_at = now;
    Some(record.retry_count)
}
