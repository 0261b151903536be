//! In-memory store
//!
//! `DashMap` shard locks give each mutation exclusive access to one record,
//! which is the atomic single-row update the pool relies on. No lock is held
//! across an `.await`.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{
    CreatePolicy, RecoveryCursor, TransferStore, apply_check_result, apply_increment_retry,
    apply_reject, apply_status_cas, validate_new,
};
use crate::event_pool::error::{PoolError, PoolResult};
use crate::event_pool::state::TransferStatus;
use crate::event_pool::types::{
    CheckMerge, CheckOutcome, Metadata, NewTransfer, PendingTransfer, Predicate,
    RecheckPolicy, RejectReason, TransferId, now_ms,
};

#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<TransferId, PendingTransfer>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert a record as-is (restores, tests)
    pub fn insert(&self, record: PendingTransfer) {
        self.records.insert(record.id, record);
    }

    fn not_found(id: TransferId) -> PoolError {
        PoolError::NotFound(id.to_string())
    }

    fn collect_where(&self, f: impl Fn(&PendingTransfer) -> bool) -> Vec<PendingTransfer> {
        self.records
            .iter()
            .filter(|entry| f(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[async_trait]
impl TransferStore for MemoryStore {
    async fn create(
        &self,
        req: NewTransfer,
        policy: &CreatePolicy,
    ) -> PoolResult<PendingTransfer> {
        validate_new(&req, policy)?;
        let record = PendingTransfer::new(req);
        self.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: TransferId) -> PoolResult<PendingTransfer> {
        self.records
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| Self::not_found(id))
    }

    async fn list(
        &self,
        scope: &str,
        status: Option<TransferStatus>,
        limit: usize,
        offset: usize,
    ) -> PoolResult<Vec<PendingTransfer>> {
        let mut page =
            self.collect_where(|r| r.scope == scope && status.is_none_or(|s| r.status == s));
        page.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(page.into_iter().skip(offset).take(limit).collect())
    }

    async fn compare_and_set_status(
        &self,
        id: TransferId,
        expected: TransferStatus,
        next: TransferStatus,
    ) -> PoolResult<bool> {
        let mut record = self.records.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        apply_status_cas(&mut record, expected, next, now_ms())
    }

    async fn reject(
        &self,
        id: TransferId,
        expected: TransferStatus,
        reason: RejectReason,
        detail: Metadata,
    ) -> PoolResult<bool> {
        let mut record = self.records.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        apply_reject(&mut record, expected, reason, detail, now_ms())
    }

    async fn set_check_result(
        &self,
        id: TransferId,
        predicate: Predicate,
        outcome: CheckOutcome,
        round: u32,
    ) -> PoolResult<CheckMerge> {
        let mut record = self.records.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        let changed = apply_check_result(&mut record, predicate, outcome, round, now_ms());
        Ok(CheckMerge {
            record: record.clone(),
            changed,
        })
    }

    async fn increment_retry(
        &self,
        id: TransferId,
        expected_round: u32,
        recheck: RecheckPolicy,
    ) -> PoolResult<Option<u32>> {
        let mut record = self.records.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        Ok(apply_increment_retry(
            &mut record,
            expected_round,
            recheck,
            now_ms(),
        ))
    }

    async fn find_expired(&self, now: i64, limit: usize) -> PoolResult<Vec<PendingTransfer>> {
        let mut expired = self.collect_where(|r| !r.status.is_terminal() && r.expires_at < now);
        expired.sort_by_key(|r| r.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn find_recoverable(
        &self,
        now: i64,
        after: Option<RecoveryCursor>,
        limit: usize,
    ) -> PoolResult<Vec<PendingTransfer>> {
        let mut live = self.collect_where(|r| {
            !r.status.is_terminal()
                && r.expires_at > now
                && after.is_none_or(|cursor| RecoveryCursor::of(r) > cursor)
        });
        live.sort_by_key(RecoveryCursor::of);
        live.truncate(limit);
        Ok(live)
    }
}
