//! Expiry Reaper
//!
//! Periodic sweep that rejects every non-terminal record past its deadline,
//! whatever stage it is stuck in.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use super::channel::TerminalNotifier;
use super::error::PoolResult;
use super::state::TransferStatus;
use super::store::TransferStore;
use super::types::{Metadata, PendingTransfer, RejectReason, TransferId, meta_keys, now_ms};

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// Records examined per sweep
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

pub struct ExpiryReaper {
    store: Arc<dyn TransferStore>,
    notifier: TerminalNotifier,
    config: ReaperConfig,
}

impl ExpiryReaper {
    pub fn new(store: Arc<dyn TransferStore>, notifier: TerminalNotifier, config: ReaperConfig) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting expiry reaper"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Expiry sweep failed");
                    }
                }
            }
        }
        info!("Expiry reaper stopped");
    }

    /// One pass; returns the number of records rejected
    pub async fn sweep(&self) -> PoolResult<usize> {
        let expired = self
            .store
            .find_expired(now_ms(), self.config.batch_size)
            .await?;
        if expired.is_empty() {
            debug!("No expired transfers");
            return Ok(0);
        }

        let mut reaped = 0;
        for record in &expired {
            match self.reap(record).await {
                Ok(true) => reaped += 1,
                Ok(false) => {}
                Err(e) => error!(transfer_id = %record.id, error = %e, "Failed to reap transfer"),
            }
        }

        if reaped > 0 {
            info!(count = reaped, found = expired.len(), "Reaped expired transfers");
        }
        Ok(reaped)
    }

    async fn reap(&self, record: &PendingTransfer) -> PoolResult<bool> {
        if self.try_reject(record.id, record.status, &record.scope).await? {
            return Ok(true);
        }

        // Status moved between the scan and the CAS; retry once from the new one
        let current = self.store.get(record.id).await?;
        if current.status.is_terminal() {
            debug!(transfer_id = %record.id, status = %current.status, "Settled before reaping");
            return Ok(false);
        }
        self.try_reject(current.id, current.status, &current.scope).await
    }

    async fn try_reject(
        &self,
        id: TransferId,
        status: TransferStatus,
        scope: &str,
    ) -> PoolResult<bool> {
        let mut detail = Metadata::new();
        detail.insert(
            meta_keys::REJECT_DETAIL.to_string(),
            format!("expired while {}", status),
        );
        if !self
            .store
            .reject(id, status, RejectReason::Expired, detail)
            .await?
        {
            return Ok(false);
        }
        if status == TransferStatus::Approved {
            // Execution may have reached the ledger
            error!(transfer_id = %id, "Approved transfer expired before completion, needs reconciliation");
        } else {
            info!(transfer_id = %id, %status, "Transfer expired");
        }
        self.notifier.rejected(id, scope, RejectReason::Expired);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_pool::store::MemoryStore;
    use crate::event_pool::types::NewTransfer;

    fn record(status: TransferStatus, expires_in_ms: i64) -> PendingTransfer {
        let mut r = PendingTransfer::new(NewTransfer::new(
            "g1",
            "u1",
            "u2",
            5,
            Duration::from_secs(60),
        ));
        r.status = status;
        r.expires_at = now_ms() + expires_in_ms;
        r
    }

    fn reaper(store: Arc<MemoryStore>, notifier: TerminalNotifier) -> ExpiryReaper {
        ExpiryReaper::new(store, notifier, ReaperConfig::default())
    }

    #[tokio::test]
    async fn test_sweep_rejects_every_expired_stage() {
        let store = Arc::new(MemoryStore::new());
        let notifier = TerminalNotifier::new(16);
        let mut terminal = notifier.subscribe();

        let stale: Vec<_> = [
            TransferStatus::Pending,
            TransferStatus::Checking,
            TransferStatus::Approved,
        ]
        .into_iter()
        .map(|s| record(s, -1_000))
        .collect();
        for r in &stale {
            store.insert(r.clone());
        }
        let live = record(TransferStatus::Checking, 60_000);
        let done = record(TransferStatus::Completed, -1_000);
        store.insert(live.clone());
        store.insert(done.clone());

        assert_eq!(reaper(store.clone(), notifier).sweep().await.unwrap(), 3);

        for r in &stale {
            let stored = store.get(r.id).await.unwrap();
            assert_eq!(stored.status, TransferStatus::Rejected);
            assert_eq!(stored.reason, Some(RejectReason::Expired));
            assert_eq!(terminal.recv().await.unwrap().reason, Some(RejectReason::Expired));
        }
        assert_eq!(store.get(live.id).await.unwrap().status, TransferStatus::Checking);
        assert_eq!(store.get(done.id).await.unwrap().status, TransferStatus::Completed);
    }

    #[tokio::test]
    async fn test_reap_follows_status_change() {
        let store = Arc::new(MemoryStore::new());
        let snapshot = record(TransferStatus::Pending, -1_000);
        let mut moved = snapshot.clone();
        moved.status = TransferStatus::Checking;
        store.insert(moved);

        let reaper = reaper(store.clone(), TerminalNotifier::new(4));
        assert!(reaper.reap(&snapshot).await.unwrap());
        assert_eq!(store.get(snapshot.id).await.unwrap().status, TransferStatus::Rejected);
    }

    #[tokio::test]
    async fn test_second_sweep_is_noop() {
        let store = Arc::new(MemoryStore::new());
        store.insert(record(TransferStatus::Checking, -10));
        let reaper = reaper(store, TerminalNotifier::new(4));

        assert_eq!(reaper.sweep().await.unwrap(), 1);
        assert_eq!(reaper.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let reaper = reaper(store, TerminalNotifier::new(4));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { reaper.run(rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
