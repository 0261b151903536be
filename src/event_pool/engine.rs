//! Transfer Event Pool
//!
//! Wires the store, the collaborators and the background workers together
//! and exposes the caller-facing operations.
//!
//! Background tasks:
//! - event listener (consumes check results)
//! - retry scheduler (fires delayed re-dispatch)
//! - expiry reaper (rejects records past their deadline)

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, warn};

use super::adapters::{CheckRunner, TransferExecutor};
use super::channel::{EventSubscriber, TerminalEvent, TerminalNotifier};
use super::dispatcher::CheckDispatcher;
use super::error::PoolResult;
use super::executor::ExecutionStage;
use super::listener::EventListener;
use super::reaper::{ExpiryReaper, ReaperConfig};
use super::retry::{BackoffPolicy, RetryCoordinator, retry_queue};
use super::state::TransferStatus;
use super::store::{CreatePolicy, RecoveryCursor, TransferStore};
use super::types::{NewTransfer, PendingTransfer, TransferId, TransferStatusView, now_ms};
use crate::config::PoolConfig;
use crate::logging::worker_span;

/// Records read per page by startup recovery
const RECOVERY_PAGE: usize = 500;

const TERMINAL_BUFFER: usize = 1_024;

/// What startup recovery resumed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub dispatched: usize,
    pub redispatched: usize,
    /// CHECKING records whose round had settled: retried, rejected or approved
    pub resumed: usize,
    /// APPROVED records left for the reaper
    pub approved: usize,
}

pub struct TransferEventPool {
    store: Arc<dyn TransferStore>,
    dispatcher: Arc<CheckDispatcher>,
    listener: Arc<EventListener>,
    notifier: TerminalNotifier,
    policy: CreatePolicy,
    config: PoolConfig,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TransferEventPool {
    /// Spawn the background workers, then resume records left non-terminal
    /// by a previous run.
    ///
    /// `subscriber` is the receiving end of the channel whose publisher was
    /// handed to `checks`.
    pub async fn start(
        store: Arc<dyn TransferStore>,
        checks: Arc<dyn CheckRunner>,
        executor: Arc<dyn TransferExecutor>,
        subscriber: EventSubscriber,
        config: PoolConfig,
    ) -> PoolResult<Self> {
        let notifier = TerminalNotifier::new(TERMINAL_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = Arc::new(CheckDispatcher::new(store.clone(), checks.clone()));
        let backoff = BackoffPolicy {
            base: config.backoff_base(),
            cap: config.backoff_cap(),
            jitter: config.backoff_jitter,
        };
        let (queue, scheduler) = retry_queue();
        let retry = Arc::new(RetryCoordinator::new(
            store.clone(),
            queue,
            notifier.clone(),
            backoff,
            config.max_retries,
            config.recheck_policy,
        ));
        let execution = Arc::new(ExecutionStage::new(
            store.clone(),
            executor.clone(),
            notifier.clone(),
            config.execution_attempts,
            backoff.base,
        ));
        let listener = Arc::new(EventListener::new(
            store.clone(),
            retry,
            execution,
            config.listener_concurrency,
        ));
        let reaper = ExpiryReaper::new(
            store.clone(),
            notifier.clone(),
            ReaperConfig {
                interval: config.reaper_interval(),
                batch_size: config.reaper_batch_size,
            },
        );

        let tasks = vec![
            tokio::spawn(
                listener
                    .clone()
                    .run(subscriber, shutdown_rx.clone())
                    .instrument(worker_span("listener")),
            ),
            tokio::spawn(
                scheduler
                    .run(dispatcher.clone(), shutdown_rx.clone())
                    .instrument(worker_span("retry_scheduler")),
            ),
            tokio::spawn(
                async move { reaper.run(shutdown_rx).await }.instrument(worker_span("reaper")),
            ),
        ];

        info!(
            checks = checks.name(),
            executor = executor.name(),
            max_retries = config.max_retries,
            recheck_policy = ?config.recheck_policy,
            "Transfer event pool started"
        );

        let pool = Self {
            store,
            dispatcher,
            listener,
            notifier,
            policy: CreatePolicy {
                allow_self_transfer: config.allow_self_transfer,
            },
            config,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        };

        let report = pool.recover().await?;
        if report != RecoveryReport::default() {
            info!(?report, "Startup recovery finished");
        }
        Ok(pool)
    }

    /// Validate, persist in PENDING and start checking. Returns once the
    /// record exists; the outcome is observed via `get_status` or
    /// `subscribe_terminal`.
    pub async fn create(&self, req: NewTransfer) -> PoolResult<TransferId> {
        let record = self.store.create(req, &self.policy).await?;
        info!(
            transfer_id = %record.id,
            scope = %record.scope,
            initiator = %record.initiator,
            target = %record.target,
            amount = record.amount,
            "Transfer created"
        );

        // The record is durable; recovery or the reaper settles it if this fails
        if let Err(e) = self.dispatcher.dispatch(record.id).await {
            error!(transfer_id = %record.id, error = %e, "Initial dispatch failed");
        }
        Ok(record.id)
    }

    pub async fn get_status(&self, id: TransferId) -> PoolResult<TransferStatusView> {
        Ok(self.store.get(id).await?.status_view())
    }

    pub async fn get(&self, id: TransferId) -> PoolResult<PendingTransfer> {
        self.store.get(id).await
    }

    pub async fn list(
        &self,
        scope: &str,
        status: Option<TransferStatus>,
        limit: usize,
        offset: usize,
    ) -> PoolResult<Vec<PendingTransfer>> {
        self.store.list(scope, status, limit, offset).await
    }

    pub fn subscribe_terminal(&self) -> broadcast::Receiver<TerminalEvent> {
        self.notifier.subscribe()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Resume every live non-terminal record, paging through the store:
    /// - PENDING is dispatched
    /// - CHECKING with a settled round gets the retry or approval it is owed,
    ///   otherwise its outstanding predicates are re-dispatched
    /// - APPROVED is left alone since execution may already have happened
    pub async fn recover(&self) -> PoolResult<RecoveryReport> {
        let now = now_ms();
        let mut report = RecoveryReport::default();
        let mut after = None;

        loop {
            let page = self.store.find_recoverable(now, after, RECOVERY_PAGE).await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(RecoveryCursor::of(last));

            for record in &page {
                if let Err(e) = self.recover_one(record, &mut report).await {
                    error!(transfer_id = %record.id, error = %e, "Failed to recover transfer");
                }
            }
        }
        Ok(report)
    }

    async fn recover_one(
        &self,
        record: &PendingTransfer,
        report: &mut RecoveryReport,
    ) -> PoolResult<()> {
        match record.status {
            TransferStatus::Pending => {
                let won = self.dispatcher.dispatch(record.id).await?;
                report.dispatched += usize::from(won);
            }
            TransferStatus::Checking => {
                if self.listener.resume(record, None).await?.is_some() {
                    report.resumed += 1;
                } else {
                    self.dispatcher.redispatch(record.id).await?;
                    report.redispatched += 1;
                }
            }
            TransferStatus::Approved => {
                warn!(
                    transfer_id = %record.id,
                    expires_at = record.expires_at,
                    "Approved transfer found at startup, leaving it for the reaper"
                );
                report.approved += 1;
            }
            TransferStatus::Completed | TransferStatus::Rejected => {}
        }
        Ok(())
    }

    /// Stop the workers and wait for in-flight handlers
    pub async fn shutdown(&self) {
        info!("Shutting down transfer event pool");
        // Receivers may already be gone if the workers exited on their own
        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Pool task ended abnormally");
            }
        }
        info!("Transfer event pool stopped");
    }
}
