//! Simulated collaborators
//!
//! In-process stand-ins for the check domain and the ledger. The binary wires
//! them when built with `simulated-collaborators`; tests script them to drive
//! every lifecycle path.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::{CheckRunner, TransferExecutor};
use crate::event_pool::channel::{EventPublisher, PoolEvent};
use crate::event_pool::error::{CheckError, ExecutionError};
use crate::event_pool::types::{ExecutionRequest, Predicate, TransferId};

/// How a predicate answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckScript {
    Pass,
    Fail,
    /// Fail, flagged as unrecoverable
    HardFail,
    /// Fail the first `n` evaluations of a record, then pass
    FailTimes(u32),
    /// Never report
    Silent,
}

/// Check runner that answers from a per-predicate script
pub struct ScriptedCheckRunner {
    publisher: EventPublisher,
    scripts: DashMap<Predicate, CheckScript>,
    delay: Duration,
    /// Publish every result twice to mimic at-least-once redelivery
    duplicate: bool,
    calls: DashMap<(TransferId, Predicate), u32>,
    total_calls: AtomicUsize,
}

impl ScriptedCheckRunner {
    /// All predicates pass by default
    pub fn new(publisher: EventPublisher) -> Self {
        Self {
            publisher,
            scripts: DashMap::new(),
            delay: Duration::ZERO,
            duplicate: false,
            calls: DashMap::new(),
            total_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_duplicates(mut self) -> Self {
        self.duplicate = true;
        self
    }

    pub fn script(&self, predicate: Predicate, script: CheckScript) {
        self.scripts.insert(predicate, script);
    }

    /// Evaluations requested for one predicate of one record
    pub fn calls_for(&self, id: TransferId, predicate: Predicate) -> u32 {
        self.calls.get(&(id, predicate)).map(|c| *c).unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    fn event_for(&self, id: TransferId, predicate: Predicate, round: u32, call: u32) -> Option<PoolEvent> {
        let script = self
            .scripts
            .get(&predicate)
            .map(|s| *s)
            .unwrap_or(CheckScript::Pass);
        match script {
            CheckScript::Pass => Some(PoolEvent::pass(id, predicate, round)),
            CheckScript::Fail => Some(PoolEvent::fail(id, predicate, round)),
            CheckScript::HardFail => Some(PoolEvent::hard_fail(id, predicate, round)),
            CheckScript::FailTimes(n) if call <= n => Some(PoolEvent::fail(id, predicate, round)),
            CheckScript::FailTimes(_) => Some(PoolEvent::pass(id, predicate, round)),
            CheckScript::Silent => None,
        }
    }
}

#[async_trait]
impl CheckRunner for ScriptedCheckRunner {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn evaluate(
        &self,
        id: TransferId,
        predicate: Predicate,
        round: u32,
    ) -> Result<(), CheckError> {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        let call = {
            let mut count = self.calls.entry((id, predicate)).or_insert(0);
            *count += 1;
            *count
        };

        let Some(event) = self.event_for(id, predicate, round, call) else {
            debug!(transfer_id = %id, %predicate, "Scripted check stays silent");
            return Ok(());
        };

        let publisher = self.publisher.clone();
        let delay = self.delay;
        let copies = if self.duplicate { 2 } else { 1 };
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            for _ in 0..copies {
                if let Err(e) = publisher.publish(event.clone()).await {
                    warn!(transfer_id = %id, error = %e, "Dropping scripted check result");
                    return;
                }
            }
        });
        Ok(())
    }
}

/// Ledger stand-in that records every execution
#[derive(Default)]
pub struct RecordingExecutor {
    calls: AtomicUsize,
    executed: DashMap<TransferId, u32>,
    fail_with: Mutex<Option<ExecutionError>>,
    transient_failures: AtomicU32,
    delay: Mutex<Duration>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent execution fails with `error`
    pub fn fail_with(&self, error: ExecutionError) {
        *self.fail_with.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
    }

    /// The next `n` executions report the ledger as unavailable
    pub fn fail_transiently(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn executions_for(&self, id: TransferId) -> u32 {
        self.executed.get(&id).map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl TransferExecutor for RecordingExecutor {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn execute(&self, req: &ExecutionRequest) -> Result<(), ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.executed.entry(req.id).or_insert(0) += 1;

        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let transient = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient {
            return Err(ExecutionError::Unavailable("simulated ledger outage".to_string()));
        }

        if let Some(error) = self.fail_with.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(error);
        }

        debug!(
            transfer_id = %req.id,
            initiator = %req.initiator,
            target = %req.target,
            amount = req.amount,
            "Simulated ledger transfer executed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_pool::channel::event_channel;
    use crate::event_pool::types::CheckOutcome;

    #[tokio::test]
    async fn test_scripted_runner_publishes_results() {
        let (publisher, mut subscriber) = event_channel(8);
        let runner = ScriptedCheckRunner::new(publisher);
        runner.script(Predicate::Balance, CheckScript::FailTimes(1));
        let id = TransferId::new();

        runner.evaluate(id, Predicate::Balance, 0).await.unwrap();
        let first = subscriber.recv().await.unwrap();
        assert_eq!(first, PoolEvent::fail(id, Predicate::Balance, 0));

        runner.evaluate(id, Predicate::Balance, 1).await.unwrap();
        let second = subscriber.recv().await.unwrap();
        assert_eq!(second, PoolEvent::pass(id, Predicate::Balance, 1));

        assert_eq!(runner.calls_for(id, Predicate::Balance), 2);
        assert_eq!(runner.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_silent_and_duplicate_scripts() {
        let (publisher, mut subscriber) = event_channel(8);
        let runner = ScriptedCheckRunner::new(publisher).with_duplicates();
        runner.script(Predicate::Cooldown, CheckScript::Silent);
        let id = TransferId::new();

        runner.evaluate(id, Predicate::Cooldown, 0).await.unwrap();
        runner.evaluate(id, Predicate::DailyLimit, 0).await.unwrap();

        for _ in 0..2 {
            match subscriber.recv().await.unwrap() {
                PoolEvent::PredicateResult {
                    predicate, outcome, ..
                } => {
                    assert_eq!(predicate, Predicate::DailyLimit);
                    assert_eq!(outcome, CheckOutcome::Pass);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_recording_executor_failures() {
        let executor = RecordingExecutor::new();
        let req = ExecutionRequest {
            id: TransferId::new(),
            scope: "g1".into(),
            initiator: "u1".into(),
            target: "u2".into(),
            amount: 10,
            metadata: Default::default(),
        };

        executor.fail_transiently(1);
        assert!(matches!(
            executor.execute(&req).await,
            Err(ExecutionError::Unavailable(_))
        ));
        assert!(executor.execute(&req).await.is_ok());

        executor.fail_with(ExecutionError::InsufficientFunds);
        assert_eq!(
            executor.execute(&req).await,
            Err(ExecutionError::InsufficientFunds)
        );
        assert_eq!(executor.calls(), 3);
        assert_eq!(executor.executions_for(req.id), 3);
    }
}
