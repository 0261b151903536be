//! Collaborator Adapters
//!
//! The pool consumes two external capabilities. Neither is implemented here:
//! predicate evaluation and the ledger live outside the pool.

pub mod simulated;

pub use simulated::{CheckScript, RecordingExecutor, ScriptedCheckRunner};

use async_trait::async_trait;

use super::error::{CheckError, ExecutionError};
use super::types::{ExecutionRequest, Predicate, TransferId};

/// Asynchronous predicate evaluation
///
/// `evaluate` only submits the work. The outcome arrives later as a
/// `PoolEvent::PredicateResult` tagged with the same `round`.
#[async_trait]
pub trait CheckRunner: Send + Sync {
    fn name(&self) -> &'static str;

    async fn evaluate(
        &self,
        id: TransferId,
        predicate: Predicate,
        round: u32,
    ) -> Result<(), CheckError>;
}

/// The `ExecuteTransfer` capability of the ledger
///
/// Called at most once per approved record (more only for transient errors
/// when the deployment opts into execution re-attempts).
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, req: &ExecutionRequest) -> Result<(), ExecutionError>;
}
