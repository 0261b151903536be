//! Transfer Event Pool
//!
//! Event-driven coordination of conditional peer-to-peer transfers. A
//! transfer is held in a persistent pool while independent predicates
//! (balance, cooldown, daily limit) are evaluated asynchronously, and is
//! executed against the ledger exactly once when every predicate passes.
//!
//! # State Machine
//!
//! ```text
//! PENDING → CHECKING → APPROVED → COMPLETED
//!    ↓         ↓  ↺        ↓
//!    └──────→ REJECTED ←───┘
//! ```
//!
//! `↺` is a retry round: status stays CHECKING, `retry_count` grows.
//!
//! # Safety Invariants
//!
//! 1. **Single transition winner**: every status change is a compare-and-set
//!    in the store; only the winner performs the side effect that follows.
//! 2. **Exactly-once execution**: only the winner of `checking → approved`
//!    calls the ledger.
//! 3. **Idempotent merge**: predicate results are joined per check round, so
//!    redelivery and reordering never change the outcome.
//! 4. **Expiry dominates**: no transition other than rejection succeeds once
//!    `expires_at` has passed.
//! 5. **Bounded retries**: at most `max_retries` retry rounds per record.

pub mod adapters;
pub mod channel;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod listener;
pub mod reaper;
pub mod retry;
pub mod state;
pub mod store;
pub mod types;


// Re-exports for convenience
pub use adapters::{CheckRunner, TransferExecutor};
pub use channel::{EventPublisher, EventSubscriber, PoolEvent, TerminalEvent, event_channel};
pub use engine::{RecoveryReport, TransferEventPool};
pub use error::{CheckError, ExecutionError, PoolError, PoolResult};
pub use state::TransferStatus;
pub use store::{MemoryStore, PgTransferStore, TransferStore};
pub use types::{
    CheckOutcome, Checks, Metadata, NewTransfer, PendingTransfer, Predicate, RecheckPolicy,
    RejectReason, TransferId, TransferStatusView,
};
