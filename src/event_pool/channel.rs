//! Notification Channels
//!
//! - Inbound: one logical channel carrying predicate results (and optional
//!   all-checks-passed signals) from the check runners to the listener.
//!   Delivery is at-least-once with no ordering across predicates.
//! - Outbound: a broadcast of terminal outcomes for callers that prefer to
//!   subscribe instead of polling `get_status`.

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::error::{PoolError, PoolResult};
use super::state::TransferStatus;
use super::types::{CheckOutcome, Predicate, RejectReason, TransferId};

// ============================================================================
// Inbound events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    PredicateResult {
        id: TransferId,
        predicate: Predicate,
        outcome: CheckOutcome,
        /// Check round the evaluation was dispatched for
        round: u32,
        /// The check domain declares the failure unrecoverable before expiry
        #[serde(default)]
        hard: bool,
    },
    AllChecksPassed {
        id: TransferId,
    },
}

impl PoolEvent {
    pub fn pass(id: TransferId, predicate: Predicate, round: u32) -> Self {
        PoolEvent::PredicateResult {
            id,
            predicate,
            outcome: CheckOutcome::Pass,
            round,
            hard: false,
        }
    }

    pub fn fail(id: TransferId, predicate: Predicate, round: u32) -> Self {
        PoolEvent::PredicateResult {
            id,
            predicate,
            outcome: CheckOutcome::Fail,
            round,
            hard: false,
        }
    }

    pub fn hard_fail(id: TransferId, predicate: Predicate, round: u32) -> Self {
        PoolEvent::PredicateResult {
            id,
            predicate,
            outcome: CheckOutcome::Fail,
            round,
            hard: true,
        }
    }

    pub fn id(&self) -> TransferId {
        match self {
            PoolEvent::PredicateResult { id, .. } | PoolEvent::AllChecksPassed { id } => *id,
        }
    }
}

/// Publisher side, handed to check runners
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<PoolEvent>,
}

impl EventPublisher {
    pub async fn publish(&self, event: PoolEvent) -> PoolResult<()> {
        debug!(transfer_id = %event.id(), ?event, "Publishing pool event");
        self.tx
            .send(event)
            .await
            .map_err(|_| PoolError::ChannelClosed)
    }
}

/// Subscriber side, consumed by the listener
pub struct EventSubscriber {
    rx: mpsc::Receiver<PoolEvent>,
}

impl EventSubscriber {
    /// Receive the next event (None once every publisher is dropped)
    pub async fn recv(&mut self) -> Option<PoolEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PoolEvent> {
        self.rx.try_recv().ok()
    }
}

/// Create a new inbound event channel pair
pub fn event_channel(buffer: usize) -> (EventPublisher, EventSubscriber) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (EventPublisher { tx }, EventSubscriber { rx })
}

// ============================================================================
// Terminal notifications
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminalEvent {
    pub id: TransferId,
    pub scope: String,
    pub status: TransferStatus,
    pub reason: Option<RejectReason>,
}

/// Emits one event per record, sent by whichever worker won the terminal CAS
#[derive(Clone)]
pub struct TerminalNotifier {
    tx: broadcast::Sender<TerminalEvent>,
}

impl TerminalNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.tx.subscribe()
    }

    pub fn completed(&self, id: TransferId, scope: &str) {
        self.emit(TerminalEvent {
            id,
            scope: scope.to_string(),
            status: TransferStatus::Completed,
            reason: None,
        });
    }

    pub fn rejected(&self, id: TransferId, scope: &str, reason: RejectReason) {
        self.emit(TerminalEvent {
            id,
            scope: scope.to_string(),
            status: TransferStatus::Rejected,
            reason: Some(reason),
        });
    }

    fn emit(&self, event: TerminalEvent) {
        // No subscribers is fine: callers may poll instead
        let _ = self.tx.send(event);
    }
}
