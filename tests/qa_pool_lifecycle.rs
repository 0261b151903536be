//! Black-box lifecycle tests through the public API, with test-local
//! collaborators implementing the adapter traits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use transfer_event_pool::config::{AppConfig, PoolConfig};
use transfer_event_pool::event_pool::types::ExecutionRequest;
use transfer_event_pool::event_pool::{
    CheckError, CheckRunner, EventPublisher, ExecutionError, MemoryStore, NewTransfer, PoolEvent,
    Predicate, RejectReason, TerminalEvent, TransferEventPool, TransferExecutor, TransferId,
    TransferStatus, TransferStore, event_channel,
};

/// Shared account balances standing in for the ledger
#[derive(Default)]
struct Accounts {
    balances: Mutex<HashMap<String, i64>>,
}

impl Accounts {
    fn with(entries: &[(&str, i64)]) -> Arc<Self> {
        let accounts = Accounts::default();
        {
            let mut b = accounts.balances.lock().unwrap();
            for (name, amount) in entries {
                b.insert(name.to_string(), *amount);
            }
        }
        Arc::new(accounts)
    }

    fn balance(&self, name: &str) -> i64 {
        *self.balances.lock().unwrap().get(name).unwrap_or(&0)
    }
}

/// Reads the pending record and answers the balance predicate from the
/// account book; the other predicates always pass.
struct BookChecks {
    store: Arc<MemoryStore>,
    accounts: Arc<Accounts>,
    publisher: EventPublisher,
}

#[async_trait]
impl CheckRunner for BookChecks {
    fn name(&self) -> &'static str {
        "book"
    }

    async fn evaluate(&self, id: TransferId, predicate: Predicate, round: u32) -> Result<(), CheckError> {
        let record = self
            .store
            .get(id)
            .await
            .map_err(|e| CheckError(e.to_string()))?;
        let event = match predicate {
            Predicate::Balance if self.accounts.balance(&record.initiator) < record.amount => {
                PoolEvent::hard_fail(id, predicate, round)
            }
            _ => PoolEvent::pass(id, predicate, round),
        };
        let publisher = self.publisher.clone();
        tokio::spawn(async move {
            let _ = publisher.publish(event).await;
        });
        Ok(())
    }
}

struct BookLedger {
    accounts: Arc<Accounts>,
}

#[async_trait]
impl TransferExecutor for BookLedger {
    fn name(&self) -> &'static str {
        "book"
    }

    async fn execute(&self, req: &ExecutionRequest) -> Result<(), ExecutionError> {
        let mut balances = self.accounts.balances.lock().unwrap();
        let from = balances.get(&req.initiator).copied().unwrap_or(0);
        if from < req.amount {
            return Err(ExecutionError::InsufficientFunds);
        }
        balances.insert(req.initiator.clone(), from - req.amount);
        *balances.entry(req.target.clone()).or_insert(0) += req.amount;
        Ok(())
    }
}

async fn start(accounts: Arc<Accounts>) -> TransferEventPool {
    let store = Arc::new(MemoryStore::new());
    let (publisher, subscriber) = event_channel(256);
    let checks = Arc::new(BookChecks {
        store: store.clone(),
        accounts: accounts.clone(),
        publisher,
    });
    let ledger = Arc::new(BookLedger { accounts });
    let config = PoolConfig {
        backoff_base_ms: 2,
        backoff_cap_ms: 10,
        backoff_jitter: 0.0,
        ..PoolConfig::default()
    };
    TransferEventPool::start(store, checks, ledger, subscriber, config)
        .await
        .unwrap()
}

async fn outcome(rx: &mut broadcast::Receiver<TerminalEvent>, id: TransferId) -> TerminalEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await.unwrap();
            if event.id == id {
                return event;
            }
        }
    })
    .await
    .expect("transfer did not settle")
}

#[tokio::test]
async fn qa_funded_transfer_moves_money_once() {
    let accounts = Accounts::with(&[("alice", 100), ("bob", 0)]);
    let pool = start(accounts.clone()).await;
    let mut terminal = pool.subscribe_terminal();

    let id = pool
        .create(NewTransfer::new("guild", "alice", "bob", 60, Duration::from_secs(30)))
        .await
        .unwrap();

    let event = outcome(&mut terminal, id).await;
    assert_eq!(event.status, TransferStatus::Completed);
    assert_eq!(event.scope, "guild");
    assert_eq!(accounts.balance("alice"), 40);
    assert_eq!(accounts.balance("bob"), 60);

    pool.shutdown().await;
}

#[tokio::test]
async fn qa_unfunded_transfer_is_rejected_without_execution() {
    let accounts = Accounts::with(&[("alice", 10)]);
    let pool = start(accounts.clone()).await;
    let mut terminal = pool.subscribe_terminal();

    let id = pool
        .create(NewTransfer::new("guild", "alice", "bob", 60, Duration::from_secs(30)))
        .await
        .unwrap();

    let event = outcome(&mut terminal, id).await;
    assert_eq!(event.status, TransferStatus::Rejected);
    assert_eq!(event.reason, Some(RejectReason::InsufficientFunds));

    let view = pool.get_status(id).await.unwrap();
    assert_eq!(view.reason, Some(RejectReason::InsufficientFunds));
    assert_eq!(accounts.balance("alice"), 10);
    assert_eq!(accounts.balance("bob"), 0);
}

#[tokio::test]
async fn qa_overdraw_race_is_settled_by_the_ledger() {
    // Both pass the balance check, only one can be executed
    let accounts = Accounts::with(&[("alice", 100)]);
    let pool = Arc::new(start(accounts.clone()).await);
    let mut terminal = pool.subscribe_terminal();

    let a = pool
        .create(NewTransfer::new("guild", "alice", "bob", 80, Duration::from_secs(30)))
        .await
        .unwrap();
    let b = pool
        .create(NewTransfer::new("guild", "alice", "carol", 80, Duration::from_secs(30)))
        .await
        .unwrap();

    let mut reasons = HashMap::new();
    tokio::time::timeout(Duration::from_secs(2), async {
        while reasons.len() < 2 {
            let event = terminal.recv().await.unwrap();
            if event.id == a || event.id == b {
                reasons.insert(event.id, event.reason);
            }
        }
    })
    .await
    .expect("transfers did not settle");

    let completed = reasons.values().filter(|r| r.is_none()).count();
    assert_eq!(completed, 1);
    assert_eq!(accounts.balance("alice"), 20);
    assert_eq!(accounts.balance("bob") + accounts.balance("carol"), 80);
}

#[test]
fn qa_shipped_configs_parse() {
    for env in ["dev", "prod"] {
        let config = AppConfig::load(env).unwrap();
        assert!(config.pool.max_retries > 0);
    }
}
