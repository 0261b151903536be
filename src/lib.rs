//! Transfer Event Pool
//!
//! Asynchronous, retryable, event-driven pool that validates conditional
//! transfers against independent predicates and executes each approved
//! transfer exactly once.
//!
//! # Modules
//!
//! - [`event_pool`] - Store, state machine and background workers
//! - [`gateway`] - HTTP surface (axum)
//! - [`db`] - PostgreSQL connection pool and schema
//! - [`config`] - YAML configuration
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod db;
pub mod event_pool;
pub mod gateway;
pub mod logging;

// Convenient re-exports at crate root
pub use event_pool::{
    NewTransfer, PendingTransfer, PoolError, TransferEventPool, TransferId, TransferStatus,
};
