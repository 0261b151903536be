use std::sync::Arc;

use crate::db::Database;
use crate::event_pool::TransferEventPool;

/// Shared gateway state
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<TransferEventPool>,
    /// Present when the pool is backed by PostgreSQL
    pub pg_db: Option<Arc<Database>>,
}

impl AppState {
    pub fn new(pool: Arc<TransferEventPool>, pg_db: Option<Arc<Database>>) -> Self {
        Self { pool, pg_db }
    }

    pub fn store_name(&self) -> &'static str {
        if self.pg_db.is_some() { "postgres" } else { "memory" }
    }
}
