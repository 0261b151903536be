//! Transfer route handlers

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::{Path, Query, State},
};

use super::state::AppState;
use super::types::{
    ApiError, ApiResult, CreateTransferRequest, CreateTransferResponse, HealthResponse,
    ListTransfersQuery, ok,
};
use crate::event_pool::types::now_ms;
use crate::event_pool::{NewTransfer, PendingTransfer, TransferId, TransferStatus, TransferStatusView};

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 500;

/// POST /api/v1/transfers
///
/// Validates and stores the transfer, then returns while checks run.
pub async fn create_transfer(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTransferRequest>,
) -> ApiResult<CreateTransferResponse> {
    let ttl = req
        .ttl_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| state.pool.config().default_ttl());

    let mut new = NewTransfer::new(req.scope, req.initiator, req.target, req.amount, ttl);
    new.metadata = req.metadata;

    let transfer_id = state.pool.create(new).await?;
    ok(CreateTransferResponse {
        transfer_id,
        status: TransferStatus::Pending,
    })
}

/// GET /api/v1/transfers/{id}
pub async fn get_transfer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<TransferStatusView> {
    let id: TransferId = id
        .parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid transfer id: {}", id)))?;
    ok(state.pool.get_status(id).await?)
}

/// GET /api/v1/transfers?scope=&status=&limit=&offset=
pub async fn list_transfers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTransfersQuery>,
) -> ApiResult<Vec<PendingTransfer>> {
    if query.scope.trim().is_empty() {
        return ApiError::bad_request("scope is required").into_err();
    }
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(s) => Some(
            s.parse::<TransferStatus>()
                .map_err(|_| ApiError::bad_request(format!("Invalid status: {}", s)))?,
        ),
    };
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);

    ok(state.pool.list(&query.scope, status, limit, offset).await?)
}

/// GET /api/v1/health
///
/// - Healthy: 200 OK + {code: 0, data: {timestamp_ms, store}}
/// - Unhealthy: 503 + {code: 5001, msg: "unavailable"}
pub async fn health_check(State(state): State<Arc<AppState>>) -> ApiResult<HealthResponse> {
    if let Some(db) = &state.pg_db
        && let Err(e) = db.health_check().await
    {
        tracing::error!(error = %e, "PostgreSQL health check failed");
        return ApiError::service_unavailable("unavailable").into_err();
    }

    ok(HealthResponse {
        timestamp_ms: now_ms(),
        store: state.store_name().to_string(),
    })
}
