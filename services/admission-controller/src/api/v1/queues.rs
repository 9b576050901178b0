//! Quota reporting endpoints.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::error::ControllerError;
use crate::quota::{QueueUsage, ReservationRecord};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_queues))
        .route("/{queue}/reservations", get(list_reservations))
}

#[derive(Debug, Serialize)]
pub struct ListQueuesResponse {
    pub items: Vec<QueueUsage>,
}

#[derive(Debug, Serialize)]
pub struct ListReservationsResponse {
    pub queue: String,
    pub items: Vec<ReservationRecord>,
}

/// GET /v1/queues
async fn list_queues(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Json<ListQueuesResponse>, ApiError> {
    let items = state
        .ledger()
        .usage()
        .await
        .map_err(|e| ApiError::from_controller(e.into(), &ctx.request_id))?;

    Ok(Json(ListQueuesResponse { items }))
}

/// GET /v1/queues/{queue}/reservations
async fn list_reservations(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(queue): Path<String>,
) -> Result<Json<ListReservationsResponse>, ApiError> {
    let items = state
        .ledger()
        .reservations(&queue)
        .await
        .map_err(ControllerError::from)
        .and_then(|items| items.ok_or_else(|| ControllerError::QueueNotFound(queue.clone())))
        .map_err(|e| ApiError::from_controller(e, &ctx.request_id))?;

    Ok(Json(ListReservationsResponse { queue, items }))
}
