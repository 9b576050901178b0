//! Workload API endpoints.
//!
//! Submission, inspection, deletion, and the verdict intake used by external
//! admission check controllers.

use std::collections::HashMap;

use admitq_id::WorkloadId;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::checks::VerdictRequest;
use crate::eviction::VerdictOutcome;
use crate::model::{ResourceList, Workload, WorkloadPhase, WorkloadStatus};
use crate::service::SubmitWorkload;
use crate::state::AppState;
use crate::store::Versioned;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_workload).get(list_workloads))
        .route("/{workload_id}", get(get_workload).delete(delete_workload))
        .route("/{workload_id}/checks/{check}", post(post_verdict))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct WorkloadResponse {
    pub id: WorkloadId,
    pub queue: String,
    pub priority: i32,
    pub resources: ResourceList,
    pub created_at: DateTime<Utc>,
    pub phase: WorkloadPhase,
    /// Resource version for optimistic concurrency.
    pub resource_version: u64,
    pub status: WorkloadStatus,
}

impl WorkloadResponse {
    fn new(workload: Versioned<Workload>, required: &[String]) -> Self {
        let Versioned { version, value } = workload;
        Self {
            phase: value.phase(required),
            id: value.id,
            queue: value.queue,
            priority: value.priority,
            resources: value.resources,
            created_at: value.created_at,
            resource_version: version.value(),
            status: value.status,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListWorkloadsResponse {
    pub items: Vec<WorkloadResponse>,
}

#[derive(Debug, Deserialize)]
pub struct ListWorkloadsQuery {
    /// Only workloads submitted to this queue.
    pub queue: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct VerdictResponse {
    /// "applied", "evicted" or "ignored".
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admitted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requeue_at: Option<DateTime<Utc>>,
}

impl From<VerdictOutcome> for VerdictResponse {
    fn from(outcome: VerdictOutcome) -> Self {
        let empty = Self {
            outcome: "",
            reason: None,
            admitted: None,
            retry_count: None,
            requeue_at: None,
        };
        match outcome {
            VerdictOutcome::Applied { admitted } => Self {
                outcome: "applied",
                admitted: Some(admitted),
                ..empty
            },
            VerdictOutcome::Evicted {
                retry_count,
                requeue_at,
            } => Self {
                outcome: "evicted",
                retry_count: Some(retry_count),
                requeue_at,
                ..empty
            },
            VerdictOutcome::Ignored(reason) => Self {
                outcome: "ignored",
                reason: Some(reason.as_str()),
                ..empty
            },
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

fn parse_workload_id(raw: &str, request_id: &str) -> Result<WorkloadId, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::bad_request("invalid_workload_id", "Invalid workload ID format")
            .with_request_id(request_id)
    })
}

async fn required_checks(
    state: &AppState,
    queue: &str,
    request_id: &str,
) -> Result<Vec<String>, ApiError> {
    Ok(state
        .store()
        .get_queue(queue)
        .await
        .map_err(|e| ApiError::from_controller(e.into(), request_id))?
        .map(|q| q.value.admission_checks)
        .unwrap_or_default())
}

/// POST /v1/workloads
async fn create_workload(
    State(state): State<AppState>,
    ctx: RequestContext,
    body: Result<Json<SubmitWorkload>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::from_json_rejection(e, &ctx.request_id))?;

    let created = state
        .workloads()
        .submit(req)
        .await
        .map_err(|e| ApiError::from_controller(e, &ctx.request_id))?;
    let required = required_checks(&state, &created.value.queue, &ctx.request_id).await?;

    Ok((
        StatusCode::CREATED,
        Json(WorkloadResponse::new(created, &required)),
    ))
}

/// GET /v1/workloads
async fn list_workloads(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<ListWorkloadsQuery>,
) -> Result<Json<ListWorkloadsResponse>, ApiError> {
    let map_err = |e: crate::error::ControllerError| ApiError::from_controller(e, &ctx.request_id);

    let workloads = state.workloads().list().await.map_err(map_err)?;
    let required: HashMap<String, Vec<String>> = state
        .store()
        .list_queues()
        .await
        .map_err(|e| map_err(e.into()))?
        .into_iter()
        .map(|q| (q.value.name, q.value.admission_checks))
        .collect();

    let items = workloads
        .into_iter()
        .filter(|wl| query.queue.as_ref().is_none_or(|q| &wl.value.queue == q))
        .map(|wl| {
            let checks = required
                .get(&wl.value.queue)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            WorkloadResponse::new(wl, checks)
        })
        .collect();

    Ok(Json(ListWorkloadsResponse { items }))
}

/// GET /v1/workloads/{workload_id}
async fn get_workload(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(workload_id): Path<String>,
) -> Result<Json<WorkloadResponse>, ApiError> {
    let id = parse_workload_id(&workload_id, &ctx.request_id)?;
    let workload = state
        .workloads()
        .get(&id)
        .await
        .map_err(|e| ApiError::from_controller(e, &ctx.request_id))?;
    let required = required_checks(&state, &workload.value.queue, &ctx.request_id).await?;

    Ok(Json(WorkloadResponse::new(workload, &required)))
}

/// DELETE /v1/workloads/{workload_id}
async fn delete_workload(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(workload_id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let id = parse_workload_id(&workload_id, &ctx.request_id)?;
    state
        .workloads()
        .delete(&id)
        .await
        .map_err(|e| ApiError::from_controller(e, &ctx.request_id))?;

    Ok(Json(DeleteResponse { ok: true }))
}

/// POST /v1/workloads/{workload_id}/checks/{check}
///
/// Verdicts are delivered at least once; redelivery is answered with an
/// "ignored" outcome rather than an error.
async fn post_verdict(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((workload_id, check)): Path<(String, String)>,
    body: Result<Json<VerdictRequest>, JsonRejection>,
) -> Result<Json<VerdictResponse>, ApiError> {
    let id = parse_workload_id(&workload_id, &ctx.request_id)?;
    let Json(req) = body.map_err(|e| {
        tracing::warn!(
            workload_id = %id,
            check = %check,
            error = %e,
            "Rejecting unreadable verdict"
        );
        ApiError::from_json_rejection(e, &ctx.request_id)
    })?;

    let outcome = state
        .workloads()
        .post_verdict(&id, &check, req)
        .await
        .map_err(|e| ApiError::from_controller(e, &ctx.request_id))?;

    Ok(Json(outcome.into()))
}
