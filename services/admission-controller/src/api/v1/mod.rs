//! API v1 routes.

mod queues;
mod workloads;

use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/workloads", workloads::routes())
        .nest("/queues", queues::routes())
}
