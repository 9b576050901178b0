//! HTTP API handlers and routing.

pub mod error;
mod health;
pub mod request_context;
mod v1;

use axum::{
    http::{header, HeaderName, Method},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(request_context::REQUEST_ID_HEADER),
        ])
        .allow_origin(Any);

    Router::new()
        .merge(health::routes())
        .nest("/v1", v1::routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{body::Body, http::Request, http::StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::clock::{SharedClock, SystemClock};
    use crate::service::WorkloadService;
    use crate::store::{InMemoryStore, SharedStore};

    fn router() -> (Arc<InMemoryStore>, Router) {
        let memory = Arc::new(InMemoryStore::new());
        let store: SharedStore = memory.clone();
        let clock: SharedClock = Arc::new(SystemClock);
        let workloads = WorkloadService::new(store.clone(), clock, Default::default());
        (memory, create_router(AppState::new(store, workloads)))
    }

    #[tokio::test]
    async fn test_readyz_tracks_store() {
        let (store, app) = router();

        let response = app
            .clone()
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        store.set_available(false);
        let response = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unknown_workload_is_problem_json() {
        let (_store, app) = router();
        let id = admitq_id::WorkloadId::new();

        let response = app
            .oneshot(
                Request::get(format!("/v1/workloads/{id}"))
                    .header(request_context::REQUEST_ID_HEADER, "req-404")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/problem+json"
        );
    }
}
