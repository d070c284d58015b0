use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route(
            "/api/libraries/{library_id}/scan",
            post(handlers::trigger_library_scan),
        )
        .route(
            "/api/collections/{collection_id}/scan",
            post(handlers::trigger_collection_rescan),
        )
        .route("/api/collections", get(handlers::list_collections))
        .route(
            "/api/collections/{collection_id}/position",
            get(handlers::collection_position),
        )
        .route(
            "/api/collections/{collection_id}/siblings",
            get(handlers::collection_siblings),
        )
        .route("/api/jobs", get(handlers::list_jobs))
        .route("/api/jobs/{job_id}", get(handlers::job_status))
        .route("/api/jobs/{job_id}/cancel", post(handlers::cancel_job))
        .route("/api/index/rebuild", post(handlers::rebuild_index))
        .route("/api/dlq/recover", post(handlers::recover_dlq))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
