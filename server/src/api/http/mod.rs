//! HTTP API handlers

mod clusters;
mod health;
mod sessions;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Session routes
        .route(
            "/sessions",
            post(sessions::start_session).get(sessions::list_sessions),
        )
        .route(
            "/sessions/{id}",
            get(sessions::get_session).delete(sessions::end_session),
        )
        .route("/sessions/{id}/commands", post(sessions::execute_command))
        .route(
            "/sessions/{id}/steps/{step_id}/validate",
            post(sessions::validate_step),
        )
        .route("/sessions/{id}/logs", get(sessions::get_logs))
        .route(
            "/sessions/{id}/configuration",
            post(sessions::apply_configuration),
        )
        .route("/sessions/{id}/pause", post(sessions::pause_session))
        .route("/sessions/{id}/rules/evaluate", post(sessions::evaluate_rules))
        // Cluster registry routes
        .route(
            "/clusters",
            post(clusters::add_cluster).get(clusters::list_clusters),
        )
        .route("/clusters/metrics", get(clusters::get_metrics))
        .route(
            "/clusters/{id}",
            get(clusters::get_cluster)
                .put(clusters::update_cluster)
                .delete(clusters::remove_cluster),
        )
        .route("/clusters/{id}/test", post(clusters::test_connection));

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
