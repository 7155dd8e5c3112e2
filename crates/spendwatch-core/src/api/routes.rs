//! API routes

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use super::handlers::{self, AppState};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Service info
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))

        // Ingestion
        .route("/webhook", post(handlers::webhook))

        // Queries
        .route("/spending-summary", get(handlers::spending_summary))
        .route("/api/v1/totals", get(handlers::list_totals))
        .route("/api/v1/totals/:kind", get(handlers::get_total))

        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
