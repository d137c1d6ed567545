pub mod backups;
pub mod schedule;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/backups", backups::router())
        .nest("/api/schedule", schedule::router())
        .route("/api/restores", axum::routing::get(backups::list_restores))
        .route("/api/storage", axum::routing::get(backups::storage_usage))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
