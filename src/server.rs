//! HTTP server module.

mod handlers;
mod state;

pub use state::AppState;

use axum::Router;
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/kobo/{device_token}/v1/library/sync", get(handlers::sync))
        .route(
            "/kobo/{device_token}/v1/library/{book_uuid}/state",
            get(handlers::get_reading_state).put(handlers::put_reading_state),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
