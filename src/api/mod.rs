pub mod error;
pub mod health;
pub mod status;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::app::AppState;
use crate::config::ServerConfig;

/// Builds the read-only HTTP status surface (§6.1). None of these routes
/// ever trigger a rebuild; rebuilds come only from the tick/hourly/
/// settings/Flow triggers wired up in `app::spawn_tasks`.
pub fn router(state: AppState, server_cfg: &ServerConfig) -> Router {
    let mut router = Router::new()
        .route("/health", get(health::health))
        .route("/api/v1/status", get(status::status))
        .route("/api/v1/plan", get(status::plan))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if server_cfg.enable_cors {
        router = router.layer(CorsLayer::permissive());
    }

    router
}
