pub mod auth;
pub mod routes;
pub mod state;

use axum::Router;
use tower_http::trace::TraceLayer;

pub use state::ApiState;

/// Assemble the full API router: operator REST shims, certificate
/// endpoints, queue monitoring, and the agent/operator WebSockets.
pub fn api_router(state: ApiState) -> Router {
    Router::new()
        .merge(routes::hosts::router())
        .merge(routes::packages::router())
        .merge(routes::updates::router())
        .merge(routes::certificates::router())
        .merge(routes::queue::router())
        .merge(routes::reboot::router())
        .merge(routes::license::router())
        .merge(routes::agent_ws::router())
        .merge(routes::events_ws::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
