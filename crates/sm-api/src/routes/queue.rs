//! Queue monitoring endpoints for the management UI.

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use sm_queue::{stats, QueueDirection};

use crate::auth::Operator;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/queue/stats", get(queue_stats))
        .route("/queue/failed", get(failed_messages))
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    host_id: Option<String>,
    direction: Option<String>,
}

async fn queue_stats(
    _op: Operator,
    State(state): State<ApiState>,
    Query(query): Query<StatsQuery>,
) -> impl IntoResponse {
    let direction = match query.direction.as_deref() {
        Some("outbound") => Some(QueueDirection::Outbound),
        Some("inbound") => Some(QueueDirection::Inbound),
        _ => None,
    };
    let snapshot = stats::get_queue_stats(state.queue.store(), query.host_id.as_deref(), direction);
    Json(json!({"result": true, "stats": snapshot}))
}

#[derive(Debug, Deserialize)]
struct FailedQuery {
    limit: Option<usize>,
}

async fn failed_messages(
    _op: Operator,
    State(state): State<ApiState>,
    Query(query): Query<FailedQuery>,
) -> impl IntoResponse {
    let messages = stats::get_failed_messages(state.queue.store(), query.limit.unwrap_or(100));
    Json(json!({"result": true, "messages": messages}))
}
