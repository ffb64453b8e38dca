//! Reboot endpoints: a plain reboot command for a connected agent and the
//! orchestrated variant that drains child workloads first.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use sm_common::events::OrchestrationEvent;
use sm_queue::{create_command_message, EnqueueRequest, Priority};
use sm_registry::orchestration::{self, OrchestrationError};
use sm_store::orchestrations;

use crate::auth::Operator;
use crate::routes::hosts::approved_host;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/host/{id}/reboot", post(reboot_host))
        .route("/host/{id}/reboot-orchestrated", post(reboot_orchestrated))
        .route("/host/{id}/orchestration", get(get_orchestration))
        .route("/orchestrations/{id}/abort", post(abort_orchestration))
}

/// Plain reboot: the agent must be connected right now.
async fn reboot_host(
    _op: Operator,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let host = match approved_host(&state, &id) {
        Ok(host) => host,
        Err(e) => return e.into_response(),
    };

    if state.connections.agent_for_host(&host.id).await.is_none() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"result": false, "message": "Agent is not connected"})),
        )
            .into_response();
    }

    let req = EnqueueRequest::command(&host.id, create_command_message("reboot_system", json!({})))
        .with_priority(Priority::High);
    match state.queue.enqueue_message(&req) {
        Ok(message_id) => {
            info!(host_id = host.id, "Reboot command queued");
            Json(json!({"result": true, "message": "Reboot queued", "message_id": message_id}))
                .into_response()
        }
        Err(e) => {
            error!(host_id = host.id, "Failed to queue reboot: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"result": false, "message": "Failed to queue reboot"})),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct OrchestratedRebootRequest {
    #[serde(default)]
    shutdown_timeout_seconds: Option<i64>,
}

async fn reboot_orchestrated(
    _op: Operator,
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Option<Json<OrchestratedRebootRequest>>,
) -> impl IntoResponse {
    let host = match approved_host(&state, &id) {
        Ok(host) => host,
        Err(e) => return e.into_response(),
    };
    let timeout = body
        .and_then(|Json(b)| b.shutdown_timeout_seconds)
        .unwrap_or(state.config.shutdown_timeout_secs);

    let result = state.store.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let orch = match orchestration::initiate_reboot(&tx, &host.id, timeout) {
            Ok(orch) => orch,
            Err(OrchestrationError::AlreadyActive(_)) => {
                return Ok(Err(()));
            }
            Err(e) => return Err(sm_store::StoreError::Other(e.to_string())),
        };
        tx.commit()?;
        Ok(Ok(orch))
    });

    match result {
        Ok(Ok(orch)) => {
            let _ = state.events.orchestration.send(OrchestrationEvent {
                orchestration_id: orch.id.clone(),
                parent_host_id: host.id.clone(),
                status: orch.status.clone(),
                message: None,
            });
            info!(host_id = host.id, orchestration_id = orch.id, "Orchestrated reboot started");
            Json(json!({
                "result": true,
                "message": "Orchestrated reboot started",
                "orchestration": orch,
            }))
            .into_response()
        }
        Ok(Err(())) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "result": false,
                "message": "An orchestration is already active for this host",
            })),
        )
            .into_response(),
        Err(e) => {
            error!(host_id = host.id, "Failed to start orchestration: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"result": false, "message": "Failed to start orchestration"})),
            )
                .into_response()
        }
    }
}

async fn get_orchestration(
    _op: Operator,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state
        .store
        .with_conn(|conn| orchestrations::find_active(conn, &id))
    {
        Ok(Some(orch)) => Json(json!({"result": true, "orchestration": orch})).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"result": false, "message": "No active orchestration"})),
        )
            .into_response(),
        Err(e) => {
            error!("Orchestration lookup failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"result": false, "message": "Internal server error"})),
            )
                .into_response()
        }
    }
}

async fn abort_orchestration(
    _op: Operator,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = state.store.with_conn(|conn| {
        Ok(orchestration::fail_orchestration(conn, &id, "aborted by operator")
            .map_err(|e| sm_store::StoreError::Other(e.to_string()))?)
    });
    match result {
        Ok(true) => Json(json!({"result": true, "message": "Orchestration aborted"})).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"result": false, "message": "No such active orchestration"})),
        )
            .into_response(),
        Err(e) => {
            error!("Abort failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"result": false, "message": "Internal server error"})),
            )
                .into_response()
        }
    }
}
