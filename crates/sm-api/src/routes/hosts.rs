//! Host data endpoints: inventory reads and refresh-request shims that
//! translate operator calls into queued commands.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::error;

use sm_queue::{create_command_message, EnqueueRequest};
use sm_store::{hosts, inventory, Host};

use crate::auth::Operator;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/hosts", get(list_hosts))
        .route("/host/{id}/request-hardware-update", post(request_hardware_update))
        .route("/host/{id}/request-user-access-update", post(request_user_access_update))
        .route("/host/{id}/request-software-update", post(request_software_update))
        .route("/host/{id}/storage", get(get_storage))
        .route("/host/{id}/network", get(get_network))
        .route("/host/{id}/users", get(get_users))
        .route("/host/{id}/software", get(get_software))
}

/// Fetch a host and require approval, mapping failures to HTTP codes.
pub(crate) fn approved_host(
    state: &ApiState,
    host_id: &str,
) -> Result<Host, (StatusCode, Json<serde_json::Value>)> {
    let host = state
        .store
        .with_conn(|conn| hosts::get_by_id(conn, host_id))
        .map_err(|e| {
            error!("Host lookup failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"result": false, "message": "Internal server error"})),
            )
        })?;
    let Some(host) = host else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"result": false, "message": "Host not found"})),
        ));
    };
    if !host.is_approved() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"result": false, "message": "Host is not approved"})),
        ));
    }
    Ok(host)
}

fn enqueue_refresh(state: &ApiState, host_id: &str, command_type: &str) -> impl IntoResponse {
    let req = EnqueueRequest::command(host_id, create_command_message(command_type, json!({})));
    match state.queue.enqueue_message(&req) {
        Ok(message_id) => (
            StatusCode::OK,
            Json(json!({
                "result": true,
                "message": "Command queued",
                "message_id": message_id,
            })),
        )
            .into_response(),
        Err(e) => {
            error!(host_id, command_type, "Failed to queue command: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"result": false, "message": "Failed to queue command"})),
            )
                .into_response()
        }
    }
}

async fn list_hosts(_op: Operator, State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.with_conn(|conn| hosts::list(conn)) {
        Ok(hosts) => Json(json!({"result": true, "hosts": hosts})).into_response(),
        Err(e) => {
            error!("Host listing failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"result": false, "message": "Internal server error"})),
            )
                .into_response()
        }
    }
}

async fn request_hardware_update(
    _op: Operator,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match approved_host(&state, &id) {
        Ok(host) => enqueue_refresh(&state, &host.id, "update_hardware").into_response(),
        Err(e) => e.into_response(),
    }
}

async fn request_user_access_update(
    _op: Operator,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match approved_host(&state, &id) {
        Ok(host) => enqueue_refresh(&state, &host.id, "update_user_access").into_response(),
        Err(e) => e.into_response(),
    }
}

async fn request_software_update(
    _op: Operator,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match approved_host(&state, &id) {
        Ok(host) => enqueue_refresh(&state, &host.id, "update_software").into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_storage(
    _op: Operator,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state
        .store
        .with_conn(|conn| inventory::list_storage_devices(conn, &id))
    {
        Ok(devices) => Json(json!({"result": true, "storage_devices": devices})).into_response(),
        Err(e) => {
            error!("Storage lookup failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"result": false, "message": "Internal server error"})),
            )
                .into_response()
        }
    }
}

async fn get_network(
    _op: Operator,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state
        .store
        .with_conn(|conn| inventory::list_network_interfaces(conn, &id))
    {
        Ok(interfaces) => {
            Json(json!({"result": true, "network_interfaces": interfaces})).into_response()
        }
        Err(e) => {
            error!("Network lookup failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"result": false, "message": "Internal server error"})),
            )
                .into_response()
        }
    }
}

async fn get_users(
    _op: Operator,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = state.store.with_conn(|conn| {
        let users = inventory::list_user_accounts(conn, &id)?;
        let mut with_groups = Vec::with_capacity(users.len());
        for user in users {
            let groups = inventory::groups_for_user(conn, user.id)?;
            with_groups.push(json!({
                "id": user.id,
                "username": user.username,
                "uid": user.uid,
                "home_directory": user.home_directory,
                "shell": user.shell,
                "is_system_user": user.is_system_user,
                "groups": groups,
            }));
        }
        Ok(with_groups)
    });
    match result {
        Ok(users) => Json(json!({"result": true, "users": users})).into_response(),
        Err(e) => {
            error!("User lookup failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"result": false, "message": "Internal server error"})),
            )
                .into_response()
        }
    }
}

async fn get_software(
    _op: Operator,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state
        .store
        .with_conn(|conn| inventory::list_software_packages(conn, &id))
    {
        Ok(packages) => Json(json!({"result": true, "software_packages": packages})).into_response(),
        Err(e) => {
            error!("Software lookup failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"result": false, "message": "Internal server error"})),
            )
                .into_response()
        }
    }
}
