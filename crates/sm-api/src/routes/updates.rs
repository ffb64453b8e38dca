//! OS upgrade execution shim. Upgrades ride the same command channel as
//! ordinary updates; the endpoint is gated on a dedicated operator role.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use sm_queue::{create_command_message, operations as queue_ops, EnqueueRequest, Priority};
use sm_store::updates;

use crate::auth::Operator;
use crate::routes::hosts::approved_host;
use crate::state::ApiState;

pub const APPLY_HOST_OS_UPGRADE: &str = "APPLY_HOST_OS_UPGRADE";

pub fn router() -> Router<ApiState> {
    Router::new().route("/execute-os-upgrades", post(execute_os_upgrades))
}

#[derive(Debug, Deserialize)]
struct OsUpgradeRequest {
    host_ids: Vec<String>,
    packages: Vec<UpgradePackage>,
}

#[derive(Debug, Clone, Deserialize)]
struct UpgradePackage {
    package_name: String,
    package_manager: String,
}

async fn execute_os_upgrades(
    op: Operator,
    State(state): State<ApiState>,
    Json(request): Json<OsUpgradeRequest>,
) -> impl IntoResponse {
    if let Err(e) = op.require_role(APPLY_HOST_OS_UPGRADE) {
        return e.into_response();
    }
    if request.host_ids.is_empty() || request.packages.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"result": false, "message": "host_ids and packages are required"})),
        )
            .into_response();
    }

    let mut queued = Vec::new();
    for host_id in &request.host_ids {
        let host = match approved_host(&state, host_id) {
            Ok(host) => host,
            Err(e) => return e.into_response(),
        };

        let result = state.store.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            for package in &request.packages {
                updates::insert_execution_log(
                    &tx,
                    &host.id,
                    &package.package_name,
                    &package.package_manager,
                )?;
            }
            let command = create_command_message(
                "apply_updates",
                json!({
                    "packages": request
                        .packages
                        .iter()
                        .map(|p| json!({
                            "package_name": p.package_name,
                            "package_manager": p.package_manager,
                            "is_os_upgrade": true,
                        }))
                        .collect::<Vec<_>>(),
                }),
            );
            let req = EnqueueRequest::command(&host.id, command).with_priority(Priority::High);
            let message_id = queue_ops::enqueue_on(&tx, &req)
                .map_err(|e| sm_store::StoreError::Other(e.to_string()))?;
            tx.commit()?;
            Ok(message_id)
        });

        match result {
            Ok(message_id) => queued.push(json!({"host_id": host.id, "message_id": message_id})),
            Err(e) => {
                error!(host_id, "Failed to queue OS upgrade: {e}");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"result": false, "message": "Failed to queue OS upgrade"})),
                )
                    .into_response();
            }
        }
    }

    info!(
        hosts = queued.len(),
        packages = request.packages.len(),
        "OS upgrades queued"
    );
    Json(json!({"result": true, "message": "OS upgrades queued", "queued": queued}))
        .into_response()
}
