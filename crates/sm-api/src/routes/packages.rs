//! Package installation shim: one installation batch becomes per-package
//! log rows plus a single queued command carrying the batch id.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use sm_queue::{create_command_message, operations as queue_ops, EnqueueRequest};
use sm_store::updates;

use crate::auth::Operator;
use crate::routes::hosts::approved_host;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new().route("/packages/install/{host_id}", post(install_packages))
}

#[derive(Debug, Deserialize)]
struct InstallRequest {
    packages: Vec<PackageSpec>,
}

#[derive(Debug, Deserialize)]
struct PackageSpec {
    package_name: String,
    #[serde(default)]
    version: Option<String>,
}

async fn install_packages(
    _op: Operator,
    State(state): State<ApiState>,
    Path(host_id): Path<String>,
    Json(request): Json<InstallRequest>,
) -> impl IntoResponse {
    let host = match approved_host(&state, &host_id) {
        Ok(host) => host,
        Err(e) => return e.into_response(),
    };
    if request.packages.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"result": false, "message": "No packages requested"})),
        )
            .into_response();
    }

    let installation_id = Uuid::new_v4().to_string();

    let enqueued = state.store.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        for package in &request.packages {
            updates::insert_installation_log(
                &tx,
                &installation_id,
                &host.id,
                &package.package_name,
                package.version.as_deref(),
            )?;
        }

        let command = create_command_message(
            "install_packages",
            json!({
                "installation_id": installation_id,
                "packages": request
                    .packages
                    .iter()
                    .map(|p| json!({
                        "package_name": p.package_name,
                        "version": p.version,
                        "installation_id": installation_id,
                    }))
                    .collect::<Vec<_>>(),
            }),
        );
        let req = EnqueueRequest::command(&host.id, command);
        let message_id = queue_ops::enqueue_on(&tx, &req)
            .map_err(|e| sm_store::StoreError::Other(e.to_string()))?;
        tx.commit()?;
        Ok(message_id)
    });

    match enqueued {
        Ok(message_id) => {
            info!(
                host_id = host.id,
                installation_id,
                packages = request.packages.len(),
                "Package installation queued"
            );
            Json(json!({
                "result": true,
                "message": "Installation queued",
                "installation_id": installation_id,
                "message_id": message_id,
            }))
            .into_response()
        }
        Err(e) => {
            error!(host_id = host.id, "Failed to queue installation: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"result": false, "message": "Failed to queue installation"})),
            )
                .into_response()
        }
    }
}
