//! Certificate endpoints.
//!
//! Fingerprint and CA download are unauthenticated so agents can complete
//! first-time setup; client certificate issue and revocation require an
//! operator.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{error, info};

use sm_store::hosts;

use crate::auth::Operator;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/certificates/server-fingerprint", get(server_fingerprint))
        .route("/certificates/ca-certificate", get(ca_certificate))
        .route("/certificates/client/{host_id}", get(client_certificate))
        .route("/certificates/revoke/{host_id}", post(revoke_certificate))
}

fn validate_host_id(host_id: &str) -> Result<(), (StatusCode, Json<serde_json::Value>)> {
    uuid::Uuid::parse_str(host_id).map(|_| ()).map_err(|_| {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"result": false, "message": "Invalid host ID format"})),
        )
    })
}

/// Server certificate fingerprint for agent pinning. Unauthenticated.
async fn server_fingerprint(State(state): State<ApiState>) -> impl IntoResponse {
    match state.ca.server_fingerprint() {
        Ok(fingerprint) => Json(json!({"fingerprint": fingerprint})).into_response(),
        Err(e) => {
            error!("Failed to get server fingerprint: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"result": false, "message": "Failed to get server fingerprint"})),
            )
                .into_response()
        }
    }
}

/// CA certificate for agent trust setup. Unauthenticated.
async fn ca_certificate(State(state): State<ApiState>) -> impl IntoResponse {
    match state.ca.ca_cert_pem() {
        Ok(pem) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/x-pem-file"),
                (header::CONTENT_DISPOSITION, "attachment; filename=ca.crt"),
            ],
            pem,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to read CA certificate: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"result": false, "message": "Failed to get CA certificate"})),
            )
                .into_response()
        }
    }
}

/// Mint a client certificate for an approved host. A fresh key pair is
/// generated on every call; the PEM and serial are stored on the host row
/// and the private key is returned inline only.
async fn client_certificate(
    _op: Operator,
    State(state): State<ApiState>,
    Path(host_id): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = validate_host_id(&host_id) {
        return e.into_response();
    }

    let host = match state.store.with_conn(|conn| hosts::get_by_id(conn, &host_id)) {
        Ok(Some(host)) => host,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"result": false, "message": "Host not found"})),
            )
                .into_response();
        }
        Err(e) => {
            error!("Host lookup failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"result": false, "message": "Internal server error"})),
            )
                .into_response();
        }
    };

    if !host.is_approved() {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"result": false, "message": "Host is not approved"})),
        )
            .into_response();
    }

    let minted = match state.ca.mint_client_cert(&host.fqdn, &host.id).await {
        Ok(minted) => minted,
        Err(e) => {
            error!(host_id, "Client certificate generation failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"result": false, "message": "Certificate generation failed"})),
            )
                .into_response();
        }
    };

    let stored = state.store.with_conn(|conn| {
        hosts::set_client_certificate(
            conn,
            &host.id,
            Some(&minted.cert_pem),
            Some(&minted.serial),
            Some(chrono::Utc::now()),
        )
    });
    if let Err(e) = stored {
        error!(host_id, "Failed to store client certificate: {e}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"result": false, "message": "Internal server error"})),
        )
            .into_response();
    }

    let ca_pem = state.ca.ca_cert_pem().unwrap_or_default();
    let fingerprint = state.ca.server_fingerprint().unwrap_or_default();

    info!(host_id, fqdn = host.fqdn, "Client certificate issued via API");
    Json(json!({
        "certificate": minted.cert_pem,
        "private_key": minted.key_pem,
        "ca_certificate": ca_pem,
        "server_fingerprint": fingerprint,
    }))
    .into_response()
}

/// Revoke a host's client certificate: clear the stored PEM and serial and
/// mark the host revoked. The old certificate still verifies at the crypto
/// layer, but the authorization layer rejects non-approved hosts.
async fn revoke_certificate(
    _op: Operator,
    State(state): State<ApiState>,
    Path(host_id): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = validate_host_id(&host_id) {
        return e.into_response();
    }

    let result = state.store.with_conn(|conn| {
        let Some(host) = hosts::get_by_id(conn, &host_id)? else {
            return Ok(false);
        };
        hosts::set_client_certificate(conn, &host.id, None, None, None)?;
        hosts::set_approval(conn, &host.id, "revoked")?;
        Ok(true)
    });

    match result {
        Ok(true) => {
            info!(host_id, "Client certificate revoked");
            Json(json!({"result": "Certificate revoked successfully"})).into_response()
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"result": false, "message": "Host not found"})),
        )
            .into_response(),
        Err(e) => {
            error!(host_id, "Revocation failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"result": false, "message": "Internal server error"})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::test_state;

    #[tokio::test]
    async fn test_invalid_host_id_is_422() {
        let (state, _dir) = test_state().await;
        let response = revoke_certificate(
            Operator { roles: vec![] },
            State(state),
            Path("not-a-uuid".to_string()),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_client_cert_requires_approval() {
        let (state, _dir) = test_state().await;
        let host_id = state
            .store
            .with_conn(|conn| Ok(hosts::create(conn, "cert.example.com", None, None, None)?.id))
            .unwrap();

        let response = client_certificate(
            Operator { roles: vec![] },
            State(state),
            Path(host_id),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_issue_then_revoke_flow() {
        let (state, dir) = test_state().await;
        state.ca.ensure_server_cert().await.unwrap();

        let host_id = state
            .store
            .with_conn(|conn| {
                let host = hosts::create(conn, "agent9.example.com", None, None, None)?;
                hosts::set_approval(conn, &host.id, "approved")?;
                Ok(host.id)
            })
            .unwrap();

        let response = client_certificate(
            Operator { roles: vec![] },
            State(state.clone()),
            Path(host_id.clone()),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let host = state
            .store
            .with_conn(|conn| hosts::get_by_id(conn, &host_id))
            .unwrap()
            .unwrap();
        let cert_pem = host.client_certificate.clone().unwrap();
        assert!(host.certificate_serial.is_some());
        assert!(host.certificate_issued_at.is_some());

        // The stored certificate round-trips through validation.
        let (fqdn, validated_id) = state.ca.validate_client_cert(&cert_pem).unwrap();
        assert_eq!(fqdn, "agent9.example.com");
        assert_eq!(validated_id, host_id);

        let response = revoke_certificate(
            Operator { roles: vec![] },
            State(state.clone()),
            Path(host_id.clone()),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let host = state
            .store
            .with_conn(|conn| hosts::get_by_id(conn, &host_id))
            .unwrap()
            .unwrap();
        assert!(host.client_certificate.is_none());
        assert!(host.certificate_serial.is_none());
        assert_eq!(host.approval_status, "revoked");

        // Crypto-layer validation still passes; authorization must reject.
        assert!(state.ca.validate_client_cert(&cert_pem).is_some());
        assert!(!host.is_approved());

        std::fs::remove_dir_all(dir).ok();
    }
}
