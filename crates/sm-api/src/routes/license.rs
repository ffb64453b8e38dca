//! License inspection endpoint: validate a token offline and report the
//! tier, entitlements, and any expiry warning.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use sm_license::{hash_license_key, tier_features, tier_modules, validate_license};

use crate::auth::Operator;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new().route("/license/validate", post(validate))
}

#[derive(Debug, Deserialize)]
struct LicenseRequest {
    license_key: String,
}

async fn validate(
    _op: Operator,
    State(_state): State<ApiState>,
    Json(request): Json<LicenseRequest>,
) -> impl IntoResponse {
    let result = validate_license(&request.license_key, None);
    let key_hash = hash_license_key(&request.license_key);

    if !result.valid {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "result": false,
                "message": result.error.unwrap_or_else(|| "Invalid license".to_string()),
                "key_hash": key_hash,
            })),
        )
            .into_response();
    }

    let payload = result.payload.expect("valid licenses carry a payload");
    info!(license_id = payload.license_id, tier = payload.tier.as_str(), "License inspected");

    Json(json!({
        "result": true,
        "key_hash": key_hash,
        "warning": result.warning,
        "license": {
            "license_id": payload.license_id,
            "tier": payload.tier.as_str(),
            "expires_at": payload.expires_at.to_rfc3339(),
            "issued_at": payload.issued_at.to_rfc3339(),
            "customer_name": payload.customer_name,
            "features": payload.features,
            "modules": payload.modules,
            "parent_hosts": payload.parent_hosts,
            "child_hosts": payload.child_hosts,
        },
        "tier_defaults": {
            "features": tier_features(payload.tier)
                .iter()
                .map(|f| f.as_str())
                .collect::<Vec<_>>(),
            "modules": tier_modules(payload.tier)
                .iter()
                .map(|m| m.as_str())
                .collect::<Vec<_>>(),
        },
    }))
    .into_response()
}
