//! Operator authentication.
//!
//! Operator requests arrive through a fronting auth proxy: a static bearer
//! token gates the API and the proxy forwards the operator's roles in the
//! `x-operator-roles` header. Endpoints that need a specific role call
//! [`Operator::require_role`].

use axum::extract::FromRequestParts;
use axum::http::{header::AUTHORIZATION, request::Parts, StatusCode};
use axum::Json;
use serde_json::json;

use crate::state::ApiState;

pub struct Operator {
    pub roles: Vec<String>,
}

impl Operator {
    pub fn require_role(
        &self,
        role: &str,
    ) -> Result<(), (StatusCode, Json<serde_json::Value>)> {
        if self.roles.iter().any(|r| r == role) {
            Ok(())
        } else {
            Err((
                StatusCode::FORBIDDEN,
                Json(json!({"result": false, "message": format!("Missing required role: {role}")})),
            ))
        }
    }
}

impl FromRequestParts<ApiState> for Operator {
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ApiState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(expected) = &state.config.api_token {
            let presented = parts
                .headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "));
            if presented != Some(expected.as_str()) {
                return Err((
                    StatusCode::UNAUTHORIZED,
                    Json(json!({"result": false, "message": "Invalid or missing token"})),
                ));
            }
        }

        let roles = parts
            .headers
            .get("x-operator-roles")
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                v.split(',')
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Operator { roles })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_role() {
        let op = Operator {
            roles: vec!["VIEW_HOSTS".to_string(), "APPLY_HOST_OS_UPGRADE".to_string()],
        };
        assert!(op.require_role("APPLY_HOST_OS_UPGRADE").is_ok());
        assert!(op.require_role("DELETE_HOST").is_err());
    }
}
