//! Local license signature validation.
//!
//! License keys are JWT-like tokens (`header.payload.signature`, each part
//! base64url) signed with ECDSA P-521 over SHA-512 (ES512). Validation is
//! fully offline against the embedded public key; callers may supply a
//! different key (the tests do).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use p521::ecdsa::signature::Verifier;
use p521::ecdsa::{Signature, VerifyingKey};
use p521::pkcs8::der::pem::decode_vec;
use p521::pkcs8::SubjectPublicKeyInfoRef;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::features::LicenseTier;

/// Days an expired license keeps working, with a warning.
pub const EXPIRATION_GRACE_DAYS: i64 = 7;

/// Public key shipped with the binary; replaced at packaging time.
const BUNDLED_PUBLIC_KEY_PEM: &str = include_str!("../keys/es512_public.pem");

/// Decoded license payload.
#[derive(Debug, Clone)]
pub struct LicensePayload {
    pub license_id: String,
    pub tier: LicenseTier,
    pub features: Vec<String>,
    pub modules: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
    pub customer_id: Option<String>,
    pub customer_name: Option<String>,
    pub parent_hosts: Option<i64>,
    pub child_hosts: Option<i64>,
    pub grace_seconds: Option<i64>,
}

/// Result of license validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub payload: Option<LicensePayload>,
    pub error: Option<String>,
    pub warning: Option<String>,
}

impl ValidationResult {
    fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// SHA-256 hex hash of the raw license key, for storage and lookup.
pub fn hash_license_key(license_key: &str) -> String {
    hex::encode(Sha256::digest(license_key.as_bytes()))
}

fn decode_base64url(data: &str) -> Result<Vec<u8>, String> {
    let trimmed = data.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|e| format!("Invalid license key encoding: {e}"))
}

/// Split a license key into (header, payload, signature bytes).
fn parse_license_key(license_key: &str) -> Result<(Value, Value, Vec<u8>), String> {
    let parts: Vec<&str> = license_key.trim().split('.').collect();
    if parts.len() != 3 {
        return Err("Invalid license key format: expected 3 parts separated by dots".to_string());
    }

    let header_json = decode_base64url(parts[0])?;
    let payload_json = decode_base64url(parts[1])?;
    let signature = decode_base64url(parts[2])?;

    let header: Value =
        serde_json::from_slice(&header_json).map_err(|e| format!("Invalid header JSON: {e}"))?;
    let payload: Value =
        serde_json::from_slice(&payload_json).map_err(|e| format!("Invalid payload JSON: {e}"))?;

    Ok((header, payload, signature))
}

/// Decode a PEM-encoded SEC1/SPKI ECDSA P-521 public key.
fn load_verifying_key_from_pem(public_key_pem: &str) -> Result<VerifyingKey, String> {
    let (_, der_bytes) =
        decode_vec(public_key_pem.as_bytes()).map_err(|e| format!("Invalid PEM: {e}"))?;
    let spki = SubjectPublicKeyInfoRef::try_from(der_bytes.as_slice())
        .map_err(|e| format!("Invalid public key DER: {e}"))?;
    VerifyingKey::from_sec1_bytes(spki.subject_public_key.raw_bytes())
        .map_err(|e| format!("Invalid public key point: {e}"))
}

/// Verify the ES512 signature over `header.payload`.
fn verify_signature(license_key: &str, signature: &[u8], public_key_pem: &str) -> bool {
    let verifying_key = match load_verifying_key_from_pem(public_key_pem) {
        Ok(k) => k,
        Err(e) => {
            warn!("Cannot load license public key: {e}");
            return false;
        }
    };

    let parts: Vec<&str> = license_key.split('.').collect();
    let signed_data = format!("{}.{}", parts[0], parts[1]);

    // DER is the issued format; raw r||s is accepted for robustness.
    let sig = match Signature::from_der(signature) {
        Ok(s) => s,
        Err(_) => match Signature::try_from(signature) {
            Ok(s) => s,
            Err(e) => {
                warn!("Malformed license signature: {e}");
                return false;
            }
        },
    };

    verifying_key.verify(signed_data.as_bytes(), &sig).is_ok()
}

fn parse_timestamp(value: &Value, context: &str) -> Result<DateTime<Utc>, String> {
    match value {
        Value::Number(n) => {
            let secs = n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| format!("Invalid {context}: not a timestamp"))?;
            Utc.timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| format!("Invalid {context}: out of range"))
        }
        Value::String(s) => {
            let normalized = s.replace('Z', "+00:00");
            DateTime::parse_from_rfc3339(&normalized)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| format!("Invalid {context}: {e}"))
        }
        _ => Err(format!("Invalid {context}: unexpected type")),
    }
}

fn string_list(payload: &Value, key: &str) -> Vec<String> {
    payload
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Validate and decode the payload. Accepts both the short key set
/// (`lic`, `exp`, `iat`, …) and the legacy long key set (`license_id`,
/// `expires_at`, `issued_at`).
fn validate_payload(payload: &Value) -> Result<LicensePayload, String> {
    let license_id = payload
        .get("lic")
        .or_else(|| payload.get("license_id"))
        .and_then(|v| v.as_str())
        .ok_or("Missing required field: lic or license_id")?
        .to_string();

    let tier_str = payload
        .get("tier")
        .and_then(|v| v.as_str())
        .ok_or("Missing required field: tier")?;
    let tier =
        LicenseTier::parse(tier_str).ok_or_else(|| format!("Invalid tier: {tier_str}"))?;

    let expires_at = if let Some(exp) = payload.get("exp") {
        parse_timestamp(exp, "expiration date")?
    } else if let Some(expires) = payload.get("expires_at") {
        parse_timestamp(expires, "expiration date")?
    } else {
        return Err("Missing required field: exp or expires_at".to_string());
    };

    let issued_at = if let Some(iat) = payload.get("iat") {
        parse_timestamp(iat, "issue date")?
    } else if let Some(issued) = payload.get("issued_at") {
        parse_timestamp(issued, "issue date")?
    } else {
        Utc::now()
    };

    Ok(LicensePayload {
        license_id,
        tier,
        features: string_list(payload, "features"),
        modules: string_list(payload, "modules"),
        expires_at,
        issued_at,
        customer_id: payload
            .get("cust")
            .or_else(|| payload.get("customer_id"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        customer_name: payload
            .get("org")
            .or_else(|| payload.get("customer_name"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        parent_hosts: payload.get("parent_hosts").and_then(|v| v.as_i64()),
        child_hosts: payload.get("child_hosts").and_then(|v| v.as_i64()),
        grace_seconds: payload.get("grace").and_then(|v| v.as_i64()),
    })
}

/// Check expiry. Returns (is_valid, warning). Within 30 days of expiry a
/// warning is attached; after expiry the grace period keeps the license
/// valid (with a warning) for [`EXPIRATION_GRACE_DAYS`].
fn check_expiration(expires_at: DateTime<Utc>) -> (bool, Option<String>) {
    let now = Utc::now();

    if now < expires_at {
        let days_remaining = (expires_at - now).num_days();
        if days_remaining <= 30 {
            return (true, Some(format!("License expires in {days_remaining} days")));
        }
        return (true, None);
    }

    let days_expired = (now - expires_at).num_days();
    if days_expired <= EXPIRATION_GRACE_DAYS {
        return (
            true,
            Some(format!(
                "License expired {days_expired} days ago (grace period ends in {} days)",
                EXPIRATION_GRACE_DAYS - days_expired
            )),
        );
    }

    (false, None)
}

/// Validate a license key: structure, ES512 signature, payload fields, and
/// expiration with grace period. Pass `public_key_pem` to override the
/// bundled key.
pub fn validate_license(license_key: &str, public_key_pem: Option<&str>) -> ValidationResult {
    let (header, payload_value, signature) = match parse_license_key(license_key) {
        Ok(parts) => parts,
        Err(e) => {
            warn!("License validation failed: {e}");
            return ValidationResult::invalid(e);
        }
    };

    let alg = header.get("alg").and_then(|v| v.as_str()).unwrap_or("");
    if alg != "ES512" {
        return ValidationResult::invalid(format!("Unsupported algorithm: {alg}"));
    }

    let key_pem = public_key_pem.unwrap_or(BUNDLED_PUBLIC_KEY_PEM);
    if !verify_signature(license_key, &signature, key_pem) {
        return ValidationResult::invalid("Invalid license signature");
    }

    let payload = match validate_payload(&payload_value) {
        Ok(p) => p,
        Err(e) => return ValidationResult::invalid(e),
    };

    let (is_valid, warning) = check_expiration(payload.expires_at);
    if !is_valid {
        return ValidationResult {
            valid: false,
            payload: Some(payload),
            error: Some("License has expired beyond the grace period".to_string()),
            warning: None,
        };
    }

    info!(
        license_id = payload.license_id,
        tier = payload.tier.as_str(),
        expires = %payload.expires_at,
        "License validated"
    );

    ValidationResult {
        valid: true,
        payload: Some(payload),
        error: None,
        warning,
    }
}

/// Whether a validated license includes a feature.
pub fn has_feature(payload: &LicensePayload, feature: crate::features::FeatureCode) -> bool {
    payload.features.iter().any(|f| f == feature.as_str())
}

/// Whether a validated license includes a module.
pub fn has_module(payload: &LicensePayload, module: crate::features::ModuleCode) -> bool {
    payload.modules.iter().any(|m| m == module.as_str())
}
