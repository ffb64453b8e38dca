use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Certificate authority configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaConfig {
    /// Directory holding CA and server certificate files
    pub cert_dir: PathBuf,
    /// Organization on issued certificates
    pub organization: String,
    /// Common name of the CA certificate
    pub ca_common_name: String,
    /// Hostname bound to the server certificate
    pub server_hostname: String,
    /// CA certificate validity in days
    pub ca_validity_days: u32,
    /// Server/client certificate validity in days
    pub cert_validity_days: u32,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            cert_dir: PathBuf::from("/etc/sysmanage/certs"),
            organization: "SysManage".to_string(),
            ca_common_name: "SysManage CA".to_string(),
            server_hostname: "localhost".to_string(),
            ca_validity_days: 3650,
            cert_validity_days: 365,
        }
    }
}

/// A freshly minted client certificate, returned inline to the caller.
/// The private key is never persisted server-side.
#[derive(Debug, Clone)]
pub struct ClientCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    /// Hex form of the certificate serial, stored on the host row for
    /// revocation checks.
    pub serial: String,
}

#[derive(Error, Debug)]
pub enum CaError {
    #[error("CA not initialized")]
    NotInitialized,

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("Certificate parsing error: {0}")]
    ParsingError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type CaResult<T> = Result<T, CaError>;
