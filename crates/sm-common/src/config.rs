use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the API + agent WebSocket endpoint
    pub api_host: String,
    pub api_port: u16,
    /// Hostname placed on the server certificate
    pub server_hostname: String,
    /// SQLite database path
    pub db_path: PathBuf,
    /// Directory holding the CA and server certificate files
    pub cert_dir: PathBuf,
    /// Static operator API token (the fronting auth proxy forwards roles)
    pub api_token: Option<String>,
    /// License key, if one has been installed
    pub license_key: Option<String>,
    /// Dispatch loop tick interval in milliseconds
    pub dispatch_tick_ms: u64,
    /// Messages dequeued per host per tick
    pub dispatch_batch_size: usize,
    /// Ticks between unacknowledged-message sweeps
    pub dispatch_retry_every_ticks: u32,
    /// Seconds a sent message may wait for acknowledgment
    pub ack_timeout_secs: i64,
    /// Default shutdown timeout for reboot orchestrations, in seconds
    pub shutdown_timeout_secs: i64,
    /// Pending messages older than this many hours are expired
    pub queue_max_age_hours: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_host: "0.0.0.0".to_string(),
            api_port: 8443,
            server_hostname: "localhost".to_string(),
            db_path: PathBuf::from("/var/lib/sysmanage/sysmanage.db"),
            cert_dir: PathBuf::from("/etc/sysmanage/certs"),
            api_token: None,
            license_key: None,
            dispatch_tick_ms: 250,
            dispatch_batch_size: 10,
            dispatch_retry_every_ticks: 240,
            ack_timeout_secs: 300,
            shutdown_timeout_secs: 300,
            queue_max_age_hours: 24,
        }
    }
}

impl ServerConfig {
    /// Load the configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("SM_API_HOST") {
            config.api_host = v;
        }
        if let Ok(v) = std::env::var("SM_API_PORT") {
            if let Ok(port) = v.parse() {
                config.api_port = port;
            }
        }
        if let Ok(v) = std::env::var("SM_SERVER_HOSTNAME") {
            config.server_hostname = v;
        }
        if let Ok(v) = std::env::var("SM_DB_PATH") {
            config.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SM_CERT_DIR") {
            config.cert_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SM_API_TOKEN") {
            config.api_token = Some(v);
        }
        if let Ok(v) = std::env::var("SM_LICENSE_KEY") {
            config.license_key = Some(v);
        }
        if let Ok(v) = std::env::var("SM_DISPATCH_TICK_MS") {
            if let Ok(ms) = v.parse() {
                config.dispatch_tick_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("SM_DISPATCH_BATCH_SIZE") {
            if let Ok(n) = v.parse() {
                config.dispatch_batch_size = n;
            }
        }
        if let Ok(v) = std::env::var("SM_ACK_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                config.ack_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("SM_SHUTDOWN_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                config.shutdown_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("SM_QUEUE_MAX_AGE_HOURS") {
            if let Ok(n) = v.parse() {
                config.queue_max_age_hours = n;
            }
        }

        config
    }

    /// Load a `.env` file (if present) and then the environment.
    pub fn load(env_file: Option<&Path>) -> Self {
        if let Some(path) = env_file {
            load_dotenv(path);
        } else {
            let candidates = [PathBuf::from("/etc/sysmanage/.env"), PathBuf::from(".env")];
            for candidate in &candidates {
                if candidate.exists() {
                    load_dotenv(candidate);
                    break;
                }
            }
        }

        Self::from_env()
    }
}

/// Parse a basic .env file (KEY=VALUE per line).
fn load_dotenv(path: &Path) {
    if let Ok(content) = std::fs::read_to_string(path) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"').trim_matches('\'');
                if std::env::var(key).is_err() {
                    // SAFETY: called before spawning any threads (single-threaded init)
                    unsafe { std::env::set_var(key, value) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.api_port, 8443);
        assert_eq!(config.dispatch_tick_ms, 250);
        assert_eq!(config.ack_timeout_secs, 300);
    }
}
