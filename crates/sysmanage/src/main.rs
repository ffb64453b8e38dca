mod supervisor;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use sm_api::{api_router, ApiState};
use sm_ca::{CaConfig, CertificateAuthority};
use sm_common::config::ServerConfig;
use sm_common::events::EventBus;
use sm_queue::QueueOps;
use sm_registry::dispatch::{DispatchConfig, Dispatcher};
use sm_registry::state::ConnectionManager;
use sm_store::Store;
use supervisor::{spawn_supervised, RestartPolicy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sysmanage=debug".parse().unwrap()),
        )
        .init();

    info!("SysManage server starting...");

    let config = Arc::new(ServerConfig::load(None));
    info!(
        db = %config.db_path.display(),
        certs = %config.cert_dir.display(),
        "Configuration loaded"
    );

    // Persistent store (schema created on open)
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Store::open(&config.db_path)?;

    // Certificate authority: CA and server certificate must exist before
    // any agent can pin or present certificates.
    let ca = Arc::new(CertificateAuthority::new(CaConfig {
        cert_dir: config.cert_dir.clone(),
        server_hostname: config.server_hostname.clone(),
        ..Default::default()
    }));
    ca.ensure_server_cert().await?;
    info!(
        fingerprint = ca.server_fingerprint()?,
        "Certificate authority ready"
    );

    // License check at boot; the server runs community-tier without one.
    if let Some(license_key) = &config.license_key {
        let result = sm_license::validate_license(license_key, None);
        match (&result.valid, &result.payload) {
            (true, Some(payload)) => {
                info!(
                    tier = payload.tier.as_str(),
                    license_id = payload.license_id,
                    "License valid"
                );
                if let Some(warning) = &result.warning {
                    warn!("{warning}");
                }
            }
            _ => warn!(
                "Installed license is invalid: {}",
                result.error.as_deref().unwrap_or("unknown error")
            ),
        }
    } else {
        info!("No license installed, running community tier");
    }

    let events = Arc::new(EventBus::new());
    let connections = Arc::new(ConnectionManager::new(store.clone(), events.clone()));
    let queue = QueueOps::new(store.clone());

    // Outbound dispatch loop
    let dispatcher_factory = {
        let queue = queue.clone();
        let connections = connections.clone();
        let events = events.clone();
        let config = config.clone();
        move || {
            let dispatcher = Dispatcher::new(
                queue.clone(),
                connections.clone(),
                events.clone(),
                DispatchConfig {
                    tick: Duration::from_millis(config.dispatch_tick_ms),
                    batch_size: config.dispatch_batch_size,
                    retry_every_ticks: config.dispatch_retry_every_ticks,
                    ack_timeout_secs: config.ack_timeout_secs,
                    queue_max_age_hours: config.queue_max_age_hours,
                },
            );
            async move { dispatcher.run().await }
        }
    };
    spawn_supervised("dispatch-loop", RestartPolicy::core(), dispatcher_factory);

    if let Some(license_key) = config.license_key.clone() {
        let license_factory = move || run_license_monitor(license_key.clone());
        spawn_supervised("license-monitor", RestartPolicy::monitor(), license_factory);
    }

    // API + agent WebSocket endpoint
    let state = ApiState {
        store: store.clone(),
        queue: queue.clone(),
        connections: connections.clone(),
        ca: ca.clone(),
        events: events.clone(),
        config: config.clone(),
    };
    let addr: SocketAddr = format!("{}:{}", config.api_host, config.api_port).parse()?;
    let api_factory = {
        let state = state.clone();
        move || {
            let app = api_router(state.clone());
            async move {
                let listener = tokio::net::TcpListener::bind(addr).await?;
                info!("API listening on {addr}");
                axum::serve(listener, app).await?;
                Ok(())
            }
        }
    };
    spawn_supervised("api-server", RestartPolicy::core(), api_factory);

    // Shutdown on SIGTERM/SIGINT
    let mut signals = Signals::new([SIGTERM, SIGINT])?;
    if let Some(signal) = signals.next().await {
        info!(signal, "Shutdown signal received");
    }

    info!("SysManage server stopped");
    Ok(())
}

/// Revalidate the installed license daily so expiry warnings surface in
/// the logs long before the grace period runs out.
async fn run_license_monitor(license_key: String) -> anyhow::Result<()> {
    loop {
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        let result = sm_license::validate_license(&license_key, None);
        if !result.valid {
            warn!(
                "License is no longer valid: {}",
                result.error.as_deref().unwrap_or("unknown error")
            );
        } else if let Some(warning) = &result.warning {
            warn!("{warning}");
        }
    }
}
