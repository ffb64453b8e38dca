pub mod agent_ws;
pub mod certificates;
pub mod events_ws;
pub mod hosts;
pub mod license;
pub mod packages;
pub mod queue;
pub mod reboot;
pub mod updates;

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::PathBuf;
    use std::sync::Arc;

    use sm_ca::{CaConfig, CertificateAuthority};
    use sm_common::{config::ServerConfig, events::EventBus};
    use sm_queue::QueueOps;
    use sm_registry::state::ConnectionManager;
    use sm_store::Store;

    use crate::state::ApiState;

    /// Fresh in-memory state with a throwaway certificate directory.
    pub(crate) async fn test_state() -> (ApiState, PathBuf) {
        let store = Store::open_memory().unwrap();
        let events = Arc::new(EventBus::new());
        let connections = Arc::new(ConnectionManager::new(store.clone(), events.clone()));
        let cert_dir =
            std::env::temp_dir().join(format!("sm-api-test-{}", uuid::Uuid::new_v4()));
        let ca = Arc::new(CertificateAuthority::new(CaConfig {
            cert_dir: cert_dir.clone(),
            ..Default::default()
        }));
        let config = Arc::new(ServerConfig {
            cert_dir: cert_dir.clone(),
            ..Default::default()
        });
        let state = ApiState {
            queue: QueueOps::new(store.clone()),
            store,
            connections,
            ca,
            events,
            config,
        };
        (state, cert_dir)
    }
}
