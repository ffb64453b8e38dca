use std::sync::Arc;

use sm_ca::CertificateAuthority;
use sm_common::{config::ServerConfig, events::EventBus};
use sm_queue::QueueOps;
use sm_registry::state::ConnectionManager;
use sm_store::Store;

/// Shared application state for all API routes.
#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub queue: QueueOps,
    pub connections: Arc<ConnectionManager>,
    pub ca: Arc<CertificateAuthority>,
    pub events: Arc<EventBus>,
    pub config: Arc<ServerConfig>,
}
