use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Event bus for cross-service notifications.
pub struct EventBus {
    /// Host connect/disconnect and status changes (registry → websocket)
    pub host_status: broadcast::Sender<HostStatusEvent>,
    /// Queue activity (dispatch loop → websocket)
    pub queue_activity: broadcast::Sender<QueueActivityEvent>,
    /// Reboot orchestration progress (orchestrator → websocket)
    pub orchestration: broadcast::Sender<OrchestrationEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            host_status: broadcast::channel(64).0,
            queue_activity: broadcast::channel(256).0,
            orchestration: broadcast::channel(64).0,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostStatusEvent {
    pub host_id: String,
    pub fqdn: Option<String>,
    /// "up" or "down"
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueActivityEvent {
    pub host_id: Option<String>,
    pub message_id: String,
    pub message_type: String,
    /// "sent", "completed", "failed"
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationEvent {
    pub orchestration_id: String,
    pub parent_host_id: String,
    pub status: String,
    pub message: Option<String>,
}
