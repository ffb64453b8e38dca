//! Connection manager: maps live agent sessions to host identities and
//! owns the per-session outbound channels.
//!
//! Three indexes are maintained: agent id → session, fqdn → agent id, and
//! host id → agent id. Each session's writes are serialized through an mpsc
//! channel drained by the socket's writer half; reads are owned by a single
//! reader task per session.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use sm_common::events::{EventBus, HostStatusEvent};
use sm_store::{hosts, Store};

use crate::protocol::Envelope;

/// Identity reported during the registration handshake.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub fqdn: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub platform: Option<String>,
}

struct AgentSession {
    identity: Option<SessionIdentity>,
    host_id: Option<String>,
    is_replay: bool,
    tx: mpsc::Sender<Envelope>,
}

/// Cloneable snapshot of a session handed to message handlers.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub agent_id: String,
    pub host_id: Option<String>,
    pub identity: Option<SessionIdentity>,
    /// Replayed queue traffic must not refresh `last_access`.
    pub is_replay: bool,
}

pub struct ConnectionManager {
    sessions: RwLock<HashMap<String, AgentSession>>,
    by_fqdn: RwLock<HashMap<String, String>>,
    by_host: RwLock<HashMap<String, String>>,
    store: Store,
    events: Arc<EventBus>,
}

impl ConnectionManager {
    pub fn new(store: Store, events: Arc<EventBus>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            by_fqdn: RwLock::new(HashMap::new()),
            by_host: RwLock::new(HashMap::new()),
            store,
            events,
        }
    }

    /// Create a session for a freshly accepted socket. Returns the
    /// server-assigned agent id and the receiver the writer task drains.
    pub async fn open_session(&self, is_replay: bool) -> (String, mpsc::Receiver<Envelope>) {
        let agent_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(32);
        self.sessions.write().await.insert(
            agent_id.clone(),
            AgentSession {
                identity: None,
                host_id: None,
                is_replay,
                tx,
            },
        );
        info!(agent_id, "Agent session opened");
        (agent_id, rx)
    }

    /// Record the agent's identity after a successful registration.
    pub async fn register_agent(
        &self,
        agent_id: &str,
        fqdn: &str,
        ipv4: Option<&str>,
        ipv6: Option<&str>,
        platform: Option<&str>,
    ) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(agent_id) {
            session.identity = Some(SessionIdentity {
                fqdn: fqdn.to_string(),
                ipv4: ipv4.map(str::to_string),
                ipv6: ipv6.map(str::to_string),
                platform: platform.map(str::to_string),
            });
            self.by_fqdn
                .write()
                .await
                .insert(fqdn.to_string(), agent_id.to_string());
            info!(agent_id, fqdn, "Agent registered");
        } else {
            warn!(agent_id, "register_agent for unknown session");
        }
    }

    /// Bind a session to an approved host id.
    pub async fn bind_host(&self, agent_id: &str, host_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(agent_id) {
            session.host_id = Some(host_id.to_string());
            self.by_host
                .write()
                .await
                .insert(host_id.to_string(), agent_id.to_string());
        }
    }

    /// Drop the host binding (stale host row, agent must re-register).
    pub async fn clear_binding(&self, agent_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(agent_id) {
            if let Some(host_id) = session.host_id.take() {
                self.by_host.write().await.remove(&host_id);
            }
            session.identity = None;
        }
    }

    pub async fn session_info(&self, agent_id: &str) -> Option<SessionInfo> {
        let sessions = self.sessions.read().await;
        sessions.get(agent_id).map(|s| SessionInfo {
            agent_id: agent_id.to_string(),
            host_id: s.host_id.clone(),
            identity: s.identity.clone(),
            is_replay: s.is_replay,
        })
    }

    /// Send an envelope to a specific session. False when the session is
    /// gone or its channel is closed.
    pub async fn send_to_agent(&self, agent_id: &str, envelope: Envelope) -> bool {
        let tx = {
            let sessions = self.sessions.read().await;
            match sessions.get(agent_id) {
                Some(s) => s.tx.clone(),
                None => return false,
            }
        };
        tx.send(envelope).await.is_ok()
    }

    /// Send an envelope to the session currently bound to `host_id`.
    /// False when no session is mapped.
    pub async fn send_to_host(&self, host_id: &str, envelope: Envelope) -> bool {
        let agent_id = {
            let by_host = self.by_host.read().await;
            match by_host.get(host_id) {
                Some(id) => id.clone(),
                None => return false,
            }
        };
        self.send_to_agent(&agent_id, envelope).await
    }

    /// Broadcast an envelope to every connected session. Returns how many
    /// sessions accepted it.
    pub async fn broadcast(&self, envelope: &Envelope) -> usize {
        let txs: Vec<mpsc::Sender<Envelope>> = {
            let sessions = self.sessions.read().await;
            sessions.values().map(|s| s.tx.clone()).collect()
        };
        let mut delivered = 0;
        for tx in txs {
            if tx.send(envelope.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn connected_host_ids(&self) -> Vec<String> {
        self.by_host.read().await.keys().cloned().collect()
    }

    pub async fn agent_for_host(&self, host_id: &str) -> Option<String> {
        self.by_host.read().await.get(host_id).cloned()
    }

    pub async fn agent_for_fqdn(&self, fqdn: &str) -> Option<String> {
        self.by_fqdn.read().await.get(fqdn).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Tear down a session on socket close (any cause). Evicts all three
    /// indexes and marks the bound host down; `active` is left unchanged.
    pub async fn disconnect(&self, agent_id: &str) {
        let session = self.sessions.write().await.remove(agent_id);
        let Some(session) = session else {
            return;
        };

        if let Some(identity) = &session.identity {
            self.by_fqdn.write().await.remove(&identity.fqdn);
        }
        if let Some(host_id) = &session.host_id {
            self.by_host.write().await.remove(host_id);

            let result = self
                .store
                .with_conn(|conn| hosts::set_status(conn, host_id, "down"));
            if let Err(e) = result {
                warn!(host_id, "Failed to mark host down on disconnect: {e}");
            }
            let _ = self.events.host_status.send(HostStatusEvent {
                host_id: host_id.clone(),
                fqdn: session.identity.as_ref().map(|i| i.fqdn.clone()),
                status: "down".to_string(),
            });
        }
        info!(agent_id, "Agent session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> (ConnectionManager, Store) {
        let store = Store::open_memory().unwrap();
        let events = Arc::new(EventBus::new());
        (ConnectionManager::new(store.clone(), events), store)
    }

    #[tokio::test]
    async fn test_send_to_host_requires_binding() {
        let (cm, _store) = manager();
        let (agent_id, mut rx) = cm.open_session(false).await;

        assert!(!cm.send_to_host("h1", Envelope::new("command", json!({}))).await);

        cm.register_agent(&agent_id, "a.example.com", Some("10.0.0.1"), None, Some("Linux"))
            .await;
        cm.bind_host(&agent_id, "h1").await;

        assert!(cm.send_to_host("h1", Envelope::new("command", json!({"n": 1}))).await);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.message_type, "command");
        assert_eq!(cm.connected_host_ids().await, vec!["h1".to_string()]);
    }

    #[tokio::test]
    async fn test_disconnect_evicts_indexes_and_marks_down() {
        let (cm, store) = manager();

        let host_id = {
            let conn = store.lock();
            sm_store::hosts::create(&conn, "b.example.com", None, None, None)
                .unwrap()
                .id
        };

        let (agent_id, _rx) = cm.open_session(false).await;
        cm.register_agent(&agent_id, "b.example.com", None, None, None).await;
        cm.bind_host(&agent_id, &host_id).await;
        assert_eq!(cm.session_count().await, 1);

        cm.disconnect(&agent_id).await;
        assert_eq!(cm.session_count().await, 0);
        assert!(cm.agent_for_host(&host_id).await.is_none());
        assert!(cm.agent_for_fqdn("b.example.com").await.is_none());

        let host = store
            .with_conn(|conn| sm_store::hosts::get_by_id(conn, &host_id))
            .unwrap()
            .unwrap();
        assert_eq!(host.status, "down");
        assert!(host.active, "active flag must be left unchanged");
    }

    #[tokio::test]
    async fn test_broadcast_counts_sessions() {
        let (cm, _store) = manager();
        let (_a1, mut rx1) = cm.open_session(false).await;
        let (_a2, mut rx2) = cm.open_session(false).await;

        let delivered = cm.broadcast(&Envelope::new("notice", json!({}))).await;
        assert_eq!(delivered, 2);
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_clear_binding() {
        let (cm, _store) = manager();
        let (agent_id, _rx) = cm.open_session(false).await;
        cm.register_agent(&agent_id, "c.example.com", None, None, None).await;
        cm.bind_host(&agent_id, "h9").await;

        cm.clear_binding(&agent_id).await;
        let info = cm.session_info(&agent_id).await.unwrap();
        assert!(info.host_id.is_none());
        assert!(info.identity.is_none());
        assert!(cm.agent_for_host("h9").await.is_none());
    }
}
