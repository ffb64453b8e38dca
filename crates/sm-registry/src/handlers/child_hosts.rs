//! Child host lifecycle reports (VMs/containers under a parent host).
//!
//! Status updates land in `host_child` and then drive the reboot
//! orchestrator: a stop feeds the drain phase, a start or error feeds the
//! restart phase.

use serde_json::json;
use tracing::{info, warn};

use sm_common::events::OrchestrationEvent;
use sm_store::{children, orchestrations};

use crate::handlers::{echo_id, HandlerContext};
use crate::orchestration;
use crate::protocol::Envelope;
use crate::state::SessionInfo;

/// Normalize the wire status. Agents report lifecycle events
/// (`started`/`stopped`/`error`) or direct states (`running`/…).
fn normalize_status(message_type: &str, raw: Option<&str>) -> String {
    let status = match message_type {
        "child_host_started" => "started",
        "child_host_stopped" => "stopped",
        "child_host_error" => "error",
        _ => raw.unwrap_or(""),
    };
    match status {
        "started" => "running".to_string(),
        "" => "unknown".to_string(),
        other => other.to_string(),
    }
}

pub async fn handle_child_host_status(
    ctx: &HandlerContext,
    session: &SessionInfo,
    envelope: &Envelope,
) -> anyhow::Result<Option<Envelope>> {
    let Some(parent_host_id) = &session.host_id else {
        return Ok(Some(Envelope::error("Host not registered")));
    };
    let data = &envelope.data;
    let Some(child_name) = data.get("child_name").and_then(|v| v.as_str()) else {
        warn!(parent_host_id, "Child host status without child_name");
        return Ok(Some(Envelope::error("Missing child_name")));
    };
    let child_type = data
        .get("child_type")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let status = normalize_status(
        &envelope.message_type,
        data.get("status").and_then(|v| v.as_str()),
    );
    let error_message = data.get("error_message").and_then(|v| v.as_str());

    info!(parent_host_id, child_name, status, "Child host status update");

    {
        let conn = ctx.store.lock();
        let tx = conn.unchecked_transaction()?;
        let active_before = orchestrations::find_active(&tx, parent_host_id)?.map(|o| o.id);
        children::upsert(&tx, parent_host_id, child_name, child_type, &status, error_message)?;

        match status.as_str() {
            "stopped" => orchestration::check_shutdown_progress(&tx, parent_host_id)?,
            "running" | "error" => orchestration::check_restart_progress(&tx, parent_host_id)?,
            _ => {}
        }

        // Surface orchestration progress to operator dashboards.
        if let Some(id) = active_before {
            if let Some(orch) = orchestrations::get_by_id(&tx, &id)? {
                let _ = ctx.events.orchestration.send(OrchestrationEvent {
                    orchestration_id: orch.id.clone(),
                    parent_host_id: parent_host_id.clone(),
                    status: orch.status.clone(),
                    message: orch.error_message.clone(),
                });
            }
        }

        tx.commit()?;
    }

    Ok(Some(Envelope::new(
        "child_host_status_ack",
        json!({"child_name": child_name, "status": status, "echo": echo_id(envelope)}),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConnectionManager;
    use sm_common::EventBus;
    use sm_queue::{operations as queue_ops, QueueDirection, QueueOps};
    use sm_store::{hosts, Store};
    use std::sync::Arc;

    async fn setup_bound() -> (HandlerContext, SessionInfo, String) {
        let store = Store::open_memory().unwrap();
        let events = Arc::new(EventBus::new());
        let connections = Arc::new(ConnectionManager::new(store.clone(), events.clone()));
        let ctx = HandlerContext {
            queue: QueueOps::new(store.clone()),
            store,
            connections,
            events,
        };
        let host_id = ctx
            .store
            .with_conn(|conn| Ok(hosts::create(conn, "parent.example.com", None, None, None)?.id))
            .unwrap();
        let (agent_id, rx) = ctx.connections.open_session(false).await;
        std::mem::forget(rx);
        ctx.connections.bind_host(&agent_id, &host_id).await;
        let session = ctx.connections.session_info(&agent_id).await.unwrap();
        (ctx, session, host_id)
    }

    fn child_status_envelope(name: &str, status: &str) -> Envelope {
        Envelope::new(
            "child_host_status",
            json!({"child_name": name, "child_type": "vm", "status": status}),
        )
    }

    #[tokio::test]
    async fn test_status_update_upserts_row() {
        let (ctx, session, host_id) = setup_bound().await;

        handle_child_host_status(&ctx, &session, &child_status_envelope("web", "started"))
            .await
            .unwrap();

        let child = ctx
            .store
            .with_conn(|conn| children::get(conn, &host_id, "web"))
            .unwrap()
            .unwrap();
        assert_eq!(child.status, "running");
    }

    #[tokio::test]
    async fn test_stop_events_drive_drain_to_reboot() {
        let (ctx, session, host_id) = setup_bound().await;

        ctx.store
            .with_conn(|conn| {
                children::upsert(conn, &host_id, "c1", "vm", "running", None)?;
                children::upsert(conn, &host_id, "c2", "vm", "running", None)?;
                Ok(())
            })
            .unwrap();
        {
            let conn = ctx.store.lock();
            orchestration::initiate_reboot(&conn, &host_id, 300).unwrap();
            // Clear the stop commands so later assertions see only the reboot.
            let pending = queue_ops::dequeue_for_host_on(
                &conn,
                &host_id,
                QueueDirection::Outbound,
                50,
                false,
            )
            .unwrap();
            for msg in pending {
                queue_ops::mark_completed_on(&conn, &msg.message_id).unwrap();
            }
        }

        handle_child_host_status(&ctx, &session, &child_status_envelope("c1", "stopped"))
            .await
            .unwrap();
        let orch = ctx
            .store
            .with_conn(|conn| orchestrations::find_active(conn, &host_id))
            .unwrap()
            .unwrap();
        assert_eq!(orch.status, "shutting_down");

        handle_child_host_status(&ctx, &session, &child_status_envelope("c2", "stopped"))
            .await
            .unwrap();
        let orch = ctx
            .store
            .with_conn(|conn| orchestrations::find_active(conn, &host_id))
            .unwrap()
            .unwrap();
        assert_eq!(orch.status, "rebooting");

        let types: Vec<String> = ctx
            .queue
            .dequeue_messages_for_host(&host_id, QueueDirection::Outbound, 50, false)
            .unwrap()
            .iter()
            .map(|m| {
                queue_ops::deserialize_message_data(m)["command_type"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string()
            })
            .collect();
        assert_eq!(types, vec!["reboot_system".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_child_name_rejected() {
        let (ctx, session, _host) = setup_bound().await;
        let envelope = Envelope::new("child_host_status", json!({"status": "stopped"}));
        let reply = handle_child_host_status(&ctx, &session, &envelope)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message_type, "error");
    }
}
