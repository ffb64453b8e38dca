//! Inbound message router.
//!
//! Every inbound envelope is recorded as an inbound queue row (audit and
//! replay), dispatched to its typed handler under a deadline, and the audit
//! row is resolved from the handler outcome. Handlers are idempotent per
//! `message_id`: replaying an envelope produces the same persistent effect.

pub mod child_hosts;
pub mod inventory;
pub mod registration;
pub mod results;
pub mod virtualization;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use sm_common::events::EventBus;
use sm_queue::{operations as queue_ops, EnqueueRequest, QueueDirection, QueueOps};
use sm_store::Store;

use crate::protocol::Envelope;
use crate::state::{ConnectionManager, SessionInfo};

/// Per-message handler deadline. On expiry the inbound audit row stays
/// pending and is reprocessed on the next connect.
const HANDLER_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct HandlerContext {
    pub store: Store,
    pub queue: QueueOps,
    pub connections: Arc<ConnectionManager>,
    pub events: Arc<EventBus>,
}

/// Route one inbound envelope. The returned envelope, if any, is written
/// back on the session by the caller (it is not enqueued).
pub async fn route_message(
    ctx: &HandlerContext,
    agent_id: &str,
    envelope: &Envelope,
) -> Option<Envelope> {
    let Some(session) = ctx.connections.session_info(agent_id).await else {
        warn!(agent_id, "Message from unknown session");
        return Some(Envelope::error("Unknown session"));
    };

    let audit_id = record_inbound(ctx, &session, envelope);

    if !is_known_type(&envelope.message_type) {
        warn!(
            message_type = envelope.message_type,
            agent_id, "Unknown message type"
        );
        if let Some(id) = &audit_id {
            let _ = ctx.queue.mark_failed(id, Some("unknown message type"), false);
        }
        return Some(Envelope::error(&format!(
            "Unknown message type: {}",
            envelope.message_type
        )));
    }

    let outcome =
        tokio::time::timeout(HANDLER_DEADLINE, dispatch(ctx, &session, envelope)).await;

    match outcome {
        Err(_) => {
            // Deadline: audit row stays pending for reprocessing.
            error!(
                message_type = envelope.message_type,
                message_id = envelope.message_id,
                "Handler deadline exceeded"
            );
            None
        }
        Ok(Ok(reply)) => {
            if let Some(id) = &audit_id {
                let _ = ctx.queue.mark_completed(id);
            }
            reply
        }
        Ok(Err(e)) => {
            error!(
                message_type = envelope.message_type,
                message_id = envelope.message_id,
                "Handler failed: {e:#}"
            );
            if let Some(id) = &audit_id {
                let _ = ctx.queue.mark_failed(id, Some(&format!("{e:#}")), false);
            }
            Some(Envelope::error("Internal server error"))
        }
    }
}

fn is_known_type(message_type: &str) -> bool {
    matches!(
        message_type,
        "system_info"
            | "heartbeat"
            | "command_result"
            | "script_execution_result"
            | "config_ack"
            | "diagnostic_result"
            | "virtualization_support_update"
            | "wsl_enable_result"
            | "lxd_initialize_result"
            | "vmm_initialize_result"
            | "update_apply_result"
            | "package_installation_status"
            | "hardware_update"
            | "user_access_update"
            | "software_update"
            | "child_host_status"
            | "child_host_started"
            | "child_host_stopped"
            | "child_host_error"
    )
}

async fn dispatch(
    ctx: &HandlerContext,
    session: &SessionInfo,
    envelope: &Envelope,
) -> anyhow::Result<Option<Envelope>> {
    match envelope.message_type.as_str() {
        "system_info" => registration::handle_system_info(ctx, session, envelope).await,
        "heartbeat" => registration::handle_heartbeat(ctx, session, envelope).await,
        "command_result" | "script_execution_result" => {
            results::handle_command_result(ctx, session, envelope).await
        }
        "config_ack" => results::handle_config_ack(ctx, session, envelope).await,
        "diagnostic_result" => results::handle_diagnostic_result(ctx, session, envelope).await,
        "update_apply_result" => results::handle_update_apply_result(ctx, session, envelope).await,
        "package_installation_status" => {
            results::handle_package_installation_status(ctx, session, envelope).await
        }
        "hardware_update" => inventory::handle_hardware_update(ctx, session, envelope).await,
        "user_access_update" => inventory::handle_user_access_update(ctx, session, envelope).await,
        "software_update" => inventory::handle_software_update(ctx, session, envelope).await,
        "virtualization_support_update" => {
            virtualization::handle_virtualization_support_update(ctx, session, envelope).await
        }
        "wsl_enable_result" => {
            virtualization::handle_wsl_enable_result(ctx, session, envelope).await
        }
        "lxd_initialize_result" => {
            virtualization::handle_lxd_initialize_result(ctx, session, envelope).await
        }
        "vmm_initialize_result" => {
            virtualization::handle_vmm_initialize_result(ctx, session, envelope).await
        }
        "child_host_status" | "child_host_started" | "child_host_stopped"
        | "child_host_error" => child_hosts::handle_child_host_status(ctx, session, envelope).await,
        other => anyhow::bail!("unroutable message type: {other}"),
    }
}

/// Record the envelope as an inbound queue row. Replayed envelopes (same
/// `message_id`) reuse the existing row instead of inserting a duplicate.
fn record_inbound(
    ctx: &HandlerContext,
    session: &SessionInfo,
    envelope: &Envelope,
) -> Option<String> {
    let conn = ctx.store.lock();

    if !envelope.message_id.is_empty() {
        if let Ok(Some(existing)) = queue_ops::get_by_message_id(&conn, &envelope.message_id) {
            return Some(existing.message_id);
        }
    }

    let payload = serde_json::to_value(envelope).ok()?;
    let mut req = EnqueueRequest::new(&envelope.message_type, payload, QueueDirection::Inbound);
    req.host_id = session.host_id.clone();
    if !envelope.message_id.is_empty() {
        req.message_id = Some(envelope.message_id.clone());
    }

    let tx = conn.unchecked_transaction().ok()?;
    match queue_ops::enqueue_on(&tx, &req) {
        Ok(id) => {
            tx.commit().ok()?;
            Some(id)
        }
        Err(e) => {
            warn!(
                message_type = envelope.message_type,
                "Failed to record inbound message: {e}"
            );
            None
        }
    }
}

/// Echo id for acknowledgments; agents that omit `message_id` get a
/// placeholder, matching what they sent.
pub(crate) fn echo_id(envelope: &Envelope) -> &str {
    if envelope.message_id.is_empty() {
        "unknown"
    } else {
        &envelope.message_id
    }
}
