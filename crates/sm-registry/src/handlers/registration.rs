//! Registration (`system_info`) and heartbeat handling.

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use sm_common::events::HostStatusEvent;
use sm_store::hosts::{self, AgentReportedFields};

use crate::handlers::{echo_id, HandlerContext};
use crate::orchestration;
use crate::protocol::Envelope;
use crate::state::SessionInfo;

/// Agent-reported optional columns shared by registration and heartbeat.
fn reported_fields(data: &Value) -> AgentReportedFields {
    let enabled_shells = data.get("enabled_shells").map(|v| {
        if v.is_null() || v.as_array().is_some_and(|a| a.is_empty()) {
            None
        } else {
            Some(v.to_string())
        }
    });
    AgentReportedFields {
        is_privileged: data.get("is_privileged").and_then(|v| v.as_bool()),
        script_execution_enabled: data
            .get("script_execution_enabled")
            .and_then(|v| v.as_bool()),
        enabled_shells,
    }
}

/// Registration handshake. Upserts the host by fqdn (approval status is
/// preserved), binds approved hosts to the session, and answers with
/// `registration_success` or `registration_pending`.
pub async fn handle_system_info(
    ctx: &HandlerContext,
    session: &SessionInfo,
    envelope: &Envelope,
) -> anyhow::Result<Option<Envelope>> {
    let data = &envelope.data;
    let Some(hostname) = data.get("hostname").and_then(|v| v.as_str()) else {
        debug!("system_info without hostname, ignoring");
        return Ok(None);
    };
    let ipv4 = data.get("ipv4").and_then(|v| v.as_str());
    let ipv6 = data.get("ipv6").and_then(|v| v.as_str());
    let platform = data.get("platform").and_then(|v| v.as_str());
    let touch_access = !session.is_replay;

    let (host_id, approved) = {
        let conn = ctx.store.lock();
        let tx = conn.unchecked_transaction()?;
        let host = hosts::upsert_by_fqdn(&tx, hostname, ipv4, ipv6, touch_access)?;
        info!(hostname, approval = host.approval_status, "Host registration");

        if host.is_approved() {
            if let Some(platform) = platform {
                hosts::set_platform(&tx, &host.id, platform)?;
            }
            hosts::refresh_heartbeat(&tx, &host.id, touch_access, &reported_fields(data))?;
            // Registration after a reboot doubles as the reconnect signal.
            orchestration::handle_agent_reconnect(&tx, &host.id)?;
        }
        tx.commit()?;
        (host.id.clone(), host.is_approved())
    };

    if approved {
        ctx.connections
            .register_agent(&session.agent_id, hostname, ipv4, ipv6, platform)
            .await;
        ctx.connections.bind_host(&session.agent_id, &host_id).await;
        let _ = ctx.events.host_status.send(HostStatusEvent {
            host_id: host_id.clone(),
            fqdn: Some(hostname.to_string()),
            status: "up".to_string(),
        });

        Ok(Some(Envelope::new(
            "registration_success",
            json!({"approved": true, "hostname": hostname, "host_id": host_id}),
        )))
    } else {
        Ok(Some(Envelope::new(
            "registration_pending",
            json!({
                "approved": false,
                "hostname": hostname,
                "message": "Host registration pending approval",
            }),
        )))
    }
}

enum HeartbeatOutcome {
    Refreshed,
    Rebound(String),
    Cleared,
}

/// Heartbeat: refresh liveness, absorb optional agent-reported fields,
/// drive reconnect-gated orchestrations, and always acknowledge.
///
/// A stale binding (host row gone) is healed from the session identity
/// when available; otherwise the binding is cleared and the agent must
/// re-register.
pub async fn handle_heartbeat(
    ctx: &HandlerContext,
    session: &SessionInfo,
    envelope: &Envelope,
) -> anyhow::Result<Option<Envelope>> {
    let Some(host_id) = &session.host_id else {
        return Ok(Some(Envelope::error("Host not registered")));
    };
    let touch_access = !session.is_replay;
    let fields = reported_fields(&envelope.data);

    let outcome = {
        let conn = ctx.store.lock();
        let tx = conn.unchecked_transaction()?;
        let outcome = if hosts::get_by_id(&tx, host_id)?.is_some() {
            hosts::refresh_heartbeat(&tx, host_id, touch_access, &fields)?;
            orchestration::handle_agent_reconnect(&tx, host_id)?;
            HeartbeatOutcome::Refreshed
        } else if let Some(identity) = &session.identity {
            let host = hosts::upsert_by_fqdn(
                &tx,
                &identity.fqdn,
                identity.ipv4.as_deref(),
                identity.ipv6.as_deref(),
                touch_access,
            )?;
            hosts::refresh_heartbeat(&tx, &host.id, touch_access, &fields)?;
            info!(
                fqdn = identity.fqdn,
                host_id = host.id,
                "Recreated host from heartbeat"
            );
            HeartbeatOutcome::Rebound(host.id)
        } else {
            warn!(host_id, "Host row missing and session has no identity, clearing binding");
            HeartbeatOutcome::Cleared
        };
        tx.commit()?;
        outcome
    };

    match outcome {
        HeartbeatOutcome::Refreshed => {}
        HeartbeatOutcome::Rebound(new_host_id) => {
            ctx.connections.bind_host(&session.agent_id, &new_host_id).await;
        }
        HeartbeatOutcome::Cleared => {
            ctx.connections.clear_binding(&session.agent_id).await;
        }
    }

    Ok(Some(Envelope::ack(echo_id(envelope))))
}
