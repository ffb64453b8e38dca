//! Virtualization capability handlers: support checks, WSL enablement,
//! LXD and VMM initialization results.
//!
//! Reboot reasons set here are protected: once one of these strings is on
//! the host row, no other update path may overwrite it until the condition
//! clears.

use serde_json::{json, Value};
use tracing::{error, info, warn};

use sm_queue::{create_command_message, operations as queue_ops, EnqueueRequest};
use sm_store::hosts;

use crate::handlers::HandlerContext;
use crate::protocol::Envelope;
use crate::state::SessionInfo;

pub const WSL_REBOOT_REASON: &str = "WSL feature enablement pending";
pub const VMM_REBOOT_REASON: &str = "VMM kernel support requires reboot";

const PROTECTED_REBOOT_REASONS: &[&str] = &[WSL_REBOOT_REASON, VMM_REBOOT_REASON];

pub fn is_protected_reason(reason: &str) -> bool {
    PROTECTED_REBOOT_REASONS.contains(&reason)
}

/// Result payloads arrive either nested under `result` (command_result
/// framing) or flat; accept both, as agents of different vintages send both.
fn result_data(data: &Value) -> &Value {
    match data.get("result") {
        Some(result) if result.is_object() => result,
        _ => data,
    }
}

fn is_success(data: &Value) -> bool {
    data.get("success")
        .and_then(|v| v.as_bool())
        .or_else(|| result_data(data).get("success").and_then(|v| v.as_bool()))
        .unwrap_or(false)
}

fn error_of(data: &Value) -> String {
    data.get("error")
        .or_else(|| result_data(data).get("error"))
        .and_then(|v| v.as_str())
        .unwrap_or("Unknown error")
        .to_string()
}

/// Set a protected reboot reason, unless a different protected reason is
/// already present.
fn set_protected_reboot_reason(
    conn: &rusqlite::Connection,
    host_id: &str,
    reason: &str,
) -> anyhow::Result<()> {
    if let Some(host) = hosts::get_by_id(conn, host_id)? {
        if let Some(existing) = &host.reboot_required_reason {
            if is_protected_reason(existing) && existing != reason {
                warn!(host_id, existing, reason, "Keeping existing protected reboot reason");
                hosts::flag_reboot_required(conn, host_id)?;
                return Ok(());
            }
        }
    }
    hosts::set_reboot_required(conn, host_id, true, Some(reason))?;
    Ok(())
}

fn enqueue_virtualization_check(
    conn: &rusqlite::Connection,
    host_id: &str,
) -> anyhow::Result<()> {
    let req = EnqueueRequest::command(
        host_id,
        create_command_message("check_virtualization_support", json!({})),
    );
    queue_ops::enqueue_on(conn, &req)?;
    Ok(())
}

/// Virtualization support check result: store the capability snapshot and
/// reconcile the WSL reboot flag.
pub async fn handle_virtualization_support_update(
    ctx: &HandlerContext,
    session: &SessionInfo,
    envelope: &Envelope,
) -> anyhow::Result<Option<Envelope>> {
    let Some(host_id) = &session.host_id else {
        warn!("Virtualization support update without bound host");
        return Ok(Some(Envelope::error("No host_id on connection")));
    };
    let data = &envelope.data;
    if !is_success(data) {
        let error = error_of(data);
        error!(host_id, error, "Virtualization support check failed");
        return Ok(Some(Envelope::error(&error)));
    }

    let result = result_data(data);
    let supported_types: Vec<String> = result
        .get("supported_types")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let capabilities = result.get("capabilities").cloned().unwrap_or_else(|| json!({}));
    let reboot_required = result
        .get("reboot_required")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    info!(host_id, types = ?supported_types, reboot_required, "Virtualization support updated");

    {
        let conn = ctx.store.lock();
        let tx = conn.unchecked_transaction()?;

        hosts::set_virtualization(
            &tx,
            host_id,
            &serde_json::to_string(&supported_types)?,
            &serde_json::to_string(&capabilities)?,
        )?;

        let wsl_caps = capabilities.get("wsl").cloned().unwrap_or_else(|| json!({}));
        let wsl_enabled = wsl_caps.get("enabled").and_then(|v| v.as_bool()).unwrap_or(false);
        let wsl_needs_enable = wsl_caps
            .get("needs_enable")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let host = hosts::get_by_id(&tx, host_id)?;
        if let Some(host) = host {
            if wsl_enabled
                && host.reboot_required
                && host.reboot_required_reason.as_deref() == Some(WSL_REBOOT_REASON)
            {
                // The WSL-enablement reboot completed; clear the flag.
                hosts::set_reboot_required(&tx, host_id, false, None)?;
                info!(host_id, "Cleared WSL reboot flag, WSL is now enabled");
            } else if reboot_required
                && supported_types.iter().any(|t| t == "wsl")
                && wsl_needs_enable
            {
                set_protected_reboot_reason(&tx, host_id, WSL_REBOOT_REASON)?;
            }
        }

        tx.commit()?;
    }

    Ok(Some(Envelope::new(
        "virtualization_support_ack",
        json!({"timestamp": chrono::Utc::now().to_rfc3339(), "status": "updated"}),
    )))
}

/// WSL enable result: a reboot requirement records the protected reason;
/// otherwise a capability refresh is queued.
pub async fn handle_wsl_enable_result(
    ctx: &HandlerContext,
    session: &SessionInfo,
    envelope: &Envelope,
) -> anyhow::Result<Option<Envelope>> {
    let Some(host_id) = &session.host_id else {
        return Ok(Some(Envelope::error("No host_id on connection")));
    };
    let data = &envelope.data;
    let result = result_data(data);
    if !is_success(data) {
        let error = error_of(data);
        error!(host_id, error, "WSL enable failed");
        return Ok(Some(Envelope::error(&error)));
    }
    let reboot_required = result
        .get("reboot_required")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    {
        let conn = ctx.store.lock();
        let tx = conn.unchecked_transaction()?;
        if reboot_required {
            set_protected_reboot_reason(&tx, host_id, WSL_REBOOT_REASON)?;
        } else {
            enqueue_virtualization_check(&tx, host_id)?;
            info!(host_id, "WSL enabled without reboot, queued virtualization check");
        }
        tx.commit()?;
    }

    Ok(Some(Envelope::new(
        "wsl_enable_ack",
        json!({"timestamp": chrono::Utc::now().to_rfc3339(), "reboot_required": reboot_required}),
    )))
}

/// LXD initialization result: queue a capability refresh.
pub async fn handle_lxd_initialize_result(
    ctx: &HandlerContext,
    session: &SessionInfo,
    envelope: &Envelope,
) -> anyhow::Result<Option<Envelope>> {
    let Some(host_id) = &session.host_id else {
        return Ok(Some(Envelope::error("No host_id on connection")));
    };
    let data = &envelope.data;
    let result = result_data(data);
    if !is_success(data) {
        let error = error_of(data);
        error!(host_id, error, "LXD initialization failed");
        return Ok(Some(Envelope::error(&error)));
    }
    let user_needs_relogin = result
        .get("user_needs_relogin")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    {
        let conn = ctx.store.lock();
        let tx = conn.unchecked_transaction()?;
        enqueue_virtualization_check(&tx, host_id)?;
        tx.commit()?;
    }
    info!(host_id, user_needs_relogin, "LXD initialized, queued virtualization check");

    Ok(Some(Envelope::new(
        "lxd_initialize_ack",
        json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "user_needs_relogin": user_needs_relogin,
        }),
    )))
}

/// VMM/vmd initialization result: reboot requirement records the protected
/// reason, otherwise a capability refresh is queued.
pub async fn handle_vmm_initialize_result(
    ctx: &HandlerContext,
    session: &SessionInfo,
    envelope: &Envelope,
) -> anyhow::Result<Option<Envelope>> {
    let Some(host_id) = &session.host_id else {
        return Ok(Some(Envelope::error("No host_id on connection")));
    };
    let data = &envelope.data;
    let result = result_data(data);
    if !is_success(data) {
        let error = error_of(data);
        error!(host_id, error, "VMM initialization failed");
        return Ok(Some(Envelope::error(&error)));
    }
    let needs_reboot = result
        .get("needs_reboot")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let already_enabled = result
        .get("already_enabled")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    {
        let conn = ctx.store.lock();
        let tx = conn.unchecked_transaction()?;
        if needs_reboot {
            set_protected_reboot_reason(&tx, host_id, VMM_REBOOT_REASON)?;
        } else {
            enqueue_virtualization_check(&tx, host_id)?;
        }
        tx.commit()?;
    }
    info!(host_id, needs_reboot, already_enabled, "VMM initialization recorded");

    Ok(Some(Envelope::new(
        "vmm_initialize_ack",
        json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "needs_reboot": needs_reboot,
            "already_enabled": already_enabled,
        }),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConnectionManager;
    use sm_common::EventBus;
    use sm_queue::{QueueDirection, QueueOps};
    use sm_store::Store;
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
            .with_conn(|conn| Ok(hosts::create(conn, "virt.example.com", None, None, None)?.id))
            .unwrap();
        let (agent_id, rx) = ctx.connections.open_session(false).await;
        std::mem::forget(rx);
        ctx.connections.bind_host(&agent_id, &host_id).await;
        let session = ctx.connections.session_info(&agent_id).await.unwrap();
        (ctx, session, host_id)
    }

    fn queued_command_types(ctx: &HandlerContext, host_id: &str) -> Vec<String> {
        ctx.queue
            .dequeue_messages_for_host(host_id, QueueDirection::Outbound, 50, false)
            .unwrap()
            .iter()
            .map(|m| {
                queue_ops::deserialize_message_data(m)["command_type"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_support_update_stores_capabilities() {
        let (ctx, session, host_id) = setup_bound().await;

        let envelope = Envelope::new(
            "virtualization_support_update",
            serde_json::json!({
                "success": true,
                "result": {
                    "supported_types": ["kvm", "lxd"],
                    "capabilities": {"kvm": {"nested": true}},
                    "reboot_required": false,
                },
            }),
        );
        let reply = handle_virtualization_support_update(&ctx, &session, &envelope)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message_type, "virtualization_support_ack");

        let host = ctx
            .store
            .with_conn(|conn| hosts::get_by_id(conn, &host_id))
            .unwrap()
            .unwrap();
        assert_eq!(host.virtualization_types.as_deref(), Some(r#"["kvm","lxd"]"#));
        assert!(host.virtualization_updated_at.is_some());
        assert!(!host.reboot_required);
    }

    #[tokio::test]
    async fn test_wsl_needs_enable_sets_protected_reason() {
        let (ctx, session, host_id) = setup_bound().await;

        let envelope = Envelope::new(
            "virtualization_support_update",
            serde_json::json!({
                "success": true,
                "result": {
                    "supported_types": ["wsl"],
                    "capabilities": {"wsl": {"enabled": false, "needs_enable": true}},
                    "reboot_required": true,
                },
            }),
        );
        handle_virtualization_support_update(&ctx, &session, &envelope)
            .await
            .unwrap();

        let host = ctx
            .store
            .with_conn(|conn| hosts::get_by_id(conn, &host_id))
            .unwrap()
            .unwrap();
        assert!(host.reboot_required);
        assert_eq!(host.reboot_required_reason.as_deref(), Some(WSL_REBOOT_REASON));
    }

    #[tokio::test]
    async fn test_wsl_enabled_clears_pending_reason() {
        let (ctx, session, host_id) = setup_bound().await;

        ctx.store
            .with_conn(|conn| {
                hosts::set_reboot_required(conn, &host_id, true, Some(WSL_REBOOT_REASON))
            })
            .unwrap();

        let envelope = Envelope::new(
            "virtualization_support_update",
            serde_json::json!({
                "success": true,
                "result": {
                    "supported_types": ["wsl"],
                    "capabilities": {"wsl": {"enabled": true}},
                    "reboot_required": false,
                },
            }),
        );
        handle_virtualization_support_update(&ctx, &session, &envelope)
            .await
            .unwrap();

        let host = ctx
            .store
            .with_conn(|conn| hosts::get_by_id(conn, &host_id))
            .unwrap()
            .unwrap();
        assert!(!host.reboot_required);
        assert!(host.reboot_required_reason.is_none());
    }

    #[tokio::test]
    async fn test_wsl_enable_without_reboot_queues_check() {
        let (ctx, session, host_id) = setup_bound().await;

        let envelope = Envelope::new(
            "wsl_enable_result",
            serde_json::json!({"result": {"success": true, "reboot_required": false}}),
        );
        let reply = handle_wsl_enable_result(&ctx, &session, &envelope)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message_type, "wsl_enable_ack");

        assert_eq!(
            queued_command_types(&ctx, &host_id),
            vec!["check_virtualization_support".to_string()]
        );
    }

    #[tokio::test]
    async fn test_vmm_needs_reboot_does_not_clobber_wsl_reason() {
        let (ctx, session, host_id) = setup_bound().await;

        ctx.store
            .with_conn(|conn| {
                hosts::set_reboot_required(conn, &host_id, true, Some(WSL_REBOOT_REASON))
            })
            .unwrap();

        let envelope = Envelope::new(
            "vmm_initialize_result",
            serde_json::json!({"result": {"success": true, "needs_reboot": true}}),
        );
        handle_vmm_initialize_result(&ctx, &session, &envelope).await.unwrap();

        let host = ctx
            .store
            .with_conn(|conn| hosts::get_by_id(conn, &host_id))
            .unwrap()
            .unwrap();
        // The earlier protected reason survives.
        assert_eq!(host.reboot_required_reason.as_deref(), Some(WSL_REBOOT_REASON));
        assert!(host.reboot_required);
    }

    #[tokio::test]
    async fn test_failed_result_returns_error() {
        let (ctx, session, _host) = setup_bound().await;

        let envelope = Envelope::new(
            "lxd_initialize_result",
            serde_json::json!({"result": {"success": false, "error": "lxd not installed"}}),
        );
        let reply = handle_lxd_initialize_result(&ctx, &session, &envelope)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message_type, "error");
        assert_eq!(reply.data["error"], "lxd not installed");
    }
}
