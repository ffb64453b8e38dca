//! Command result, update apply result, installation status, config ack,
//! and diagnostic result handling.

use serde_json::Value;
use tracing::{debug, info, warn};

use sm_queue::operations as queue_ops;
use sm_store::{hosts, updates, updates::InstallationOutcome};

use crate::handlers::{echo_id, HandlerContext};
use crate::protocol::Envelope;
use crate::state::SessionInfo;

/// Command execution result from an agent.
///
/// The originating outbound message is acknowledged: delivery succeeded
/// even when the command itself failed. Script executions additionally
/// record stdout/stderr/exit onto their execution log rows.
pub async fn handle_command_result(
    ctx: &HandlerContext,
    session: &SessionInfo,
    envelope: &Envelope,
) -> anyhow::Result<Option<Envelope>> {
    let data = &envelope.data;
    let execution_id = data.get("execution_id").and_then(|v| v.as_str());

    {
        let conn = ctx.store.lock();

        // Correlate back to the outbound row: execution id first, then the
        // explicit correlation id, then a message id echo (in the payload
        // or at the envelope level).
        let target = if let Some(execution_id) = execution_id {
            queue_ops::find_outbound_by_execution_id(&conn, execution_id)?
                .map(|m| m.message_id)
        } else {
            envelope
                .correlation_id
                .clone()
                .or_else(|| {
                    data.get("message_id")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                })
                .or_else(|| {
                    (!envelope.message_id.is_empty()).then(|| envelope.message_id.clone())
                })
        };

        match target {
            Some(message_id) => {
                queue_ops::mark_acknowledged_on(&conn, &message_id)?;
            }
            None => debug!(
                hostname = ?session.identity.as_ref().map(|i| i.fqdn.as_str()),
                "Command result without correlation"
            ),
        }

        if let Some(execution_id) = execution_id {
            record_script_outcome(&conn, execution_id, data)?;
        }
    }

    Ok(Some(Envelope::new(
        "command_result_ack",
        serde_json::json!({"timestamp": chrono::Utc::now().to_rfc3339()}),
    )))
}

fn record_script_outcome(
    conn: &rusqlite::Connection,
    execution_id: &str,
    data: &Value,
) -> anyhow::Result<()> {
    let success = data.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
    let outcome = InstallationOutcome {
        installation_id: execution_id.to_string(),
        status: if success { "completed" } else { "failed" }.to_string(),
        stdout_log: data.get("stdout").and_then(|v| v.as_str()).map(str::to_string),
        stderr_log: data.get("stderr").and_then(|v| v.as_str()).map(str::to_string),
        exit_code: data.get("exit_code").and_then(|v| v.as_i64()),
        error_message: data.get("error").and_then(|v| v.as_str()).map(str::to_string),
    };
    let updated = updates::record_installation_outcome(conn, &outcome)?;
    if updated > 0 {
        info!(execution_id, success, rows = updated, "Recorded script execution result");
    }
    Ok(())
}

/// Package update application result: successes leave the pending-updates
/// table, failures are flagged, and a reboot requirement is recorded on
/// the host (without disturbing a protected reason).
pub async fn handle_update_apply_result(
    ctx: &HandlerContext,
    session: &SessionInfo,
    envelope: &Envelope,
) -> anyhow::Result<Option<Envelope>> {
    let Some(host_id) = &session.host_id else {
        return Ok(Some(Envelope::error("Host not registered")));
    };
    let data = &envelope.data;
    let updated_packages = package_list(data, "updated_packages");
    let failed_packages = package_list(data, "failed_packages");
    let requires_reboot = data
        .get("requires_reboot")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    info!(
        host_id,
        updated = updated_packages.len(),
        failed = failed_packages.len(),
        "Update application result"
    );

    {
        let conn = ctx.store.lock();
        let tx = conn.unchecked_transaction()?;

        for (name, manager, _error) in &updated_packages {
            let removed = updates::delete_package_update(&tx, host_id, name, manager)?;
            debug!(package = name, removed, "Applied update removed from pending");
            updates::complete_latest_execution(&tx, host_id, name, manager, true, None)?;
        }

        for (name, manager, error) in &failed_packages {
            updates::mark_package_update_failed(&tx, host_id, name, manager)?;
            updates::complete_latest_execution(
                &tx,
                host_id,
                name,
                manager,
                false,
                error.as_deref(),
            )?;
        }

        if requires_reboot {
            hosts::flag_reboot_required(&tx, host_id)?;
        }

        tx.commit()?;
    }

    Ok(Some(Envelope::new(
        "update_apply_ack",
        serde_json::json!({
            "updated_count": updated_packages.len(),
            "failed_count": failed_packages.len(),
            "requires_reboot": requires_reboot,
        }),
    )))
}

fn package_list(data: &Value, key: &str) -> Vec<(String, String, Option<String>)> {
    data.get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|p| {
                    let name = p.get("package_name")?.as_str()?.to_string();
                    let manager = p.get("package_manager")?.as_str()?.to_string();
                    let error = p.get("error").and_then(|e| e.as_str()).map(str::to_string);
                    Some((name, manager, error))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Per-package installation progress for an installation batch.
pub async fn handle_package_installation_status(
    ctx: &HandlerContext,
    _session: &SessionInfo,
    envelope: &Envelope,
) -> anyhow::Result<Option<Envelope>> {
    let data = &envelope.data;

    let outcomes: Vec<InstallationOutcome> =
        if let Some(results) = data.get("results").and_then(|v| v.as_array()) {
            results
                .iter()
                .filter_map(|r| serde_json::from_value(r.clone()).ok())
                .collect()
        } else {
            serde_json::from_value::<InstallationOutcome>(data.clone())
                .ok()
                .into_iter()
                .collect()
        };

    if outcomes.is_empty() {
        warn!("Package installation status without usable outcomes");
        return Ok(Some(Envelope::error("No installation outcomes in message")));
    }

    {
        let conn = ctx.store.lock();
        let tx = conn.unchecked_transaction()?;
        for outcome in &outcomes {
            let n = updates::record_installation_outcome(&tx, outcome)?;
            if n == 0 {
                warn!(
                    installation_id = outcome.installation_id,
                    "Installation status for unknown batch"
                );
            }
        }
        tx.commit()?;
    }

    Ok(Some(Envelope::ack(echo_id(envelope))))
}

/// Configuration acknowledgment; log-only.
pub async fn handle_config_ack(
    _ctx: &HandlerContext,
    session: &SessionInfo,
    envelope: &Envelope,
) -> anyhow::Result<Option<Envelope>> {
    info!(
        hostname = ?session.identity.as_ref().map(|i| i.fqdn.as_str()),
        status = ?envelope.data.get("status").and_then(|v| v.as_str()),
        "Configuration acknowledged"
    );
    Ok(Some(Envelope::new(
        "config_ack_received",
        serde_json::json!({"timestamp": chrono::Utc::now().to_rfc3339()}),
    )))
}

/// Diagnostic collection result: stamp the request status on the host.
pub async fn handle_diagnostic_result(
    ctx: &HandlerContext,
    session: &SessionInfo,
    envelope: &Envelope,
) -> anyhow::Result<Option<Envelope>> {
    let Some(host_id) = &session.host_id else {
        return Ok(Some(Envelope::error("Host not registered")));
    };
    let success = envelope
        .data
        .get("success")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    ctx.store.with_conn(|conn| {
        hosts::set_diagnostics_status(conn, host_id, if success { "completed" } else { "failed" })
    })?;

    Ok(Some(Envelope::new(
        "diagnostic_result_ack",
        serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "status": "processed",
        }),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConnectionManager;
    use serde_json::json;
    use sm_common::EventBus;
    use sm_queue::{EnqueueRequest, QueueOps};
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
            .with_conn(|conn| {
                let host = hosts::create(conn, "res.example.com", None, None, None)?;
                hosts::set_approval(conn, &host.id, "approved")?;
                Ok(host.id)
            })
            .unwrap();
        let (agent_id, rx) = ctx.connections.open_session(false).await;
        std::mem::forget(rx);
        ctx.connections.bind_host(&agent_id, &host_id).await;
        let session = ctx.connections.session_info(&agent_id).await.unwrap();
        (ctx, session, host_id)
    }

    #[tokio::test]
    async fn test_command_result_acknowledges_outbound() {
        let (ctx, session, host_id) = setup_bound().await;

        let outbound = ctx
            .queue
            .enqueue_message(&EnqueueRequest::command(
                &host_id,
                json!({"command_type": "update_hardware"}),
            ))
            .unwrap();
        ctx.queue.mark_sent(&outbound).unwrap();

        let mut envelope = Envelope::new("command_result", json!({"success": true}));
        envelope.correlation_id = Some(outbound.clone());
        let reply = handle_command_result(&ctx, &session, &envelope)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message_type, "command_result_ack");

        let row = ctx.queue.get_message(&outbound).unwrap().unwrap();
        assert_eq!(row.status, "completed");
    }

    #[tokio::test]
    async fn test_script_result_acknowledges_by_execution_id() {
        let (ctx, session, host_id) = setup_bound().await;

        let outbound = ctx
            .queue
            .enqueue_message(&EnqueueRequest::command(
                &host_id,
                json!({
                    "command_type": "execute_script",
                    "execution_id": "EX-9",
                    "parameters": {"script_content": "uptime"},
                }),
            ))
            .unwrap();
        ctx.queue.mark_sent(&outbound).unwrap();

        // Installation-log row tracking this execution.
        ctx.store
            .with_conn(|conn| {
                updates::insert_installation_log(conn, "EX-9", &host_id, "uptime-script", None)?;
                Ok(())
            })
            .unwrap();

        let envelope = Envelope::new(
            "command_result",
            json!({
                "execution_id": "EX-9",
                "success": true,
                "stdout": "up 3 days",
                "exit_code": 0,
            }),
        );
        handle_command_result(&ctx, &session, &envelope).await.unwrap();

        let row = ctx.queue.get_message(&outbound).unwrap().unwrap();
        assert_eq!(row.status, "completed");

        let logs = ctx
            .store
            .with_conn(|conn| updates::list_installation_logs(conn, "EX-9"))
            .unwrap();
        assert_eq!(logs[0].status, "completed");
        assert_eq!(logs[0].stdout_log.as_deref(), Some("up 3 days"));
        assert_eq!(logs[0].exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_update_apply_result_walks_packages() {
        let (ctx, session, host_id) = setup_bound().await;

        ctx.store
            .with_conn(|conn| {
                updates::upsert_package_update(
                    conn, &host_id, "openssl", "apt", Some("1.0"), Some("1.1"), true,
                )?;
                updates::upsert_package_update(
                    conn, &host_id, "vim", "apt", Some("9.0"), Some("9.1"), false,
                )?;
                updates::insert_execution_log(conn, &host_id, "openssl", "apt")?;
                updates::insert_execution_log(conn, &host_id, "vim", "apt")?;
                Ok(())
            })
            .unwrap();

        let envelope = Envelope::new(
            "update_apply_result",
            json!({
                "hostname": "res.example.com",
                "updated_packages": [
                    {"package_name": "openssl", "package_manager": "apt"},
                ],
                "failed_packages": [
                    {"package_name": "vim", "package_manager": "apt", "error": "conflict"},
                ],
                "requires_reboot": true,
            }),
        );
        let reply = handle_update_apply_result(&ctx, &session, &envelope)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message_type, "update_apply_ack");
        assert_eq!(reply.data["updated_count"], 1);
        assert_eq!(reply.data["failed_count"], 1);

        let (pending, logs, host) = ctx
            .store
            .with_conn(|conn| {
                Ok((
                    updates::list_package_updates(conn, &host_id)?,
                    updates::list_execution_logs(conn, &host_id)?,
                    hosts::get_by_id(conn, &host_id)?.unwrap(),
                ))
            })
            .unwrap();

        // openssl applied and removed; vim kept as failed.
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].package_name, "vim");
        assert_eq!(pending[0].status, "failed");
        assert!(logs.iter().any(|l| l.package_name == "openssl"
            && l.execution_status == "success"));
        assert!(logs.iter().any(|l| l.package_name == "vim"
            && l.execution_status == "failed"
            && l.error_log.as_deref() == Some("conflict")));
        assert!(host.reboot_required);
    }

    #[tokio::test]
    async fn test_update_apply_result_is_idempotent() {
        let (ctx, session, host_id) = setup_bound().await;

        ctx.store
            .with_conn(|conn| {
                updates::upsert_package_update(
                    conn, &host_id, "curl", "apt", Some("8.0"), Some("8.1"), false,
                )?;
                Ok(())
            })
            .unwrap();

        let envelope = Envelope::new(
            "update_apply_result",
            json!({
                "updated_packages": [{"package_name": "curl", "package_manager": "apt"}],
                "failed_packages": [],
                "requires_reboot": false,
            }),
        );
        handle_update_apply_result(&ctx, &session, &envelope).await.unwrap();
        // Replay of the same envelope: same persistent effect.
        handle_update_apply_result(&ctx, &session, &envelope).await.unwrap();

        let pending = ctx
            .store
            .with_conn(|conn| updates::list_package_updates(conn, &host_id))
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_installation_status_batch() {
        let (ctx, session, host_id) = setup_bound().await;

        ctx.store
            .with_conn(|conn| {
                updates::insert_installation_log(conn, "batch-7", &host_id, "htop", None)?;
                Ok(())
            })
            .unwrap();

        let envelope = Envelope::new(
            "package_installation_status",
            json!({"installation_id": "batch-7", "status": "completed", "exit_code": 0}),
        );
        let reply = handle_package_installation_status(&ctx, &session, &envelope)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message_type, "ack");

        let logs = ctx
            .store
            .with_conn(|conn| updates::list_installation_logs(conn, "batch-7"))
            .unwrap();
        assert_eq!(logs[0].status, "completed");
    }

    #[tokio::test]
    async fn test_diagnostic_result_stamps_status() {
        let (ctx, session, host_id) = setup_bound().await;

        let envelope = Envelope::new("diagnostic_result", json!({"success": true}));
        handle_diagnostic_result(&ctx, &session, &envelope).await.unwrap();

        let host = ctx
            .store
            .with_conn(|conn| hosts::get_by_id(conn, &host_id))
            .unwrap()
            .unwrap();
        assert_eq!(host.diagnostics_request_status.as_deref(), Some("completed"));
    }
}
