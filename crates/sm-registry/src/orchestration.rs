//! Reboot orchestration state machine.
//!
//! A parent host that owns running child workloads is rebooted in phases:
//! drain children, reboot, wait for the agent to reconnect, restart the
//! children recorded in the initiation snapshot. Every transition is
//! triggered by an external event (child status report, heartbeat
//! reconnect) and runs as one short transaction on the caller's
//! connection; serialization comes from the single non-terminal row per
//! parent.

use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;
use tracing::{info, warn};

use sm_queue::{create_command_message, operations as queue_ops, EnqueueRequest, QueueError};
use sm_store::{
    children, orchestrations, ChildRestartEntry, ChildSnapshotEntry, RebootOrchestration,
    StoreError,
};

#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("An orchestration is already active for host {0}")]
    AlreadyActive(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

fn enqueue_command(
    conn: &Connection,
    host_id: &str,
    command_type: &str,
    parameters: serde_json::Value,
) -> OrchestrationResult<String> {
    let req = EnqueueRequest::command(host_id, create_command_message(command_type, parameters));
    Ok(queue_ops::enqueue_on(conn, &req)?)
}

/// Start an orchestrated reboot for a parent host.
///
/// Snapshots the currently running children, inserts the orchestration in
/// `shutting_down`, and enqueues a stop command per child. With no running
/// children the shutdown phase resolves immediately and the reboot command
/// is issued in the same transaction.
pub fn initiate_reboot(
    conn: &Connection,
    parent_host_id: &str,
    shutdown_timeout_seconds: i64,
) -> OrchestrationResult<RebootOrchestration> {
    if orchestrations::find_active(conn, parent_host_id)?.is_some() {
        return Err(OrchestrationError::AlreadyActive(parent_host_id.to_string()));
    }

    let running = children::list_running(conn, parent_host_id)?;
    let snapshot: Vec<ChildSnapshotEntry> = running
        .iter()
        .map(|c| ChildSnapshotEntry {
            id: c.id.clone(),
            child_name: c.child_name.clone(),
            child_type: c.child_type.clone(),
        })
        .collect();

    let orch = orchestrations::insert(
        conn,
        parent_host_id,
        &serde_json::to_string(&snapshot)?,
        shutdown_timeout_seconds,
    )?;

    for child in &snapshot {
        enqueue_command(
            conn,
            parent_host_id,
            "stop_child_host",
            json!({"child_name": child.child_name, "child_type": child.child_type}),
        )?;
    }

    info!(
        orchestration_id = orch.id,
        parent_host_id,
        children = snapshot.len(),
        "Reboot orchestration initiated"
    );

    if snapshot.is_empty() {
        check_shutdown_progress(conn, parent_host_id)?;
        if let Some(refreshed) = orchestrations::get_by_id(conn, &orch.id)? {
            return Ok(refreshed);
        }
    }
    Ok(orch)
}

/// Called after a child host stops. When every snapshot child is stopped,
/// or the shutdown timeout has elapsed, the reboot command is issued.
pub fn check_shutdown_progress(
    conn: &Connection,
    parent_host_id: &str,
) -> OrchestrationResult<()> {
    let Some(mut orch) = orchestrations::find_in_status(conn, parent_host_id, "shutting_down")?
    else {
        return Ok(());
    };

    let snapshot: Vec<ChildSnapshotEntry> = serde_json::from_str(&orch.child_hosts_snapshot)?;
    let snapshot_names: Vec<String> = snapshot.iter().map(|e| e.child_name.clone()).collect();

    let still_running = children::count_running_in(conn, parent_host_id, &snapshot_names)?;
    if still_running > 0 {
        let elapsed = (Utc::now() - orch.initiated_at).num_seconds();
        if elapsed < orch.shutdown_timeout_seconds {
            info!(
                orchestration_id = orch.id,
                still_running,
                elapsed,
                timeout = orch.shutdown_timeout_seconds,
                "Children still running, waiting"
            );
            return Ok(());
        }
        warn!(
            orchestration_id = orch.id,
            still_running, "Shutdown timeout exceeded, proceeding with reboot"
        );
    }

    let now = Utc::now();
    orch.status = "rebooting".to_string();
    orch.shutdown_completed_at = Some(now);
    orch.reboot_issued_at = Some(now);
    orchestrations::update(conn, &orch)?;

    enqueue_command(conn, parent_host_id, "reboot_system", json!({}))?;

    info!(
        orchestration_id = orch.id,
        parent_host_id, "All children stopped, reboot command issued"
    );
    Ok(())
}

/// Called when a host heartbeats again. A `rebooting` orchestration moves
/// to `restarting` and a start command is enqueued per snapshot child.
pub fn handle_agent_reconnect(conn: &Connection, host_id: &str) -> OrchestrationResult<()> {
    let Some(mut orch) = orchestrations::find_in_status(conn, host_id, "rebooting")? else {
        return Ok(());
    };

    let snapshot: Vec<ChildSnapshotEntry> = serde_json::from_str(&orch.child_hosts_snapshot)?;

    orch.status = "pending_restart".to_string();
    orch.agent_reconnected_at = Some(Utc::now());
    let restart_status: Vec<ChildRestartEntry> = snapshot
        .iter()
        .map(|entry| ChildRestartEntry {
            child_name: entry.child_name.clone(),
            restart_status: "pending".to_string(),
            error: None,
        })
        .collect();
    orch.child_hosts_restart_status = Some(serde_json::to_string(&restart_status)?);
    orchestrations::update(conn, &orch)?;

    for entry in &snapshot {
        enqueue_command(
            conn,
            host_id,
            "start_child_host",
            json!({"child_name": entry.child_name, "child_type": entry.child_type}),
        )?;
    }

    orch.status = "restarting".to_string();
    orchestrations::update(conn, &orch)?;

    info!(
        orchestration_id = orch.id,
        host_id,
        children = snapshot.len(),
        "Agent reconnected, start commands enqueued"
    );

    // Nothing to restart resolves the orchestration immediately.
    if snapshot.is_empty() {
        check_restart_progress(conn, host_id)?;
    }
    Ok(())
}

/// Called after a child status update during restart. Updates the restart
/// tracking list; once every entry is running or failed the orchestration
/// completes (failures are enumerated in `error_message` but still end in
/// `completed`).
pub fn check_restart_progress(conn: &Connection, parent_host_id: &str) -> OrchestrationResult<()> {
    let Some(mut orch) = orchestrations::find_in_status(conn, parent_host_id, "restarting")?
    else {
        return Ok(());
    };

    let mut restart_status: Vec<ChildRestartEntry> = orch
        .child_hosts_restart_status
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?
        .unwrap_or_default();

    for entry in &mut restart_status {
        let child = children::get(conn, parent_host_id, &entry.child_name)?;
        match child {
            Some(c) if c.status == "running" => {
                entry.restart_status = "running".to_string();
            }
            Some(c) if c.status == "error" => {
                entry.restart_status = "failed".to_string();
                entry.error = c.error_message.clone();
            }
            _ => {}
        }
    }
    orch.child_hosts_restart_status = Some(serde_json::to_string(&restart_status)?);

    let all_done = restart_status
        .iter()
        .all(|e| e.restart_status == "running" || e.restart_status == "failed");

    if all_done {
        let failed_count = restart_status
            .iter()
            .filter(|e| e.restart_status == "failed")
            .count();
        orch.restart_completed_at = Some(Utc::now());
        orch.status = "completed".to_string();
        if failed_count > 0 {
            orch.error_message = Some(format!(
                "{failed_count} of {} child host(s) failed to restart",
                restart_status.len()
            ));
        }
        orchestrations::update(conn, &orch)?;
        info!(
            orchestration_id = orch.id,
            restarted = restart_status.len() - failed_count,
            failed = failed_count,
            "Reboot orchestration completed"
        );
    } else {
        orchestrations::update(conn, &orch)?;
        let pending = restart_status
            .iter()
            .filter(|e| e.restart_status == "pending")
            .count();
        info!(orchestration_id = orch.id, pending, "Children still pending restart");
    }
    Ok(())
}

/// Operator abort: move a non-terminal orchestration to terminal `failed`.
pub fn fail_orchestration(
    conn: &Connection,
    orchestration_id: &str,
    reason: &str,
) -> OrchestrationResult<bool> {
    let Some(mut orch) = orchestrations::get_by_id(conn, orchestration_id)? else {
        return Ok(false);
    };
    if orch.is_terminal() {
        return Ok(false);
    }
    orch.status = "failed".to_string();
    orch.error_message = Some(reason.to_string());
    orchestrations::update(conn, &orch)?;
    warn!(orchestration_id, reason, "Reboot orchestration aborted");
    Ok(true)
}
