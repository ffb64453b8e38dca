//! Reboot orchestration repository.

use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::models::RebootOrchestration;
use crate::store::{fmt_ts, now_ts, parse_ts, StoreResult};

const ORCH_COLUMNS: &str = "id, parent_host_id, status, child_hosts_snapshot, \
     child_hosts_restart_status, initiated_at, shutdown_completed_at, reboot_issued_at, \
     agent_reconnected_at, restart_completed_at, shutdown_timeout_seconds, error_message";

const NON_TERMINAL: &str = "('shutting_down', 'rebooting', 'pending_restart', 'restarting')";

fn row_to_orchestration(row: &Row<'_>) -> rusqlite::Result<RebootOrchestration> {
    let ts = |idx: usize| -> rusqlite::Result<Option<chrono::DateTime<chrono::Utc>>> {
        let v: Option<String> = row.get(idx)?;
        Ok(v.as_deref().and_then(parse_ts))
    };
    Ok(RebootOrchestration {
        id: row.get(0)?,
        parent_host_id: row.get(1)?,
        status: row.get(2)?,
        child_hosts_snapshot: row.get(3)?,
        child_hosts_restart_status: row.get(4)?,
        initiated_at: parse_ts(&row.get::<_, String>(5)?).unwrap_or_else(chrono::Utc::now),
        shutdown_completed_at: ts(6)?,
        reboot_issued_at: ts(7)?,
        agent_reconnected_at: ts(8)?,
        restart_completed_at: ts(9)?,
        shutdown_timeout_seconds: row.get(10)?,
        error_message: row.get(11)?,
    })
}

pub fn get_by_id(conn: &Connection, id: &str) -> StoreResult<Option<RebootOrchestration>> {
    let orch = conn
        .query_row(
            &format!("SELECT {ORCH_COLUMNS} FROM reboot_orchestration WHERE id = ?1"),
            params![id],
            row_to_orchestration,
        )
        .optional()?;
    Ok(orch)
}

/// The single non-terminal orchestration for a parent, if any.
pub fn find_active(
    conn: &Connection,
    parent_host_id: &str,
) -> StoreResult<Option<RebootOrchestration>> {
    let orch = conn
        .query_row(
            &format!(
                "SELECT {ORCH_COLUMNS} FROM reboot_orchestration
                 WHERE parent_host_id = ?1 AND status IN {NON_TERMINAL}"
            ),
            params![parent_host_id],
            row_to_orchestration,
        )
        .optional()?;
    Ok(orch)
}

/// The orchestration for a parent in a specific phase, if any.
pub fn find_in_status(
    conn: &Connection,
    parent_host_id: &str,
    status: &str,
) -> StoreResult<Option<RebootOrchestration>> {
    let orch = conn
        .query_row(
            &format!(
                "SELECT {ORCH_COLUMNS} FROM reboot_orchestration
                 WHERE parent_host_id = ?1 AND status = ?2"
            ),
            params![parent_host_id, status],
            row_to_orchestration,
        )
        .optional()?;
    Ok(orch)
}

pub fn insert(
    conn: &Connection,
    parent_host_id: &str,
    child_hosts_snapshot: &str,
    shutdown_timeout_seconds: i64,
) -> StoreResult<RebootOrchestration> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO reboot_orchestration
            (id, parent_host_id, status, child_hosts_snapshot, initiated_at,
             shutdown_timeout_seconds)
         VALUES (?1, ?2, 'shutting_down', ?3, ?4, ?5)",
        params![
            id,
            parent_host_id,
            child_hosts_snapshot,
            now_ts(),
            shutdown_timeout_seconds
        ],
    )?;
    get_by_id(conn, &id)?.ok_or_else(|| {
        crate::store::StoreError::Other(format!("orchestration {id} missing after insert"))
    })
}

/// Persist the mutable fields of an orchestration row.
pub fn update(conn: &Connection, orch: &RebootOrchestration) -> StoreResult<()> {
    conn.execute(
        "UPDATE reboot_orchestration SET
            status = ?1,
            child_hosts_restart_status = ?2,
            shutdown_completed_at = ?3,
            reboot_issued_at = ?4,
            agent_reconnected_at = ?5,
            restart_completed_at = ?6,
            error_message = ?7
         WHERE id = ?8",
        params![
            orch.status,
            orch.child_hosts_restart_status,
            orch.shutdown_completed_at.map(fmt_ts),
            orch.reboot_issued_at.map(fmt_ts),
            orch.agent_reconnected_at.map(fmt_ts),
            orch.restart_completed_at.map(fmt_ts),
            orch.error_message,
            orch.id
        ],
    )?;
    Ok(())
}
