//! Child host (VM/container) repository.

use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::models::HostChild;
use crate::store::{now_ts, parse_ts, StoreResult};

fn row_to_child(row: &Row<'_>) -> rusqlite::Result<HostChild> {
    Ok(HostChild {
        id: row.get(0)?,
        parent_host_id: row.get(1)?,
        child_name: row.get(2)?,
        child_type: row.get(3)?,
        status: row.get(4)?,
        error_message: row.get(5)?,
        updated_at: parse_ts(&row.get::<_, String>(6)?).unwrap_or_else(chrono::Utc::now),
    })
}

const CHILD_COLUMNS: &str =
    "id, parent_host_id, child_name, child_type, status, error_message, updated_at";

pub fn get(conn: &Connection, parent_host_id: &str, child_name: &str) -> StoreResult<Option<HostChild>> {
    let child = conn
        .query_row(
            &format!(
                "SELECT {CHILD_COLUMNS} FROM host_child
                 WHERE parent_host_id = ?1 AND child_name = ?2"
            ),
            params![parent_host_id, child_name],
            row_to_child,
        )
        .optional()?;
    Ok(child)
}

pub fn list_for_parent(conn: &Connection, parent_host_id: &str) -> StoreResult<Vec<HostChild>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHILD_COLUMNS} FROM host_child
         WHERE parent_host_id = ?1 ORDER BY child_name"
    ))?;
    let children = stmt
        .query_map(params![parent_host_id], row_to_child)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(children)
}

pub fn list_running(conn: &Connection, parent_host_id: &str) -> StoreResult<Vec<HostChild>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHILD_COLUMNS} FROM host_child
         WHERE parent_host_id = ?1 AND status = 'running' ORDER BY child_name"
    ))?;
    let children = stmt
        .query_map(params![parent_host_id], row_to_child)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(children)
}

/// Count children from `names` that are still running.
pub fn count_running_in(
    conn: &Connection,
    parent_host_id: &str,
    names: &[String],
) -> StoreResult<usize> {
    let children = list_running(conn, parent_host_id)?;
    Ok(children
        .iter()
        .filter(|c| names.contains(&c.child_name))
        .count())
}

/// Insert or update a child host row from an agent status report.
pub fn upsert(
    conn: &Connection,
    parent_host_id: &str,
    child_name: &str,
    child_type: &str,
    status: &str,
    error_message: Option<&str>,
) -> StoreResult<HostChild> {
    let now = now_ts();
    let updated = conn.execute(
        "UPDATE host_child SET child_type = ?1, status = ?2, error_message = ?3,
                updated_at = ?4
         WHERE parent_host_id = ?5 AND child_name = ?6",
        params![child_type, status, error_message, now, parent_host_id, child_name],
    )?;
    if updated == 0 {
        conn.execute(
            "INSERT INTO host_child (id, parent_host_id, child_name, child_type,
                                     status, error_message, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                parent_host_id,
                child_name,
                child_type,
                status,
                error_message,
                now
            ],
        )?;
    }
    get(conn, parent_host_id, child_name)?.ok_or_else(|| {
        crate::store::StoreError::Other(format!(
            "child {child_name} of {parent_host_id} missing after write"
        ))
    })
}

pub fn remove(conn: &Connection, parent_host_id: &str, child_name: &str) -> StoreResult<bool> {
    let n = conn.execute(
        "DELETE FROM host_child WHERE parent_host_id = ?1 AND child_name = ?2",
        params![parent_host_id, child_name],
    )?;
    Ok(n > 0)
}
