//! Pending package updates, update execution logs, installation logs, and
//! Ubuntu Pro state.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::models::{PackageUpdate, SoftwareInstallationLog, UpdateExecutionLog};
use crate::store::{now_ts, parse_ts, StoreResult};

// ── package_update ──────────────────────────────────────────────

pub fn upsert_package_update(
    conn: &Connection,
    host_id: &str,
    package_name: &str,
    package_manager: &str,
    current_version: Option<&str>,
    available_version: Option<&str>,
    is_security_update: bool,
) -> StoreResult<()> {
    let now = now_ts();
    let updated = conn.execute(
        "UPDATE package_update SET current_version = ?1, available_version = ?2,
                is_security_update = ?3, status = 'available', updated_at = ?4
         WHERE host_id = ?5 AND package_name = ?6 AND package_manager = ?7",
        params![
            current_version,
            available_version,
            is_security_update,
            now,
            host_id,
            package_name,
            package_manager
        ],
    )?;
    if updated == 0 {
        conn.execute(
            "INSERT INTO package_update (host_id, package_name, package_manager,
                 current_version, available_version, is_security_update, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                host_id,
                package_name,
                package_manager,
                current_version,
                available_version,
                is_security_update,
                now
            ],
        )?;
    }
    Ok(())
}

pub fn list_package_updates(conn: &Connection, host_id: &str) -> StoreResult<Vec<PackageUpdate>> {
    let mut stmt = conn.prepare(
        "SELECT id, host_id, package_name, package_manager, current_version,
                available_version, is_security_update, status
         FROM package_update WHERE host_id = ?1 ORDER BY package_name",
    )?;
    let rows = stmt
        .query_map(params![host_id], |row: &Row<'_>| {
            Ok(PackageUpdate {
                id: row.get(0)?,
                host_id: row.get(1)?,
                package_name: row.get(2)?,
                package_manager: row.get(3)?,
                current_version: row.get(4)?,
                available_version: row.get(5)?,
                is_security_update: row.get(6)?,
                status: row.get(7)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Remove a pending update after it was applied. Returns rows deleted.
pub fn delete_package_update(
    conn: &Connection,
    host_id: &str,
    package_name: &str,
    package_manager: &str,
) -> StoreResult<usize> {
    let n = conn.execute(
        "DELETE FROM package_update
         WHERE host_id = ?1 AND package_name = ?2 AND package_manager = ?3",
        params![host_id, package_name, package_manager],
    )?;
    Ok(n)
}

pub fn mark_package_update_failed(
    conn: &Connection,
    host_id: &str,
    package_name: &str,
    package_manager: &str,
) -> StoreResult<usize> {
    let n = conn.execute(
        "UPDATE package_update SET status = 'failed', updated_at = ?1
         WHERE host_id = ?2 AND package_name = ?3 AND package_manager = ?4",
        params![now_ts(), host_id, package_name, package_manager],
    )?;
    Ok(n)
}

// ── update_execution_log ────────────────────────────────────────

pub fn insert_execution_log(
    conn: &Connection,
    host_id: &str,
    package_name: &str,
    package_manager: &str,
) -> StoreResult<i64> {
    let now = now_ts();
    conn.execute(
        "INSERT INTO update_execution_log (host_id, package_name, package_manager,
             execution_status, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
        params![host_id, package_name, package_manager, now],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Resolve the most recent pending execution log entry for a package.
pub fn complete_latest_execution(
    conn: &Connection,
    host_id: &str,
    package_name: &str,
    package_manager: &str,
    success: bool,
    error_log: Option<&str>,
) -> StoreResult<bool> {
    let id: Option<i64> = conn
        .query_row(
            "SELECT id FROM update_execution_log
             WHERE host_id = ?1 AND package_name = ?2 AND package_manager = ?3
               AND execution_status = 'pending'
             ORDER BY created_at DESC LIMIT 1",
            params![host_id, package_name, package_manager],
            |r| r.get(0),
        )
        .optional()?;
    let Some(id) = id else {
        return Ok(false);
    };
    let now = now_ts();
    conn.execute(
        "UPDATE update_execution_log SET execution_status = ?1, error_log = ?2,
                completed_at = ?3, updated_at = ?3 WHERE id = ?4",
        params![if success { "success" } else { "failed" }, error_log, now, id],
    )?;
    Ok(true)
}

pub fn list_execution_logs(
    conn: &Connection,
    host_id: &str,
) -> StoreResult<Vec<UpdateExecutionLog>> {
    let mut stmt = conn.prepare(
        "SELECT id, host_id, package_name, package_manager, execution_status,
                error_log, created_at, completed_at
         FROM update_execution_log WHERE host_id = ?1 ORDER BY created_at DESC",
    )?;
    let rows = stmt
        .query_map(params![host_id], |row: &Row<'_>| {
            let completed: Option<String> = row.get(7)?;
            Ok(UpdateExecutionLog {
                id: row.get(0)?,
                host_id: row.get(1)?,
                package_name: row.get(2)?,
                package_manager: row.get(3)?,
                execution_status: row.get(4)?,
                error_log: row.get(5)?,
                created_at: parse_ts(&row.get::<_, String>(6)?).unwrap_or_else(chrono::Utc::now),
                completed_at: completed.as_deref().and_then(parse_ts),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ── software_installation_log ───────────────────────────────────

pub fn insert_installation_log(
    conn: &Connection,
    installation_id: &str,
    host_id: &str,
    package_name: &str,
    requested_version: Option<&str>,
) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO software_installation_log (installation_id, host_id, package_name,
             requested_version, status, created_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
        params![installation_id, host_id, package_name, requested_version, now_ts()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Agent-reported outcome for one installation batch entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallationOutcome {
    pub installation_id: String,
    pub status: String,
    #[serde(default)]
    pub stdout_log: Option<String>,
    #[serde(default)]
    pub stderr_log: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

pub fn record_installation_outcome(
    conn: &Connection,
    outcome: &InstallationOutcome,
) -> StoreResult<usize> {
    let completed = matches!(outcome.status.as_str(), "completed" | "failed");
    let n = conn.execute(
        "UPDATE software_installation_log SET status = ?1, stdout_log = ?2,
                stderr_log = ?3, exit_code = ?4, error_message = ?5,
                completed_at = CASE WHEN ?6 THEN ?7 ELSE completed_at END
         WHERE installation_id = ?8",
        params![
            outcome.status,
            outcome.stdout_log,
            outcome.stderr_log,
            outcome.exit_code,
            outcome.error_message,
            completed,
            now_ts(),
            outcome.installation_id
        ],
    )?;
    Ok(n)
}

pub fn list_installation_logs(
    conn: &Connection,
    installation_id: &str,
) -> StoreResult<Vec<SoftwareInstallationLog>> {
    let mut stmt = conn.prepare(
        "SELECT id, installation_id, host_id, package_name, requested_version, status,
                stdout_log, stderr_log, exit_code, error_message, created_at, completed_at
         FROM software_installation_log WHERE installation_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![installation_id], |row: &Row<'_>| {
            let completed: Option<String> = row.get(11)?;
            Ok(SoftwareInstallationLog {
                id: row.get(0)?,
                installation_id: row.get(1)?,
                host_id: row.get(2)?,
                package_name: row.get(3)?,
                requested_version: row.get(4)?,
                status: row.get(5)?,
                stdout_log: row.get(6)?,
                stderr_log: row.get(7)?,
                exit_code: row.get(8)?,
                error_message: row.get(9)?,
                created_at: parse_ts(&row.get::<_, String>(10)?).unwrap_or_else(chrono::Utc::now),
                completed_at: completed.as_deref().and_then(parse_ts),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ── Ubuntu Pro ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UbuntuProReport {
    #[serde(default)]
    pub attached: bool,
    pub subscription: Option<String>,
    pub expires: Option<String>,
    pub account_name: Option<String>,
    pub contract_name: Option<String>,
    pub tech_support_level: Option<String>,
    #[serde(default)]
    pub services: Vec<UbuntuProServiceReport>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UbuntuProServiceReport {
    pub name: String,
    pub status: Option<String>,
    pub entitled: Option<String>,
}

pub fn replace_ubuntu_pro(
    conn: &Connection,
    host_id: &str,
    report: &UbuntuProReport,
) -> StoreResult<()> {
    let now = now_ts();
    conn.execute(
        "DELETE FROM ubuntu_pro_service WHERE host_id = ?1",
        params![host_id],
    )?;
    conn.execute(
        "DELETE FROM ubuntu_pro_info WHERE host_id = ?1",
        params![host_id],
    )?;
    conn.execute(
        "INSERT INTO ubuntu_pro_info (host_id, attached, subscription, expires,
             account_name, contract_name, tech_support_level, last_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            host_id,
            report.attached,
            report.subscription,
            report.expires,
            report.account_name,
            report.contract_name,
            report.tech_support_level,
            now
        ],
    )?;
    for service in &report.services {
        conn.execute(
            "INSERT INTO ubuntu_pro_service (host_id, service_name, status, entitled,
                 last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![host_id, service.name, service.status, service.entitled, now],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn test_package_update_lifecycle() {
        let store = Store::open_memory().unwrap();
        let conn = store.lock();

        upsert_package_update(&conn, "h1", "openssl", "apt", Some("3.0.1"), Some("3.0.2"), true)
            .unwrap();
        upsert_package_update(&conn, "h1", "vim", "apt", Some("9.0"), Some("9.1"), false)
            .unwrap();
        assert_eq!(list_package_updates(&conn, "h1").unwrap().len(), 2);

        // Applied → removed
        assert_eq!(delete_package_update(&conn, "h1", "openssl", "apt").unwrap(), 1);
        // Failed → flagged, row kept
        assert_eq!(mark_package_update_failed(&conn, "h1", "vim", "apt").unwrap(), 1);

        let remaining = list_package_updates(&conn, "h1").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].status, "failed");
    }

    #[test]
    fn test_execution_log_completion() {
        let store = Store::open_memory().unwrap();
        let conn = store.lock();

        insert_execution_log(&conn, "h1", "openssl", "apt").unwrap();
        assert!(complete_latest_execution(&conn, "h1", "openssl", "apt", true, None).unwrap());
        // Nothing pending any more
        assert!(!complete_latest_execution(&conn, "h1", "openssl", "apt", true, None).unwrap());

        let logs = list_execution_logs(&conn, "h1").unwrap();
        assert_eq!(logs[0].execution_status, "success");
        assert!(logs[0].completed_at.is_some());
    }

    #[test]
    fn test_installation_outcome() {
        let store = Store::open_memory().unwrap();
        let conn = store.lock();

        insert_installation_log(&conn, "batch-1", "h1", "htop", None).unwrap();
        insert_installation_log(&conn, "batch-1", "h1", "tmux", None).unwrap();

        let outcome = InstallationOutcome {
            installation_id: "batch-1".into(),
            status: "completed".into(),
            exit_code: Some(0),
            ..Default::default()
        };
        assert_eq!(record_installation_outcome(&conn, &outcome).unwrap(), 2);

        let logs = list_installation_logs(&conn, "batch-1").unwrap();
        assert!(logs.iter().all(|l| l.status == "completed"));
        assert!(logs.iter().all(|l| l.completed_at.is_some()));
    }
}
