//! Host repository. All functions operate on a caller-held connection so
//! they compose into larger transactions.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::models::Host;
use crate::store::{fmt_ts, now_ts, parse_ts, StoreResult};

const HOST_COLUMNS: &str = "id, fqdn, ipv4, ipv6, active, status, approval_status, last_access, \
     platform, is_agent_privileged, script_execution_enabled, enabled_shells, \
     reboot_required, reboot_required_reason, client_certificate, certificate_serial, \
     certificate_issued_at, virtualization_types, virtualization_capabilities, \
     virtualization_updated_at, diagnostics_request_status, hardware_updated_at, \
     software_updated_at, user_access_updated_at, cpu_vendor, cpu_model, cpu_cores, \
     cpu_threads, memory_total_mb, created_at, updated_at";

fn row_to_host(row: &Row<'_>) -> rusqlite::Result<Host> {
    let ts = |idx: usize| -> rusqlite::Result<Option<DateTime<Utc>>> {
        let v: Option<String> = row.get(idx)?;
        Ok(v.as_deref().and_then(parse_ts))
    };
    Ok(Host {
        id: row.get(0)?,
        fqdn: row.get(1)?,
        ipv4: row.get(2)?,
        ipv6: row.get(3)?,
        active: row.get(4)?,
        status: row.get(5)?,
        approval_status: row.get(6)?,
        last_access: ts(7)?,
        platform: row.get(8)?,
        is_agent_privileged: row.get(9)?,
        script_execution_enabled: row.get(10)?,
        enabled_shells: row.get(11)?,
        reboot_required: row.get(12)?,
        reboot_required_reason: row.get(13)?,
        client_certificate: row.get(14)?,
        certificate_serial: row.get(15)?,
        certificate_issued_at: ts(16)?,
        virtualization_types: row.get(17)?,
        virtualization_capabilities: row.get(18)?,
        virtualization_updated_at: ts(19)?,
        diagnostics_request_status: row.get(20)?,
        hardware_updated_at: ts(21)?,
        software_updated_at: ts(22)?,
        user_access_updated_at: ts(23)?,
        cpu_vendor: row.get(24)?,
        cpu_model: row.get(25)?,
        cpu_cores: row.get(26)?,
        cpu_threads: row.get(27)?,
        memory_total_mb: row.get(28)?,
        created_at: parse_ts(&row.get::<_, String>(29)?).unwrap_or_else(Utc::now),
        updated_at: parse_ts(&row.get::<_, String>(30)?).unwrap_or_else(Utc::now),
    })
}

pub fn get_by_id(conn: &Connection, id: &str) -> StoreResult<Option<Host>> {
    let host = conn
        .query_row(
            &format!("SELECT {HOST_COLUMNS} FROM host WHERE id = ?1"),
            params![id],
            row_to_host,
        )
        .optional()?;
    Ok(host)
}

pub fn get_by_fqdn(conn: &Connection, fqdn: &str) -> StoreResult<Option<Host>> {
    let host = conn
        .query_row(
            &format!("SELECT {HOST_COLUMNS} FROM host WHERE fqdn = ?1"),
            params![fqdn],
            row_to_host,
        )
        .optional()?;
    Ok(host)
}

pub fn list(conn: &Connection) -> StoreResult<Vec<Host>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {HOST_COLUMNS} FROM host ORDER BY fqdn"))?;
    let hosts = stmt
        .query_map([], row_to_host)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(hosts)
}

/// Create a host with pending approval. Returns the new row.
pub fn create(
    conn: &Connection,
    fqdn: &str,
    ipv4: Option<&str>,
    ipv6: Option<&str>,
    last_access: Option<DateTime<Utc>>,
) -> StoreResult<Host> {
    let id = Uuid::new_v4().to_string();
    let now = now_ts();
    conn.execute(
        "INSERT INTO host (id, fqdn, ipv4, ipv6, active, status, approval_status,
                           last_access, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 1, 'up', 'pending', ?5, ?6, ?6)",
        params![id, fqdn, ipv4, ipv6, last_access.map(fmt_ts), now],
    )?;
    get_by_id(conn, &id)?
        .ok_or_else(|| crate::store::StoreError::Other(format!("host {id} missing after insert")))
}

/// Update an existing host by fqdn or create a new pending one.
///
/// Existing hosts keep their approval status; only liveness fields and
/// addresses are refreshed. `touch_access` is false for replayed queue
/// traffic, which must not move `last_access`.
pub fn upsert_by_fqdn(
    conn: &Connection,
    fqdn: &str,
    ipv4: Option<&str>,
    ipv6: Option<&str>,
    touch_access: bool,
) -> StoreResult<Host> {
    if let Some(host) = get_by_fqdn(conn, fqdn)? {
        let now = now_ts();
        if touch_access {
            conn.execute(
                "UPDATE host SET ipv4 = ?1, ipv6 = ?2, active = 1, status = 'up',
                        last_access = ?3, updated_at = ?3 WHERE id = ?4",
                params![ipv4, ipv6, now, host.id],
            )?;
        } else {
            conn.execute(
                "UPDATE host SET ipv4 = ?1, ipv6 = ?2, active = 1, status = 'up',
                        updated_at = ?3 WHERE id = ?4",
                params![ipv4, ipv6, now, host.id],
            )?;
        }
        get_by_id(conn, &host.id)?.ok_or_else(|| {
            crate::store::StoreError::Other(format!("host {} missing after update", host.id))
        })
    } else {
        let access = touch_access.then(Utc::now);
        create(conn, fqdn, ipv4, ipv6, access)
    }
}

pub fn set_status(conn: &Connection, id: &str, status: &str) -> StoreResult<()> {
    conn.execute(
        "UPDATE host SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status, now_ts(), id],
    )?;
    Ok(())
}

pub fn set_platform(conn: &Connection, id: &str, platform: &str) -> StoreResult<()> {
    conn.execute(
        "UPDATE host SET platform = ?1, updated_at = ?2 WHERE id = ?3",
        params![platform, now_ts(), id],
    )?;
    Ok(())
}

pub fn set_approval(conn: &Connection, id: &str, approval_status: &str) -> StoreResult<()> {
    conn.execute(
        "UPDATE host SET approval_status = ?1, updated_at = ?2 WHERE id = ?3",
        params![approval_status, now_ts(), id],
    )?;
    Ok(())
}

/// Optional agent-reported fields refreshed by registration and heartbeat.
#[derive(Debug, Default, Clone)]
pub struct AgentReportedFields {
    pub is_privileged: Option<bool>,
    pub script_execution_enabled: Option<bool>,
    /// Serialized JSON list, or None to clear
    pub enabled_shells: Option<Option<String>>,
}

/// Refresh liveness on a heartbeat: status up, active, optionally
/// `last_access`, and any agent-reported columns present in the message.
pub fn refresh_heartbeat(
    conn: &Connection,
    id: &str,
    touch_access: bool,
    fields: &AgentReportedFields,
) -> StoreResult<()> {
    let now = now_ts();
    conn.execute(
        "UPDATE host SET status = 'up', active = 1, updated_at = ?1 WHERE id = ?2",
        params![now, id],
    )?;
    if touch_access {
        conn.execute(
            "UPDATE host SET last_access = ?1 WHERE id = ?2",
            params![now, id],
        )?;
    }
    if let Some(v) = fields.is_privileged {
        conn.execute(
            "UPDATE host SET is_agent_privileged = ?1 WHERE id = ?2",
            params![v, id],
        )?;
    }
    if let Some(v) = fields.script_execution_enabled {
        conn.execute(
            "UPDATE host SET script_execution_enabled = ?1 WHERE id = ?2",
            params![v, id],
        )?;
    }
    if let Some(shells) = &fields.enabled_shells {
        conn.execute(
            "UPDATE host SET enabled_shells = ?1 WHERE id = ?2",
            params![shells, id],
        )?;
    }
    Ok(())
}

pub fn set_reboot_required(
    conn: &Connection,
    id: &str,
    required: bool,
    reason: Option<&str>,
) -> StoreResult<()> {
    conn.execute(
        "UPDATE host SET reboot_required = ?1, reboot_required_reason = ?2,
                updated_at = ?3 WHERE id = ?4",
        params![required, reason, now_ts(), id],
    )?;
    Ok(())
}

/// Set the reboot flag without touching an existing reason string.
pub fn flag_reboot_required(conn: &Connection, id: &str) -> StoreResult<()> {
    conn.execute(
        "UPDATE host SET reboot_required = 1, updated_at = ?1 WHERE id = ?2",
        params![now_ts(), id],
    )?;
    Ok(())
}

pub fn set_client_certificate(
    conn: &Connection,
    id: &str,
    cert_pem: Option<&str>,
    serial: Option<&str>,
    issued_at: Option<DateTime<Utc>>,
) -> StoreResult<()> {
    conn.execute(
        "UPDATE host SET client_certificate = ?1, certificate_serial = ?2,
                certificate_issued_at = ?3, updated_at = ?4 WHERE id = ?5",
        params![cert_pem, serial, issued_at.map(fmt_ts), now_ts(), id],
    )?;
    Ok(())
}

pub fn set_virtualization(
    conn: &Connection,
    id: &str,
    types_json: &str,
    capabilities_json: &str,
) -> StoreResult<()> {
    let now = now_ts();
    conn.execute(
        "UPDATE host SET virtualization_types = ?1, virtualization_capabilities = ?2,
                virtualization_updated_at = ?3, updated_at = ?3 WHERE id = ?4",
        params![types_json, capabilities_json, now, id],
    )?;
    Ok(())
}

pub fn set_diagnostics_status(conn: &Connection, id: &str, status: &str) -> StoreResult<()> {
    conn.execute(
        "UPDATE host SET diagnostics_request_status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status, now_ts(), id],
    )?;
    Ok(())
}

/// Host timestamp columns stamped after an inventory refresh.
#[derive(Debug, Clone, Copy)]
pub enum InventoryStamp {
    Hardware,
    Software,
    UserAccess,
}

pub fn stamp_inventory(conn: &Connection, id: &str, which: InventoryStamp) -> StoreResult<()> {
    let column = match which {
        InventoryStamp::Hardware => "hardware_updated_at",
        InventoryStamp::Software => "software_updated_at",
        InventoryStamp::UserAccess => "user_access_updated_at",
    };
    conn.execute(
        &format!("UPDATE host SET {column} = ?1, updated_at = ?1 WHERE id = ?2"),
        params![now_ts(), id],
    )?;
    Ok(())
}

#[derive(Debug, Default, Clone)]
pub struct HardwareSummary {
    pub cpu_vendor: Option<String>,
    pub cpu_model: Option<String>,
    pub cpu_cores: Option<i64>,
    pub cpu_threads: Option<i64>,
    pub memory_total_mb: Option<i64>,
}

pub fn set_hardware_summary(
    conn: &Connection,
    id: &str,
    summary: &HardwareSummary,
) -> StoreResult<()> {
    conn.execute(
        "UPDATE host SET
            cpu_vendor = COALESCE(?1, cpu_vendor),
            cpu_model = COALESCE(?2, cpu_model),
            cpu_cores = COALESCE(?3, cpu_cores),
            cpu_threads = COALESCE(?4, cpu_threads),
            memory_total_mb = COALESCE(?5, memory_total_mb),
            updated_at = ?6
         WHERE id = ?7",
        params![
            summary.cpu_vendor,
            summary.cpu_model,
            summary.cpu_cores,
            summary.cpu_threads,
            summary.memory_total_mb,
            now_ts(),
            id
        ],
    )?;
    Ok(())
}
