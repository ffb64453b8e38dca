//! Normalized inventory tables refreshed from agent reports.
//!
//! Each refresh replaces the host's rows wholesale (delete-then-insert);
//! entries carrying an `error` field are skipped by the caller.

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::models::{NetworkInterface, SoftwarePackage, StorageDevice, UserAccount, UserGroup};
use crate::store::{now_ts, StoreResult};

// ── Agent report shapes ─────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageDeviceReport {
    pub name: Option<String>,
    pub device_path: Option<String>,
    pub mount_point: Option<String>,
    pub file_system: Option<String>,
    pub device_type: Option<String>,
    pub capacity_bytes: Option<i64>,
    pub used_bytes: Option<i64>,
    pub available_bytes: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkInterfaceReport {
    pub name: Option<String>,
    pub interface_type: Option<String>,
    pub hardware_type: Option<String>,
    pub mac_address: Option<String>,
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
    pub subnet_mask: Option<String>,
    #[serde(default)]
    pub is_active: bool,
    pub speed_mbps: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserAccountReport {
    pub username: String,
    pub uid: Option<i64>,
    pub home_directory: Option<String>,
    pub shell: Option<String>,
    #[serde(default)]
    pub is_system_user: bool,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserGroupReport {
    pub group_name: String,
    pub gid: Option<i64>,
    #[serde(default)]
    pub is_system_group: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SoftwarePackageReport {
    pub package_name: String,
    pub version: Option<String>,
    pub description: Option<String>,
    pub package_manager: Option<String>,
    pub architecture: Option<String>,
    pub size_bytes: Option<i64>,
    pub vendor: Option<String>,
    #[serde(default)]
    pub is_system_package: bool,
    #[serde(default)]
    pub error: Option<String>,
}

// ── Storage devices ─────────────────────────────────────────────

pub fn replace_storage_devices(
    conn: &Connection,
    host_id: &str,
    devices: &[StorageDeviceReport],
) -> StoreResult<usize> {
    let now = now_ts();
    conn.execute(
        "DELETE FROM storage_device WHERE host_id = ?1",
        params![host_id],
    )?;
    let mut inserted = 0;
    for device in devices.iter().filter(|d| d.error.is_none()) {
        conn.execute(
            "INSERT INTO storage_device (host_id, device_name, device_path, mount_point,
                 filesystem, device_type, capacity_bytes, used_bytes, available_bytes,
                 last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                host_id,
                device.name,
                device.device_path,
                device.mount_point,
                device.file_system,
                device.device_type,
                device.capacity_bytes,
                device.used_bytes,
                device.available_bytes,
                now
            ],
        )?;
        inserted += 1;
    }
    Ok(inserted)
}

pub fn list_storage_devices(conn: &Connection, host_id: &str) -> StoreResult<Vec<StorageDevice>> {
    let mut stmt = conn.prepare(
        "SELECT id, host_id, device_name, device_path, mount_point, filesystem,
                device_type, capacity_bytes, used_bytes, available_bytes
         FROM storage_device WHERE host_id = ?1 ORDER BY device_name",
    )?;
    let rows = stmt
        .query_map(params![host_id], |row: &Row<'_>| {
            Ok(StorageDevice {
                id: row.get(0)?,
                host_id: row.get(1)?,
                device_name: row.get(2)?,
                device_path: row.get(3)?,
                mount_point: row.get(4)?,
                filesystem: row.get(5)?,
                device_type: row.get(6)?,
                capacity_bytes: row.get(7)?,
                used_bytes: row.get(8)?,
                available_bytes: row.get(9)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ── Network interfaces ──────────────────────────────────────────

pub fn replace_network_interfaces(
    conn: &Connection,
    host_id: &str,
    interfaces: &[NetworkInterfaceReport],
) -> StoreResult<usize> {
    let now = now_ts();
    conn.execute(
        "DELETE FROM network_interface WHERE host_id = ?1",
        params![host_id],
    )?;
    let mut inserted = 0;
    for iface in interfaces.iter().filter(|i| i.error.is_none()) {
        let interface_type = iface
            .interface_type
            .clone()
            .or_else(|| iface.hardware_type.clone());
        conn.execute(
            "INSERT INTO network_interface (host_id, interface_name, interface_type,
                 mac_address, ipv4_address, ipv6_address, netmask, is_active, speed_mbps,
                 last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                host_id,
                iface.name,
                interface_type,
                iface.mac_address,
                iface.ipv4_address,
                iface.ipv6_address,
                iface.subnet_mask,
                iface.is_active,
                iface.speed_mbps,
                now
            ],
        )?;
        inserted += 1;
    }
    Ok(inserted)
}

pub fn list_network_interfaces(
    conn: &Connection,
    host_id: &str,
) -> StoreResult<Vec<NetworkInterface>> {
    let mut stmt = conn.prepare(
        "SELECT id, host_id, interface_name, interface_type, mac_address, ipv4_address,
                ipv6_address, netmask, is_active, speed_mbps
         FROM network_interface WHERE host_id = ?1 ORDER BY interface_name",
    )?;
    let rows = stmt
        .query_map(params![host_id], |row: &Row<'_>| {
            Ok(NetworkInterface {
                id: row.get(0)?,
                host_id: row.get(1)?,
                interface_name: row.get(2)?,
                interface_type: row.get(3)?,
                mac_address: row.get(4)?,
                ipv4_address: row.get(5)?,
                ipv6_address: row.get(6)?,
                netmask: row.get(7)?,
                is_active: row.get(8)?,
                speed_mbps: row.get(9)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ── Users and groups ────────────────────────────────────────────

/// Replace users, groups, and memberships for a host in one pass.
pub fn replace_user_access(
    conn: &Connection,
    host_id: &str,
    users: &[UserAccountReport],
    groups: &[UserGroupReport],
) -> StoreResult<(usize, usize)> {
    let now = now_ts();
    conn.execute(
        "DELETE FROM user_group_membership WHERE host_id = ?1",
        params![host_id],
    )?;
    conn.execute(
        "DELETE FROM user_account WHERE host_id = ?1",
        params![host_id],
    )?;
    conn.execute(
        "DELETE FROM user_group WHERE host_id = ?1",
        params![host_id],
    )?;

    let mut group_ids = std::collections::HashMap::new();
    let mut inserted_groups = 0;
    for group in groups.iter().filter(|g| g.error.is_none()) {
        conn.execute(
            "INSERT INTO user_group (host_id, group_name, gid, is_system_group, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![host_id, group.group_name, group.gid, group.is_system_group, now],
        )?;
        group_ids.insert(group.group_name.clone(), conn.last_insert_rowid());
        inserted_groups += 1;
    }

    let mut inserted_users = 0;
    for user in users.iter().filter(|u| u.error.is_none()) {
        conn.execute(
            "INSERT INTO user_account (host_id, username, uid, home_directory, shell,
                 is_system_user, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                host_id,
                user.username,
                user.uid,
                user.home_directory,
                user.shell,
                user.is_system_user,
                now
            ],
        )?;
        let user_id = conn.last_insert_rowid();
        inserted_users += 1;

        for group_name in &user.groups {
            if let Some(group_id) = group_ids.get(group_name) {
                conn.execute(
                    "INSERT INTO user_group_membership (host_id, user_account_id, user_group_id)
                     VALUES (?1, ?2, ?3)",
                    params![host_id, user_id, group_id],
                )?;
            }
        }
    }

    Ok((inserted_users, inserted_groups))
}

pub fn list_user_accounts(conn: &Connection, host_id: &str) -> StoreResult<Vec<UserAccount>> {
    let mut stmt = conn.prepare(
        "SELECT id, host_id, username, uid, home_directory, shell, is_system_user
         FROM user_account WHERE host_id = ?1 ORDER BY username",
    )?;
    let rows = stmt
        .query_map(params![host_id], |row: &Row<'_>| {
            Ok(UserAccount {
                id: row.get(0)?,
                host_id: row.get(1)?,
                username: row.get(2)?,
                uid: row.get(3)?,
                home_directory: row.get(4)?,
                shell: row.get(5)?,
                is_system_user: row.get(6)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn list_user_groups(conn: &Connection, host_id: &str) -> StoreResult<Vec<UserGroup>> {
    let mut stmt = conn.prepare(
        "SELECT id, host_id, group_name, gid, is_system_group
         FROM user_group WHERE host_id = ?1 ORDER BY group_name",
    )?;
    let rows = stmt
        .query_map(params![host_id], |row: &Row<'_>| {
            Ok(UserGroup {
                id: row.get(0)?,
                host_id: row.get(1)?,
                group_name: row.get(2)?,
                gid: row.get(3)?,
                is_system_group: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Group names a user belongs to, via the membership table.
pub fn groups_for_user(conn: &Connection, user_account_id: i64) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT g.group_name FROM user_group_membership m
         JOIN user_group g ON g.id = m.user_group_id
         WHERE m.user_account_id = ?1 ORDER BY g.group_name",
    )?;
    let rows = stmt
        .query_map(params![user_account_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ── Software packages ───────────────────────────────────────────

pub fn replace_software_packages(
    conn: &Connection,
    host_id: &str,
    packages: &[SoftwarePackageReport],
) -> StoreResult<usize> {
    let now = now_ts();
    conn.execute(
        "DELETE FROM software_package WHERE host_id = ?1",
        params![host_id],
    )?;
    let mut inserted = 0;
    for package in packages.iter().filter(|p| p.error.is_none()) {
        conn.execute(
            "INSERT INTO software_package (host_id, package_name, version, description,
                 package_manager, architecture, size_bytes, vendor, is_system_package,
                 last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                host_id,
                package.package_name,
                package.version,
                package.description,
                package.package_manager,
                package.architecture,
                package.size_bytes,
                package.vendor,
                package.is_system_package,
                now
            ],
        )?;
        inserted += 1;
    }
    Ok(inserted)
}

pub fn list_software_packages(
    conn: &Connection,
    host_id: &str,
) -> StoreResult<Vec<SoftwarePackage>> {
    let mut stmt = conn.prepare(
        "SELECT id, host_id, package_name, version, description, package_manager,
                architecture, size_bytes, vendor, is_system_package
         FROM software_package WHERE host_id = ?1 ORDER BY package_name",
    )?;
    let rows = stmt
        .query_map(params![host_id], |row: &Row<'_>| {
            Ok(SoftwarePackage {
                id: row.get(0)?,
                host_id: row.get(1)?,
                package_name: row.get(2)?,
                version: row.get(3)?,
                description: row.get(4)?,
                package_manager: row.get(5)?,
                architecture: row.get(6)?,
                size_bytes: row.get(7)?,
                vendor: row.get(8)?,
                is_system_package: row.get(9)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn test_replace_skips_error_entries() {
        let store = Store::open_memory().unwrap();
        let conn = store.lock();

        let devices = vec![
            StorageDeviceReport {
                name: Some("sda".into()),
                mount_point: Some("/".into()),
                capacity_bytes: Some(512_000_000_000),
                ..Default::default()
            },
            StorageDeviceReport {
                name: Some("sdb".into()),
                error: Some("read failed".into()),
                ..Default::default()
            },
        ];
        let inserted = replace_storage_devices(&conn, "h1", &devices).unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(list_storage_devices(&conn, "h1").unwrap().len(), 1);
    }

    #[test]
    fn test_replace_is_wholesale() {
        let store = Store::open_memory().unwrap();
        let conn = store.lock();

        let first = vec![
            StorageDeviceReport { name: Some("sda".into()), ..Default::default() },
            StorageDeviceReport { name: Some("sdb".into()), ..Default::default() },
        ];
        replace_storage_devices(&conn, "h1", &first).unwrap();

        let second = vec![StorageDeviceReport { name: Some("nvme0".into()), ..Default::default() }];
        replace_storage_devices(&conn, "h1", &second).unwrap();

        let rows = list_storage_devices(&conn, "h1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].device_name.as_deref(), Some("nvme0"));
    }

    #[test]
    fn test_user_access_with_memberships() {
        let store = Store::open_memory().unwrap();
        let conn = store.lock();

        let groups = vec![
            UserGroupReport { group_name: "wheel".into(), gid: Some(10), ..Default::default() },
            UserGroupReport { group_name: "staff".into(), gid: Some(20), ..Default::default() },
        ];
        let users = vec![UserAccountReport {
            username: "alice".into(),
            uid: Some(1000),
            groups: vec!["wheel".into(), "staff".into(), "missing".into()],
            ..Default::default()
        }];

        let (nu, ng) = replace_user_access(&conn, "h1", &users, &groups).unwrap();
        assert_eq!((nu, ng), (1, 2));

        let accounts = list_user_accounts(&conn, "h1").unwrap();
        let memberships = groups_for_user(&conn, accounts[0].id).unwrap();
        assert_eq!(memberships, vec!["staff".to_string(), "wheel".to_string()]);
    }
}
