//! Inventory refresh handlers: hardware, user access, and software.
//!
//! Each report replaces the host's normalized rows wholesale and stamps
//! the matching `*_updated_at` column. Entries flagged with `error` are
//! skipped. Legacy JSON-blob fields are tolerated on the wire.

use serde_json::Value;
use tracing::info;

use sm_store::hosts::{self, HardwareSummary, InventoryStamp};
use sm_store::inventory::{
    self, NetworkInterfaceReport, SoftwarePackageReport, StorageDeviceReport, UserAccountReport,
    UserGroupReport,
};
use sm_store::updates::{self, UbuntuProReport};

use crate::handlers::{echo_id, HandlerContext};
use crate::protocol::Envelope;
use crate::state::SessionInfo;

fn parse_array<T: serde::de::DeserializeOwned>(data: &Value, key: &str) -> Vec<T> {
    data.get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

pub async fn handle_hardware_update(
    ctx: &HandlerContext,
    session: &SessionInfo,
    envelope: &Envelope,
) -> anyhow::Result<Option<Envelope>> {
    let Some(host_id) = &session.host_id else {
        return Ok(Some(Envelope::error("Host not registered")));
    };
    let data = &envelope.data;

    let storage: Vec<StorageDeviceReport> = parse_array(data, "storage_devices");
    let interfaces: Vec<NetworkInterfaceReport> = parse_array(data, "network_interfaces");
    let summary = HardwareSummary {
        cpu_vendor: data.get("cpu_vendor").and_then(|v| v.as_str()).map(str::to_string),
        cpu_model: data.get("cpu_model").and_then(|v| v.as_str()).map(str::to_string),
        cpu_cores: data.get("cpu_cores").and_then(|v| v.as_i64()),
        cpu_threads: data.get("cpu_threads").and_then(|v| v.as_i64()),
        memory_total_mb: data.get("memory_total_mb").and_then(|v| v.as_i64()),
    };

    let (devices, nics) = {
        let conn = ctx.store.lock();
        let tx = conn.unchecked_transaction()?;
        let devices = if data.get("storage_devices").is_some() {
            inventory::replace_storage_devices(&tx, host_id, &storage)?
        } else {
            0
        };
        let nics = if data.get("network_interfaces").is_some() {
            inventory::replace_network_interfaces(&tx, host_id, &interfaces)?
        } else {
            0
        };
        hosts::set_hardware_summary(&tx, host_id, &summary)?;
        hosts::stamp_inventory(&tx, host_id, InventoryStamp::Hardware)?;
        tx.commit()?;
        (devices, nics)
    };

    info!(host_id, devices, interfaces = nics, "Hardware inventory updated");
    Ok(Some(Envelope::ack(echo_id(envelope))))
}

pub async fn handle_user_access_update(
    ctx: &HandlerContext,
    session: &SessionInfo,
    envelope: &Envelope,
) -> anyhow::Result<Option<Envelope>> {
    let Some(host_id) = &session.host_id else {
        return Ok(Some(Envelope::error("Host not registered")));
    };
    let data = &envelope.data;

    let users: Vec<UserAccountReport> = parse_array(data, "users");
    let groups: Vec<UserGroupReport> = parse_array(data, "groups");

    let (nu, ng) = {
        let conn = ctx.store.lock();
        let tx = conn.unchecked_transaction()?;
        let counts = inventory::replace_user_access(&tx, host_id, &users, &groups)?;
        hosts::stamp_inventory(&tx, host_id, InventoryStamp::UserAccess)?;
        tx.commit()?;
        counts
    };

    info!(host_id, users = nu, groups = ng, "User access inventory updated");
    Ok(Some(Envelope::ack(echo_id(envelope))))
}

pub async fn handle_software_update(
    ctx: &HandlerContext,
    session: &SessionInfo,
    envelope: &Envelope,
) -> anyhow::Result<Option<Envelope>> {
    let Some(host_id) = &session.host_id else {
        return Ok(Some(Envelope::error("Host not registered")));
    };
    let data = &envelope.data;

    let packages: Vec<SoftwarePackageReport> = parse_array(data, "software_packages");
    let available = data.get("available_updates").and_then(|v| v.as_array());
    let ubuntu_pro: Option<UbuntuProReport> = data
        .get("ubuntu_pro")
        .and_then(|v| serde_json::from_value(v.clone()).ok());

    let installed = {
        let conn = ctx.store.lock();
        let tx = conn.unchecked_transaction()?;
        let installed = if data.get("software_packages").is_some() {
            inventory::replace_software_packages(&tx, host_id, &packages)?
        } else {
            0
        };

        if let Some(available) = available {
            for entry in available {
                let Some(name) = entry.get("package_name").and_then(|v| v.as_str()) else {
                    continue;
                };
                let manager = entry
                    .get("package_manager")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                updates::upsert_package_update(
                    &tx,
                    host_id,
                    name,
                    manager,
                    entry.get("current_version").and_then(|v| v.as_str()),
                    entry.get("available_version").and_then(|v| v.as_str()),
                    entry
                        .get("is_security_update")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                )?;
            }
        }

        if let Some(report) = &ubuntu_pro {
            updates::replace_ubuntu_pro(&tx, host_id, report)?;
        }

        hosts::stamp_inventory(&tx, host_id, InventoryStamp::Software)?;
        tx.commit()?;
        installed
    };

    info!(host_id, packages = installed, "Software inventory updated");
    Ok(Some(Envelope::ack(echo_id(envelope))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConnectionManager;
    use serde_json::json;
    use sm_common::EventBus;
    use sm_queue::QueueOps;
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
            .with_conn(|conn| Ok(hosts::create(conn, "inv.example.com", None, None, None)?.id))
            .unwrap();
        let (agent_id, rx) = ctx.connections.open_session(false).await;
        std::mem::forget(rx);
        ctx.connections.bind_host(&agent_id, &host_id).await;
        let session = ctx.connections.session_info(&agent_id).await.unwrap();
        (ctx, session, host_id)
    }

    #[tokio::test]
    async fn test_hardware_update_replaces_and_stamps() {
        let (ctx, session, host_id) = setup_bound().await;

        let envelope = Envelope::new(
            "hardware_update",
            json!({
                "cpu_vendor": "AMD",
                "cpu_cores": 16,
                "memory_total_mb": 65536,
                "storage_devices": [
                    {"name": "nvme0n1", "mount_point": "/", "capacity_bytes": 1000000000000i64},
                    {"name": "bad", "error": "smartctl failed"},
                ],
                "network_interfaces": [
                    {"name": "eth0", "mac_address": "aa:bb:cc:dd:ee:ff", "is_active": true},
                ],
            }),
        );
        let reply = handle_hardware_update(&ctx, &session, &envelope)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message_type, "ack");

        let (host, devices, nics) = ctx
            .store
            .with_conn(|conn| {
                Ok((
                    hosts::get_by_id(conn, &host_id)?.unwrap(),
                    inventory::list_storage_devices(conn, &host_id)?,
                    inventory::list_network_interfaces(conn, &host_id)?,
                ))
            })
            .unwrap();

        assert_eq!(host.cpu_vendor.as_deref(), Some("AMD"));
        assert_eq!(host.cpu_cores, Some(16));
        assert!(host.hardware_updated_at.is_some());
        assert_eq!(devices.len(), 1, "error entry must be skipped");
        assert_eq!(nics.len(), 1);
    }

    #[tokio::test]
    async fn test_user_access_update() {
        let (ctx, session, host_id) = setup_bound().await;

        let envelope = Envelope::new(
            "user_access_update",
            json!({
                "users": [
                    {"username": "root", "uid": 0, "is_system_user": true, "groups": ["wheel"]},
                    {"username": "deploy", "uid": 1001, "groups": ["wheel", "staff"]},
                ],
                "groups": [
                    {"group_name": "wheel", "gid": 0},
                    {"group_name": "staff", "gid": 50},
                ],
            }),
        );
        handle_user_access_update(&ctx, &session, &envelope).await.unwrap();

        let (host, users, groups) = ctx
            .store
            .with_conn(|conn| {
                Ok((
                    hosts::get_by_id(conn, &host_id)?.unwrap(),
                    inventory::list_user_accounts(conn, &host_id)?,
                    inventory::list_user_groups(conn, &host_id)?,
                ))
            })
            .unwrap();
        assert!(host.user_access_updated_at.is_some());
        assert_eq!(users.len(), 2);
        assert_eq!(groups.len(), 2);
    }

    #[tokio::test]
    async fn test_software_update_with_available_updates() {
        let (ctx, session, host_id) = setup_bound().await;

        let envelope = Envelope::new(
            "software_update",
            json!({
                "software_packages": [
                    {"package_name": "openssh", "version": "9.6", "package_manager": "pkg"},
                ],
                "available_updates": [
                    {
                        "package_name": "openssl",
                        "package_manager": "pkg",
                        "current_version": "3.1",
                        "available_version": "3.2",
                        "is_security_update": true,
                    },
                ],
                "ubuntu_pro": {"attached": true, "subscription": "pro", "services": [
                    {"name": "esm-infra", "status": "enabled"},
                ]},
            }),
        );
        handle_software_update(&ctx, &session, &envelope).await.unwrap();

        let (host, packages, pending) = ctx
            .store
            .with_conn(|conn| {
                Ok((
                    hosts::get_by_id(conn, &host_id)?.unwrap(),
                    inventory::list_software_packages(conn, &host_id)?,
                    updates::list_package_updates(conn, &host_id)?,
                ))
            })
            .unwrap();
        assert!(host.software_updated_at.is_some());
        assert_eq!(packages.len(), 1);
        assert_eq!(pending.len(), 1);
        assert!(pending[0].is_security_update);
    }

    #[tokio::test]
    async fn test_unbound_session_rejected() {
        let (ctx, _session, _host) = setup_bound().await;
        let (agent_id, rx) = ctx.connections.open_session(false).await;
        std::mem::forget(rx);
        let unbound = ctx.connections.session_info(&agent_id).await.unwrap();

        let envelope = Envelope::new("hardware_update", json!({}));
        let reply = handle_hardware_update(&ctx, &unbound, &envelope)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message_type, "error");
    }
}
