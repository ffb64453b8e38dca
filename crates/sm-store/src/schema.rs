use rusqlite::Connection;

use crate::store::StoreResult;

/// Create all tables and indexes. Idempotent.
pub fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS host (
            id TEXT PRIMARY KEY,
            fqdn TEXT UNIQUE NOT NULL,
            ipv4 TEXT,
            ipv6 TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'down',
            approval_status TEXT NOT NULL DEFAULT 'pending',
            last_access TEXT,
            platform TEXT,
            is_agent_privileged INTEGER NOT NULL DEFAULT 0,
            script_execution_enabled INTEGER NOT NULL DEFAULT 0,
            enabled_shells TEXT,
            reboot_required INTEGER NOT NULL DEFAULT 0,
            reboot_required_reason TEXT,
            client_certificate TEXT,
            certificate_serial TEXT,
            certificate_issued_at TEXT,
            virtualization_types TEXT,
            virtualization_capabilities TEXT,
            virtualization_updated_at TEXT,
            diagnostics_request_status TEXT,
            hardware_updated_at TEXT,
            software_updated_at TEXT,
            user_access_updated_at TEXT,
            cpu_vendor TEXT,
            cpu_model TEXT,
            cpu_cores INTEGER,
            cpu_threads INTEGER,
            memory_total_mb INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS message_queue (
            id INTEGER PRIMARY KEY,
            message_id TEXT UNIQUE NOT NULL,
            host_id TEXT,
            direction TEXT NOT NULL,
            message_type TEXT NOT NULL,
            message_data TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            priority TEXT NOT NULL DEFAULT 'normal',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            created_at TEXT NOT NULL,
            scheduled_at TEXT,
            started_at TEXT,
            completed_at TEXT,
            expired_at TEXT,
            error_message TEXT,
            last_error_at TEXT,
            correlation_id TEXT,
            reply_to TEXT,
            execution_id TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_queue_host_dir_status
            ON message_queue(host_id, direction, status, scheduled_at);
        CREATE INDEX IF NOT EXISTS idx_queue_status_created
            ON message_queue(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_queue_correlation
            ON message_queue(correlation_id);
        CREATE INDEX IF NOT EXISTS idx_queue_reply_to
            ON message_queue(reply_to);
        CREATE INDEX IF NOT EXISTS idx_queue_execution_id
            ON message_queue(execution_id);

        CREATE TABLE IF NOT EXISTS reboot_orchestration (
            id TEXT PRIMARY KEY,
            parent_host_id TEXT NOT NULL,
            status TEXT NOT NULL,
            child_hosts_snapshot TEXT NOT NULL,
            child_hosts_restart_status TEXT,
            initiated_at TEXT NOT NULL,
            shutdown_completed_at TEXT,
            reboot_issued_at TEXT,
            agent_reconnected_at TEXT,
            restart_completed_at TEXT,
            shutdown_timeout_seconds INTEGER NOT NULL DEFAULT 300,
            error_message TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_orchestration_parent_status
            ON reboot_orchestration(parent_host_id, status);

        CREATE TABLE IF NOT EXISTS host_child (
            id TEXT PRIMARY KEY,
            parent_host_id TEXT NOT NULL,
            child_name TEXT NOT NULL,
            child_type TEXT NOT NULL,
            status TEXT NOT NULL,
            error_message TEXT,
            updated_at TEXT NOT NULL,
            UNIQUE(parent_host_id, child_name)
        );

        CREATE TABLE IF NOT EXISTS storage_device (
            id INTEGER PRIMARY KEY,
            host_id TEXT NOT NULL,
            device_name TEXT,
            device_path TEXT,
            mount_point TEXT,
            filesystem TEXT,
            device_type TEXT,
            capacity_bytes INTEGER,
            used_bytes INTEGER,
            available_bytes INTEGER,
            last_updated TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_storage_host ON storage_device(host_id);

        CREATE TABLE IF NOT EXISTS network_interface (
            id INTEGER PRIMARY KEY,
            host_id TEXT NOT NULL,
            interface_name TEXT,
            interface_type TEXT,
            mac_address TEXT,
            ipv4_address TEXT,
            ipv6_address TEXT,
            netmask TEXT,
            is_active INTEGER NOT NULL DEFAULT 0,
            speed_mbps INTEGER,
            last_updated TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_netif_host ON network_interface(host_id);

        CREATE TABLE IF NOT EXISTS user_account (
            id INTEGER PRIMARY KEY,
            host_id TEXT NOT NULL,
            username TEXT NOT NULL,
            uid INTEGER,
            home_directory TEXT,
            shell TEXT,
            is_system_user INTEGER NOT NULL DEFAULT 0,
            last_updated TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_user_account_host ON user_account(host_id);

        CREATE TABLE IF NOT EXISTS user_group (
            id INTEGER PRIMARY KEY,
            host_id TEXT NOT NULL,
            group_name TEXT NOT NULL,
            gid INTEGER,
            is_system_group INTEGER NOT NULL DEFAULT 0,
            last_updated TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_user_group_host ON user_group(host_id);

        CREATE TABLE IF NOT EXISTS user_group_membership (
            id INTEGER PRIMARY KEY,
            host_id TEXT NOT NULL,
            user_account_id INTEGER NOT NULL,
            user_group_id INTEGER NOT NULL,
            FOREIGN KEY (user_account_id) REFERENCES user_account(id) ON DELETE CASCADE,
            FOREIGN KEY (user_group_id) REFERENCES user_group(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS software_package (
            id INTEGER PRIMARY KEY,
            host_id TEXT NOT NULL,
            package_name TEXT NOT NULL,
            version TEXT,
            description TEXT,
            package_manager TEXT,
            architecture TEXT,
            size_bytes INTEGER,
            vendor TEXT,
            is_system_package INTEGER NOT NULL DEFAULT 0,
            last_updated TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_software_host ON software_package(host_id);

        CREATE TABLE IF NOT EXISTS package_update (
            id INTEGER PRIMARY KEY,
            host_id TEXT NOT NULL,
            package_name TEXT NOT NULL,
            package_manager TEXT NOT NULL,
            current_version TEXT,
            available_version TEXT,
            is_security_update INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'available',
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_package_update_host ON package_update(host_id);

        CREATE TABLE IF NOT EXISTS update_execution_log (
            id INTEGER PRIMARY KEY,
            host_id TEXT NOT NULL,
            package_name TEXT NOT NULL,
            package_manager TEXT NOT NULL,
            execution_status TEXT NOT NULL DEFAULT 'pending',
            error_log TEXT,
            created_at TEXT NOT NULL,
            completed_at TEXT,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_update_exec_host ON update_execution_log(host_id);

        CREATE TABLE IF NOT EXISTS software_installation_log (
            id INTEGER PRIMARY KEY,
            installation_id TEXT NOT NULL,
            host_id TEXT NOT NULL,
            package_name TEXT NOT NULL,
            requested_version TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            stdout_log TEXT,
            stderr_log TEXT,
            exit_code INTEGER,
            error_message TEXT,
            created_at TEXT NOT NULL,
            completed_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_install_log_installation
            ON software_installation_log(installation_id);
        CREATE INDEX IF NOT EXISTS idx_install_log_host
            ON software_installation_log(host_id);

        CREATE TABLE IF NOT EXISTS ubuntu_pro_info (
            id INTEGER PRIMARY KEY,
            host_id TEXT UNIQUE NOT NULL,
            attached INTEGER NOT NULL DEFAULT 0,
            subscription TEXT,
            expires TEXT,
            account_name TEXT,
            contract_name TEXT,
            tech_support_level TEXT,
            last_updated TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ubuntu_pro_service (
            id INTEGER PRIMARY KEY,
            host_id TEXT NOT NULL,
            service_name TEXT NOT NULL,
            status TEXT,
            entitled TEXT,
            last_updated TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ubuntu_pro_service_host
            ON ubuntu_pro_service(host_id);
        ",
    )?;
    Ok(())
}
