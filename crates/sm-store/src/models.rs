use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A managed machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub fqdn: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    /// Lifecycle flag: record not soft-deleted. Distinct from approval.
    pub active: bool,
    /// "up" or "down"
    pub status: String,
    /// pending | approved | rejected | revoked
    pub approval_status: String,
    /// Only set on real heartbeats, never on replayed queue traffic.
    pub last_access: Option<DateTime<Utc>>,
    pub platform: Option<String>,
    pub is_agent_privileged: bool,
    pub script_execution_enabled: bool,
    /// JSON list of shell names the agent allows for script execution
    pub enabled_shells: Option<String>,
    pub reboot_required: bool,
    pub reboot_required_reason: Option<String>,
    pub client_certificate: Option<String>,
    pub certificate_serial: Option<String>,
    pub certificate_issued_at: Option<DateTime<Utc>>,
    pub virtualization_types: Option<String>,
    pub virtualization_capabilities: Option<String>,
    pub virtualization_updated_at: Option<DateTime<Utc>>,
    pub diagnostics_request_status: Option<String>,
    pub hardware_updated_at: Option<DateTime<Utc>>,
    pub software_updated_at: Option<DateTime<Utc>>,
    pub user_access_updated_at: Option<DateTime<Utc>>,
    pub cpu_vendor: Option<String>,
    pub cpu_model: Option<String>,
    pub cpu_cores: Option<i64>,
    pub cpu_threads: Option<i64>,
    pub memory_total_mb: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Host {
    pub fn is_approved(&self) -> bool {
        self.approval_status == "approved"
    }
}

/// One durable queue row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: i64,
    pub message_id: String,
    /// None means broadcast.
    pub host_id: Option<String>,
    pub direction: String,
    pub message_type: String,
    pub message_data: String,
    pub status: String,
    pub priority: String,
    pub retry_count: i64,
    pub max_retries: i64,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Derived from the payload at enqueue time for script dedup lookups.
    pub execution_id: Option<String>,
}

/// One in-flight parent reboot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebootOrchestration {
    pub id: String,
    pub parent_host_id: String,
    /// shutting_down | rebooting | pending_restart | restarting | completed | failed
    pub status: String,
    /// JSON list of {id, child_name, child_type} captured at initiation
    pub child_hosts_snapshot: String,
    /// JSON list of {child_name, restart_status, error}
    pub child_hosts_restart_status: Option<String>,
    pub initiated_at: DateTime<Utc>,
    pub shutdown_completed_at: Option<DateTime<Utc>>,
    pub reboot_issued_at: Option<DateTime<Utc>>,
    pub agent_reconnected_at: Option<DateTime<Utc>>,
    pub restart_completed_at: Option<DateTime<Utc>>,
    pub shutdown_timeout_seconds: i64,
    pub error_message: Option<String>,
}

impl RebootOrchestration {
    pub fn is_terminal(&self) -> bool {
        self.status == "completed" || self.status == "failed"
    }
}

/// Snapshot entry frozen into `child_hosts_snapshot` at initiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildSnapshotEntry {
    pub id: String,
    pub child_name: String,
    pub child_type: String,
}

/// Restart-tracking entry in `child_hosts_restart_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildRestartEntry {
    pub child_name: String,
    /// pending | running | failed
    pub restart_status: String,
    pub error: Option<String>,
}

/// A VM or container owned by a parent host's agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostChild {
    pub id: String,
    pub parent_host_id: String,
    pub child_name: String,
    pub child_type: String,
    pub status: String,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageDevice {
    pub id: i64,
    pub host_id: String,
    pub device_name: Option<String>,
    pub device_path: Option<String>,
    pub mount_point: Option<String>,
    pub filesystem: Option<String>,
    pub device_type: Option<String>,
    pub capacity_bytes: Option<i64>,
    pub used_bytes: Option<i64>,
    pub available_bytes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub id: i64,
    pub host_id: String,
    pub interface_name: Option<String>,
    pub interface_type: Option<String>,
    pub mac_address: Option<String>,
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
    pub netmask: Option<String>,
    pub is_active: bool,
    pub speed_mbps: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: i64,
    pub host_id: String,
    pub username: String,
    pub uid: Option<i64>,
    pub home_directory: Option<String>,
    pub shell: Option<String>,
    pub is_system_user: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserGroup {
    pub id: i64,
    pub host_id: String,
    pub group_name: String,
    pub gid: Option<i64>,
    pub is_system_group: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftwarePackage {
    pub id: i64,
    pub host_id: String,
    pub package_name: String,
    pub version: Option<String>,
    pub description: Option<String>,
    pub package_manager: Option<String>,
    pub architecture: Option<String>,
    pub size_bytes: Option<i64>,
    pub vendor: Option<String>,
    pub is_system_package: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageUpdate {
    pub id: i64,
    pub host_id: String,
    pub package_name: String,
    pub package_manager: String,
    pub current_version: Option<String>,
    pub available_version: Option<String>,
    pub is_security_update: bool,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateExecutionLog {
    pub id: i64,
    pub host_id: String,
    pub package_name: String,
    pub package_manager: String,
    /// pending | success | failed
    pub execution_status: String,
    pub error_log: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftwareInstallationLog {
    pub id: i64,
    pub installation_id: String,
    pub host_id: String,
    pub package_name: String,
    pub requested_version: Option<String>,
    /// pending | installing | completed | failed
    pub status: String,
    pub stdout_log: Option<String>,
    pub stderr_log: Option<String>,
    pub exit_code: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UbuntuProInfo {
    pub id: i64,
    pub host_id: String,
    pub attached: bool,
    pub subscription: Option<String>,
    pub expires: Option<String>,
    pub account_name: Option<String>,
    pub contract_name: Option<String>,
    pub tech_support_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UbuntuProService {
    pub id: i64,
    pub host_id: String,
    pub service_name: String,
    pub status: Option<String>,
    pub entitled: Option<String>,
}
