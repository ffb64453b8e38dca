//! Feature and module codes enabled by Pro+ licenses, and the fixed
//! tier-to-entitlement tables shipped with the binary.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureCode {
    #[serde(rename = "health")]
    HealthAnalysis,
    HealthHistory,
    HealthAlerts,
    HealthReports,
    AdvancedMonitoring,
    PerformanceAnalytics,
    PredictiveMaintenance,
    VulnerabilityScanning,
    ComplianceReports,
    SecurityHardening,
    AutoRemediation,
    WorkflowAutomation,
    ScheduledTasks,
    SiemIntegration,
    ApiExtended,
    WebhookAdvanced,
    CustomReports,
    ExecutiveDashboard,
    ExportPdf,
}

impl FeatureCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HealthAnalysis => "health",
            Self::HealthHistory => "health_history",
            Self::HealthAlerts => "health_alerts",
            Self::HealthReports => "health_reports",
            Self::AdvancedMonitoring => "advanced_monitoring",
            Self::PerformanceAnalytics => "performance_analytics",
            Self::PredictiveMaintenance => "predictive_maintenance",
            Self::VulnerabilityScanning => "vulnerability_scanning",
            Self::ComplianceReports => "compliance_reports",
            Self::SecurityHardening => "security_hardening",
            Self::AutoRemediation => "auto_remediation",
            Self::WorkflowAutomation => "workflow_automation",
            Self::ScheduledTasks => "scheduled_tasks",
            Self::SiemIntegration => "siem_integration",
            Self::ApiExtended => "api_extended",
            Self::WebhookAdvanced => "webhook_advanced",
            Self::CustomReports => "custom_reports",
            Self::ExecutiveDashboard => "executive_dashboard",
            Self::ExportPdf => "export_pdf",
        }
    }
}

/// Dynamically loadable analysis modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleCode {
    HealthEngine,
    SecurityScanner,
    PerformanceAnalyzer,
    AnomalyDetector,
    PredictionEngine,
    LogAnalyzer,
    MetricsAggregator,
}

impl ModuleCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HealthEngine => "health_engine",
            Self::SecurityScanner => "security_scanner",
            Self::PerformanceAnalyzer => "performance_analyzer",
            Self::AnomalyDetector => "anomaly_detector",
            Self::PredictionEngine => "prediction_engine",
            Self::LogAnalyzer => "log_analyzer",
            Self::MetricsAggregator => "metrics_aggregator",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseTier {
    Community,
    Professional,
    Enterprise,
}

impl LicenseTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Community => "community",
            Self::Professional => "professional",
            Self::Enterprise => "enterprise",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "community" => Some(Self::Community),
            "professional" => Some(Self::Professional),
            "enterprise" => Some(Self::Enterprise),
            _ => None,
        }
    }
}

/// Features included in each tier.
pub fn tier_features(tier: LicenseTier) -> &'static [FeatureCode] {
    match tier {
        LicenseTier::Community => &[],
        LicenseTier::Professional => &[
            FeatureCode::HealthAnalysis,
            FeatureCode::HealthHistory,
            FeatureCode::AdvancedMonitoring,
            FeatureCode::CustomReports,
        ],
        LicenseTier::Enterprise => &[
            FeatureCode::HealthAnalysis,
            FeatureCode::HealthHistory,
            FeatureCode::HealthAlerts,
            FeatureCode::HealthReports,
            FeatureCode::AdvancedMonitoring,
            FeatureCode::PerformanceAnalytics,
            FeatureCode::PredictiveMaintenance,
            FeatureCode::VulnerabilityScanning,
            FeatureCode::ComplianceReports,
            FeatureCode::SecurityHardening,
            FeatureCode::AutoRemediation,
            FeatureCode::WorkflowAutomation,
            FeatureCode::ScheduledTasks,
            FeatureCode::SiemIntegration,
            FeatureCode::ApiExtended,
            FeatureCode::WebhookAdvanced,
            FeatureCode::CustomReports,
            FeatureCode::ExecutiveDashboard,
            FeatureCode::ExportPdf,
        ],
    }
}

/// Modules included in each tier.
pub fn tier_modules(tier: LicenseTier) -> &'static [ModuleCode] {
    match tier {
        LicenseTier::Community => &[],
        LicenseTier::Professional => &[ModuleCode::HealthEngine],
        LicenseTier::Enterprise => &[
            ModuleCode::HealthEngine,
            ModuleCode::SecurityScanner,
            ModuleCode::PerformanceAnalyzer,
            ModuleCode::AnomalyDetector,
            ModuleCode::PredictionEngine,
            ModuleCode::LogAnalyzer,
            ModuleCode::MetricsAggregator,
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_parse() {
        assert_eq!(LicenseTier::parse("enterprise"), Some(LicenseTier::Enterprise));
        assert_eq!(LicenseTier::parse("community"), Some(LicenseTier::Community));
        assert!(LicenseTier::parse("platinum").is_none());
    }

    #[test]
    fn test_community_has_nothing() {
        assert!(tier_features(LicenseTier::Community).is_empty());
        assert!(tier_modules(LicenseTier::Community).is_empty());
    }

    #[test]
    fn test_enterprise_superset_of_professional() {
        let pro = tier_features(LicenseTier::Professional);
        let ent = tier_features(LicenseTier::Enterprise);
        for feature in pro {
            assert!(ent.contains(feature), "enterprise missing {feature:?}");
        }
        assert!(tier_modules(LicenseTier::Enterprise).contains(&ModuleCode::AnomalyDetector));
        assert!(tier_modules(LicenseTier::Enterprise).contains(&ModuleCode::PredictionEngine));
    }
}
