//! Settings file management

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::authn::CredentialSettings;
use crate::errors::ConductorError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::redfish::client::DEFAULT_FIRMWARE_CATALOG_URL;
use crate::redfish::ApplyTimePolicy;
use crate::transport::TrustConfig;

/// Conductor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Device connection configuration
    #[serde(default)]
    pub transport: TransportSettings,

    /// Retry policy for device calls
    #[serde(default)]
    pub retry: RetrySettings,

    /// Device session lifetime
    #[serde(default)]
    pub session: SessionSettings,

    /// Job polling and readiness probing
    #[serde(default)]
    pub polling: PollingSettings,

    /// Repository used by installs that do not name one
    #[serde(default = "default_catalog_url")]
    pub firmware_catalog_url: String,

    /// Plan generation
    #[serde(default)]
    pub planner: PlannerSettings,

    /// Record storage
    #[serde(default)]
    pub storage: StorageSettings,

    /// Local status server
    #[serde(default)]
    pub server: ServerSettings,

    /// Device job runner
    #[serde(default)]
    pub dispatcher: DispatcherSettings,

    /// Device credentials; never written back
    #[serde(default, skip_serializing)]
    pub credentials: CredentialSettings,
}

fn default_true() -> bool {
    true
}

fn default_catalog_url() -> String {
    DEFAULT_FIRMWARE_CATALOG_URL.to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            logging: LoggingSettings::default(),
            transport: TransportSettings::default(),
            retry: RetrySettings::default(),
            session: SessionSettings::default(),
            polling: PollingSettings::default(),
            firmware_catalog_url: default_catalog_url(),
            planner: PlannerSettings::default(),
            storage: StorageSettings::default(),
            server: ServerSettings::default(),
            dispatcher: DispatcherSettings::default(),
            credentials: CredentialSettings::default(),
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Write logs to stdout
    #[serde(default = "default_true")]
    pub stdout: bool,

    /// Emit JSON lines on stdout
    #[serde(default)]
    pub json: bool,

    /// Also write daily-rolling files under the storage logs directory
    #[serde(default)]
    pub to_file: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            stdout: true,
            json: false,
            to_file: false,
        }
    }
}

/// Device connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Certificate trust; `system` unless configured
    #[serde(default)]
    pub trust: TrustConfig,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    120
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            trust: TrustConfig::default(),
        }
    }
}

/// Retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    2_000
}

fn default_max_delay() -> u64 {
    30_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

/// Session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_renew_margin")]
    pub renew_margin_secs: u64,
}

fn default_session_ttl() -> u64 {
    1800
}

fn default_renew_margin() -> u64 {
    60
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            renew_margin_secs: default_renew_margin(),
        }
    }
}

/// Polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSettings {
    #[serde(default = "default_poll_interval")]
    pub job_poll_interval_secs: u64,

    #[serde(default = "default_ready_probe_interval")]
    pub ready_probe_interval_secs: u64,

    /// Deadline for one update submission
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_ready_probe_interval() -> u64 {
    10
}

fn default_operation_timeout() -> u64 {
    300
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            job_poll_interval_secs: default_poll_interval(),
            ready_probe_interval_secs: default_ready_probe_interval(),
            operation_timeout_secs: default_operation_timeout(),
        }
    }
}

/// Plan generation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerSettings {
    #[serde(default = "default_recurrence_days")]
    pub recurrence_interval_days: u64,

    #[serde(default = "default_group_stagger")]
    pub group_stagger_secs: u64,

    /// Environment labels, highest priority first
    #[serde(default = "default_priority_order")]
    pub priority_order: Vec<String>,

    #[serde(default)]
    pub apply_time: ApplyTimePolicy,
}

fn default_recurrence_days() -> u64 {
    30
}

fn default_group_stagger() -> u64 {
    3600
}

fn default_priority_order() -> Vec<String> {
    vec!["prod".to_string(), "staging".to_string(), "dev".to_string()]
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            recurrence_interval_days: default_recurrence_days(),
            group_stagger_secs: default_group_stagger(),
            priority_order: default_priority_order(),
            apply_time: ApplyTimePolicy::default(),
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Base directory; the platform default when absent
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
}

/// Status server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Job runner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSettings {
    #[serde(default = "default_dispatch_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    #[serde(default = "default_connectivity_timeout")]
    pub connectivity_timeout_secs: u64,

    /// How long finished jobs stay queryable
    #[serde(default = "default_job_retention")]
    pub job_retention_secs: u64,
}

fn default_dispatch_interval() -> u64 {
    5
}

fn default_max_concurrent_jobs() -> usize {
    8
}

fn default_job_timeout() -> u64 {
    2 * 60 * 60
}

fn default_ready_timeout() -> u64 {
    15 * 60
}

fn default_connectivity_timeout() -> u64 {
    60
}

fn default_job_retention() -> u64 {
    24 * 60 * 60
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_dispatch_interval(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            job_timeout_secs: default_job_timeout(),
            ready_timeout_secs: default_ready_timeout(),
            connectivity_timeout_secs: default_connectivity_timeout(),
            job_retention_secs: default_job_retention(),
        }
    }
}

/// Load settings from `file`, falling back to defaults if it does not exist
pub async fn load_settings(file: &File) -> Result<Settings, ConductorError> {
    match file.read_json_opt::<Settings>().await? {
        Some(settings) => Ok(settings),
        None => {
            info!("No settings at {}, using defaults", file.path().display());
            Ok(Settings::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_fill_defaults() {
        let settings: Settings = serde_json::from_str(
            r#"{
                "log_level": "debug",
                "transport": {"trust": {"mode": "trust_all"}},
                "planner": {"priority_order": ["prod", "dev"]},
                "credentials": {"default": {"username": "root", "password": "calvin"}}
            }"#,
        )
        .unwrap();

        assert_eq!(settings.log_level, LogLevel::Debug);
        assert_eq!(settings.transport.trust, TrustConfig::TrustAll);
        assert_eq!(settings.transport.connect_timeout_secs, 10);
        assert_eq!(settings.planner.priority_order, vec!["prod", "dev"]);
        assert_eq!(settings.planner.group_stagger_secs, 3600);
        assert_eq!(settings.firmware_catalog_url, DEFAULT_FIRMWARE_CATALOG_URL);
        assert!(settings.credentials.default.is_some());
        assert!(settings.server.enabled);
    }

    #[test]
    fn test_credentials_are_not_serialized() {
        let mut settings = Settings::default();
        settings.credentials = serde_json::from_str(
            r#"{"default": {"username": "root", "password": "calvin"}}"#,
        )
        .unwrap();

        let text = serde_json::to_string(&settings).unwrap();
        assert!(!text.contains("calvin"));
        assert!(!text.contains("credentials"));
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join("settings.json"));
        let settings = load_settings(&file).await.unwrap();
        assert_eq!(settings.dispatcher.max_concurrent_jobs, 8);
    }
}
