//! Application configuration options

use std::time::Duration;

use crate::errors::ConductorError;
use crate::logs::LogOptions;
use crate::planner::PlannerOptions;
use crate::redfish::RedfishOptions;
use crate::redfish::RetryPolicy;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::transport::TransportOptions;
use crate::utils::CooldownOptions;
use crate::workers::{dispatcher, scheduler};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Logging configuration
    pub log: LogOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Protocol client options shared by all devices
    pub redfish: RedfishOptions,

    /// Plan generation options
    pub planner: PlannerOptions,

    /// Enable local HTTP server
    pub enable_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Device job runner options
    pub dispatcher: dispatcher::Options,

    /// Plan scheduler options
    pub scheduler: scheduler::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            log: LogOptions::default(),
            layout: StorageLayout::default(),
            redfish: RedfishOptions::default(),
            planner: PlannerOptions::default(),
            enable_server: true,
            server: ServerOptions::default(),
            dispatcher: dispatcher::Options::default(),
            scheduler: scheduler::Options::default(),
        }
    }
}

impl AppOptions {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConductorError> {
        let layout = match &settings.storage.base_dir {
            Some(dir) => StorageLayout::new(dir.clone()),
            None => StorageLayout::default(),
        };

        let log = LogOptions {
            log_level: settings.log_level.clone(),
            stdout: settings.logging.stdout,
            log_dir: settings
                .logging
                .to_file
                .then(|| layout.logs_dir().path().to_path_buf()),
            json_format: settings.logging.json,
        };

        let redfish = RedfishOptions {
            transport: TransportOptions {
                connect_timeout: Duration::from_secs(settings.transport.connect_timeout_secs),
                request_timeout: Duration::from_secs(settings.transport.request_timeout_secs),
                trust: settings.transport.trust.clone(),
            },
            retry: RetryPolicy {
                max_attempts: settings.retry.max_attempts,
                backoff: CooldownOptions {
                    base_delay: Duration::from_millis(settings.retry.base_delay_ms),
                    max_delay: Duration::from_millis(settings.retry.max_delay_ms),
                    multiplier: 2.0,
                },
            },
            session_ttl: Duration::from_secs(settings.session.ttl_secs),
            session_renew_margin: Duration::from_secs(settings.session.renew_margin_secs),
            poll_interval: Duration::from_secs(settings.polling.job_poll_interval_secs),
            ready_probe_interval: Duration::from_secs(settings.polling.ready_probe_interval_secs),
            operation_timeout: Duration::from_secs(settings.polling.operation_timeout_secs),
            firmware_catalog_url: settings.firmware_catalog_url.clone(),
        };

        let recurrence_secs = settings
            .planner
            .recurrence_interval_days
            .checked_mul(24 * 3600)
            .ok_or_else(|| {
                ConductorError::ConfigError(format!(
                    "planner.recurrence_interval_days {} is out of range",
                    settings.planner.recurrence_interval_days
                ))
            })?;

        let planner = PlannerOptions {
            recurrence_interval: Duration::from_secs(recurrence_secs),
            group_stagger: Duration::from_secs(settings.planner.group_stagger_secs),
            priority_order: settings.planner.priority_order.clone(),
            start_time: None,
            apply_time: settings.planner.apply_time,
        };

        let dispatcher = dispatcher::Options {
            interval: Duration::from_secs(settings.dispatcher.interval_secs),
            max_concurrent_jobs: settings.dispatcher.max_concurrent_jobs,
            job_timeout: Duration::from_secs(settings.dispatcher.job_timeout_secs),
            ready_timeout: Duration::from_secs(settings.dispatcher.ready_timeout_secs),
            connectivity_timeout: Duration::from_secs(settings.dispatcher.connectivity_timeout_secs),
            job_retention: Duration::from_secs(settings.dispatcher.job_retention_secs),
        };

        Ok(Self {
            lifecycle: LifecycleOptions::default(),
            log,
            layout,
            redfish,
            planner,
            enable_server: settings.server.enabled,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            dispatcher,
            scheduler: scheduler::Options::default(),
        })
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}
