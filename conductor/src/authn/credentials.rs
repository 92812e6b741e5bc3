//! Device credential lookup

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::errors::ConductorError;
use crate::redfish::DeviceCredentials;

/// Resolves the management credentials for a device
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials_for(&self, device_id: &str) -> Result<DeviceCredentials, ConductorError>;
}

/// One credential entry as written in the settings file.
///
/// The password is given inline or read from the environment variable named
/// by `password_env`; inline wins.
#[derive(Debug, Deserialize)]
pub struct CredentialEntry {
    pub username: String,

    #[serde(default)]
    pub password: Option<SecretString>,

    #[serde(default)]
    pub password_env: Option<String>,
}

impl Clone for CredentialEntry {
    fn clone(&self) -> Self {
        Self {
            username: self.username.clone(),
            password: self
                .password
                .as_ref()
                .map(|p| SecretString::from(p.expose_secret().to_string())),
            password_env: self.password_env.clone(),
        }
    }
}

impl CredentialEntry {
    fn resolve(&self) -> Result<DeviceCredentials, ConductorError> {
        let password = match (&self.password, &self.password_env) {
            (Some(password), _) => SecretString::from(password.expose_secret().to_string()),
            (None, Some(var)) => std::env::var(var)
                .map(SecretString::from)
                .map_err(|_| {
                    ConductorError::ConfigError(format!(
                        "password variable {} for user {} is not set",
                        var, self.username
                    ))
                })?,
            (None, None) => {
                return Err(ConductorError::ConfigError(format!(
                    "no password configured for user {}",
                    self.username
                )))
            }
        };
        Ok(DeviceCredentials {
            username: self.username.clone(),
            password,
        })
    }
}

/// Credentials section of the settings file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialSettings {
    /// Used for devices without their own entry
    #[serde(default)]
    pub default: Option<CredentialEntry>,

    /// Per-device entries keyed by device id
    #[serde(default)]
    pub devices: HashMap<String, CredentialEntry>,
}

/// Credentials fixed at startup
#[derive(Default)]
pub struct StaticCredentials {
    default: Option<DeviceCredentials>,
    devices: HashMap<String, DeviceCredentials>,
}

impl StaticCredentials {
    pub fn new(default: Option<DeviceCredentials>) -> Self {
        Self {
            default,
            devices: HashMap::new(),
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>, credentials: DeviceCredentials) -> Self {
        self.devices.insert(device_id.into(), credentials);
        self
    }

    /// Resolve every entry now so a missing password fails at startup
    pub fn from_settings(settings: &CredentialSettings) -> Result<Self, ConductorError> {
        let default = settings
            .default
            .as_ref()
            .map(CredentialEntry::resolve)
            .transpose()?;
        let devices = settings
            .devices
            .iter()
            .map(|(id, entry)| Ok((id.clone(), entry.resolve()?)))
            .collect::<Result<HashMap<_, _>, ConductorError>>()?;

        debug!(
            "Loaded credentials for {} devices (default: {})",
            devices.len(),
            default.is_some()
        );
        Ok(Self { default, devices })
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credentials_for(&self, device_id: &str) -> Result<DeviceCredentials, ConductorError> {
        self.devices
            .get(device_id)
            .or(self.default.as_ref())
            .cloned()
            .ok_or_else(|| ConductorError::NotFound(format!("credentials for device {}", device_id)))
    }
}
