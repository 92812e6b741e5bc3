//! Redfish request and resource models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Session creation request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreateRequest {
    #[serde(rename = "UserName")]
    pub user_name: String,
    #[serde(rename = "Password")]
    pub password: String,
}

/// Transfer protocol used by the device to fetch an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferProtocol {
    Http,
    Https,
    Ftp,
    Sftp,
    Scp,
    Tftp,
    Nfs,
    Cifs,
}

impl TransferProtocol {
    /// Infer the transfer protocol from a URI scheme.
    ///
    /// Unknown schemes map to plain HTTP.
    pub fn from_scheme(scheme: &str) -> Self {
        match scheme.to_ascii_lowercase().as_str() {
            "https" => TransferProtocol::Https,
            "sftp" => TransferProtocol::Sftp,
            "scp" => TransferProtocol::Scp,
            "ftp" => TransferProtocol::Ftp,
            "tftp" => TransferProtocol::Tftp,
            "nfs" => TransferProtocol::Nfs,
            "cifs" | "smb" => TransferProtocol::Cifs,
            _ => TransferProtocol::Http,
        }
    }

    /// Whether the protocol encrypts the transfer
    pub fn is_secure(&self) -> bool {
        matches!(
            self,
            TransferProtocol::Https | TransferProtocol::Sftp | TransferProtocol::Scp
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferProtocol::Http => "HTTP",
            TransferProtocol::Https => "HTTPS",
            TransferProtocol::Ftp => "FTP",
            TransferProtocol::Sftp => "SFTP",
            TransferProtocol::Scp => "SCP",
            TransferProtocol::Tftp => "TFTP",
            TransferProtocol::Nfs => "NFS",
            TransferProtocol::Cifs => "CIFS",
        }
    }
}

/// Redfish `OperationApplyTime` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationApplyTime {
    Immediate,
    OnReset,
    AtMaintenanceWindowStart,
}

/// Redfish maintenance window annotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    #[serde(rename = "MaintenanceWindowStartTime")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "MaintenanceWindowDurationInSeconds")]
    pub duration_secs: u64,
}

/// `UpdateService.SimpleUpdate` action body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleUpdateRequest {
    #[serde(rename = "ImageURI")]
    pub image_uri: String,

    #[serde(rename = "TransferProtocol", skip_serializing_if = "Option::is_none")]
    pub transfer_protocol: Option<TransferProtocol>,

    #[serde(rename = "Targets", default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,

    #[serde(
        rename = "@Redfish.OperationApplyTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub apply_time: Option<OperationApplyTime>,

    #[serde(
        rename = "@Redfish.MaintenanceWindow",
        skip_serializing_if = "Option::is_none"
    )]
    pub maintenance_window: Option<MaintenanceWindow>,
}

/// Vendor `InstallFromRepository` action body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallFromRepositoryRequest {
    #[serde(rename = "IPAddress")]
    pub ip_address: String,

    #[serde(rename = "ShareType")]
    pub share_type: String,

    #[serde(rename = "ShareName")]
    pub share_name: String,

    #[serde(rename = "CatalogFile", skip_serializing_if = "Option::is_none")]
    pub catalog_file: Option<String>,

    /// Devices expect the literal strings "True"/"False" here
    #[serde(rename = "ApplyUpdate")]
    pub apply_update: String,

    #[serde(rename = "RebootNeeded")]
    pub reboot_needed: bool,
}

/// JSON metadata part of a multipart push update
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateParameters {
    #[serde(rename = "Targets", default)]
    pub targets: Vec<String>,

    #[serde(
        rename = "@Redfish.OperationApplyTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub apply_time: Option<OperationApplyTime>,
}

/// `@odata.id` link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ODataLink {
    #[serde(rename = "@odata.id")]
    pub odata_id: String,
}

/// Service root (`/redfish/v1`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceRoot {
    #[serde(rename = "RedfishVersion", default)]
    pub redfish_version: Option<String>,

    #[serde(rename = "UUID", default)]
    pub uuid: Option<String>,

    #[serde(rename = "Product", default)]
    pub product: Option<String>,
}

/// Update service resource with its action catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateService {
    #[serde(rename = "Actions", default)]
    pub actions: Map<String, Value>,

    #[serde(rename = "MultipartHttpPushUri", default)]
    pub multipart_http_push_uri: Option<String>,

    #[serde(rename = "HttpPushUri", default)]
    pub http_push_uri: Option<String>,

    #[serde(rename = "FirmwareInventory", default)]
    pub firmware_inventory: Option<ODataLink>,
}

/// An advertised action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEntry {
    pub target: String,

    #[serde(rename = "@Redfish.OperationApplyTimeSupport", default)]
    pub apply_time_support: Option<Value>,

    #[serde(rename = "TransferProtocol@Redfish.AllowableValues", default)]
    pub allowable_protocols: Vec<String>,
}

impl ActionEntry {
    /// Whether the device accepts apply-time annotations on this action
    pub fn supports_apply_time(&self) -> bool {
        self.apply_time_support.is_some()
    }
}

impl UpdateService {
    /// Find an action whose name contains `pattern` (case-insensitive).
    ///
    /// Vendor actions nested under `Oem` are searched as well.
    pub fn find_action(&self, pattern: &str) -> Option<(String, ActionEntry)> {
        find_action_in(&self.actions, &pattern.to_ascii_lowercase())
    }
}

fn find_action_in(map: &Map<String, Value>, pattern: &str) -> Option<(String, ActionEntry)> {
    for (name, value) in map {
        let Some(obj) = value.as_object() else {
            continue;
        };
        if obj.contains_key("target") {
            if name.to_ascii_lowercase().contains(pattern) {
                if let Ok(entry) = serde_json::from_value::<ActionEntry>(value.clone()) {
                    return Some((name.clone(), entry));
                }
            }
        } else if let Some(found) = find_action_in(obj, pattern) {
            return Some(found);
        }
    }
    None
}
