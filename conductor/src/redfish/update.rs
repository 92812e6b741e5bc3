//! Firmware update submission

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::info;
use url::Url;

use redfish_models::{
    ActionEntry, InstallFromRepositoryRequest, MaintenanceWindow, OperationApplyTime,
    SimpleUpdateRequest, TransferProtocol, UpdateParameters,
};

use crate::errors::ProtocolError;
use crate::redfish::client::{
    resolve_location, DeviceTarget, RedfishClient, RequestBody, RequestSpec,
};
use crate::redfish::payload::{MultipartSpec, PayloadSource};

/// When the device applies an update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyTimePolicy {
    #[default]
    Immediate,
    OnReset,
    AtMaintenanceWindow,
}

impl ApplyTimePolicy {
    pub fn to_redfish(self) -> OperationApplyTime {
        match self {
            ApplyTimePolicy::Immediate => OperationApplyTime::Immediate,
            ApplyTimePolicy::OnReset => OperationApplyTime::OnReset,
            ApplyTimePolicy::AtMaintenanceWindow => OperationApplyTime::AtMaintenanceWindowStart,
        }
    }
}

/// Update payload, one variant per submission mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum UpdatePayload {
    /// The device fetches the image itself
    DirectUri { image_uri: String },

    /// The device installs from a firmware repository catalog
    RepositoryInstall {
        #[serde(default)]
        repository_url: Option<String>,
    },

    /// The conductor uploads the image
    MultipartUpload { source: String },
}

/// Maintenance window for deferred updates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceWindowSpec {
    pub start: DateTime<Utc>,
    pub duration_secs: u64,
}

/// Device-independent part of an update request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSpec {
    #[serde(flatten)]
    pub payload: UpdatePayload,

    #[serde(default)]
    pub transfer_protocol: Option<TransferProtocol>,

    #[serde(default)]
    pub apply_time: ApplyTimePolicy,

    #[serde(default)]
    pub maintenance_window: Option<MaintenanceWindowSpec>,

    /// Component targets; empty means the device decides
    #[serde(default)]
    pub targets: Vec<String>,
}

impl UpdateSpec {
    pub fn new(payload: UpdatePayload) -> Self {
        Self {
            payload,
            transfer_protocol: None,
            apply_time: ApplyTimePolicy::default(),
            maintenance_window: None,
            targets: Vec::new(),
        }
    }

    pub fn direct_uri(image_uri: impl Into<String>) -> Self {
        Self::new(UpdatePayload::DirectUri {
            image_uri: image_uri.into(),
        })
    }

    pub fn repository_install(repository_url: Option<String>) -> Self {
        Self::new(UpdatePayload::RepositoryInstall { repository_url })
    }

    pub fn multipart_upload(source: impl Into<String>) -> Self {
        Self::new(UpdatePayload::MultipartUpload {
            source: source.into(),
        })
    }

    pub fn with_apply_time(mut self, apply_time: ApplyTimePolicy) -> Self {
        self.apply_time = apply_time;
        self
    }
}

/// A firmware update for one device
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub device: DeviceTarget,
    pub spec: UpdateSpec,
}

impl UpdateRequest {
    pub fn new(device: DeviceTarget, spec: UpdateSpec) -> Self {
        Self { device, spec }
    }
}

/// Result of an accepted submission
#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome {
    pub status: u16,
    pub body: Value,
    /// Absolute job/task URL, absent when the device did not return one
    pub task_location: Option<Url>,
}

/// Transfer protocol inferred from an image URI scheme
pub fn infer_transfer_protocol(image_uri: &str) -> TransferProtocol {
    Url::parse(image_uri)
        .map(|url| TransferProtocol::from_scheme(url.scheme()))
        .unwrap_or(TransferProtocol::Http)
}

/// Build a SimpleUpdate body; apply-time annotations are only sent when the
/// action advertises support for them
pub fn build_simple_update_body(
    spec: &UpdateSpec,
    image_uri: &str,
    action: &ActionEntry,
) -> SimpleUpdateRequest {
    let transfer_protocol = spec
        .transfer_protocol
        .unwrap_or_else(|| infer_transfer_protocol(image_uri));

    let (apply_time, maintenance_window) = if action.supports_apply_time() {
        let window = match (spec.apply_time, &spec.maintenance_window) {
            (ApplyTimePolicy::AtMaintenanceWindow, Some(window)) => Some(MaintenanceWindow {
                start_time: window.start,
                duration_secs: window.duration_secs,
            }),
            _ => None,
        };
        (Some(spec.apply_time.to_redfish()), window)
    } else {
        (None, None)
    };

    SimpleUpdateRequest {
        image_uri: image_uri.to_string(),
        transfer_protocol: Some(transfer_protocol),
        targets: spec.targets.clone(),
        apply_time,
        maintenance_window,
    }
}

/// Build an InstallFromRepository body from a repository URL.
///
/// `https://host/dir/Catalog.xml` becomes host `host`, share type `HTTPS`,
/// share name `dir` and catalog file `Catalog.xml`.
pub fn build_repository_body(
    repository_url: &str,
    apply_time: ApplyTimePolicy,
) -> Result<InstallFromRepositoryRequest, ProtocolError> {
    let url = Url::parse(repository_url).map_err(|e| {
        ProtocolError::Validation(format!("Invalid repository URL {}: {}", repository_url, e))
    })?;
    let host = url.host_str().ok_or_else(|| {
        ProtocolError::Validation(format!("Repository URL {} has no host", repository_url))
    })?;
    let ip_address = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let path = url.path().trim_start_matches('/');
    let (share_name, catalog_file) = match path.rsplit_once('/') {
        Some((dir, file)) if file.contains('.') => (dir.to_string(), Some(file.to_string())),
        None if path.contains('.') => (String::new(), Some(path.to_string())),
        _ => (path.trim_end_matches('/').to_string(), None),
    };

    Ok(InstallFromRepositoryRequest {
        ip_address,
        share_type: url.scheme().to_ascii_uppercase(),
        share_name,
        catalog_file,
        apply_update: "True".to_string(),
        reboot_needed: apply_time == ApplyTimePolicy::Immediate,
    })
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::Validation(e.to_string()))
}

impl RedfishClient {
    /// Submit an update using the mode named by its payload
    pub async fn submit_update(&self, request: &UpdateRequest) -> Result<UpdateOutcome, ProtocolError> {
        match request.spec.payload {
            UpdatePayload::DirectUri { .. } => self.submit_simple_update(request).await,
            UpdatePayload::RepositoryInstall { .. } => self.submit_repository_install(request).await,
            UpdatePayload::MultipartUpload { .. } => self.submit_multipart_upload(request).await,
        }
    }

    /// Submit a SimpleUpdate; the device pulls the image from its URI
    pub async fn submit_simple_update(
        &self,
        request: &UpdateRequest,
    ) -> Result<UpdateOutcome, ProtocolError> {
        self.check_device(request)?;
        let UpdatePayload::DirectUri { image_uri } = &request.spec.payload else {
            return Err(ProtocolError::Validation(
                "SimpleUpdate requires a direct-uri payload".to_string(),
            ));
        };
        if image_uri.trim().is_empty() {
            return Err(ProtocolError::Validation("Empty image URI".to_string()));
        }

        let deadline = self.operation_deadline();
        let service = self.update_service(deadline).await?;
        let (name, action) = service
            .find_action("SimpleUpdate")
            .ok_or_else(|| ProtocolError::ProtocolUnsupported("SimpleUpdate".to_string()))?;

        let body = build_simple_update_body(&request.spec, image_uri, &action);
        info!(
            "Submitting {} to {} for {}",
            name, self.base_url, image_uri
        );
        let spec = RequestSpec::post_json(self.url(&action.target)?, to_json(&body)?);
        self.submit_action("SimpleUpdate", spec, deadline).await
    }

    /// Submit a repository install through the vendor action
    pub async fn submit_repository_install(
        &self,
        request: &UpdateRequest,
    ) -> Result<UpdateOutcome, ProtocolError> {
        self.check_device(request)?;
        let UpdatePayload::RepositoryInstall { repository_url } = &request.spec.payload else {
            return Err(ProtocolError::Validation(
                "InstallFromRepository requires a repository-install payload".to_string(),
            ));
        };
        let repository_url = repository_url
            .clone()
            .unwrap_or_else(|| self.options.firmware_catalog_url.clone());
        let body = build_repository_body(&repository_url, request.spec.apply_time)?;

        let deadline = self.operation_deadline();
        let service = self.update_service(deadline).await?;
        let (name, action) = service.find_action("InstallFromRepository").ok_or_else(|| {
            ProtocolError::ProtocolUnsupported("InstallFromRepository".to_string())
        })?;

        info!(
            "Submitting {} to {} from {}",
            name, self.base_url, repository_url
        );
        let spec = RequestSpec::post_json(self.url(&action.target)?, to_json(&body)?);
        self.submit_action("InstallFromRepository", spec, deadline).await
    }

    /// Upload the image to the multipart push URI
    pub async fn submit_multipart_upload(
        &self,
        request: &UpdateRequest,
    ) -> Result<UpdateOutcome, ProtocolError> {
        self.check_device(request)?;
        let UpdatePayload::MultipartUpload { source } = &request.spec.payload else {
            return Err(ProtocolError::Validation(
                "Multipart upload requires a multipart-upload payload".to_string(),
            ));
        };
        let source = PayloadSource::parse(source)?;

        let deadline = self.operation_deadline();
        let service = self.update_service(deadline).await?;
        let push_uri = service.multipart_http_push_uri.clone().ok_or_else(|| {
            ProtocolError::ProtocolUnsupported("MultipartHttpPushUri".to_string())
        })?;

        let parameters = UpdateParameters {
            targets: request.spec.targets.clone(),
            apply_time: Some(request.spec.apply_time.to_redfish()),
        };
        let parameters = serde_json::to_string(&parameters)
            .map_err(|e| ProtocolError::Validation(e.to_string()))?;

        info!(
            "Uploading {} to {}{}",
            source.filename(),
            self.base_url,
            push_uri.trim_start_matches('/')
        );
        let spec = RequestSpec {
            method: Method::POST,
            url: self.url(&push_uri)?,
            body: RequestBody::Multipart(MultipartSpec { parameters, source }),
        };
        self.submit_action("MultipartUpdate", spec, deadline).await
    }

    async fn submit_action(
        &self,
        name: &str,
        spec: RequestSpec,
        deadline: Instant,
    ) -> Result<UpdateOutcome, ProtocolError> {
        let spec = &spec;
        let response = self
            .options
            .retry
            .run(name, deadline, move |_| async move {
                self.execute(spec, deadline).await?.into_success()
            })
            .await?;

        let task_location = resolve_location(&self.base_url, response.location.as_deref())?;
        match &task_location {
            Some(location) => info!("{} accepted (HTTP {}), task {}", name, response.status, location),
            None => info!("{} accepted (HTTP {}) without a task location", name, response.status),
        }

        Ok(UpdateOutcome {
            status: response.status,
            body: response.body,
            task_location,
        })
    }

    fn check_device(&self, request: &UpdateRequest) -> Result<(), ProtocolError> {
        let requested = request.device.base_url()?;
        if requested != self.base_url {
            return Err(ProtocolError::Validation(format!(
                "Request for {} sent to client for {}",
                requested, self.base_url
            )));
        }
        Ok(())
    }
}
