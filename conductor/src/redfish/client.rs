//! Device-scoped Redfish client

use std::time::Duration;

use reqwest::header::{HeaderMap, ACCEPT, LOCATION};
use reqwest::{Client, Method, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::debug;
use url::Url;

use redfish_models::{ServiceRoot, UpdateService};

use crate::errors::ProtocolError;
use crate::redfish::payload::MultipartSpec;
use crate::redfish::retry::RetryPolicy;
use crate::redfish::session::{Auth, SessionState};
use crate::transport::factory::{ClientFactory, TransportOptions};

pub const SERVICE_ROOT_PATH: &str = "/redfish/v1";
pub const SESSIONS_PATH: &str = "/redfish/v1/SessionService/Sessions";
pub const UPDATE_SERVICE_PATH: &str = "/redfish/v1/UpdateService";
pub const FIRMWARE_INVENTORY_PATH: &str = "/redfish/v1/UpdateService/FirmwareInventory";

pub const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

pub const DEFAULT_FIRMWARE_CATALOG_URL: &str = "https://downloads.dell.com/catalog/Catalog.xml";

/// Username and password for a management controller
#[derive(Debug, Deserialize)]
pub struct DeviceCredentials {
    pub username: String,
    pub password: SecretString,
}

impl DeviceCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }
}

impl Clone for DeviceCredentials {
    fn clone(&self) -> Self {
        Self {
            username: self.username.clone(),
            password: SecretString::from(self.password.expose_secret().to_string()),
        }
    }
}

/// Address and credentials of one management endpoint
#[derive(Debug, Clone)]
pub struct DeviceTarget {
    pub address: String,
    pub credentials: DeviceCredentials,
}

impl DeviceTarget {
    pub fn new(address: impl Into<String>, credentials: DeviceCredentials) -> Self {
        Self {
            address: address.into(),
            credentials,
        }
    }

    /// Base URL of the endpoint; bare hosts default to HTTPS
    pub fn base_url(&self) -> Result<Url, ProtocolError> {
        let address = self.address.trim().trim_end_matches('/');
        let with_scheme = if address.contains("://") {
            address.to_string()
        } else {
            format!("https://{}", address)
        };

        let mut url = Url::parse(&with_scheme).map_err(|e| {
            ProtocolError::Validation(format!("Invalid device address {}: {}", self.address, e))
        })?;
        if url.host_str().is_none() {
            return Err(ProtocolError::Validation(format!(
                "Device address {} has no host",
                self.address
            )));
        }
        url.set_path("/");
        url.set_query(None);
        Ok(url)
    }
}

/// Protocol client options
#[derive(Debug, Clone)]
pub struct RedfishOptions {
    pub transport: TransportOptions,

    /// Retry policy for mutating calls and catalog reads
    pub retry: RetryPolicy,

    /// Assumed lifetime of a created session
    pub session_ttl: Duration,

    /// Renew a session when it expires within this margin
    pub session_renew_margin: Duration,

    /// Interval between job status polls
    pub poll_interval: Duration,

    /// Interval between device readiness probes
    pub ready_probe_interval: Duration,

    /// Deadline applied to a whole update submission
    pub operation_timeout: Duration,

    /// Repository used by repository installs that do not name one
    pub firmware_catalog_url: String,
}

impl Default for RedfishOptions {
    fn default() -> Self {
        Self {
            transport: TransportOptions::default(),
            retry: RetryPolicy::default(),
            session_ttl: Duration::from_secs(1800),
            session_renew_margin: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            ready_probe_interval: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(300),
            firmware_catalog_url: DEFAULT_FIRMWARE_CATALOG_URL.to_string(),
        }
    }
}

/// Body of an outgoing request
pub(crate) enum RequestBody {
    Empty,
    Json(Value),
    Multipart(MultipartSpec),
}

/// A rebuildable request description.
///
/// Requests are rebuilt for every attempt because multipart bodies are
/// single-use streams.
pub(crate) struct RequestSpec {
    pub method: Method,
    pub url: Url,
    pub body: RequestBody,
}

impl RequestSpec {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            body: RequestBody::Empty,
        }
    }

    pub fn post_json(url: Url, body: Value) -> Self {
        Self {
            method: Method::POST,
            url,
            body: RequestBody::Json(body),
        }
    }
}

/// A device response with a body that may be empty, JSON, or text
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub location: Option<String>,
    pub auth_token: Option<String>,
    pub body: Value,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_text(&self) -> String {
        match &self.body {
            Value::Null => String::new(),
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }

    /// Convert a non-2xx response into a classified error
    pub fn into_success(self) -> Result<Self, ProtocolError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ProtocolError::from_status(self.status, self.body_text()))
        }
    }
}

/// Parse a response body leniently: empty → null, JSON → value, else text
pub fn parse_body(bytes: &[u8]) -> Value {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Resolve a possibly relative `Location` header against the device base URL
pub fn resolve_location(base: &Url, location: Option<&str>) -> Result<Option<Url>, ProtocolError> {
    match location.map(str::trim) {
        None | Some("") => Ok(None),
        Some(location) => base.join(location).map(Some).map_err(|e| {
            ProtocolError::MalformedResponse(format!("Invalid Location header {}: {}", location, e))
        }),
    }
}

/// Client for one device's management endpoint
pub struct RedfishClient {
    pub(crate) http: Client,

    /// Fetches remote firmware payloads; never sends device credentials
    pub(crate) payload_http: Client,
    pub(crate) base_url: Url,
    pub(crate) credentials: DeviceCredentials,
    pub(crate) options: RedfishOptions,
    pub(crate) session: Mutex<SessionState>,
}

impl RedfishClient {
    /// Create a client from existing device and payload HTTP clients
    pub fn new(
        http: Client,
        payload_http: Client,
        target: DeviceTarget,
        options: RedfishOptions,
    ) -> Result<Self, ProtocolError> {
        let base_url = target.base_url()?;
        Ok(Self {
            http,
            payload_http,
            base_url,
            credentials: target.credentials,
            options,
            session: Mutex::new(SessionState::default()),
        })
    }

    /// Create a client whose HTTP client comes from `factory`
    pub fn connect(
        factory: &ClientFactory,
        target: DeviceTarget,
        options: RedfishOptions,
    ) -> Result<Self, ProtocolError> {
        let http = factory.client(&options.transport)?;
        let payload_http = factory.payload_client(options.transport.connect_timeout)?;
        Self::new(http, payload_http, target, options)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn options(&self) -> &RedfishOptions {
        &self.options
    }

    /// Resolve a device path or absolute URL
    pub fn url(&self, path: &str) -> Result<Url, ProtocolError> {
        self.base_url
            .join(path)
            .map_err(|e| ProtocolError::MalformedResponse(format!("Invalid path {}: {}", path, e)))
    }

    pub(crate) fn operation_deadline(&self) -> Instant {
        Instant::now() + self.options.operation_timeout
    }

    /// Send a request through the session pipeline.
    ///
    /// A 401 on a session token invalidates the session and retries once with a
    /// fresh one; any other 401 is a permanent authentication failure.
    pub(crate) async fn execute(
        &self,
        spec: &RequestSpec,
        deadline: Instant,
    ) -> Result<RawResponse, ProtocolError> {
        let mut escalated = false;

        loop {
            let auth = self.ensure_session(deadline).await?;
            let request = match timeout_at(deadline, self.build_request(spec, &auth)).await {
                Ok(request) => request?,
                Err(_) => {
                    return Err(ProtocolError::Timeout(format!(
                        "preparing {} {} exceeded its deadline",
                        spec.method, spec.url
                    )))
                }
            };
            let response = self.send(request, deadline).await?;

            if response.status != 401 {
                return Ok(response);
            }

            match auth {
                Auth::Token(token) if !escalated => {
                    debug!("Session rejected by {}, renewing once", self.base_url);
                    self.invalidate_session(&token).await;
                    escalated = true;
                }
                _ => {
                    self.discard_session().await;
                    return Err(ProtocolError::Authentication(format!(
                        "{} {} rejected credentials: {}",
                        spec.method,
                        spec.url,
                        response.body_text()
                    )));
                }
            }
        }
    }

    async fn build_request(
        &self,
        spec: &RequestSpec,
        auth: &Auth,
    ) -> Result<RequestBuilder, ProtocolError> {
        let builder = self
            .http
            .request(spec.method.clone(), spec.url.clone())
            .header(ACCEPT, "application/json");
        let builder = self.authorize(builder, auth);

        let builder = match &spec.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(body),
            RequestBody::Multipart(multipart) => {
                builder.multipart(multipart.build_form(&self.payload_http).await?)
            }
        };
        Ok(builder)
    }

    pub(crate) fn authorize(&self, builder: RequestBuilder, auth: &Auth) -> RequestBuilder {
        match auth {
            Auth::Token(token) => builder.header(AUTH_TOKEN_HEADER, token),
            Auth::Basic => builder.basic_auth(
                &self.credentials.username,
                Some(self.credentials.password.expose_secret()),
            ),
        }
    }

    /// Send one request, bounded by `deadline`.
    ///
    /// On expiry the in-flight future is dropped, which cancels the request
    /// and closes its connection.
    pub(crate) async fn send(
        &self,
        request: RequestBuilder,
        deadline: Instant,
    ) -> Result<RawResponse, ProtocolError> {
        let call = async {
            let response = request.send().await?;
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let bytes = response.bytes().await?;
            Ok::<RawResponse, ProtocolError>(RawResponse {
                status,
                location: header_string(&headers, LOCATION.as_str()),
                auth_token: header_string(&headers, AUTH_TOKEN_HEADER),
                body: parse_body(&bytes),
            })
        };

        match timeout_at(deadline, call).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout(format!(
                "request to {} exceeded its deadline",
                self.base_url
            ))),
        }
    }

    /// Retry-wrapped GET of a JSON resource
    pub(crate) async fn get_resource(
        &self,
        name: &str,
        url: Url,
        deadline: Instant,
    ) -> Result<RawResponse, ProtocolError> {
        let spec = RequestSpec::get(url);
        let spec = &spec;
        self.options
            .retry
            .run(name, deadline, move |_| async move {
                self.execute(spec, deadline).await?.into_success()
            })
            .await
    }

    /// Fetch the update service and its action catalog
    pub async fn update_service(&self, deadline: Instant) -> Result<UpdateService, ProtocolError> {
        let url = self.url(UPDATE_SERVICE_PATH)?;
        let response = self.get_resource("GetUpdateService", url, deadline).await?;
        serde_json::from_value(response.body)
            .map_err(|e| ProtocolError::MalformedResponse(format!("UpdateService: {}", e)))
    }

    /// Unauthenticated read of the service root
    pub async fn service_root(&self, deadline: Instant) -> Result<ServiceRoot, ProtocolError> {
        let url = self.url(SERVICE_ROOT_PATH)?;
        let request = self.http.get(url).header(ACCEPT, "application/json");
        let response = self.send(request, deadline).await?.into_success()?;
        serde_json::from_value(response.body)
            .map_err(|e| ProtocolError::MalformedResponse(format!("ServiceRoot: {}", e)))
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
