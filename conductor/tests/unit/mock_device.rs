//! In-process Redfish device used by the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Redirect, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::stream;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use fwconductor::redfish::{DeviceCredentials, DeviceTarget, RedfishOptions, RetryPolicy};
use fwconductor::utils::CooldownOptions;

pub const SIMPLE_UPDATE_PATH: &str = "/redfish/v1/UpdateService/Actions/UpdateService.SimpleUpdate";
pub const REPOSITORY_PATH: &str =
    "/redfish/v1/Dell/Systems/System.Embedded.1/DellSoftwareInstallationService/Actions/DellSoftwareInstallationService.InstallFromRepository";
pub const PUSH_PATH: &str = "/redfish/v1/UpdateService/MultipartUpload";
pub const TASK_PATH: &str = "/redfish/v1/TaskService/Tasks/JID_001";

/// Behaviour knobs for one mock device
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Answer session creation with 404 when false
    pub sessions_supported: bool,

    /// Reject the first session token
    pub revoke_first_token: bool,

    /// Reject every session token
    pub reject_tokens: bool,

    /// Reject basic credentials
    pub reject_basic: bool,

    /// UpdateService document served instead of the full catalog
    pub catalog: Option<Value>,

    /// Status and body returned by every update action
    pub action_error: Option<(u16, String)>,

    /// Location header returned by update actions
    pub update_location: Option<String>,

    /// Documents served by the task resource in order; the last one repeats
    pub task_documents: Vec<Value>,

    /// Delay before a session is created
    pub session_delay: Duration,

    /// Delay before a session delete is answered
    pub session_close_delay: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sessions_supported: true,
            revoke_first_token: false,
            reject_tokens: false,
            reject_basic: false,
            catalog: None,
            action_error: None,
            update_location: Some(TASK_PATH.to_string()),
            task_documents: vec![json!({"TaskState": "Completed"})],
            session_delay: Duration::from_millis(50),
            session_close_delay: Duration::ZERO,
        }
    }
}

/// A request as seen by the device
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub token: Option<String>,
    pub authorization: Option<String>,
    pub content_length: Option<String>,
    pub body: Bytes,
}

impl Recorded {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

pub struct DeviceState {
    pub config: DeviceConfig,
    pub session_creates: AtomicUsize,
    pub session_deletes: AtomicUsize,
    pub requests: Mutex<Vec<Recorded>>,
    task_documents: Mutex<VecDeque<Value>>,
}

impl DeviceState {
    pub fn requests_to(&self, path: &str) -> Vec<Recorded> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    fn record(&self, method: &Method, uri: &Uri, headers: &HeaderMap, body: Bytes) {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        self.requests.lock().unwrap().push(Recorded {
            method: method.to_string(),
            path: uri.path().to_string(),
            token: header("x-auth-token"),
            authorization: header("authorization"),
            content_length: header("content-length"),
            body,
        });
    }

    /// Whether the request carries acceptable credentials
    fn authorized(&self, headers: &HeaderMap) -> bool {
        if headers.contains_key("authorization") {
            return !self.config.reject_basic;
        }
        let Some(token) = headers.get("x-auth-token").and_then(|v| v.to_str().ok()) else {
            return false;
        };
        if self.config.reject_tokens {
            return false;
        }
        // an expired first session
        if token == "token-1" && self.config.revoke_first_token {
            return false;
        }
        token.starts_with("token-")
    }
}

pub struct MockDevice {
    pub addr: SocketAddr,
    pub state: Arc<DeviceState>,
    handle: JoinHandle<()>,
}

impl MockDevice {
    pub async fn start(config: DeviceConfig) -> Self {
        let state = Arc::new(DeviceState {
            task_documents: Mutex::new(config.task_documents.clone().into()),
            config,
            session_creates: AtomicUsize::new(0),
            session_deletes: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/redfish/v1/SessionService/Sessions", post(create_session))
            .route("/redfish/v1/SessionService/Sessions/{id}", delete(delete_session))
            .route("/redfish/v1/UpdateService", get(update_service))
            .route("/redfish/v1/UpdateService/FirmwareInventory", get(firmware_inventory))
            .route(SIMPLE_UPDATE_PATH, post(update_action))
            .route(REPOSITORY_PATH, post(update_action))
            .route(PUSH_PATH, post(update_action))
            .route("/redfish/v1/TaskService/Tasks/{id}", get(task))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn target(&self) -> DeviceTarget {
        DeviceTarget::new(self.base_url(), DeviceCredentials::new("root", "calvin"))
    }

    pub fn session_creates(&self) -> usize {
        self.state.session_creates.load(Ordering::SeqCst)
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Client options with intervals short enough for tests
pub fn fast_options() -> RedfishOptions {
    RedfishOptions {
        retry: RetryPolicy {
            max_attempts: 3,
            backoff: CooldownOptions {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                multiplier: 2.0,
            },
        },
        poll_interval: Duration::from_millis(20),
        ready_probe_interval: Duration::from_millis(20),
        operation_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response()
}

async fn create_session(
    State(state): State<Arc<DeviceState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.record(&method, &uri, &headers, body);
    let n = state.session_creates.fetch_add(1, Ordering::SeqCst) + 1;
    if !state.config.sessions_supported {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    }
    tokio::time::sleep(state.config.session_delay).await;

    let mut response = (StatusCode::CREATED, Json(json!({"Id": n.to_string()}))).into_response();
    let headers = response.headers_mut();
    headers.insert("X-Auth-Token", format!("token-{}", n).parse().unwrap());
    headers.insert(
        "Location",
        format!("/redfish/v1/SessionService/Sessions/{}", n)
            .parse()
            .unwrap(),
    );
    response
}

async fn delete_session(State(state): State<Arc<DeviceState>>, Path(_id): Path<String>) -> StatusCode {
    tokio::time::sleep(state.config.session_close_delay).await;
    state.session_deletes.fetch_add(1, Ordering::SeqCst);
    StatusCode::NO_CONTENT
}

async fn update_service(
    State(state): State<Arc<DeviceState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let authorized = state.authorized(&headers);
    state.record(&method, &uri, &headers, Bytes::new());
    if !authorized {
        return unauthorized();
    }
    if let Some(catalog) = &state.config.catalog {
        return Json(catalog.clone()).into_response();
    }

    Json(json!({
        "@odata.id": "/redfish/v1/UpdateService",
        "MultipartHttpPushUri": PUSH_PATH,
        "Actions": {
            "#UpdateService.SimpleUpdate": {
                "target": SIMPLE_UPDATE_PATH,
                "TransferProtocol@Redfish.AllowableValues": ["HTTP", "HTTPS"]
            },
            "Oem": {
                "#DellSoftwareInstallationService.InstallFromRepository": {
                    "target": REPOSITORY_PATH
                }
            }
        }
    }))
    .into_response()
}

async fn firmware_inventory(
    State(state): State<Arc<DeviceState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let authorized = state.authorized(&headers);
    state.record(&method, &uri, &headers, Bytes::new());
    if !authorized {
        return unauthorized();
    }
    Json(json!({"Members": []})).into_response()
}

async fn update_action(
    State(state): State<Arc<DeviceState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let authorized = state.authorized(&headers);
    state.record(&method, &uri, &headers, body);
    if !authorized {
        return unauthorized();
    }
    if let Some((status, body)) = &state.config.action_error {
        let status = StatusCode::from_u16(*status).unwrap();
        return (status, Json(json!({"error": {"message": body}}))).into_response();
    }

    match &state.config.update_location {
        Some(location) => {
            let mut response = StatusCode::ACCEPTED.into_response();
            response
                .headers_mut()
                .insert("Location", location.parse().unwrap());
            response
        }
        None => (StatusCode::OK, "").into_response(),
    }
}

async fn task(
    State(state): State<Arc<DeviceState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let authorized = state.authorized(&headers);
    state.record(&method, &uri, &headers, Bytes::new());
    if !authorized {
        return unauthorized();
    }
    let mut documents = state.task_documents.lock().unwrap();
    let document = if documents.len() > 1 {
        documents.pop_front()
    } else {
        documents.front().cloned()
    };
    Json(document.unwrap_or(Value::Null)).into_response()
}

/// Firmware download server used as a multipart payload source
pub struct PayloadServer {
    pub addr: SocketAddr,
    pub state: Arc<PayloadState>,
    handle: JoinHandle<()>,
}

pub struct PayloadState {
    pub content: Vec<u8>,
    pub fetches: Mutex<Vec<String>>,
}

impl PayloadState {
    pub fn fetches_of(&self, path: &str) -> usize {
        self.fetches.lock().unwrap().iter().filter(|p| *p == path).count()
    }

    fn fetched(&self, uri: &Uri) -> usize {
        let mut fetches = self.fetches.lock().unwrap();
        fetches.push(uri.path().to_string());
        fetches.iter().filter(|p| *p == uri.path()).count()
    }
}

impl PayloadServer {
    /// Routes:
    /// `/redirect/fw.bin` answers 307 to `/files/fw.bin`;
    /// `/files/fw.bin` serves the content with a length;
    /// `/chunked/fw.bin` streams it without a length;
    /// `/flaky/fw.bin` cuts the first download short, then streams it fully.
    pub async fn start(content: Vec<u8>) -> Self {
        let state = Arc::new(PayloadState {
            content,
            fetches: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/redirect/fw.bin", get(redirect_payload))
            .route("/files/fw.bin", get(full_payload))
            .route("/chunked/fw.bin", get(chunked_payload))
            .route("/flaky/fw.bin", get(flaky_payload))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for PayloadServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn chunks_of(content: &[u8]) -> Vec<Result<Bytes, std::io::Error>> {
    content
        .chunks(4)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect()
}

async fn redirect_payload(State(state): State<Arc<PayloadState>>, uri: Uri) -> Response {
    state.fetched(&uri);
    Redirect::temporary("/files/fw.bin").into_response()
}

async fn full_payload(State(state): State<Arc<PayloadState>>, uri: Uri) -> Response {
    state.fetched(&uri);
    Bytes::from(state.content.clone()).into_response()
}

async fn chunked_payload(State(state): State<Arc<PayloadState>>, uri: Uri) -> Response {
    state.fetched(&uri);
    Body::from_stream(stream::iter(chunks_of(&state.content))).into_response()
}

async fn flaky_payload(State(state): State<Arc<PayloadState>>, uri: Uri) -> Response {
    if state.fetched(&uri) > 1 {
        return Body::from_stream(stream::iter(chunks_of(&state.content))).into_response();
    }

    // first chunk, a pause so it reaches the client, then a broken stream
    let head = Bytes::copy_from_slice(&state.content[..4.min(state.content.len())]);
    let body = stream::unfold(0u8, move |step| {
        let head = head.clone();
        async move {
            match step {
                0 => Some((Ok(head), 1)),
                1 => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Some((Err(std::io::Error::other("connection reset")), 2))
                }
                _ => None,
            }
        }
    });
    Body::from_stream(body).into_response()
}
