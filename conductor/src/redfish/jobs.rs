//! Job polling and device readiness

use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::errors::ProtocolError;
use crate::redfish::client::{RawResponse, RedfishClient, RequestSpec, FIRMWARE_INVENTORY_PATH};

/// Keys read, in order, for a job's state
const STATE_KEYS: [&str; 3] = ["TaskState", "JobState", "Status"];

const FAILURE_MARKERS: [&str; 3] = ["exception", "failed", "error"];
const COMPLETED_STATES: [&str; 4] = ["completed", "complete", "succeeded", "success"];

/// Normalized state of a device job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Still running, or no recognizable state
    Pending(Option<String>),
    Completed(String),
    Failed(String),
}

impl JobState {
    /// Classify a raw state string; failure markers win over completion
    pub fn classify(state: &str) -> Self {
        let lower = state.to_ascii_lowercase();
        if FAILURE_MARKERS.iter().any(|marker| lower.contains(marker)) {
            JobState::Failed(state.to_string())
        } else if COMPLETED_STATES.contains(&lower.as_str()) {
            JobState::Completed(state.to_string())
        } else {
            JobState::Pending(Some(state.to_string()))
        }
    }

    pub fn from_document(document: &Value) -> Self {
        match extract_state(document) {
            Some(state) => Self::classify(&state),
            None => JobState::Pending(None),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending(_))
    }
}

fn extract_state(document: &Value) -> Option<String> {
    STATE_KEYS.iter().find_map(|key| match document.get(*key) {
        Some(Value::String(state)) => Some(state.clone()),
        Some(Value::Object(status)) => status
            .get("State")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    })
}

impl RedfishClient {
    /// Poll a job or task until it reaches a terminal state.
    ///
    /// Transient read errors are logged and polling continues. Returns the
    /// final document on completion.
    pub async fn poll_job(&self, location: &Url, deadline: Instant) -> Result<Value, ProtocolError> {
        let spec = RequestSpec::get(location.clone());
        let mut polls = 0u32;

        loop {
            if Instant::now() >= deadline {
                return Err(ProtocolError::Timeout(format!(
                    "job {} still pending after {} polls",
                    location, polls
                )));
            }
            polls += 1;

            match self
                .execute(&spec, deadline)
                .await
                .and_then(RawResponse::into_success)
            {
                Ok(response) => match JobState::from_document(&response.body) {
                    JobState::Completed(state) => {
                        info!("Job {} finished: {}", location, state);
                        return Ok(response.body);
                    }
                    JobState::Failed(state) => {
                        error!("Job {} failed: {}", location, state);
                        return Err(ProtocolError::JobFailed {
                            state,
                            document: response.body,
                        });
                    }
                    JobState::Pending(state) => {
                        debug!(
                            "Job {} pending ({})",
                            location,
                            state.as_deref().unwrap_or("no state")
                        );
                    }
                },
                Err(e) if e.is_transient() => warn!("Polling {} failed: {}", location, e),
                Err(e) => return Err(e),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep(self.options.poll_interval.min(remaining)).await;
        }
    }

    /// Probe the firmware inventory until the device answers.
    ///
    /// Every probe failure counts as not-ready; only the deadline ends the wait.
    pub async fn wait_for_device_ready(&self, deadline: Instant) -> Result<(), ProtocolError> {
        let spec = RequestSpec::get(self.url(FIRMWARE_INVENTORY_PATH)?);
        let mut probes = 0u32;

        loop {
            if Instant::now() >= deadline {
                return Err(ProtocolError::Timeout(format!(
                    "device {} not ready after {} probes",
                    self.base_url, probes
                )));
            }
            probes += 1;

            match self
                .execute(&spec, deadline)
                .await
                .and_then(RawResponse::into_success)
            {
                Ok(_) => {
                    info!("Device {} ready after {} probes", self.base_url, probes);
                    return Ok(());
                }
                Err(e) => debug!("Device {} not ready (probe {}): {}", self.base_url, probes, e),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep(self.options.ready_probe_interval.min(remaining)).await;
        }
    }
}
