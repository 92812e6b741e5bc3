//! Device job runner
//!
//! Claims queued jobs and runs them against devices through the protocol
//! client. Jobs of one run execute one at a time in submission order, so a
//! run's safety checks settle before its updates start.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::authn::CredentialProvider;
use crate::errors::{ConductorError, ProtocolError};
use crate::jobs::{job_types, JobQueue, JobRecord, JobStatus};
use crate::planner::{CheckReport, InventoryProvider};
use crate::redfish::{ApplyTimePolicy, ClientPool, DeviceTarget, RedfishClient, UpdateRequest, UpdateSpec};

pub const SAFETY_CHECK_CANCEL_MESSAGE: &str = "Cancelled after failed safety check";

/// Checked with the device readiness probe rather than the inventory
pub const CONNECTIVITY_CHECK: &str = "connectivity";

/// Dispatcher options
#[derive(Debug, Clone)]
pub struct Options {
    /// Queue polling interval
    pub interval: Duration,

    /// Jobs running at once across all runs
    pub max_concurrent_jobs: usize,

    /// Deadline for one device task to finish
    pub job_timeout: Duration,

    /// Deadline for a device to answer again after an update
    pub ready_timeout: Duration,

    /// Deadline for the connectivity check, per device
    pub connectivity_timeout: Duration,

    /// How long finished jobs stay in the queue
    pub job_retention: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_concurrent_jobs: 8,
            job_timeout: Duration::from_secs(2 * 60 * 60),
            ready_timeout: Duration::from_secs(15 * 60),
            connectivity_timeout: Duration::from_secs(60),
            job_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FirmwareUpdateJob {
    address: String,
    #[serde(default)]
    updates: Vec<UpdateSpec>,
}

#[derive(Debug, Deserialize)]
struct SafetyCheckJob {
    check: String,
    #[serde(default)]
    device_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RollbackJob {
    address: String,
    #[serde(default)]
    images: Vec<String>,
}

/// Executes queued device jobs
pub struct Dispatcher {
    options: Options,
    job_queue: Arc<dyn JobQueue>,
    pool: Arc<ClientPool>,
    credentials: Arc<dyn CredentialProvider>,
    inventory: Arc<dyn InventoryProvider>,
    permits: Arc<Semaphore>,
    busy_runs: Mutex<HashSet<String>>,
}

impl Dispatcher {
    pub fn new(
        options: Options,
        job_queue: Arc<dyn JobQueue>,
        pool: Arc<ClientPool>,
        credentials: Arc<dyn CredentialProvider>,
        inventory: Arc<dyn InventoryProvider>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_concurrent_jobs.max(1)));
        Self {
            options,
            job_queue,
            pool,
            credentials,
            inventory,
            permits,
            busy_runs: Mutex::new(HashSet::new()),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Claim as many jobs as there are free permits and spawn them.
    ///
    /// Returns the number of jobs started.
    pub async fn dispatch_pending(self: &Arc<Self>) -> usize {
        let mut started = 0;

        loop {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                debug!("All {} job slots busy", self.options.max_concurrent_jobs);
                break;
            };

            let busy = self
                .busy_runs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            let job = match self.job_queue.next_queued(&busy).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to claim job: {}", e);
                    break;
                }
            };

            self.busy_runs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(job.run_id.clone());
            started += 1;

            let dispatcher = self.clone();
            tokio::spawn(async move {
                let run_id = job.run_id.clone();
                dispatcher.process(job).await;
                dispatcher
                    .busy_runs
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&run_id);
                drop(permit);
            });
        }
        started
    }

    /// Drop finished jobs older than the retention period
    pub async fn prune_finished(&self) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(self.options.job_retention)
            .ok()
            .and_then(|retention| chrono::Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };
        match self.job_queue.prune_finished(cutoff).await {
            Ok(pruned) => pruned,
            Err(e) => {
                warn!("Failed to prune finished jobs: {}", e);
                0
            }
        }
    }

    /// Wait until every spawned job has released its slot
    pub async fn drain(&self) {
        let total = self.options.max_concurrent_jobs.max(1) as u32;
        if let Ok(all) = self.permits.acquire_many(total).await {
            drop(all);
        }
    }

    /// Run one claimed job and write its outcome back to the queue
    pub async fn process(&self, job: JobRecord) {
        info!("Running {} job {} (run {})", job.job_type, job.id, job.run_id);

        let outcome = self.run_job(&job).await;
        let (status, result, error) = match outcome {
            Ok(result) => (JobStatus::Completed, Some(result), None),
            Err(e) => {
                error!("Job {} failed: {}", job.id, e);
                let result = match &e {
                    ConductorError::Protocol(ProtocolError::JobFailed { document, .. }) => {
                        Some(document.clone())
                    }
                    _ => None,
                };
                (JobStatus::Failed, result, Some(e.to_string()))
            }
        };

        if let Err(e) = self
            .job_queue
            .update_status(&job.id, status, result, error)
            .await
        {
            warn!("Failed to record status of job {}: {}", job.id, e);
        }

        if status == JobStatus::Failed && job.job_type == job_types::SAFETY_CHECK {
            match self
                .job_queue
                .cancel_run(&job.run_id, SAFETY_CHECK_CANCEL_MESSAGE)
                .await
            {
                Ok(count) => info!("Cancelled {} remaining jobs of run {}", count, job.run_id),
                Err(e) => warn!("Failed to cancel jobs of run {}: {}", job.run_id, e),
            }
        }
    }

    /// Execute a job and return its result document
    pub async fn run_job(&self, job: &JobRecord) -> Result<Value, ConductorError> {
        match job.job_type.as_str() {
            job_types::FIRMWARE_UPDATE => {
                let params: FirmwareUpdateJob = serde_json::from_value(job.metadata.clone())?;
                self.firmware_update(job, params).await
            }
            job_types::SAFETY_CHECK => {
                let params: SafetyCheckJob = serde_json::from_value(job.metadata.clone())?;
                self.safety_check(params).await
            }
            job_types::ROLLBACK => {
                let params: RollbackJob = serde_json::from_value(job.metadata.clone())?;
                self.rollback(job, params).await
            }
            other => Err(ConductorError::ValidationError(format!(
                "Unsupported job type: {}",
                other
            ))),
        }
    }

    async fn firmware_update(
        &self,
        job: &JobRecord,
        params: FirmwareUpdateJob,
    ) -> Result<Value, ConductorError> {
        if params.updates.is_empty() {
            return Err(ConductorError::ValidationError(format!(
                "job {} has no updates",
                job.id
            )));
        }
        let device_id = device_id_of(job)?;
        let (client, target) = self.client(device_id, &params.address).await?;

        let mut results = Vec::with_capacity(params.updates.len());
        let mut needs_ready_wait = false;
        for spec in params.updates {
            needs_ready_wait |= spec.apply_time == ApplyTimePolicy::Immediate;
            results.push(self.apply(&client, &target, spec).await?);
        }

        if needs_ready_wait {
            client
                .wait_for_device_ready(Instant::now() + self.options.ready_timeout)
                .await?;
        }
        Ok(json!({ "device_id": device_id, "updates": results }))
    }

    async fn rollback(&self, job: &JobRecord, params: RollbackJob) -> Result<Value, ConductorError> {
        if params.images.is_empty() {
            return Err(ConductorError::ValidationError(format!(
                "job {} has no rollback images",
                job.id
            )));
        }
        let device_id = device_id_of(job)?;
        let (client, target) = self.client(device_id, &params.address).await?;

        let mut results = Vec::with_capacity(params.images.len());
        for image in params.images {
            warn!("Rolling back {} to {}", device_id, image);
            results.push(self.apply(&client, &target, UpdateSpec::direct_uri(image)).await?);
        }
        client
            .wait_for_device_ready(Instant::now() + self.options.ready_timeout)
            .await?;
        Ok(json!({ "device_id": device_id, "rollbacks": results }))
    }

    async fn safety_check(&self, params: SafetyCheckJob) -> Result<Value, ConductorError> {
        let report = if params.check == CONNECTIVITY_CHECK {
            self.connectivity(&params.device_ids).await?
        } else {
            self.inventory
                .run_check(&params.check, &params.device_ids)
                .await?
        };

        if !report.passed {
            return Err(ConductorError::CheckFailed(format!(
                "{}: {}",
                report.check,
                report.failures.join("; ")
            )));
        }
        debug!("Safety check {} passed", report.check);
        Ok(serde_json::to_value(report)?)
    }

    async fn connectivity(&self, device_ids: &[String]) -> Result<CheckReport, ConductorError> {
        let inventory = self.inventory.snapshot().await?;
        let mut failures = Vec::new();

        for device_id in device_ids {
            let Some(device) = inventory.device(device_id) else {
                failures.push(format!("{}: unknown device", device_id));
                continue;
            };
            let probe = async {
                let (client, _) = self.client(device_id, &device.address).await?;
                client
                    .wait_for_device_ready(Instant::now() + self.options.connectivity_timeout)
                    .await?;
                Ok::<_, ConductorError>(())
            };
            if let Err(e) = probe.await {
                failures.push(format!("{}: {}", device_id, e));
            }
        }

        Ok(CheckReport {
            check: CONNECTIVITY_CHECK.to_string(),
            passed: failures.is_empty(),
            failures,
        })
    }

    /// Submit one update and wait for its task, if the device returned one
    async fn apply(
        &self,
        client: &RedfishClient,
        target: &DeviceTarget,
        spec: UpdateSpec,
    ) -> Result<Value, ConductorError> {
        let request = UpdateRequest::new(target.clone(), spec);
        let outcome = client.submit_update(&request).await?;

        let task = match &outcome.task_location {
            Some(location) => Some(
                client
                    .poll_job(location, Instant::now() + self.options.job_timeout)
                    .await?,
            ),
            None => None,
        };
        Ok(json!({
            "status": outcome.status,
            "task_location": outcome.task_location.as_ref().map(|u| u.to_string()),
            "task": task,
        }))
    }

    async fn client(
        &self,
        device_id: &str,
        address: &str,
    ) -> Result<(Arc<RedfishClient>, DeviceTarget), ConductorError> {
        let credentials = self.credentials.credentials_for(device_id).await?;
        let target = DeviceTarget::new(address, credentials);
        let client = self.pool.client_for(device_id, &target).await?;
        Ok((client, target))
    }
}

fn device_id_of(job: &JobRecord) -> Result<&str, ConductorError> {
    job.device_id
        .as_deref()
        .ok_or_else(|| ConductorError::ValidationError(format!("job {} has no device", job.id)))
}

/// Run the dispatcher until shutdown, then wait for in-flight jobs
pub async fn run<S, F>(
    dispatcher: Arc<Dispatcher>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Dispatcher starting...");
    let interval = dispatcher.options().interval;

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Dispatcher shutting down...");
                break;
            }
            _ = sleep_fn(interval) => {}
        }

        let started = dispatcher.dispatch_pending().await;
        if started > 0 {
            debug!("Started {} jobs", started);
        }
        dispatcher.prune_finished().await;
    }

    dispatcher.drain().await;
    info!("Dispatcher stopped");
}
