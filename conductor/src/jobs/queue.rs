//! Job queue trait and in-memory implementation

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use crate::errors::ConductorError;
use crate::jobs::models::{JobRecord, JobStatus, JobSubmission};
use crate::utils::generate_uuid;

/// Error message recorded on jobs cancelled with their workflow
pub const WORKFLOW_CANCEL_MESSAGE: &str = "Cancelled by workflow cancellation";

/// Job queue used by the workflow engine and the dispatcher
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job and return its id
    async fn submit(&self, submission: JobSubmission) -> Result<String, ConductorError>;

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, ConductorError>;

    /// Jobs submitted by one workflow execution, in submission order
    async fn jobs_for_run(&self, run_id: &str) -> Result<Vec<JobRecord>, ConductorError>;

    /// Claim the oldest queued job whose run is not in `skip_runs`,
    /// marking it running
    async fn next_queued(
        &self,
        skip_runs: &HashSet<String>,
    ) -> Result<Option<JobRecord>, ConductorError>;

    /// Record a status change. Terminal jobs are not changed.
    async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<(), ConductorError>;

    /// Cancel every non-terminal job of a run, returning how many changed
    async fn cancel_run(&self, run_id: &str, message: &str) -> Result<usize, ConductorError>;

    /// Forget terminal jobs last updated before `finished_before`
    async fn prune_finished(&self, finished_before: DateTime<Utc>) -> Result<usize, ConductorError>;
}

/// In-memory job queue
#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: RwLock<HashMap<String, JobRecord>>,
    order: RwLock<Vec<String>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn submit(&self, submission: JobSubmission) -> Result<String, ConductorError> {
        let id = generate_uuid();
        let record = JobRecord::new(id.clone(), submission);
        debug!("Queued {} job {} for run {}", record.job_type, id, record.run_id);

        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let mut order = self.order.write().unwrap_or_else(|e| e.into_inner());
        jobs.insert(id.clone(), record);
        order.push(id.clone());
        Ok(id)
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, ConductorError> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.get(job_id).cloned())
    }

    async fn jobs_for_run(&self, run_id: &str) -> Result<Vec<JobRecord>, ConductorError> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let order = self.order.read().unwrap_or_else(|e| e.into_inner());
        Ok(order
            .iter()
            .filter_map(|id| jobs.get(id))
            .filter(|job| job.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn next_queued(
        &self,
        skip_runs: &HashSet<String>,
    ) -> Result<Option<JobRecord>, ConductorError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let order = self.order.read().unwrap_or_else(|e| e.into_inner());

        let Some(id) = order.iter().find(|id| {
            matches!(jobs.get(*id), Some(job)
                if job.status == JobStatus::Queued && !skip_runs.contains(&job.run_id))
        }) else {
            return Ok(None);
        };

        let Some(job) = jobs.get_mut(id) else {
            return Ok(None);
        };
        job.status = JobStatus::Running;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<(), ConductorError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| ConductorError::NotFound(format!("job {}", job_id)))?;

        if job.status.is_terminal() {
            debug!(
                "Ignoring {} for job {} already {}",
                status.as_str(),
                job_id,
                job.status.as_str()
            );
            return Ok(());
        }

        job.status = status;
        if result.is_some() {
            job.result = result;
        }
        if error.is_some() {
            job.error = error;
        }
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn cancel_run(&self, run_id: &str, message: &str) -> Result<usize, ConductorError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let mut cancelled = 0;

        for job in jobs
            .values_mut()
            .filter(|job| job.run_id == run_id && !job.status.is_terminal())
        {
            job.status = JobStatus::Cancelled;
            job.error = Some(message.to_string());
            job.updated_at = now;
            cancelled += 1;
        }

        if cancelled > 0 {
            info!("Cancelled {} jobs of run {}", cancelled, run_id);
        }
        Ok(cancelled)
    }

    async fn prune_finished(&self, finished_before: DateTime<Utc>) -> Result<usize, ConductorError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let mut order = self.order.write().unwrap_or_else(|e| e.into_inner());

        let before = jobs.len();
        jobs.retain(|_, job| !(job.status.is_terminal() && job.updated_at < finished_before));
        order.retain(|id| jobs.contains_key(id));

        let pruned = before - jobs.len();
        if pruned > 0 {
            debug!("Pruned {} finished jobs", pruned);
        }
        Ok(pruned)
    }
}
