//! Job records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Job type strings understood by the dispatcher
pub mod job_types {
    pub const FIRMWARE_UPDATE: &str = "firmware_update";
    pub const SAFETY_CHECK: &str = "safety_check";
    pub const ROLLBACK: &str = "rollback";
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// A job to enqueue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    pub job_type: String,

    /// Workflow execution that submitted the job
    pub run_id: String,

    #[serde(default)]
    pub device_id: Option<String>,

    #[serde(default)]
    pub metadata: Value,
}

/// A queued or finished job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub job_type: String,
    pub run_id: String,
    pub device_id: Option<String>,
    pub metadata: Value,
    pub status: JobStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(id: String, submission: JobSubmission) -> Self {
        let now = Utc::now();
        Self {
            id,
            job_type: submission.job_type,
            run_id: submission.run_id,
            device_id: submission.device_id,
            metadata: submission.metadata,
            status: JobStatus::Queued,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
