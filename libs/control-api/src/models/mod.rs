//! Control server API models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Plan list response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanListResponse {
    pub plans: Vec<PlanSummary>,
    pub total: usize,
}

/// Plan summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSummary {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub status: String,
    pub group: String,
    pub device_count: usize,
    pub next_execution_date: Option<DateTime<Utc>>,
}

/// Execution control response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionControlResponse {
    pub success: bool,
    pub execution_id: String,
    pub status: String,
    pub message: Option<String>,
}

/// Error body returned by the control server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
