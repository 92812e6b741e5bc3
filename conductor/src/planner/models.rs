//! Fleet inventory and orchestration plan records

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::workflow::model::{WorkflowStep, WorkflowTemplate};

/// A managed server as seen by the inventory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,

    /// Management endpoint address
    pub address: String,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub cluster: Option<String>,

    #[serde(default)]
    pub environment: Option<String>,

    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,

    #[serde(default)]
    pub service_tag: Option<String>,

    /// Safety check name → passing; unlisted checks pass
    #[serde(default)]
    pub health: BTreeMap<String, bool>,
}

/// Package criticality, most urgent first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    Critical,
    Important,
    Recommended,
    Optional,
}

/// A firmware package available for rollout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwarePackage {
    pub id: String,
    pub name: String,
    pub version: String,
    pub image_uri: String,
    pub criticality: Criticality,

    /// Install order declared by the package; lower first
    #[serde(default)]
    pub sequence_order: i32,

    /// Models this package applies to; empty means all models
    #[serde(default)]
    pub compatible_models: Vec<String>,

    /// Image to reinstall when rolling this package back
    #[serde(default)]
    pub rollback_image_uri: Option<String>,
}

impl FirmwarePackage {
    pub fn is_compatible(&self, model: Option<&str>) -> bool {
        if self.compatible_models.is_empty() {
            return true;
        }
        model.is_some_and(|model| {
            self.compatible_models
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(model))
        })
    }
}

/// Fleet snapshot used to generate plans
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,

    #[serde(default)]
    pub packages: Vec<FirmwarePackage>,
}

impl Inventory {
    pub fn device(&self, id: &str) -> Option<&DeviceRecord> {
        self.devices.iter().find(|device| device.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanKind {
    Manual,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Active,
    Overwritten,
    Superseded,
    Completed,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Active => "active",
            PlanStatus::Overwritten => "overwritten",
            PlanStatus::Superseded => "superseded",
            PlanStatus::Completed => "completed",
        }
    }
}

impl PlanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanKind::Manual => "manual",
            PlanKind::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    Cluster,
    Standalone,
}

/// Devices updated together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanGroup {
    /// Cluster name, or the device id for standalone groups
    pub name: String,
    pub kind: GroupKind,

    #[serde(default)]
    pub environment: Option<String>,
}

/// An update campaign for one device group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationPlan {
    pub id: String,
    pub name: String,
    pub kind: PlanKind,
    pub status: PlanStatus,
    pub group: PlanGroup,
    pub device_ids: Vec<String>,
    pub workflow: WorkflowTemplate,
    pub safety_checks: Vec<String>,

    /// Rollback steps; not part of the workflow, see [`Self::rollback_template`]
    pub rollback_steps: Vec<WorkflowStep>,

    pub next_execution_date: DateTime<Utc>,
    pub recurrence_interval_secs: u64,
    pub created_at: DateTime<Utc>,
}

impl OrchestrationPlan {
    pub fn is_active(&self) -> bool {
        self.status == PlanStatus::Active
    }

    /// Whether the two plans target at least one common device
    pub fn overlaps(&self, other: &OrchestrationPlan) -> bool {
        let ours: HashSet<&String> = self.device_ids.iter().collect();
        other.device_ids.iter().any(|id| ours.contains(id))
    }

    /// Campaign context handed to the workflow engine
    pub fn execution_context(&self) -> Value {
        json!({
            "plan_id": self.id,
            "plan_name": self.name,
            "group": self.group.name,
            "environment": self.group.environment,
            "device_ids": self.device_ids,
        })
    }

    /// Move the next execution date past `now` by whole intervals. A plan
    /// without recurrence, or whose next date is not representable, completes
    /// instead.
    pub fn advance_schedule(&mut self, now: DateTime<Utc>) {
        let Some(step) = i64::try_from(self.recurrence_interval_secs)
            .ok()
            .filter(|secs| *secs > 0)
        else {
            self.status = PlanStatus::Completed;
            return;
        };
        if self.next_execution_date > now {
            return;
        }

        let behind = now.signed_duration_since(self.next_execution_date).num_seconds();
        let next = (behind / step + 1)
            .checked_mul(step)
            .and_then(chrono::Duration::try_seconds)
            .and_then(|offset| self.next_execution_date.checked_add_signed(offset));
        match next {
            Some(next) => self.next_execution_date = next,
            None => self.status = PlanStatus::Completed,
        }
    }

    /// A runnable workflow made of this plan's rollback steps, chained in order
    pub fn rollback_template(&self) -> WorkflowTemplate {
        let mut steps = self.rollback_steps.clone();
        let ids: Vec<String> = steps.iter().map(|step| step.id.clone()).collect();
        for (step, next) in steps.iter_mut().zip(ids.iter().skip(1)) {
            step.next_steps = vec![next.clone()];
        }
        if let Some(last) = steps.last_mut() {
            last.next_steps.clear();
        }

        WorkflowTemplate {
            id: format!("{}-rollback", self.workflow.id),
            name: format!("Rollback {}", self.name),
            description: Some(format!("Rollback of plan {}", self.id)),
            steps,
        }
    }
}

/// Audit trail entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub plan_ids: Vec<String>,
    pub message: String,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>, plan_ids: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            id: crate::utils::generate_uuid(),
            action: action.into(),
            timestamp: Utc::now(),
            plan_ids,
            message: message.into(),
        }
    }
}
