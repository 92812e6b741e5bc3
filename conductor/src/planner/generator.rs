//! Plan generation from a fleet snapshot

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::errors::ConductorError;
use crate::jobs::models::job_types;
use crate::planner::models::{
    AuditEvent, DeviceRecord, FirmwarePackage, GroupKind, Inventory, OrchestrationPlan, PlanGroup,
    PlanKind, PlanStatus,
};
use crate::redfish::update::{ApplyTimePolicy, UpdateSpec};
use crate::store::RecordStore;
use crate::utils::generate_uuid;
use crate::workflow::model::{StepKind, WorkflowStep, WorkflowTemplate};

/// Checks run before every group
pub const STANDARD_SAFETY_CHECKS: [&str; 3] = ["connectivity", "disk_space", "backup_verification"];

/// Additional checks for cluster groups
pub const CLUSTER_SAFETY_CHECKS: [&str; 3] = ["cluster_health", "ha_status", "capacity_headroom"];

pub const AUDIT_PLAN_OVERWRITTEN: &str = "plan_overwritten";

/// Plan generator options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerOptions {
    /// Groups updated more recently than this are skipped
    pub recurrence_interval: Duration,

    /// Gap between consecutive groups' execution dates
    pub group_stagger: Duration,

    /// Environment labels, highest priority first
    pub priority_order: Vec<String>,

    /// First execution date; defaults to generation time
    pub start_time: Option<DateTime<Utc>>,

    pub apply_time: ApplyTimePolicy,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            recurrence_interval: Duration::from_secs(30 * 24 * 3600),
            group_stagger: Duration::from_secs(3600),
            priority_order: vec!["prod".to_string(), "staging".to_string(), "dev".to_string()],
            start_time: None,
            apply_time: ApplyTimePolicy::Immediate,
        }
    }
}

/// Devices grouped for one plan
#[derive(Debug, Clone)]
pub struct DeviceGroup<'a> {
    pub group: PlanGroup,
    pub devices: Vec<&'a DeviceRecord>,
}

/// Group devices by cluster, in order of first appearance.
///
/// Devices without a cluster form standalone groups of one.
pub fn group_devices(devices: &[DeviceRecord]) -> Vec<DeviceGroup<'_>> {
    let mut groups: Vec<DeviceGroup<'_>> = Vec::new();
    let mut clusters: HashMap<&str, usize> = HashMap::new();

    for device in devices {
        match device.cluster.as_deref().filter(|c| !c.is_empty()) {
            Some(cluster) => match clusters.get(cluster) {
                Some(&index) => {
                    let group = &mut groups[index];
                    if group.group.environment.is_none() {
                        group.group.environment = device.environment.clone();
                    }
                    group.devices.push(device);
                }
                None => {
                    clusters.insert(cluster, groups.len());
                    groups.push(DeviceGroup {
                        group: PlanGroup {
                            name: cluster.to_string(),
                            kind: GroupKind::Cluster,
                            environment: device.environment.clone(),
                        },
                        devices: vec![device],
                    });
                }
            },
            None => groups.push(DeviceGroup {
                group: PlanGroup {
                    name: device.id.clone(),
                    kind: GroupKind::Standalone,
                    environment: device.environment.clone(),
                },
                devices: vec![device],
            }),
        }
    }
    groups
}

/// Compatible packages in install order
pub fn select_packages<'a>(
    packages: &'a [FirmwarePackage],
    device: &DeviceRecord,
) -> Vec<&'a FirmwarePackage> {
    let mut selected: Vec<&FirmwarePackage> = packages
        .iter()
        .filter(|package| package.is_compatible(device.model.as_deref()))
        .collect();
    selected.sort_by_key(|package| (package.sequence_order, package.criticality));
    selected
}

/// Builds and installs orchestration plans
pub struct PlanGenerator {
    options: PlannerOptions,
    store: Arc<dyn RecordStore>,
}

impl PlanGenerator {
    pub fn new(options: PlannerOptions, store: Arc<dyn RecordStore>) -> Self {
        Self { options, store }
    }

    pub fn options(&self) -> &PlannerOptions {
        &self.options
    }

    fn priority_rank(&self, environment: Option<&str>) -> usize {
        environment
            .and_then(|env| {
                self.options
                    .priority_order
                    .iter()
                    .position(|label| label.eq_ignore_ascii_case(env))
            })
            .unwrap_or(self.options.priority_order.len())
    }

    /// Whether any device in the group is due for an update
    fn is_due(&self, devices: &[&DeviceRecord], now: DateTime<Utc>) -> bool {
        let interval = chrono::Duration::from_std(self.options.recurrence_interval)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        devices.iter().any(|device| match device.last_update {
            Some(last_update) => now.signed_duration_since(last_update) >= interval,
            None => true,
        })
    }

    /// Generate auto plans for every due group, ordered by priority
    pub fn generate(
        &self,
        inventory: &Inventory,
        now: DateTime<Utc>,
    ) -> Result<Vec<OrchestrationPlan>, ConductorError> {
        let mut groups = group_devices(&inventory.devices);
        groups.sort_by_key(|group| self.priority_rank(group.group.environment.as_deref()));

        let start = self.options.start_time.unwrap_or(now);
        let stagger = chrono::Duration::from_std(self.options.group_stagger).map_err(|_| {
            ConductorError::ConfigError(format!(
                "group stagger of {}s is out of range",
                self.options.group_stagger.as_secs()
            ))
        })?;

        let mut plans = Vec::new();
        for group in groups {
            if !self.is_due(&group.devices, now) {
                info!(
                    "Skipping group {}: all devices updated within the recurrence interval",
                    group.group.name
                );
                continue;
            }

            let next_execution_date = self.execution_date(start, stagger, plans.len())?;
            match self.build_plan(&group, &inventory.packages, next_execution_date, now) {
                Some(plan) => plans.push(plan),
                None => debug!("Skipping group {}: no compatible packages", group.group.name),
            }
        }

        info!("Generated {} plans", plans.len());
        Ok(plans)
    }

    /// `start + index * stagger`, rejecting dates chrono cannot represent
    fn execution_date(
        &self,
        start: DateTime<Utc>,
        stagger: chrono::Duration,
        index: usize,
    ) -> Result<DateTime<Utc>, ConductorError> {
        i32::try_from(index)
            .ok()
            .and_then(|index| stagger.checked_mul(index))
            .and_then(|offset| start.checked_add_signed(offset))
            .ok_or_else(|| {
                ConductorError::ConfigError(format!(
                    "group stagger of {}s puts group {} beyond the supported date range",
                    self.options.group_stagger.as_secs(),
                    index
                ))
            })
    }

    fn build_plan(
        &self,
        group: &DeviceGroup<'_>,
        packages: &[FirmwarePackage],
        next_execution_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<OrchestrationPlan> {
        let plan_id = generate_uuid();
        let device_ids: Vec<String> = group.devices.iter().map(|d| d.id.clone()).collect();

        let mut update_steps = Vec::new();
        let mut rollback_steps = Vec::new();
        for device in &group.devices {
            let selected = select_packages(packages, device);
            if selected.is_empty() {
                continue;
            }
            update_steps.push(self.update_step(device, &selected));
            rollback_steps.extend(rollback_step(device, &selected));
        }
        if update_steps.is_empty() {
            return None;
        }

        let mut safety_checks: Vec<String> =
            STANDARD_SAFETY_CHECKS.iter().map(|c| c.to_string()).collect();
        if group.group.kind == GroupKind::Cluster {
            safety_checks.extend(CLUSTER_SAFETY_CHECKS.iter().map(|c| c.to_string()));
        }

        let mut steps: Vec<WorkflowStep> = safety_checks
            .iter()
            .map(|check| safety_check_step(check, &device_ids))
            .collect();
        steps.extend(update_steps);
        chain(&mut steps);

        let environment = group.group.environment.as_deref().unwrap_or("unlabeled");
        Some(OrchestrationPlan {
            id: plan_id.clone(),
            name: format!("Firmware update {} ({})", group.group.name, environment),
            kind: PlanKind::Auto,
            status: PlanStatus::Active,
            group: group.group.clone(),
            device_ids,
            workflow: WorkflowTemplate {
                id: format!("plan-{}", plan_id),
                name: format!("Update {}", group.group.name),
                description: None,
                steps,
            },
            safety_checks,
            rollback_steps,
            next_execution_date,
            recurrence_interval_secs: self.options.recurrence_interval.as_secs(),
            created_at: now,
        })
    }

    fn update_step(&self, device: &DeviceRecord, packages: &[&FirmwarePackage]) -> WorkflowStep {
        let updates: Vec<UpdateSpec> = packages
            .iter()
            .map(|package| {
                UpdateSpec::direct_uri(package.image_uri.clone())
                    .with_apply_time(self.options.apply_time)
            })
            .collect();
        let summary: Vec<_> = packages
            .iter()
            .map(|p| json!({"id": p.id, "name": p.name, "version": p.version}))
            .collect();

        let mut step = WorkflowStep::new(
            format!("update-{}", device.id),
            StepKind::Job {
                job_type: job_types::FIRMWARE_UPDATE.to_string(),
                device_id: Some(device.id.clone()),
                metadata: json!({
                    "address": device.address,
                    "service_tag": device.service_tag,
                    "updates": updates,
                    "packages": summary,
                }),
            },
        );
        step.name = Some(format!("Update {}", device.name));
        step
    }

    /// Install a plan, retiring active plans that target overlapping devices.
    ///
    /// Overlapping manual plans are marked overwritten with an audit event;
    /// overlapping auto plans are superseded.
    pub async fn install(&self, plan: &OrchestrationPlan) -> Result<(), ConductorError> {
        for mut existing in self.store.list_plans().await? {
            if existing.id == plan.id || !existing.is_active() || !existing.overlaps(plan) {
                continue;
            }

            match existing.kind {
                PlanKind::Manual => {
                    existing.status = PlanStatus::Overwritten;
                    self.store.save_plan(&existing).await?;
                    let event = AuditEvent::new(
                        AUDIT_PLAN_OVERWRITTEN,
                        vec![existing.id.clone(), plan.id.clone()],
                        format!(
                            "Manual plan {} overwritten by {} plan {}",
                            existing.id,
                            plan.kind.as_str(),
                            plan.id
                        ),
                    );
                    self.store.append_audit(&event).await?;
                    info!("Manual plan {} overwritten by {}", existing.id, plan.id);
                }
                PlanKind::Auto => {
                    existing.status = PlanStatus::Superseded;
                    self.store.save_plan(&existing).await?;
                    debug!("Plan {} superseded by {}", existing.id, plan.id);
                }
            }
        }

        self.store.save_plan(plan).await
    }

    /// Generate and install plans
    pub async fn generate_and_install(
        &self,
        inventory: &Inventory,
        now: DateTime<Utc>,
    ) -> Result<Vec<OrchestrationPlan>, ConductorError> {
        let plans = self.generate(inventory, now)?;
        for plan in &plans {
            self.install(plan).await?;
        }
        Ok(plans)
    }
}

fn safety_check_step(check: &str, device_ids: &[String]) -> WorkflowStep {
    WorkflowStep::new(
        format!("check-{}", check),
        StepKind::Job {
            job_type: job_types::SAFETY_CHECK.to_string(),
            device_id: None,
            metadata: json!({"check": check, "device_ids": device_ids}),
        },
    )
}

/// Rollback job for a device; none when no package names a rollback image
fn rollback_step(device: &DeviceRecord, packages: &[&FirmwarePackage]) -> Option<WorkflowStep> {
    // reverse install order
    let images: Vec<&str> = packages
        .iter()
        .rev()
        .filter_map(|package| package.rollback_image_uri.as_deref())
        .collect();
    if images.is_empty() {
        return None;
    }

    Some(WorkflowStep::new(
        format!("rollback-{}", device.id),
        StepKind::Job {
            job_type: job_types::ROLLBACK.to_string(),
            device_id: Some(device.id.clone()),
            metadata: json!({"address": device.address, "images": images}),
        },
    ))
}

/// Link steps into a sequential chain
fn chain(steps: &mut [WorkflowStep]) {
    let ids: Vec<String> = steps.iter().map(|step| step.id.clone()).collect();
    for (step, next) in steps.iter_mut().zip(ids.into_iter().skip(1)) {
        step.next_steps = vec![next];
    }
}
