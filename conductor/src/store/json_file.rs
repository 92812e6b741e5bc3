//! Record store backed by one JSON file per record

use std::path::Path;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::errors::ConductorError;
use crate::filesys::dir::Dir;
use crate::planner::models::{AuditEvent, OrchestrationPlan};
use crate::storage::layout::StorageLayout;
use crate::store::RecordStore;
use crate::workflow::model::WorkflowExecution;

/// Stores plans, executions and audit events under a [`StorageLayout`]
pub struct JsonFileStore {
    layout: StorageLayout,
}

impl JsonFileStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Ensure the record directories exist
    pub async fn setup(&self) -> Result<(), ConductorError> {
        self.layout.setup().await
    }
}

/// Record ids become file names, so path separators are rejected
fn record_name(id: &str) -> Result<String, ConductorError> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\'])
        && !Path::new(id).is_absolute();
    if !valid {
        return Err(ConductorError::StoreError(format!("Invalid record id {:?}", id)));
    }
    Ok(format!("{}.json", id))
}

async fn read_all<T: DeserializeOwned>(dir: &Dir) -> Result<Vec<T>, ConductorError> {
    let mut records = Vec::new();
    for path in dir.list_files("json").await? {
        match crate::filesys::file::File::new(&path).read_json::<T>().await {
            Ok(record) => records.push(record),
            Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
        }
    }
    Ok(records)
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn save_plan(&self, plan: &OrchestrationPlan) -> Result<(), ConductorError> {
        self.layout
            .plans_dir()
            .file(&record_name(&plan.id)?)
            .write_json(plan)
            .await
    }

    async fn get_plan(&self, plan_id: &str) -> Result<Option<OrchestrationPlan>, ConductorError> {
        self.layout
            .plans_dir()
            .file(&record_name(plan_id)?)
            .read_json_opt()
            .await
    }

    async fn list_plans(&self) -> Result<Vec<OrchestrationPlan>, ConductorError> {
        let mut plans: Vec<OrchestrationPlan> = read_all(&self.layout.plans_dir()).await?;
        plans.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(plans)
    }

    async fn append_audit(&self, event: &AuditEvent) -> Result<(), ConductorError> {
        self.layout
            .audit_dir()
            .file(&record_name(&event.id)?)
            .write_json(event)
            .await
    }

    async fn list_audit(&self) -> Result<Vec<AuditEvent>, ConductorError> {
        let mut events: Vec<AuditEvent> = read_all(&self.layout.audit_dir()).await?;
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), ConductorError> {
        self.layout
            .executions_dir()
            .file(&record_name(&execution.id)?)
            .write_json(execution)
            .await
    }

    async fn get_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecution>, ConductorError> {
        self.layout
            .executions_dir()
            .file(&record_name(execution_id)?)
            .read_json_opt()
            .await
    }

    async fn list_executions(&self) -> Result<Vec<WorkflowExecution>, ConductorError> {
        let mut executions: Vec<WorkflowExecution> =
            read_all(&self.layout.executions_dir()).await?;
        executions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(executions)
    }
}
