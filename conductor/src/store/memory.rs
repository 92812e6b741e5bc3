//! In-memory record store

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::errors::ConductorError;
use crate::planner::models::{AuditEvent, OrchestrationPlan};
use crate::store::RecordStore;
use crate::workflow::model::WorkflowExecution;

#[derive(Default)]
pub struct MemoryStore {
    plans: RwLock<HashMap<String, OrchestrationPlan>>,
    audit: RwLock<Vec<AuditEvent>>,
    executions: RwLock<HashMap<String, WorkflowExecution>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn save_plan(&self, plan: &OrchestrationPlan) -> Result<(), ConductorError> {
        let mut plans = self.plans.write().unwrap_or_else(|e| e.into_inner());
        plans.insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn get_plan(&self, plan_id: &str) -> Result<Option<OrchestrationPlan>, ConductorError> {
        let plans = self.plans.read().unwrap_or_else(|e| e.into_inner());
        Ok(plans.get(plan_id).cloned())
    }

    async fn list_plans(&self) -> Result<Vec<OrchestrationPlan>, ConductorError> {
        let plans = self.plans.read().unwrap_or_else(|e| e.into_inner());
        let mut plans: Vec<_> = plans.values().cloned().collect();
        plans.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(plans)
    }

    async fn append_audit(&self, event: &AuditEvent) -> Result<(), ConductorError> {
        let mut audit = self.audit.write().unwrap_or_else(|e| e.into_inner());
        audit.push(event.clone());
        Ok(())
    }

    async fn list_audit(&self) -> Result<Vec<AuditEvent>, ConductorError> {
        let audit = self.audit.read().unwrap_or_else(|e| e.into_inner());
        Ok(audit.clone())
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), ConductorError> {
        let mut executions = self.executions.write().unwrap_or_else(|e| e.into_inner());
        executions.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn get_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecution>, ConductorError> {
        let executions = self.executions.read().unwrap_or_else(|e| e.into_inner());
        Ok(executions.get(execution_id).cloned())
    }

    async fn list_executions(&self) -> Result<Vec<WorkflowExecution>, ConductorError> {
        let executions = self.executions.read().unwrap_or_else(|e| e.into_inner());
        let mut executions: Vec<_> = executions.values().cloned().collect();
        executions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(executions)
    }
}
