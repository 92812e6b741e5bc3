//! Record store for plans, audit events and workflow executions

pub mod json_file;
pub mod memory;

use async_trait::async_trait;

use crate::errors::ConductorError;
use crate::planner::models::{AuditEvent, OrchestrationPlan};
use crate::workflow::model::WorkflowExecution;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace a plan
    async fn save_plan(&self, plan: &OrchestrationPlan) -> Result<(), ConductorError>;

    async fn get_plan(&self, plan_id: &str) -> Result<Option<OrchestrationPlan>, ConductorError>;

    /// All plans, oldest first
    async fn list_plans(&self) -> Result<Vec<OrchestrationPlan>, ConductorError>;

    async fn append_audit(&self, event: &AuditEvent) -> Result<(), ConductorError>;

    /// Audit events, oldest first
    async fn list_audit(&self) -> Result<Vec<AuditEvent>, ConductorError>;

    /// Insert or replace an execution
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), ConductorError>;

    async fn get_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecution>, ConductorError>;

    /// All executions, oldest first
    async fn list_executions(&self) -> Result<Vec<WorkflowExecution>, ConductorError>;
}
