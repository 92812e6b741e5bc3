//! Execution status transitions

use crate::workflow::model::{ExecutionStatus, WorkflowExecution};

/// Execution event
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// All reachable steps ran without failures
    Complete,

    /// At least one step failed
    Fail(String),

    /// Cancelled by the operator
    Cancel,
}

impl WorkflowExecution {
    /// Process an event and transition status
    pub fn process(&mut self, event: ExecutionEvent) -> Result<(), String> {
        let new_status = match (&self.status, &event) {
            (ExecutionStatus::Running, ExecutionEvent::Complete) => ExecutionStatus::Completed,
            (ExecutionStatus::Running, ExecutionEvent::Fail(err)) => {
                self.error = Some(err.clone());
                ExecutionStatus::Failed
            }
            (ExecutionStatus::Running, ExecutionEvent::Cancel) => ExecutionStatus::Cancelled,

            _ => {
                return Err(format!(
                    "Invalid transition from {} on {:?}",
                    self.status.as_str(),
                    event
                ));
            }
        };

        self.status = new_status;
        self.completed_at = Some(chrono::Utc::now());
        Ok(())
    }
}
