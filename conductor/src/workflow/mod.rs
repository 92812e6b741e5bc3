//! Workflow engine

pub mod condition;
pub mod engine;
pub mod fsm;
pub mod model;

pub use engine::WorkflowEngine;
pub use model::{
    ExecutionStatus, LogEntry, StepKind, StepStatus, WorkflowExecution, WorkflowStep,
    WorkflowTemplate,
};
