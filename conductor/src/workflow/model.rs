//! Workflow templates and executions

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ConductorError;

/// A workflow definition: a graph of steps addressed by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: String,
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    pub steps: Vec<WorkflowStep>,
}

/// A step in a workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(flatten)]
    pub kind: StepKind,

    /// Guard evaluated against `{context, result}` after the step ran;
    /// successors are followed only when it holds
    #[serde(default)]
    pub condition: Option<String>,

    #[serde(default)]
    pub next_steps: Vec<String>,
}

/// Step kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Submit a device job
    Job {
        job_type: String,
        #[serde(default)]
        device_id: Option<String>,
        #[serde(default)]
        metadata: Value,
    },

    /// Branch on an expression: `next_steps` when true, `else_steps` when false
    Condition {
        expression: String,
        #[serde(default)]
        else_steps: Vec<String>,
    },

    /// Run each branch and everything reachable from it concurrently
    Parallel { branches: Vec<String> },

    Delay { duration_ms: u64 },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Job { .. } => "job",
            StepKind::Condition { .. } => "condition",
            StepKind::Parallel { .. } => "parallel",
            StepKind::Delay { .. } => "delay",
        }
    }
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
            condition: None,
            next_steps: Vec::new(),
        }
    }

    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.next_steps.push(next.into());
        self
    }

    pub fn guarded(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Every step id this step can lead to
    pub fn references(&self) -> impl Iterator<Item = &String> {
        let extra: &[String] = match &self.kind {
            StepKind::Condition { else_steps, .. } => else_steps,
            StepKind::Parallel { branches } => branches,
            _ => &[],
        };
        self.next_steps.iter().chain(extra.iter())
    }
}

impl WorkflowTemplate {
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.id == id)
    }

    /// Check ids are unique and every reference resolves
    pub fn validate(&self) -> Result<(), ConductorError> {
        if self.steps.is_empty() {
            return Err(ConductorError::WorkflowError(format!(
                "template {} has no steps",
                self.id
            )));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(ConductorError::WorkflowError(format!(
                    "template {} has duplicate step {}",
                    self.id, step.id
                )));
            }
        }

        for step in &self.steps {
            if let Some(missing) = step.references().find(|r| !ids.contains(r.as_str())) {
                return Err(ConductorError::WorkflowError(format!(
                    "step {} references unknown step {}",
                    step.id, missing
                )));
            }
        }
        Ok(())
    }

    /// Steps no other step references, in declaration order.
    ///
    /// A graph where every step is referenced starts at its first step.
    pub fn entry_steps(&self) -> Vec<String> {
        let referenced: HashSet<&String> =
            self.steps.iter().flat_map(WorkflowStep::references).collect();
        let entries: Vec<String> = self
            .steps
            .iter()
            .filter(|step| !referenced.contains(&step.id))
            .map(|step| step.id.clone())
            .collect();

        if entries.is_empty() {
            self.steps.iter().take(1).map(|step| step.id.clone()).collect()
        } else {
            entries
        }
    }
}

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Failed,
    Cancelled,
}

/// One executed step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub step_id: String,
    pub kind: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub status: StepStatus,

    #[serde(default)]
    pub result: Option<Value>,

    #[serde(default)]
    pub error: Option<String>,
}

/// A run of a workflow template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub template_id: String,
    pub status: ExecutionStatus,

    /// Launch context; step results are added under `steps.<id>`
    pub context: Value,

    pub log: Vec<LogEntry>,
    pub job_ids: Vec<String>,
    pub started_at: DateTime<Utc>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub error: Option<String>,
}

impl WorkflowExecution {
    pub fn new(id: String, template_id: String, context: Map<String, Value>) -> Self {
        Self {
            id,
            template_id,
            status: ExecutionStatus::Running,
            context: Value::Object(context),
            log: Vec::new(),
            job_ids: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    /// Record a step result under `context.steps.<id>`
    pub fn record_result(&mut self, step_id: &str, result: &Value) {
        let Value::Object(context) = &mut self.context else {
            return;
        };
        let steps = context
            .entry("steps")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(steps) = steps {
            steps.insert(step_id.to_string(), result.clone());
        }
    }

    pub fn has_failures(&self) -> bool {
        self.log.iter().any(|entry| entry.status == StepStatus::Failed)
    }

    /// Number of log entries for `step_id`
    pub fn runs_of(&self, step_id: &str) -> usize {
        self.log.iter().filter(|entry| entry.step_id == step_id).count()
    }
}
