//! Workflow execution engine

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::errors::ConductorError;
use crate::jobs::{JobQueue, JobSubmission, WORKFLOW_CANCEL_MESSAGE};
use crate::store::RecordStore;
use crate::utils::generate_uuid;
use crate::workflow::condition;
use crate::workflow::fsm::ExecutionEvent;
use crate::workflow::model::{
    ExecutionStatus, LogEntry, StepKind, StepStatus, WorkflowExecution, WorkflowStep,
    WorkflowTemplate,
};

/// Shared state of one running execution
struct RunContext {
    steps: HashMap<String, WorkflowStep>,
    execution: Arc<Mutex<WorkflowExecution>>,
    visited: Mutex<HashSet<String>>,
    cancel: watch::Receiver<bool>,
}

impl RunContext {
    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Claim a step; false if it already ran or is running
    async fn claim(&self, step_id: &str) -> bool {
        self.visited.lock().await.insert(step_id.to_string())
    }

    /// Resolves once the run is cancelled
    async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        let closed = cancel.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// Handle kept for a run while it executes
#[derive(Clone)]
struct ActiveRun {
    cancel: Arc<watch::Sender<bool>>,
    execution: Arc<Mutex<WorkflowExecution>>,
}

/// A prepared execution, not yet driven
pub struct PreparedRun {
    id: String,
    context: RunContext,
    entries: Vec<String>,
}

impl PreparedRun {
    pub fn id(&self) -> &str {
        &self.id
    }
}

enum StepOutcome {
    Done { result: Value, next: Vec<String> },
    Failed(String),
    Cancelled,
}

/// Runs workflow templates against a job queue
pub struct WorkflowEngine {
    job_queue: Arc<dyn JobQueue>,
    store: Arc<dyn RecordStore>,
    active: RwLock<HashMap<String, ActiveRun>>,
}

impl WorkflowEngine {
    pub fn new(job_queue: Arc<dyn JobQueue>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            job_queue,
            store,
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Run a template to completion and return the final execution
    pub async fn execute(
        &self,
        template: &WorkflowTemplate,
        context: Value,
    ) -> Result<WorkflowExecution, ConductorError> {
        let run = self.prepare(template, context).await?;
        Ok(self.drive(run).await)
    }

    /// Start a template in the background and return the execution id
    pub async fn launch(
        self: &Arc<Self>,
        template: &WorkflowTemplate,
        context: Value,
    ) -> Result<String, ConductorError> {
        let run = self.prepare(template, context).await?;
        let id = run.id.clone();
        let engine = self.clone();
        tokio::spawn(async move {
            engine.drive(run).await;
        });
        Ok(id)
    }

    /// Validate the template and register a new running execution
    pub async fn prepare(
        &self,
        template: &WorkflowTemplate,
        context: Value,
    ) -> Result<PreparedRun, ConductorError> {
        template.validate()?;
        let context = match context {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ConductorError::WorkflowError(format!(
                    "Launch context must be an object, got {}",
                    other
                )))
            }
        };

        let id = generate_uuid();
        let execution = WorkflowExecution::new(id.clone(), template.id.clone(), context);
        self.persist(&execution).await;

        let execution = Arc::new(Mutex::new(execution));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.active.write().await.insert(
            id.clone(),
            ActiveRun {
                cancel: Arc::new(cancel_tx),
                execution: execution.clone(),
            },
        );

        let steps = template
            .steps
            .iter()
            .map(|step| (step.id.clone(), step.clone()))
            .collect();

        info!(
            "Starting execution {} of template {} ({} steps)",
            id,
            template.id,
            template.steps.len()
        );
        Ok(PreparedRun {
            id,
            context: RunContext {
                steps,
                execution,
                visited: Mutex::new(HashSet::new()),
                cancel: cancel_rx,
            },
            entries: template.entry_steps(),
        })
    }

    /// Execute a prepared run until no steps remain
    pub async fn drive(&self, run: PreparedRun) -> WorkflowExecution {
        let PreparedRun {
            id,
            context,
            entries,
        } = run;

        self.run_from(&context, entries).await;

        let finished = {
            let mut execution = context.execution.lock().await;
            if execution.status == ExecutionStatus::Running {
                let event = match execution
                    .log
                    .iter()
                    .find(|entry| entry.status == StepStatus::Failed)
                {
                    Some(failed) => ExecutionEvent::Fail(format!(
                        "step {} failed: {}",
                        failed.step_id,
                        failed.error.as_deref().unwrap_or("unknown error")
                    )),
                    None => ExecutionEvent::Complete,
                };
                if let Err(e) = execution.process(event) {
                    warn!("Execution {}: {}", id, e);
                }
            }
            execution.clone()
        };

        self.persist(&finished).await;
        self.active.write().await.remove(&id);

        match finished.status {
            ExecutionStatus::Failed => error!(
                "Execution {} failed: {}",
                id,
                finished.error.as_deref().unwrap_or_default()
            ),
            status => info!("Execution {} {}", id, status.as_str()),
        }
        finished
    }

    /// Cancel an execution and its outstanding jobs.
    ///
    /// Steps that already completed are not rolled back.
    pub async fn cancel(&self, execution_id: &str) -> Result<WorkflowExecution, ConductorError> {
        let active = self.active.read().await.get(execution_id).cloned();

        let execution = match active {
            Some(active) => {
                active.cancel.send_replace(true);
                let mut execution = active.execution.lock().await;
                execution
                    .process(ExecutionEvent::Cancel)
                    .map_err(ConductorError::WorkflowError)?;
                execution.clone()
            }
            None => {
                let mut execution = self
                    .store
                    .get_execution(execution_id)
                    .await?
                    .ok_or_else(|| ConductorError::NotFound(format!("execution {}", execution_id)))?;
                execution
                    .process(ExecutionEvent::Cancel)
                    .map_err(ConductorError::WorkflowError)?;
                // not driven by this process, so nothing else will persist it
                self.persist(&execution).await;
                execution
            }
        };

        let cancelled = self
            .job_queue
            .cancel_run(execution_id, WORKFLOW_CANCEL_MESSAGE)
            .await?;
        info!(
            "Cancelled execution {} ({} jobs cancelled)",
            execution_id, cancelled
        );
        Ok(execution)
    }

    /// Live state of a running execution, or the stored record
    pub async fn get_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecution>, ConductorError> {
        let active = self.active.read().await.get(execution_id).cloned();
        if let Some(active) = active {
            return Ok(Some(active.execution.lock().await.clone()));
        }
        self.store.get_execution(execution_id).await
    }

    fn run_from<'a>(&'a self, run: &'a RunContext, roots: Vec<String>) -> BoxFuture<'a, ()> {
        async move {
            let mut queue: VecDeque<String> = roots.into();

            while let Some(step_id) = queue.pop_front() {
                if run.is_cancelled() {
                    return;
                }
                if !run.claim(&step_id).await {
                    debug!("Step {} already visited", step_id);
                    continue;
                }
                let Some(step) = run.steps.get(&step_id) else {
                    continue;
                };

                let started_at = Utc::now();
                let outcome = self.execute_step(run, step).await;
                let (status, result, error, next) = match outcome {
                    StepOutcome::Done { result, next } => {
                        match self.guard_allows(run, step, &result).await {
                            Ok(true) => (StepStatus::Completed, Some(result), None, next),
                            Ok(false) => {
                                debug!("Guard on {} is false, not following successors", step.id);
                                (StepStatus::Completed, Some(result), None, Vec::new())
                            }
                            Err(e) => (
                                StepStatus::Failed,
                                Some(result),
                                Some(format!("guard: {}", e)),
                                Vec::new(),
                            ),
                        }
                    }
                    StepOutcome::Failed(e) => (StepStatus::Failed, None, Some(e), Vec::new()),
                    StepOutcome::Cancelled => (StepStatus::Cancelled, None, None, Vec::new()),
                };

                let snapshot = {
                    let mut execution = run.execution.lock().await;
                    if let Some(result) = &result {
                        execution.record_result(&step.id, result);
                    }
                    execution.log.push(LogEntry {
                        step_id: step.id.clone(),
                        kind: step.kind.name().to_string(),
                        started_at,
                        completed_at: Utc::now(),
                        status,
                        result,
                        error: error.clone(),
                    });
                    execution.clone()
                };
                self.persist(&snapshot).await;

                if let Some(e) = error {
                    warn!("Step {} failed: {}", step.id, e);
                }
                queue.extend(next);
            }
        }
        .boxed()
    }

    async fn execute_step(&self, run: &RunContext, step: &WorkflowStep) -> StepOutcome {
        match &step.kind {
            StepKind::Job {
                job_type,
                device_id,
                metadata,
            } => self.submit_job(run, step, job_type, device_id, metadata).await,

            StepKind::Condition {
                expression,
                else_steps,
            } => {
                let scope = json!({
                    "context": run.execution.lock().await.context.clone(),
                    "result": Value::Null,
                });
                match condition::evaluate(expression, &scope) {
                    Ok(true) => StepOutcome::Done {
                        result: json!({ "value": true }),
                        next: step.next_steps.clone(),
                    },
                    Ok(false) => StepOutcome::Done {
                        result: json!({ "value": false }),
                        next: else_steps.clone(),
                    },
                    Err(e) => StepOutcome::Failed(e.to_string()),
                }
            }

            StepKind::Parallel { branches } => {
                debug!("Step {} fanning out to {} branches", step.id, branches.len());
                join_all(
                    branches
                        .iter()
                        .map(|branch| self.run_from(run, vec![branch.clone()])),
                )
                .await;

                if run.is_cancelled() {
                    return StepOutcome::Cancelled;
                }
                StepOutcome::Done {
                    result: json!({ "branches": branches }),
                    next: step.next_steps.clone(),
                }
            }

            StepKind::Delay { duration_ms } => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(*duration_ms)) => StepOutcome::Done {
                        result: json!({ "slept_ms": duration_ms }),
                        next: step.next_steps.clone(),
                    },
                    _ = run.cancelled() => StepOutcome::Cancelled,
                }
            }
        }
    }

    async fn submit_job(
        &self,
        run: &RunContext,
        step: &WorkflowStep,
        job_type: &str,
        device_id: &Option<String>,
        metadata: &Value,
    ) -> StepOutcome {
        let run_id = run.execution.lock().await.id.clone();
        let submission = JobSubmission {
            job_type: job_type.to_string(),
            run_id: run_id.clone(),
            device_id: device_id.clone(),
            metadata: metadata.clone(),
        };

        let job_id = match self.job_queue.submit(submission).await {
            Ok(id) => id,
            Err(e) => return StepOutcome::Failed(format!("job submission failed: {}", e)),
        };
        run.execution.lock().await.job_ids.push(job_id.clone());
        debug!("Step {} submitted {} job {}", step.id, job_type, job_id);

        // a cancel racing the submission must not leave the job queued
        if run.is_cancelled() {
            if let Err(e) = self
                .job_queue
                .cancel_run(&run_id, WORKFLOW_CANCEL_MESSAGE)
                .await
            {
                warn!("Failed to cancel jobs of {}: {}", run_id, e);
            }
        }

        StepOutcome::Done {
            result: json!({ "job_id": job_id, "job_type": job_type }),
            next: step.next_steps.clone(),
        }
    }

    async fn guard_allows(
        &self,
        run: &RunContext,
        step: &WorkflowStep,
        result: &Value,
    ) -> Result<bool, ConductorError> {
        let Some(expression) = &step.condition else {
            return Ok(true);
        };
        let scope = json!({
            "context": run.execution.lock().await.context.clone(),
            "result": result,
        });
        Ok(condition::evaluate(expression, &scope)?)
    }

    async fn persist(&self, execution: &WorkflowExecution) {
        if let Err(e) = self.store.save_execution(execution).await {
            warn!("Failed to persist execution {}: {}", execution.id, e);
        }
    }
}
