//! Main application run loop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::ConductorError;
use crate::jobs::JobRecord;
use crate::planner::OrchestrationPlan;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::{dispatcher, scheduler};
use crate::workflow::WorkflowExecution;

/// Interval at which a foreground run checks its jobs
const RUN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Run the dispatcher, scheduler and status server until `shutdown_signal`
pub async fn run(
    options: AppOptions,
    app_state: Arc<AppState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ConductorError> {
    info!("Starting fwconductor...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());
    shutdown_manager.with_app_state(app_state.clone())?;

    if let Err(e) = init(&options, app_state, &shutdown_tx, &mut shutdown_manager).await {
        error!("Failed to start: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

/// Generate plans from the current inventory and persist them
pub async fn generate_plans(app_state: &AppState) -> Result<Vec<OrchestrationPlan>, ConductorError> {
    let inventory = app_state.inventory.snapshot().await?;
    info!(
        "Planning for {} devices and {} packages",
        inventory.devices.len(),
        inventory.packages.len()
    );
    app_state
        .planner
        .generate_and_install(&inventory, Utc::now())
        .await
}

/// Outcome of a foreground plan run
#[derive(Debug, Clone, Serialize)]
pub struct PlanRun {
    pub execution: WorkflowExecution,
    pub jobs: Vec<JobRecord>,
}

/// Execute a stored plan (or its rollback steps) in the foreground.
///
/// The dispatcher runs alongside until every job of the execution is
/// terminal.
pub async fn run_plan(
    app_state: Arc<AppState>,
    plan_id: &str,
    rollback: bool,
) -> Result<PlanRun, ConductorError> {
    let plan = app_state
        .store
        .get_plan(plan_id)
        .await?
        .ok_or_else(|| ConductorError::NotFound(format!("plan {}", plan_id)))?;

    let template = if rollback {
        plan.rollback_template()
    } else {
        plan.workflow.clone()
    };
    info!("Running {} of plan {}", template.name, plan.id);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let dispatcher_handle = spawn_dispatcher(app_state.clone(), shutdown_rx);

    let result: Result<PlanRun, ConductorError> = async {
        let execution = app_state
            .engine
            .execute(&template, plan.execution_context())
            .await?;
        let jobs = wait_for_jobs(&app_state, &execution.id).await?;
        Ok(PlanRun { execution, jobs })
    }
    .await;

    let _ = shutdown_tx.send(());
    dispatcher_handle
        .await
        .map_err(|e| ConductorError::ShutdownError(e.to_string()))?;
    app_state.shutdown().await?;
    result
}

async fn wait_for_jobs(app_state: &AppState, run_id: &str) -> Result<Vec<JobRecord>, ConductorError> {
    loop {
        let jobs = app_state.job_queue.jobs_for_run(run_id).await?;
        let pending = jobs.iter().filter(|job| !job.status.is_terminal()).count();
        if pending == 0 {
            return Ok(jobs);
        }
        info!("Waiting for {} of {} jobs", pending, jobs.len());
        tokio::time::sleep(RUN_POLL_INTERVAL).await;
    }
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_tx: &broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), ConductorError> {
    init_dispatcher_worker(app_state.clone(), shutdown_manager, shutdown_tx.subscribe())?;

    init_scheduler_worker(
        options.scheduler.clone(),
        app_state.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    if options.enable_server {
        init_server(options, app_state, shutdown_manager, shutdown_tx.subscribe()).await?;
    }
    Ok(())
}

fn spawn_dispatcher(
    app_state: Arc<AppState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let dispatcher = app_state.dispatcher.clone();
    tokio::spawn(async move {
        dispatcher::run(
            dispatcher,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    })
}

fn init_dispatcher_worker(
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ConductorError> {
    info!("Initializing dispatcher...");
    let handle = spawn_dispatcher(app_state, shutdown_rx);
    shutdown_manager.with_dispatcher_handle(handle)
}

fn init_scheduler_worker(
    options: scheduler::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ConductorError> {
    info!("Initializing scheduler...");

    let engine = app_state.engine.clone();
    let store = app_state.store.clone();

    let handle = tokio::spawn(async move {
        scheduler::run(
            &options,
            engine,
            store,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_scheduler_handle(handle)
}

async fn init_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ConductorError> {
    info!("Initializing local HTTP server...");

    let server_state = ServerState::new(app_state.engine.clone(), app_state.store.clone());

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    server_handle: Option<JoinHandle<Result<(), ConductorError>>>,
    dispatcher_handle: Option<JoinHandle<()>>,
    scheduler_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            server_handle: None,
            dispatcher_handle: None,
            scheduler_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), ConductorError> {
        if self.app_state.is_some() {
            return Err(ConductorError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_dispatcher_handle(&mut self, handle: JoinHandle<()>) -> Result<(), ConductorError> {
        if self.dispatcher_handle.is_some() {
            return Err(ConductorError::ShutdownError("dispatcher_handle already set".to_string()));
        }
        self.dispatcher_handle = Some(handle);
        Ok(())
    }

    pub fn with_scheduler_handle(&mut self, handle: JoinHandle<()>) -> Result<(), ConductorError> {
        if self.scheduler_handle.is_some() {
            return Err(ConductorError::ShutdownError("scheduler_handle already set".to_string()));
        }
        self.scheduler_handle = Some(handle);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), ConductorError>>,
    ) -> Result<(), ConductorError> {
        if self.server_handle.is_some() {
            return Err(ConductorError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ConductorError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), ConductorError> {
        info!("Shutting down fwconductor...");

        // 1. Scheduler, so no new executions start
        if let Some(handle) = self.scheduler_handle.take() {
            handle.await.map_err(|e| ConductorError::ShutdownError(e.to_string()))?;
        }

        // 2. Server
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| ConductorError::ShutdownError(e.to_string()))??;
        }

        // 3. Dispatcher, which drains running jobs
        if let Some(handle) = self.dispatcher_handle.take() {
            handle.await.map_err(|e| ConductorError::ShutdownError(e.to_string()))?;
        }

        // 4. App state
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
