//! Plan scheduler

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::errors::ConductorError;
use crate::store::RecordStore;
use crate::workflow::WorkflowEngine;

/// Scheduler options
#[derive(Debug, Clone)]
pub struct Options {
    /// How often stored plans are checked
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Launch every active plan whose execution date has passed.
///
/// Each launched plan's next execution date moves forward by its recurrence
/// interval before the plan is saved again. Returns the execution ids.
pub async fn launch_due(
    engine: &Arc<WorkflowEngine>,
    store: &dyn RecordStore,
    now: DateTime<Utc>,
) -> Result<Vec<String>, ConductorError> {
    let mut launched = Vec::new();

    for mut plan in store.list_plans().await? {
        if !plan.is_active() || plan.next_execution_date > now {
            continue;
        }

        match engine
            .launch(&plan.workflow, plan.execution_context())
            .await
        {
            Ok(execution_id) => {
                info!("Launched plan {} as execution {}", plan.id, execution_id);
                launched.push(execution_id);
            }
            Err(e) => error!("Failed to launch plan {}: {}", plan.id, e),
        }

        plan.advance_schedule(now);
        store.save_plan(&plan).await?;
    }
    Ok(launched)
}

/// Run the scheduler until shutdown
pub async fn run<S, F>(
    options: &Options,
    engine: Arc<WorkflowEngine>,
    store: Arc<dyn RecordStore>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Scheduler starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Scheduler shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        if let Err(e) = launch_due(&engine, store.as_ref(), Utc::now()).await {
            error!("Failed to check plan schedule: {}", e);
        }
    }
}
