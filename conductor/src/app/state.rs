//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::AppOptions;
use crate::authn::CredentialProvider;
use crate::errors::ConductorError;
use crate::jobs::{JobQueue, MemoryJobQueue};
use crate::planner::{InventoryProvider, PlanGenerator};
use crate::redfish::ClientPool;
use crate::store::{JsonFileStore, RecordStore};
use crate::transport::ClientFactory;
use crate::workers::Dispatcher;
use crate::workflow::WorkflowEngine;

/// Main application state
pub struct AppState {
    /// Plans, audit events and executions
    pub store: Arc<dyn RecordStore>,

    /// Jobs submitted by running workflows
    pub job_queue: Arc<dyn JobQueue>,

    /// Per-device protocol clients
    pub pool: Arc<ClientPool>,

    pub engine: Arc<WorkflowEngine>,

    pub planner: Arc<PlanGenerator>,

    pub dispatcher: Arc<Dispatcher>,

    pub inventory: Arc<dyn InventoryProvider>,
}

impl AppState {
    /// Initialize application state on top of the JSON file store
    pub async fn init(
        options: &AppOptions,
        credentials: Arc<dyn CredentialProvider>,
        inventory: Arc<dyn InventoryProvider>,
    ) -> Result<Self, ConductorError> {
        info!("Initializing application state...");

        let store = JsonFileStore::new(options.layout.clone());
        store.setup().await?;

        Ok(Self::with_store(options, Arc::new(store), credentials, inventory))
    }

    /// Wire the components around an existing record store
    pub fn with_store(
        options: &AppOptions,
        store: Arc<dyn RecordStore>,
        credentials: Arc<dyn CredentialProvider>,
        inventory: Arc<dyn InventoryProvider>,
    ) -> Self {
        let job_queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());
        let pool = Arc::new(ClientPool::new(
            Arc::new(ClientFactory::new()),
            options.redfish.clone(),
        ));
        let engine = Arc::new(WorkflowEngine::new(job_queue.clone(), store.clone()));
        let planner = Arc::new(PlanGenerator::new(options.planner.clone(), store.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            options.dispatcher.clone(),
            job_queue.clone(),
            pool.clone(),
            credentials,
            inventory.clone(),
        ));

        Self {
            store,
            job_queue,
            pool,
            engine,
            planner,
            dispatcher,
            inventory,
        }
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), ConductorError> {
        info!("Shutting down application state...");
        self.pool.close_all().await;
        Ok(())
    }
}
