//! Server state

use std::sync::Arc;

use crate::store::RecordStore;
use crate::workflow::WorkflowEngine;

/// Server state shared across handlers
pub struct ServerState {
    pub engine: Arc<WorkflowEngine>,
    pub store: Arc<dyn RecordStore>,
}

impl ServerState {
    pub fn new(engine: Arc<WorkflowEngine>, store: Arc<dyn RecordStore>) -> Self {
        Self { engine, store }
    }
}
