//! fwconductor library
//!
//! Firmware update orchestration for Redfish management controllers: the
//! device protocol client, the workflow engine and the plan generator.

pub mod app;
pub mod authn;
pub mod errors;
pub mod filesys;
pub mod jobs;
pub mod logs;
pub mod planner;
pub mod redfish;
pub mod server;
pub mod storage;
pub mod store;
pub mod transport;
pub mod utils;
pub mod workers;
pub mod workflow;
