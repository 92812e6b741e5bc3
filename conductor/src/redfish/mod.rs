//! Redfish protocol client

pub mod client;
pub mod jobs;
pub mod payload;
pub mod pool;
pub mod retry;
pub mod session;
pub mod update;

pub use client::{DeviceCredentials, DeviceTarget, RedfishClient, RedfishOptions};
pub use jobs::JobState;
pub use pool::ClientPool;
pub use retry::RetryPolicy;
pub use session::AuthMode;
pub use update::{ApplyTimePolicy, UpdateOutcome, UpdatePayload, UpdateRequest, UpdateSpec};
