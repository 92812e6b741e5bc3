//! Orchestration plan generation

pub mod generator;
pub mod inventory;
pub mod models;

pub use generator::{PlanGenerator, PlannerOptions};
pub use inventory::{CheckReport, InventoryProvider, StaticInventory};
pub use models::{
    AuditEvent, Criticality, DeviceRecord, FirmwarePackage, Inventory, OrchestrationPlan,
    PlanKind, PlanStatus,
};
