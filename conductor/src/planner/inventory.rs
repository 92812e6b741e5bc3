//! Inventory collaborator

use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ConductorError;
use crate::filesys::file::File;
use crate::planner::models::Inventory;

/// Result of a group safety check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckReport {
    pub check: String,
    pub passed: bool,

    /// Devices that failed, with reasons
    pub failures: Vec<String>,
}

/// Source of fleet snapshots and non-protocol safety checks
#[async_trait]
pub trait InventoryProvider: Send + Sync {
    async fn snapshot(&self) -> Result<Inventory, ConductorError>;

    async fn run_check(
        &self,
        check: &str,
        device_ids: &[String],
    ) -> Result<CheckReport, ConductorError>;
}

/// Inventory held in memory, typically loaded from a JSON file.
///
/// Checks read each device's `health` map; unlisted checks pass.
pub struct StaticInventory {
    inventory: RwLock<Inventory>,
}

impl StaticInventory {
    pub fn new(inventory: Inventory) -> Self {
        Self {
            inventory: RwLock::new(inventory),
        }
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ConductorError> {
        let inventory = File::new(path.as_ref()).read_json::<Inventory>().await?;
        Ok(Self::new(inventory))
    }

    pub fn replace(&self, inventory: Inventory) {
        let mut current = self.inventory.write().unwrap_or_else(|e| e.into_inner());
        *current = inventory;
    }
}

#[async_trait]
impl InventoryProvider for StaticInventory {
    async fn snapshot(&self) -> Result<Inventory, ConductorError> {
        let inventory = self.inventory.read().unwrap_or_else(|e| e.into_inner());
        Ok(inventory.clone())
    }

    async fn run_check(
        &self,
        check: &str,
        device_ids: &[String],
    ) -> Result<CheckReport, ConductorError> {
        let inventory = self.inventory.read().unwrap_or_else(|e| e.into_inner());
        let failures: Vec<String> = device_ids
            .iter()
            .filter_map(|id| match inventory.device(id) {
                None => Some(format!("{}: unknown device", id)),
                Some(device) if device.health.get(check) == Some(&false) => {
                    Some(format!("{}: {} failed", id, check))
                }
                Some(_) => None,
            })
            .collect();

        Ok(CheckReport {
            check: check.to_string(),
            passed: failures.is_empty(),
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::models::DeviceRecord;

    #[tokio::test]
    async fn test_checks_read_health_flags() {
        let mut healthy = DeviceRecord {
            id: "a".to_string(),
            name: "A".to_string(),
            address: "10.0.0.1".to_string(),
            model: None,
            cluster: None,
            environment: None,
            last_update: None,
            service_tag: None,
            health: Default::default(),
        };
        let mut degraded = healthy.clone();
        degraded.id = "b".to_string();
        degraded.health.insert("disk_space".to_string(), false);
        healthy.health.insert("disk_space".to_string(), true);

        let provider = StaticInventory::new(Inventory {
            devices: vec![healthy, degraded],
            packages: vec![],
        });

        let ids = vec!["a".to_string(), "b".to_string()];
        let report = provider.run_check("disk_space", &ids).await.unwrap();
        assert!(!report.passed);
        assert_eq!(report.failures, vec!["b: disk_space failed"]);

        assert!(provider.run_check("ha_status", &ids).await.unwrap().passed);
        assert!(!provider.run_check("ha_status", &["zz".to_string()]).await.unwrap().passed);
    }
}
