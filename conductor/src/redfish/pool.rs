//! Per-device client cache

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::ProtocolError;
use crate::redfish::client::{DeviceTarget, RedfishClient, RedfishOptions};
use crate::transport::factory::ClientFactory;

/// Keeps one client, and therefore one session, per device
pub struct ClientPool {
    factory: Arc<ClientFactory>,
    options: RedfishOptions,
    clients: RwLock<HashMap<String, Arc<RedfishClient>>>,
}

impl ClientPool {
    pub fn new(factory: Arc<ClientFactory>, options: RedfishOptions) -> Self {
        Self {
            factory,
            options,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &RedfishOptions {
        &self.options
    }

    /// Get the client for `device_id`, replacing it if the address changed
    pub async fn client_for(
        &self,
        device_id: &str,
        target: &DeviceTarget,
    ) -> Result<Arc<RedfishClient>, ProtocolError> {
        let base_url = target.base_url()?;
        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(device_id) {
                if client.base_url() == &base_url {
                    return Ok(client.clone());
                }
            }
        }

        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get(device_id) {
            if client.base_url() == &base_url {
                return Ok(client.clone());
            }
        }

        let client = Arc::new(RedfishClient::connect(
            &self.factory,
            target.clone(),
            self.options.clone(),
        )?);
        let previous = clients.insert(device_id.to_string(), client.clone());
        drop(clients);

        if let Some(previous) = previous {
            debug!("Device {} moved to {}, replacing client", device_id, base_url);
            previous.close().await;
        }
        Ok(client)
    }

    /// Close and forget the client for `device_id`
    pub async fn evict(&self, device_id: &str) {
        let removed = self.clients.write().await.remove(device_id);
        if let Some(client) = removed {
            client.close().await;
        }
    }

    /// Close every session
    pub async fn close_all(&self) {
        let clients: Vec<_> = self.clients.write().await.drain().map(|(_, c)| c).collect();
        for client in clients {
            client.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
