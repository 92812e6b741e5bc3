//! HTTP client factory with per-configuration caching

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::ProtocolError;
use crate::transport::trust::TrustConfig;
use crate::utils::sha256_hash;

/// Connection settings shared by all requests to management endpoints
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub trust: TrustConfig,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
            trust: TrustConfig::default(),
        }
    }
}

impl TransportOptions {
    /// Stable fingerprint identifying an equivalent client configuration
    pub fn fingerprint(&self) -> String {
        // serde_json output of this struct is deterministic (no maps)
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        sha256_hash(&encoded)
    }
}

/// Builds HTTP clients and reuses them for identical transport options.
///
/// The cache is owned by the factory; callers that want sharing pass the same
/// factory around.
#[derive(Default)]
pub struct ClientFactory {
    clients: RwLock<HashMap<String, Client>>,
    payload_clients: RwLock<HashMap<Duration, Client>>,
}

impl ClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or build a client for the given options
    pub fn client(&self, options: &TransportOptions) -> Result<Client, ProtocolError> {
        let key = options.fingerprint();

        {
            let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
            if let Some(client) = clients.get(&key) {
                return Ok(client.clone());
            }
        }

        let builder = Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(options.request_timeout)
            .redirect(reqwest::redirect::Policy::none());
        let client = options.trust.apply(builder)?.build()?;

        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        let client = clients.entry(key.clone()).or_insert(client).clone();
        debug!("Transport client ready ({})", &key[..12]);
        Ok(client)
    }

    /// Get or build the client used to fetch firmware payloads.
    ///
    /// Payload hosts are not management endpoints: redirects are followed,
    /// the platform trust store applies and only connecting is time-bounded.
    pub fn payload_client(&self, connect_timeout: Duration) -> Result<Client, ProtocolError> {
        {
            let clients = self.payload_clients.read().unwrap_or_else(|e| e.into_inner());
            if let Some(client) = clients.get(&connect_timeout) {
                return Ok(client.clone());
            }
        }

        let builder = Client::builder().connect_timeout(connect_timeout);
        let client = TrustConfig::System.apply(builder)?.build()?;

        let mut clients = self.payload_clients.write().unwrap_or_else(|e| e.into_inner());
        Ok(clients.entry(connect_timeout).or_insert(client).clone())
    }

    /// Number of distinct cached configurations
    pub fn len(&self) -> usize {
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
