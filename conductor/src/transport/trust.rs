//! TLS trust configuration for management endpoints

use std::io::Cursor;
use std::path::PathBuf;

use reqwest::{Certificate, ClientBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::ProtocolError;

/// Which certificates a device connection trusts
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TrustConfig {
    /// Platform certificate store
    #[default]
    System,

    /// Only the given CA bundle, read from `path` or inline `pem` text
    CaBundle {
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default)]
        pem: Option<String>,
    },

    /// Accept any certificate. Management controllers commonly ship self-signed
    /// certificates; this mode must be selected explicitly.
    TrustAll,
}

impl TrustConfig {
    /// Apply this trust configuration to a client builder
    pub fn apply(&self, builder: ClientBuilder) -> Result<ClientBuilder, ProtocolError> {
        match self {
            TrustConfig::System => {
                let native = rustls_native_certs::load_native_certs().unwrap_or_default();
                if native.is_empty() {
                    warn!("No platform certificates found, using bundled roots");
                    return Ok(builder);
                }

                let mut builder = builder.tls_built_in_root_certs(false);
                let mut added = 0usize;
                for cert in native {
                    if let Ok(cert) = Certificate::from_der(cert.as_ref()) {
                        builder = builder.add_root_certificate(cert);
                        added += 1;
                    }
                }
                debug!("Loaded {} platform root certificates", added);
                Ok(builder)
            }
            TrustConfig::CaBundle { path, pem } => {
                let certs = load_bundle(path.as_ref(), pem.as_deref())?;
                let mut builder = builder.tls_built_in_root_certs(false);
                for cert in certs {
                    builder = builder.add_root_certificate(cert);
                }
                Ok(builder)
            }
            TrustConfig::TrustAll => {
                warn!("Certificate verification disabled for management endpoints");
                Ok(builder.danger_accept_invalid_certs(true))
            }
        }
    }
}

fn load_bundle(path: Option<&PathBuf>, pem: Option<&str>) -> Result<Vec<Certificate>, ProtocolError> {
    let pem_bytes = match (pem, path) {
        (Some(pem), _) => pem.as_bytes().to_vec(),
        (None, Some(path)) => std::fs::read(path).map_err(|e| {
            ProtocolError::Transport(format!("Failed to read CA bundle {}: {}", path.display(), e))
        })?,
        (None, None) => {
            return Err(ProtocolError::Transport(
                "CA bundle trust requires a path or PEM text".to_string(),
            ))
        }
    };

    let mut cursor = Cursor::new(pem_bytes);
    let mut certs = Vec::new();
    for cert in rustls_pemfile::certs(&mut cursor) {
        let cert = cert
            .map_err(|e| ProtocolError::Transport(format!("Invalid PEM in CA bundle: {}", e)))?;
        let cert = Certificate::from_der(cert.as_ref())
            .map_err(|e| ProtocolError::Transport(format!("Invalid certificate: {}", e)))?;
        certs.push(cert);
    }

    if certs.is_empty() {
        return Err(ProtocolError::Transport(
            "CA bundle contains no certificates".to_string(),
        ));
    }
    Ok(certs)
}
