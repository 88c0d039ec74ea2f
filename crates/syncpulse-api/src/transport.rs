// Shared transport configuration for building reqwest::Client instances.
//
// The push client and any future HTTP surface share TLS and timeout
// settings through this module, avoiding duplicated builder logic.

use std::path::PathBuf;
use std::time::Duration;

/// TLS verification mode for store connections.
#[derive(Debug, Clone)]
pub enum TlsMode {
    /// Use the system certificate store.
    System,
    /// Use a custom CA certificate from the given PEM file.
    CustomCa(PathBuf),
    /// Accept any certificate (for self-hosted stores with self-signed certs).
    DangerAcceptInvalid,
}

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tls: TlsMode,
    /// Applies to request/ack exchanges and push-stream setup, not to the
    /// lifetime of an established stream.
    pub timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsMode::System,
            timeout: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    ///
    /// The connect timeout comes from `self.timeout`; no overall request
    /// timeout is set because push streams are long-lived by design.
    pub fn build_client(&self) -> Result<reqwest::Client, crate::error::Error> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.timeout)
            .user_agent(concat!("syncpulse/", env!("CARGO_PKG_VERSION")));

        match &self.tls {
            TlsMode::System => {}
            TlsMode::CustomCa(path) => {
                let cert_pem = std::fs::read(path).map_err(|e| {
                    crate::error::Error::Deserialization {
                        message: format!("failed to read CA cert: {e}"),
                    }
                })?;
                let cert = reqwest::Certificate::from_pem(&cert_pem).map_err(|e| {
                    crate::error::Error::Deserialization {
                        message: format!("invalid CA cert: {e}"),
                    }
                })?;
                builder = builder.add_root_certificate(cert);
            }
            TlsMode::DangerAcceptInvalid => {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        builder.build().map_err(crate::error::Error::Transport)
    }
}
