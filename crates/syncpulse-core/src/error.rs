// ── Core error types ──
//
// Domain-facing errors from syncpulse-core. Consumers never see raw
// transport errors; the `From<syncpulse_api::Error>` impl translates them
// into domain-appropriate variants.

use thiserror::Error;

use crate::model::EntityKind;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Tick errors ──────────────────────────────────────────────────
    /// The store snapshot was absent. Aborts the current tick only.
    #[error("No data in the store snapshot")]
    NoData,

    /// The target collection was empty. Aborts the current tick only.
    #[error("No {kind} entities to update")]
    NoEntities { kind: EntityKind },

    /// The chosen entity does not carry the monitored property.
    #[error("Entity {id} has no {property} property")]
    MissingProperty { id: String, property: String },

    // ── Operation errors ─────────────────────────────────────────────
    #[error("Store operation failed: {message}")]
    OperationFailed { message: String },
}

impl CoreError {
    /// Returns `true` if this failure means the credential is unusable
    /// and the owning worker must signal `disconnected`.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthenticationFailed { .. })
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<syncpulse_api::Error> for CoreError {
    fn from(err: syncpulse_api::Error) -> Self {
        match err {
            syncpulse_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            syncpulse_api::Error::AuthRevoked => CoreError::AuthenticationFailed {
                message: "session authentication revoked".into(),
            },
            syncpulse_api::Error::Transport(e) => CoreError::ConnectionFailed {
                reason: e.to_string(),
            },
            syncpulse_api::Error::InvalidUrl(e) => CoreError::ConnectionFailed {
                reason: format!("invalid URL: {e}"),
            },
            syncpulse_api::Error::WebSocketConnect(reason) => {
                CoreError::ConnectionFailed { reason }
            }
            syncpulse_api::Error::SessionClosed => CoreError::ConnectionFailed {
                reason: "session closed".into(),
            },
            syncpulse_api::Error::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            syncpulse_api::Error::Stream { status, message } => CoreError::ConnectionFailed {
                reason: format!("{message} (HTTP {status})"),
            },
            syncpulse_api::Error::NoData { .. } => CoreError::NoData,
            syncpulse_api::Error::Store { message, .. }
            | syncpulse_api::Error::Write { message }
            | syncpulse_api::Error::Deserialization { message } => {
                CoreError::OperationFailed { message }
            }
        }
    }
}
