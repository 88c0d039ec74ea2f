use thiserror::Error;

/// Top-level error type for the `syncpulse-api` crate.
///
/// Covers every failure mode across both transports: authentication,
/// request/ack exchanges on the duplex session, push-stream setup, and
/// payload decoding. `syncpulse-core` maps these into domain-facing
/// variants.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Credential rejected by the store (invalid or revoked token).
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// The store revoked the session's authentication mid-flight.
    #[error("Session authentication revoked by the store")]
    AuthRevoked,

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// WebSocket connection or handshake failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// The duplex session ended while a request was still in flight.
    #[error("Session closed")]
    SessionClosed,

    /// A request/ack exchange exceeded the configured timeout.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// A push stream could not be opened (non-auth HTTP failure).
    #[error("Push stream failed (HTTP {status}): {message}")]
    Stream { status: u16, message: String },

    // ── Store-level failures ────────────────────────────────────────
    /// The store rejected an operation (negative ack).
    #[error("Store rejected the request: {message}")]
    Store {
        message: String,
        code: Option<String>,
    },

    /// A one-shot read found nothing at the requested path.
    #[error("No data at {path}")]
    NoData { path: String },

    /// A write was not acknowledged.
    #[error("Write failed: {message}")]
    Write { message: String },

    // ── Data ────────────────────────────────────────────────────────
    /// Payload decoding failed.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String },
}

impl Error {
    /// Returns `true` if this error means the credential is no longer
    /// usable and the owning session should be treated as disconnected.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::Authentication { .. } | Self::AuthRevoked)
    }

    /// Returns `true` if this is a transient fault worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } | Self::WebSocketConnect(_) => true,
            Self::Stream { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
