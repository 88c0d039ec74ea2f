// ── Privileged admin session ──
//
// Wraps one duplex session authenticated with the master token. The
// orchestrator authenticates lazily on the first tick and reuses the
// session for every subsequent read and write.

use syncpulse_api::{AuthState, DuplexSession};

use crate::error::CoreError;
use crate::model::AccessToken;
use crate::transport::AdminStore;

#[derive(Clone)]
pub struct AdminSession {
    session: DuplexSession,
    master_token: AccessToken,
}

impl AdminSession {
    pub fn new(session: DuplexSession, master_token: AccessToken) -> Self {
        Self { session, master_token }
    }

    /// De-authenticate and close the underlying session. Best-effort;
    /// called once during process shutdown.
    pub async fn shutdown(&self) {
        if let Err(e) = self.session.unauthenticate().await {
            tracing::debug!(error = %e, "unauthenticate on shutdown failed");
        }
        self.session.close().await;
    }
}

impl AdminStore for AdminSession {
    async fn ensure_authenticated(&self) -> Result<(), CoreError> {
        if *self.session.auth_state().borrow() == AuthState::Authenticated {
            return Ok(());
        }
        self.session
            .authenticate(self.master_token.secret())
            .await
            .map_err(|e| CoreError::AuthenticationFailed { message: e.to_string() })?;
        tracing::info!(token = %self.master_token, "authenticated master client");
        Ok(())
    }

    async fn read_root(&self) -> Result<serde_json::Value, CoreError> {
        self.session.read_once("/").await.map_err(CoreError::from)
    }

    async fn write(&self, path: &str, data: serde_json::Value) -> Result<(), CoreError> {
        self.session.write(path, data).await.map_err(CoreError::from)
    }
}
