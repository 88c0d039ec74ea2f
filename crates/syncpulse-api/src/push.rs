//! Per-path push streams.
//!
//! The push transport opens one independent long-lived HTTP stream per
//! watched path. The store answers with newline-delimited JSON events;
//! every `put` carries the full subtree snapshot for that path, so
//! consumers reconcile against the whole set rather than applying deltas.
//!
//! Authorization is carried per stream (`auth` query parameter); a 401/403
//! on open maps to [`Error::Authentication`], and a mid-stream revocation
//! arrives as an `auth_revoked` event line.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;

const EVENT_CHANNEL_CAPACITY: usize = 64;

// ── PushEvent ────────────────────────────────────────────────────────

/// One event line from a push stream.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PushEvent {
    /// Event name: `put`, `keep-alive`, `auth_revoked`, ...
    pub event: String,

    /// Path the event applies to, relative to the stream root.
    #[serde(default)]
    pub path: Option<String>,

    /// Full subtree snapshot for `put` events.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl PushEvent {
    pub fn is_put(&self) -> bool {
        self.event == "put"
    }

    pub fn is_auth_revoked(&self) -> bool {
        self.event == "auth_revoked"
    }
}

// ── PushStream ───────────────────────────────────────────────────────

/// A live push stream for one path.
///
/// Dropping the stream (or calling [`close`](Self::close)) tears down the
/// underlying HTTP connection; both are idempotent.
pub struct PushStream {
    pub events: mpsc::Receiver<PushEvent>,
    cancel: CancellationToken,
}

impl PushStream {
    /// Receive the next event, or `None` once the stream has ended.
    pub async fn next_event(&mut self) -> Option<PushEvent> {
        self.events.recv().await
    }

    /// Close the stream. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PushStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── PushClient ───────────────────────────────────────────────────────

/// Factory for push streams against one store root address.
#[derive(Clone)]
pub struct PushClient {
    http: reqwest::Client,
    base: Url,
}

impl PushClient {
    pub fn new(base: Url, transport: &TransportConfig) -> Result<Self, Error> {
        Ok(Self {
            http: transport.build_client()?,
            base,
        })
    }

    /// The store root address this client targets.
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Open a long-lived stream on `path`, authorized by `token`.
    ///
    /// Returns once the store has accepted the stream; events arrive on
    /// the returned [`PushStream`]. No retry happens here -- callers decide
    /// whether and when to reconnect.
    pub async fn open_stream(&self, path: &str, token: &str) -> Result<PushStream, Error> {
        let url = self.stream_url(path, token);
        tracing::debug!(path, "opening push stream");

        let response = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, "application/x-ndjson")
            .send()
            .await
            .map_err(Error::Transport)?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(Error::Authentication {
                message: format!("push stream on {path} rejected (HTTP {})", status.as_u16()),
            });
        }
        if !status.is_success() {
            return Err(Error::Stream {
                status: status.as_u16(),
                message: format!("push stream on {path} failed"),
            });
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        tokio::spawn(stream_loop(response, tx, cancel.clone()));

        Ok(PushStream { events: rx, cancel })
    }

    /// `{base}{path}.json?auth={token}&stream=ndjson`
    fn stream_url(&self, path: &str, token: &str) -> Url {
        let mut url = self.base.clone();
        url.set_path(&format!("{}.json", path.trim_end_matches('/')));
        url.query_pairs_mut()
            .append_pair("auth", token)
            .append_pair("stream", "ndjson");
        url
    }
}

// ── Body reading ─────────────────────────────────────────────────────

/// Read the chunked body, reassemble lines, and forward parsed events
/// until the connection ends or the stream handle is dropped.
async fn stream_loop(
    response: reqwest::Response,
    tx: mpsc::Sender<PushEvent>,
    cancel: CancellationToken,
) {
    let mut body = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            chunk = body.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        buf.extend_from_slice(&bytes);
                        if !drain_lines(&mut buf, &tx).await {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "push stream read error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    tracing::debug!("push stream loop exiting");
}

/// Parse and forward every complete line in `buf`.
///
/// Returns `false` when the consumer is gone and reading should stop.
async fn drain_lines(buf: &mut Vec<u8>, tx: &mpsc::Sender<PushEvent>) -> bool {
    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buf.drain(..=pos).collect();
        let line = trim_line(&line);
        if line.is_empty() {
            continue;
        }

        match serde_json::from_slice::<PushEvent>(line) {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    return false;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "unparseable push stream line");
            }
        }
    }
    true
}

fn trim_line(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |p| p + 1);
    &line[..end]
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn put_event_parses() {
        let event: PushEvent = serde_json::from_str(
            r#"{"event":"put","path":"/","data":{"t1":{"target_temperature_f":70}}}"#,
        )
        .unwrap();
        assert!(event.is_put());
        assert_eq!(event.path.as_deref(), Some("/"));
        assert!(event.data.is_some());
    }

    #[test]
    fn keep_alive_is_not_put() {
        let event: PushEvent = serde_json::from_str(r#"{"event":"keep-alive"}"#).unwrap();
        assert!(!event.is_put());
        assert!(!event.is_auth_revoked());
    }

    #[test]
    fn trim_line_strips_trailing_whitespace() {
        assert_eq!(trim_line(b"abc\r\n"), b"abc");
        assert_eq!(trim_line(b"  \r\n"), b"");
    }
}
