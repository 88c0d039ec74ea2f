//! Persistent duplex session over WebSocket.
//!
//! One connection carries everything: the auth handshake, one-shot queries,
//! writes, and any number of concurrent subscriptions. Client frames carry
//! a request id; the background read loop routes acks back to the waiting
//! caller and fans subscription events out to per-subscription channels.
//!
//! # Example
//!
//! ```rust,ignore
//! use syncpulse_api::{DuplexSession, EventKind, TransportConfig};
//! use url::Url;
//!
//! let url = Url::parse("wss://store.example.net/session")?;
//! let session = DuplexSession::connect(&url, &TransportConfig::default()).await?;
//! session.authenticate("c.token-value").await?;
//!
//! let mut sub = session.subscribe("/devices/thermostats", EventKind::ChildAdded).await?;
//! while let Some(event) = sub.events.recv().await {
//!     println!("added: {:?}", event.key);
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;
use crate::wire::{ClientFrame, EventKind, ServerFrame, StoreEvent};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

// ── Channel capacities ───────────────────────────────────────────────

const SUBSCRIPTION_CHANNEL_CAPACITY: usize = 256;

// ── AuthState ────────────────────────────────────────────────────────

/// Authentication state of a duplex session, observable via `watch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
    /// The store revoked the credential mid-session. Terminal.
    Revoked,
}

// ── Subscription ─────────────────────────────────────────────────────

/// A live subscription on the duplex session.
///
/// Dropping the receiver does NOT release the store-side watch; call
/// [`DuplexSession::unsubscribe`] with `id` to release it exactly once.
pub struct Subscription {
    pub id: u64,
    pub events: mpsc::Receiver<StoreEvent>,
}

// ── Ack (internal) ───────────────────────────────────────────────────

#[derive(Debug)]
struct Ack {
    ok: bool,
    sub: Option<u64>,
    data: Option<serde_json::Value>,
    error: Option<String>,
    code: Option<String>,
}

// ── DuplexSession ────────────────────────────────────────────────────

/// Handle to one persistent duplex session.
///
/// Cheaply cloneable; all clones share the connection. [`close`](Self::close)
/// is idempotent and tears down the background read loop.
#[derive(Clone)]
pub struct DuplexSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    sink: Mutex<WsSink>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Ack>>>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<StoreEvent>>>,
    auth: watch::Sender<AuthState>,
    next_rid: AtomicU64,
    cancel: CancellationToken,
    closed: CancellationToken,
    timeout: Duration,
}

impl DuplexSession {
    /// Open the WebSocket connection and spawn the read loop.
    ///
    /// The session starts unauthenticated; call
    /// [`authenticate`](Self::authenticate) before subscribing or writing.
    pub async fn connect(url: &Url, transport: &TransportConfig) -> Result<Self, Error> {
        let uri: tungstenite::http::Uri = url
            .as_str()
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

        tracing::debug!(url = %url, "connecting duplex session");

        let connect = tokio_tungstenite::connect_async(uri);
        let (ws_stream, _response) = tokio::time::timeout(transport.timeout, connect)
            .await
            .map_err(|_| Error::Timeout {
                timeout_secs: transport.timeout.as_secs(),
            })?
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

        let (sink, source) = ws_stream.split();
        let (auth, _) = watch::channel(AuthState::Unauthenticated);

        let inner = Arc::new(SessionInner {
            sink: Mutex::new(sink),
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            auth,
            next_rid: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            closed: CancellationToken::new(),
            timeout: transport.timeout,
        });

        tokio::spawn(read_loop(Arc::clone(&inner), source));

        Ok(Self { inner })
    }

    // ── Requests ─────────────────────────────────────────────────────

    /// Authenticate this session with a tenant or privileged token.
    pub async fn authenticate(&self, token: &str) -> Result<(), Error> {
        let token = token.to_owned();
        self.request(|rid| ClientFrame::Auth { rid, token }).await?;
        // send_replace updates unconditionally, even with zero receivers.
        self.inner.auth.send_replace(AuthState::Authenticated);
        Ok(())
    }

    /// Drop this session's authentication (best-effort, used at shutdown).
    pub async fn unauthenticate(&self) -> Result<(), Error> {
        self.request(|rid| ClientFrame::Unauth { rid }).await?;
        self.inner.auth.send_replace(AuthState::Unauthenticated);
        Ok(())
    }

    /// Read the value at `path` once.
    pub async fn read_once(&self, path: &str) -> Result<serde_json::Value, Error> {
        let p = path.to_owned();
        let ack = self.request(|rid| ClientFrame::Query { rid, path: p }).await?;
        match ack.data {
            Some(data) if !data.is_null() => Ok(data),
            _ => Err(Error::NoData { path: path.to_owned() }),
        }
    }

    /// Open a subscription on `path` for one event kind.
    pub async fn subscribe(&self, path: &str, kind: EventKind) -> Result<Subscription, Error> {
        let p = path.to_owned();
        let ack = self
            .request(move |rid| ClientFrame::Listen { rid, path: p, query: kind })
            .await?;
        let id = ack.sub.ok_or_else(|| Error::Deserialization {
            message: "listen ack without subscription id".into(),
        })?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CHANNEL_CAPACITY);
        self.inner.subscribers.lock().await.insert(id, tx);
        Ok(Subscription { id, events: rx })
    }

    /// Release a subscription opened by [`subscribe`](Self::subscribe).
    pub async fn unsubscribe(&self, sub: u64) -> Result<(), Error> {
        self.inner.subscribers.lock().await.remove(&sub);
        self.request(|rid| ClientFrame::Unlisten { rid, sub }).await?;
        Ok(())
    }

    /// Write `data` at `path`.
    pub async fn write(&self, path: &str, data: serde_json::Value) -> Result<(), Error> {
        let p = path.to_owned();
        self.request(|rid| ClientFrame::Put { rid, path: p, data })
            .await
            .map_err(|e| match e {
                Error::Authentication { .. } | Error::AuthRevoked => e,
                other => Error::Write { message: other.to_string() },
            })?;
        Ok(())
    }

    // ── State observation ────────────────────────────────────────────

    /// Subscribe to authentication state changes.
    pub fn auth_state(&self) -> watch::Receiver<AuthState> {
        self.inner.auth.subscribe()
    }

    /// Token cancelled when the underlying connection has ended, for any
    /// reason. Auth revocation is reported via [`auth_state`](Self::auth_state),
    /// not here.
    pub fn closed(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    /// Close the session. Idempotent.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let mut sink = self.inner.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
    }

    // ── Request/ack plumbing ─────────────────────────────────────────

    async fn request(&self, build: impl FnOnce(u64) -> ClientFrame) -> Result<Ack, Error> {
        if self.inner.closed.is_cancelled() {
            return Err(Error::SessionClosed);
        }
        if *self.inner.auth.borrow() == AuthState::Revoked {
            return Err(Error::AuthRevoked);
        }

        let rid = self.inner.next_rid.fetch_add(1, Ordering::Relaxed);
        let frame = build(rid);
        let json = serde_json::to_string(&frame).map_err(|e| Error::Deserialization {
            message: e.to_string(),
        })?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(rid, tx);

        {
            let mut sink = self.inner.sink.lock().await;
            if let Err(e) = sink.send(Message::Text(json.into())).await {
                self.inner.pending.lock().await.remove(&rid);
                return Err(Error::WebSocketConnect(e.to_string()));
            }
        }

        let ack = match tokio::time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) => return Err(Error::SessionClosed),
            Err(_) => {
                self.inner.pending.lock().await.remove(&rid);
                return Err(Error::Timeout {
                    timeout_secs: self.inner.timeout.as_secs(),
                });
            }
        };

        if ack.ok {
            Ok(ack)
        } else {
            let message = ack.error.unwrap_or_else(|| "request rejected".into());
            match ack.code.as_deref() {
                Some("unauthorized" | "permission_denied") => Err(Error::Authentication { message }),
                _ => Err(Error::Store { message, code: ack.code }),
            }
        }
    }
}

// ── Background read loop ─────────────────────────────────────────────

/// Read frames until the connection drops or the session is closed,
/// routing acks to waiters and events to subscribers.
async fn read_loop(inner: Arc<SessionInner>, mut source: WsSource) {
    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            frame = source.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_frame(&inner, text.as_str()).await;
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite answers pings automatically
                        tracing::trace!("duplex ping");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            tracing::debug!(code = %cf.code, reason = %cf.reason, "duplex close frame");
                        }
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "duplex read error");
                        break;
                    }
                    None => break,
                    _ => {
                        // Binary, Pong, Frame -- ignore
                    }
                }
            }
        }
    }

    // Fail anything still waiting and signal consumers the session ended.
    inner.pending.lock().await.clear();
    inner.subscribers.lock().await.clear();
    inner.closed.cancel();
    tracing::debug!("duplex read loop exiting");
}

/// Parse one text frame and route it.
async fn dispatch_frame(inner: &Arc<SessionInner>, text: &str) {
    let frame: ServerFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable duplex frame");
            return;
        }
    };

    match frame {
        ServerFrame::Ack { rid, ok, sub, data, error, code } => {
            if let Some(waiter) = inner.pending.lock().await.remove(&rid) {
                let _ = waiter.send(Ack { ok, sub, data, error, code });
            } else {
                tracing::debug!(rid, "ack with no waiter");
            }
        }
        ServerFrame::Event { sub, kind, key, data } => {
            let sender = inner.subscribers.lock().await.get(&sub).cloned();
            if let Some(tx) = sender {
                // A slow consumer drops events rather than stalling the
                // read loop for every other subscription on the session.
                if tx.try_send(StoreEvent { kind, key, data }).is_err() {
                    tracing::warn!(sub, "subscription channel full, dropping event");
                }
            }
        }
        ServerFrame::AuthRevoked => {
            tracing::debug!("store revoked session authentication");
            inner.auth.send_replace(AuthState::Revoked);
        }
    }
}
