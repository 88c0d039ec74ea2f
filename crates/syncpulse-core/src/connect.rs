// ── Wire-backed transport adapters ──
//
// Bridges from `syncpulse-api` clients to the transport traits the core
// consumes. Translation work (store events → domain types) happens here,
// in small forwarder tasks, so workers only ever see typed channels.

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use syncpulse_api::{
    AuthState, DuplexSession, EventKind as WireEventKind, PushClient, PushStream, StoreEvent,
    TransportConfig,
};

use crate::error::CoreError;
use crate::model::{AccessToken, EntityKind, EntityRecord};
use crate::transport::{
    ChildEvent, ChildFeed, DuplexLink, DuplexTransport, PushFeed, PushTransport, PushUpdate,
    ValueFeed,
};

const CHILD_CHANNEL_CAPACITY: usize = 256;
const VALUE_CHANNEL_CAPACITY: usize = 64;
const PUSH_CHANNEL_CAPACITY: usize = 64;

// ── Duplex adapter ──────────────────────────────────────────────────

/// Duplex transport backed by one WebSocket session per worker.
pub struct WsDuplexTransport {
    url: Url,
    transport: TransportConfig,
}

impl WsDuplexTransport {
    pub fn new(url: Url, transport: TransportConfig) -> Self {
        Self { url, transport }
    }
}

impl DuplexTransport for WsDuplexTransport {
    type Link = WsDuplexLink;

    async fn connect(&self, token: &AccessToken) -> Result<WsDuplexLink, CoreError> {
        let session = DuplexSession::connect(&self.url, &self.transport)
            .await
            .map_err(CoreError::from)?;

        if let Err(e) = session.authenticate(token.secret()).await {
            session.close().await;
            return Err(CoreError::from(e));
        }

        let auth_lost = CancellationToken::new();
        tokio::spawn(watch_auth(session.auth_state(), auth_lost.clone()));

        Ok(WsDuplexLink { session, auth_lost })
    }
}

/// One established, authenticated duplex session.
pub struct WsDuplexLink {
    session: DuplexSession,
    auth_lost: CancellationToken,
}

impl DuplexLink for WsDuplexLink {
    async fn read_root(&self) -> Result<serde_json::Value, CoreError> {
        self.session.read_once("/").await.map_err(CoreError::from)
    }

    async fn subscribe_children(&self, kind: EntityKind) -> Result<ChildFeed, CoreError> {
        let path = kind.collection_path();
        let added = self
            .session
            .subscribe(path, WireEventKind::ChildAdded)
            .await
            .map_err(CoreError::from)?;
        let removed = match self.session.subscribe(path, WireEventKind::ChildRemoved).await {
            Ok(sub) => sub,
            Err(e) => {
                let _ = self.session.unsubscribe(added.id).await;
                return Err(CoreError::from(e));
            }
        };

        let (tx, rx) = mpsc::channel(CHILD_CHANNEL_CAPACITY);
        tokio::spawn(merge_children(added.events, removed.events, tx));
        Ok(ChildFeed { events: rx })
    }

    async fn subscribe_value(&self, kind: EntityKind, id: &str) -> Result<ValueFeed, CoreError> {
        let sub = self
            .session
            .subscribe(&kind.entity_path(id), WireEventKind::Value)
            .await
            .map_err(CoreError::from)?;

        let (tx, rx) = mpsc::channel(VALUE_CHANNEL_CAPACITY);
        tokio::spawn(translate_values(sub.events, kind, id.to_owned(), tx));
        Ok(ValueFeed { id: sub.id, events: rx })
    }

    async fn unsubscribe(&self, id: u64) {
        if let Err(e) = self.session.unsubscribe(id).await {
            tracing::debug!(sub = id, error = %e, "unsubscribe failed");
        }
    }

    fn auth_lost(&self) -> CancellationToken {
        self.auth_lost.clone()
    }

    async fn close(&self) {
        self.session.close().await;
    }
}

/// Trip the auth-lost token when the session's credential is revoked.
async fn watch_auth(mut rx: watch::Receiver<AuthState>, auth_lost: CancellationToken) {
    loop {
        if *rx.borrow_and_update() == AuthState::Revoked {
            auth_lost.cancel();
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Merge child-added and child-removed subscriptions into one feed.
async fn merge_children(
    mut added: mpsc::Receiver<StoreEvent>,
    mut removed: mpsc::Receiver<StoreEvent>,
    tx: mpsc::Sender<ChildEvent>,
) {
    loop {
        let event = tokio::select! {
            event = added.recv() => match event {
                Some(ev) => ev.key.map(ChildEvent::Added),
                None => break,
            },
            event = removed.recv() => match event {
                Some(ev) => ev.key.map(ChildEvent::Removed),
                None => break,
            },
        };

        match event {
            Some(event) => {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            None => tracing::debug!("child event without a key"),
        }
    }
}

/// Turn raw value events into entity records.
async fn translate_values(
    mut events: mpsc::Receiver<StoreEvent>,
    kind: EntityKind,
    id: String,
    tx: mpsc::Sender<EntityRecord>,
) {
    while let Some(event) = events.recv().await {
        let Some(data) = event.data else {
            tracing::debug!(kind = %kind, id = %id, "value event without data");
            continue;
        };
        if let Some(record) = EntityRecord::from_value(kind, &id, &data) {
            if tx.send(record).await.is_err() {
                break;
            }
        }
    }
}

// ── Push adapter ────────────────────────────────────────────────────

/// Push transport backed by the per-path HTTP stream client.
pub struct HttpPushTransport {
    client: PushClient,
}

impl HttpPushTransport {
    pub fn new(base: Url, transport: &TransportConfig) -> Result<Self, CoreError> {
        Ok(Self {
            client: PushClient::new(base, transport).map_err(CoreError::from)?,
        })
    }
}

impl PushTransport for HttpPushTransport {
    async fn open_stream(&self, token: &AccessToken, path: &str) -> Result<PushFeed, CoreError> {
        let stream = self
            .client
            .open_stream(path, token.secret())
            .await
            .map_err(CoreError::from)?;

        let (tx, rx) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
        let closer = CancellationToken::new();
        tokio::spawn(pump_push(stream, tx, closer.clone()));
        Ok(PushFeed::new(rx, closer))
    }
}

/// Forward put snapshots, surface revocations, drop everything else.
async fn pump_push(mut stream: PushStream, tx: mpsc::Sender<PushUpdate>, closer: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = closer.cancelled() => {
                stream.close();
                break;
            }
            event = stream.next_event() => {
                match event {
                    Some(ev) if ev.is_put() => {
                        let snapshot = ev.data.unwrap_or(serde_json::Value::Null);
                        if tx.send(PushUpdate::Snapshot(snapshot)).await.is_err() {
                            break;
                        }
                    }
                    Some(ev) if ev.is_auth_revoked() => {
                        let _ = tx.send(PushUpdate::AuthRevoked).await;
                        break;
                    }
                    Some(ev) => {
                        tracing::trace!(event = %ev.event, "ignoring push event");
                    }
                    None => break,
                }
            }
        }
    }
}
