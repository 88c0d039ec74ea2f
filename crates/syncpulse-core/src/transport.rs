// ── Transport seams ──
//
// The interfaces the core consumes, one per transport variant plus the
// privileged admin surface. Concrete wire-backed implementations live in
// `connect`; tests plug in channel-backed fakes. Subscriptions are plain
// `mpsc` receivers so fakes stay trivial.

use std::future::Future;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::model::{AccessToken, EntityKind, EntityRecord};

// ── Duplex variant ──────────────────────────────────────────────────

/// One child membership change under a watched collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
    Added(String),
    Removed(String),
}

/// Incremental child events for one collection. Lives as long as the
/// session; released by closing the link.
pub struct ChildFeed {
    pub events: mpsc::Receiver<ChildEvent>,
}

/// Value events for one entity. `id` is the link-level subscription id,
/// handed back to [`DuplexLink::unsubscribe`] on release.
pub struct ValueFeed {
    pub id: u64,
    pub events: mpsc::Receiver<EntityRecord>,
}

/// Connects one authenticated duplex link per worker.
pub trait DuplexTransport: Send + Sync + 'static {
    type Link: DuplexLink;

    /// Connect and authenticate. An invalid token fails here.
    fn connect(
        &self,
        token: &AccessToken,
    ) -> impl Future<Output = Result<Self::Link, CoreError>> + Send;
}

/// One established duplex session, owned by a single worker.
pub trait DuplexLink: Send + Sync + 'static {
    /// One-shot root snapshot, used during worker bootstrap.
    fn read_root(&self) -> impl Future<Output = Result<serde_json::Value, CoreError>> + Send;

    /// Child-added/child-removed events for one collection.
    fn subscribe_children(
        &self,
        kind: EntityKind,
    ) -> impl Future<Output = Result<ChildFeed, CoreError>> + Send;

    /// Value watch on one entity.
    fn subscribe_value(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> impl Future<Output = Result<ValueFeed, CoreError>> + Send;

    /// Release a value watch opened by
    /// [`subscribe_value`](Self::subscribe_value). Failures are logged,
    /// not surfaced -- release is best-effort on a dying link.
    fn unsubscribe(&self, id: u64) -> impl Future<Output = ()> + Send;

    /// Cancelled when the session's authentication is lost. Transport
    /// faults do NOT trip this; they end the feeds instead.
    fn auth_lost(&self) -> CancellationToken;

    /// Close the session. Idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

// ── Push variant ────────────────────────────────────────────────────

/// One event from a push stream.
#[derive(Debug, Clone)]
pub enum PushUpdate {
    /// Full subtree snapshot for the streamed path.
    Snapshot(serde_json::Value),
    /// The store revoked the stream's authorization mid-flight.
    AuthRevoked,
}

/// A live push stream for one path.
pub struct PushFeed {
    pub events: mpsc::Receiver<PushUpdate>,
    closer: CancellationToken,
}

impl PushFeed {
    pub fn new(events: mpsc::Receiver<PushUpdate>, closer: CancellationToken) -> Self {
        Self { events, closer }
    }

    /// Token that tears down the underlying stream when cancelled.
    pub fn closer(&self) -> CancellationToken {
        self.closer.clone()
    }

    /// Close the stream. Idempotent.
    pub fn close(&self) {
        self.closer.cancel();
    }
}

/// Opens independent long-lived streams, one per path, authorized per
/// call. No retry on failure -- the caller decides.
pub trait PushTransport: Send + Sync + 'static {
    fn open_stream(
        &self,
        token: &AccessToken,
        path: &str,
    ) -> impl Future<Output = Result<PushFeed, CoreError>> + Send;
}

// ── Privileged admin surface ────────────────────────────────────────

/// The orchestrator's store access: authenticate once and cache, read
/// the root snapshot, write one field.
pub trait AdminStore: Send + Sync + 'static {
    /// Authenticate if not already authenticated; cached thereafter.
    fn ensure_authenticated(&self) -> impl Future<Output = Result<(), CoreError>> + Send;

    fn read_root(&self) -> impl Future<Output = Result<serde_json::Value, CoreError>> + Send;

    fn write(
        &self,
        path: &str,
        data: serde_json::Value,
    ) -> impl Future<Output = Result<(), CoreError>> + Send;
}
