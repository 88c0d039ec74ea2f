// ── Sync workers ──
//
// A worker owns one authenticated view of the store for one tenant token,
// keeps a subscription topology consistent with the store's current
// membership, and exposes the most recently observed record per entity
// kind. Two concrete variants sit behind the same handle: `duplex`
// (incremental child deltas over one session) and `push` (full-snapshot
// streams per path).
//
// All topology and last-update mutation happens on the worker's own event
// loop; value events arrive epoch-tagged through a single channel so a
// stale forwarder can never clobber a newer handle's record.

pub mod duplex;
pub mod push;

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::model::{AccessToken, EntityKind, EntityRecord, TransportKind};
use crate::topology::SubscriptionTopology;

// ── WorkerState ─────────────────────────────────────────────────────

/// Lifecycle of one worker, observable via `watch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    /// Authentication was lost; the pool removes and replaces the worker.
    /// Emitted at most once per worker.
    Disconnected,
    /// All subscriptions and the session/streams are released. Terminal.
    Stopped,
}

// ── WorkerFactory ───────────────────────────────────────────────────

/// Creates and starts workers of one transport variant.
///
/// `start` resolves only once the worker is fully subscribed and
/// `Running`, so pools never hold a half-started entry.
pub trait WorkerFactory: Send + Sync + 'static {
    fn transport(&self) -> TransportKind;

    fn start(
        &self,
        token: AccessToken,
    ) -> impl Future<Output = Result<WorkerHandle, CoreError>> + Send;
}

// ── WorkerHandle ────────────────────────────────────────────────────

/// Pool- and orchestrator-facing handle to one running worker.
///
/// Cheaply cloneable; all clones refer to the same worker.
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    token: AccessToken,
    transport: TransportKind,
    last_update: DashMap<EntityKind, EntityRecord>,
    state: watch::Sender<WorkerState>,
    cancel: CancellationToken,
}

impl WorkerHandle {
    pub(crate) fn create(token: AccessToken, transport: TransportKind) -> Self {
        let (state, _) = watch::channel(WorkerState::Starting);
        Self {
            inner: Arc::new(WorkerInner {
                token,
                transport,
                last_update: DashMap::new(),
                state,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn token(&self) -> &AccessToken {
        &self.inner.token
    }

    pub fn transport(&self) -> TransportKind {
        self.inner.transport
    }

    /// Most recently observed record for `kind`, if any.
    pub fn last_update(&self, kind: EntityKind) -> Option<EntityRecord> {
        self.inner.last_update.get(&kind).map(|r| r.value().clone())
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<WorkerState> {
        self.inner.state.subscribe()
    }

    /// Request the worker to stop and release everything it holds.
    /// Safe to call multiple times.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    /// Wait until the worker has released all resources.
    pub async fn wait_stopped(&self) {
        let mut rx = self.inner.state.subscribe();
        loop {
            if *rx.borrow_and_update() == WorkerState::Stopped {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Identity comparison: same worker, not same token.
    pub fn same_worker(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ── Internal (event-loop side) ───────────────────────────────────

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub(crate) fn set_running(&self) {
        // send_modify updates unconditionally, even with zero receivers.
        self.inner.state.send_modify(|s| *s = WorkerState::Running);
    }

    /// Transition to `Disconnected`. Returns `true` only for the first
    /// call that actually transitions, so the signal fires exactly once.
    pub(crate) fn set_disconnected(&self) -> bool {
        self.inner.state.send_if_modified(|s| {
            if matches!(s, WorkerState::Starting | WorkerState::Running) {
                *s = WorkerState::Disconnected;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn set_stopped(&self) {
        self.inner.state.send_modify(|s| *s = WorkerState::Stopped);
    }

    pub(crate) fn record(&self, kind: EntityKind, record: EntityRecord) {
        self.inner.last_update.insert(kind, record);
    }
}

// ── Event-loop shared pieces ────────────────────────────────────────

/// A value observation flowing from a forwarder task into the worker
/// loop, tagged with the epoch of the handle that produced it.
#[derive(Debug)]
pub(crate) struct ValueUpdate {
    pub kind: EntityKind,
    pub id: String,
    pub epoch: u64,
    pub record: EntityRecord,
}

/// Apply a value update unless its handle has been replaced or removed.
pub(crate) fn apply_value_update(
    handle: &WorkerHandle,
    topology: &SubscriptionTopology,
    update: ValueUpdate,
) {
    if topology.is_current(update.kind, &update.id, update.epoch) {
        handle.record(update.kind, update.record);
    } else {
        tracing::trace!(
            kind = %update.kind,
            id = %update.id,
            epoch = update.epoch,
            "discarding stale value update"
        );
    }
}

/// Why a worker's event loop stopped processing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitReason {
    /// `stop()` was called.
    Stopped,
    /// Authentication was lost; signal `Disconnected` and await `stop()`.
    AuthLost,
    /// The transport went away without an auth loss. Not fatal to the
    /// pool -- the worker idles until stopped.
    LinkDead,
}
