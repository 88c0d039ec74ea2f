// ── Worker pool ──
//
// Owns the live workers for one (transport, token-set) pair. Every worker
// gets its own supervisor task, so simultaneous disconnections replace
// independently without blocking each other. The list is published as a
// watch snapshot: the orchestrator iterates a point-in-time copy, never
// the live collection.

use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::model::{AccessToken, TransportKind};
use crate::worker::{WorkerFactory, WorkerHandle, WorkerState};

// ── PoolView ────────────────────────────────────────────────────────

/// Read-only view of a pool for the orchestrator's fan-out poll.
#[derive(Clone)]
pub struct PoolView {
    transport: TransportKind,
    snapshot: watch::Receiver<Arc<Vec<WorkerHandle>>>,
}

impl PoolView {
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Point-in-time copy of the current worker list.
    pub fn snapshot(&self) -> Arc<Vec<WorkerHandle>> {
        self.snapshot.borrow().clone()
    }
}

// ── WorkerPool ──────────────────────────────────────────────────────

/// The set of live workers for one transport variant.
///
/// Invariant: at most one `Starting`/`Running` worker per access token at
/// any instant -- a disconnected worker leaves the list before its
/// replacement is constructed.
pub struct WorkerPool<F: WorkerFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: WorkerFactory> Clone for WorkerPool<F> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct PoolInner<F> {
    factory: F,
    workers: Mutex<Vec<WorkerHandle>>,
    snapshot: watch::Sender<Arc<Vec<WorkerHandle>>>,
    cancel: CancellationToken,
}

impl<F: WorkerFactory> WorkerPool<F> {
    pub fn new(factory: F) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            inner: Arc::new(PoolInner {
                factory,
                workers: Mutex::new(Vec::new()),
                snapshot,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn transport(&self) -> TransportKind {
        self.inner.factory.transport()
    }

    /// Start a worker for `token` and insert it into the pool.
    ///
    /// On failure the token has no live worker and the error is returned
    /// to the caller.
    pub async fn start_worker(&self, token: AccessToken) -> Result<(), CoreError> {
        let handle = self.inner.factory.start(token).await?;
        insert_worker(&self.inner, handle.clone()).await;
        tokio::spawn(supervise(Arc::clone(&self.inner), handle));
        Ok(())
    }

    /// View for snapshot-before-iterate polling.
    pub fn view(&self) -> PoolView {
        PoolView {
            transport: self.transport(),
            snapshot: self.inner.snapshot.subscribe(),
        }
    }

    pub async fn worker_count(&self) -> usize {
        self.inner.workers.lock().await.len()
    }

    /// Stop every worker and the supervisors. Idempotent; resolves once
    /// all workers have released their resources.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let workers: Vec<WorkerHandle> = self.inner.workers.lock().await.clone();
        for worker in &workers {
            worker.stop();
        }
        for worker in &workers {
            worker.wait_stopped().await;
        }
    }
}

// ── List mutation ───────────────────────────────────────────────────

async fn insert_worker<F: WorkerFactory>(inner: &PoolInner<F>, handle: WorkerHandle) {
    let mut list = inner.workers.lock().await;
    list.push(handle);
    publish(inner, &list);
}

async fn remove_worker<F: WorkerFactory>(inner: &PoolInner<F>, handle: &WorkerHandle) {
    let mut list = inner.workers.lock().await;
    list.retain(|w| !w.same_worker(handle));
    publish(inner, &list);
}

fn publish<F: WorkerFactory>(inner: &PoolInner<F>, list: &[WorkerHandle]) {
    inner.snapshot.send_modify(|snap| *snap = Arc::new(list.to_vec()));
}

// ── Supervision ─────────────────────────────────────────────────────

/// Watch one worker chain: on `Disconnected`, remove it, release its
/// resources, and start a fresh worker for the same token -- inserted only
/// if its start succeeds. Runs until the worker is stopped externally,
/// the pool shuts down, or a restart fails.
async fn supervise<F: WorkerFactory>(inner: Arc<PoolInner<F>>, mut handle: WorkerHandle) {
    loop {
        let mut state_rx = handle.state_watch();
        loop {
            match *state_rx.borrow_and_update() {
                WorkerState::Disconnected => break,
                WorkerState::Stopped => return,
                WorkerState::Starting | WorkerState::Running => {}
            }
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        // The old entry leaves the pool before the replacement is even
        // constructed, keeping the one-worker-per-token invariant.
        remove_worker(&inner, &handle).await;
        handle.stop();
        handle.wait_stopped().await;

        tracing::info!(
            token = %handle.token(),
            transport = %inner.factory.transport(),
            "restarting worker after disconnect"
        );

        match inner.factory.start(handle.token().clone()).await {
            Ok(replacement) => {
                insert_worker(&inner, replacement.clone()).await;
                handle = replacement;
            }
            Err(e) => {
                tracing::warn!(token = %handle.token(), error = %e, "worker restart failed");
                return;
            }
        }
    }
}
