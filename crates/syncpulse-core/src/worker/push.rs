// ── Push-stream worker ──
//
// One independent long-lived stream per top-level collection, plus one
// per discovered entity, opened lazily. Every `put` carries a full
// subtree snapshot, so membership is recomputed from scratch each time
// and run through the same topology diff as the duplex variant -- no
// monotonic-growth or cross-stream ordering assumptions.

use std::collections::HashSet;
use std::sync::Arc;

use strum::IntoEnumIterator;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::model::{AccessToken, EntityKind, EntityRecord, TransportKind};
use crate::topology::{SubscriptionHandle, SubscriptionTopology};
use crate::transport::{PushFeed, PushTransport, PushUpdate};
use crate::worker::{ExitReason, ValueUpdate, WorkerFactory, WorkerHandle, apply_value_update};

const VALUE_CHANNEL_CAPACITY: usize = 256;

// ── Factory ─────────────────────────────────────────────────────────

/// Starts push-stream workers over a shared transport.
pub struct PushWorkerFactory<T: PushTransport> {
    transport: Arc<T>,
}

impl<T: PushTransport> PushWorkerFactory<T> {
    pub fn new(transport: T) -> Self {
        Self { transport: Arc::new(transport) }
    }
}

impl<T: PushTransport> WorkerFactory for PushWorkerFactory<T> {
    fn transport(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn start(&self, token: AccessToken) -> Result<WorkerHandle, CoreError> {
        tracing::info!(token = %token, "starting push-stream worker");

        let mut feeds: Vec<(EntityKind, PushFeed)> = Vec::new();
        for kind in EntityKind::iter() {
            match self.transport.open_stream(&token, kind.collection_path()).await {
                Ok(feed) => feeds.push((kind, feed)),
                Err(e) => {
                    for (_, feed) in &feeds {
                        feed.close();
                    }
                    return Err(e);
                }
            }
        }

        let handle = WorkerHandle::create(token, TransportKind::Stream);
        tokio::spawn(run_worker(handle.clone(), Arc::clone(&self.transport), feeds));
        handle.set_running();
        Ok(handle)
    }
}

// ── Event loop ──────────────────────────────────────────────────────

async fn run_worker<T: PushTransport>(
    handle: WorkerHandle,
    transport: Arc<T>,
    feeds: Vec<(EntityKind, PushFeed)>,
) {
    let token = handle.token().clone();
    let mut topology = SubscriptionTopology::new();
    let (value_tx, mut value_rx) = mpsc::channel::<ValueUpdate>(VALUE_CHANNEL_CAPACITY);

    let mut collections: StreamMap<EntityKind, ReceiverStream<PushUpdate>> = StreamMap::new();
    let mut collection_closers: Vec<CancellationToken> = Vec::new();
    for (kind, feed) in feeds {
        collection_closers.push(feed.closer());
        collections.insert(kind, ReceiverStream::new(feed.events));
    }

    let cancel = handle.cancel_token();

    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break ExitReason::Stopped,
            update = value_rx.recv() => {
                // The loop holds a sender clone, so `recv` never yields `None`.
                if let Some(update) = update {
                    apply_value_update(&handle, &topology, update);
                }
            }
            item = collections.next() => {
                match item {
                    Some((kind, PushUpdate::Snapshot(snapshot))) => {
                        match reconcile(&transport, &token, &mut topology, kind, &snapshot, &value_tx).await {
                            Ok(()) => {}
                            Err(e) if e.is_auth() => break ExitReason::AuthLost,
                            Err(e) => {
                                tracing::warn!(token = %token, kind = %kind, error = %e, "reconcile failed");
                            }
                        }
                    }
                    Some((kind, PushUpdate::AuthRevoked)) => {
                        tracing::warn!(token = %token, kind = %kind, "collection stream authorization revoked");
                        break ExitReason::AuthLost;
                    }
                    None => {
                        tracing::warn!(token = %token, "all collection streams ended");
                        break ExitReason::LinkDead;
                    }
                }
            }
        }
    };

    match reason {
        ExitReason::Stopped => {}
        ExitReason::AuthLost => {
            if handle.set_disconnected() {
                tracing::info!(token = %token, transport = %handle.transport(), "worker disconnected");
            }
            cancel.cancelled().await;
        }
        ExitReason::LinkDead => {
            // A dead transport is not an auth loss; idle until stopped.
            cancel.cancelled().await;
        }
    }

    for sub in topology.drain_all() {
        sub.close();
    }
    for closer in &collection_closers {
        closer.cancel();
    }
    handle.set_stopped();
    tracing::debug!(token = %token, "push-stream worker stopped");
}

// ── Reconciliation ──────────────────────────────────────────────────

/// Recompute current ids from a full collection snapshot and apply the
/// topology diff: close streams for removed ids, open streams for added
/// ones. Entities are bucketed by their actual kind.
///
/// A non-auth failure opening one entity's stream leaves that id
/// untracked; the next `put` retries it. An auth failure aborts.
async fn reconcile<T: PushTransport>(
    transport: &Arc<T>,
    token: &AccessToken,
    topology: &mut SubscriptionTopology,
    kind: EntityKind,
    snapshot: &serde_json::Value,
    value_tx: &mpsc::Sender<ValueUpdate>,
) -> Result<(), CoreError> {
    let current: HashSet<String> = snapshot
        .as_object()
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default();

    let delta = topology.diff(kind, &current);
    if delta.is_empty() {
        return Ok(());
    }

    for id in delta.removed {
        if let Some(handle) = topology.remove(kind, &id) {
            handle.close();
        }
    }

    for id in delta.added {
        match transport.open_stream(token, &kind.entity_path(&id)).await {
            Ok(feed) => {
                let epoch = topology.allocate_epoch();
                let closer = feed.closer();
                tokio::spawn(forward_entity(feed, kind, id.clone(), epoch, value_tx.clone()));
                topology.insert(kind, id, SubscriptionHandle::new(epoch, None, closer));
            }
            Err(e) if e.is_auth() => return Err(e),
            Err(e) => {
                tracing::warn!(kind = %kind, id = %id, error = %e, "entity stream failed");
            }
        }
    }

    Ok(())
}

/// Forward one entity's snapshots into the worker loop until the stream
/// ends or its handle is closed.
async fn forward_entity(
    mut feed: PushFeed,
    kind: EntityKind,
    id: String,
    epoch: u64,
    tx: mpsc::Sender<ValueUpdate>,
) {
    let closer = feed.closer();
    loop {
        tokio::select! {
            biased;
            _ = closer.cancelled() => break,
            event = feed.events.recv() => {
                match event {
                    Some(PushUpdate::Snapshot(value)) => {
                        // Null means the entity vanished; the collection
                        // snapshot drives the actual removal.
                        if let Some(record) = EntityRecord::from_value(kind, &id, &value) {
                            let update = ValueUpdate { kind, id: id.clone(), epoch, record };
                            if tx.send(update).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(PushUpdate::AuthRevoked) => {
                        tracing::warn!(kind = %kind, id = %id, "entity stream authorization revoked");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}
