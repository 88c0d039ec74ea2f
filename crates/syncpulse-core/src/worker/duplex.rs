// ── Duplex worker ──
//
// One persistent bidirectional session per worker. The store replays
// current membership as child-added events on subscribe, then streams
// single-id deltas; the loop feeds each one through the topology and
// opens or releases per-entity value watches accordingly.

use std::sync::Arc;

use strum::IntoEnumIterator;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::model::{AccessToken, EntityKind, EntityRecord, TransportKind};
use crate::topology::{SubscriptionHandle, SubscriptionTopology};
use crate::transport::{ChildEvent, ChildFeed, DuplexLink, DuplexTransport};
use crate::worker::{ExitReason, ValueUpdate, WorkerFactory, WorkerHandle, apply_value_update};

const VALUE_CHANNEL_CAPACITY: usize = 256;

// ── Factory ─────────────────────────────────────────────────────────

/// Starts duplex workers over a shared transport.
pub struct DuplexWorkerFactory<T: DuplexTransport> {
    transport: Arc<T>,
}

impl<T: DuplexTransport> DuplexWorkerFactory<T> {
    pub fn new(transport: T) -> Self {
        Self { transport: Arc::new(transport) }
    }
}

impl<T: DuplexTransport> WorkerFactory for DuplexWorkerFactory<T> {
    fn transport(&self) -> TransportKind {
        TransportKind::Duplex
    }

    async fn start(&self, token: AccessToken) -> Result<WorkerHandle, CoreError> {
        tracing::info!(token = %token, "starting duplex worker");

        let link = self.transport.connect(&token).await?;

        // Bootstrap requires a populated root; an empty store means there
        // is nothing to watch and the start fails.
        if let Err(e) = link.read_root().await {
            link.close().await;
            return Err(e);
        }

        let mut feeds: Vec<(EntityKind, ChildFeed)> = Vec::new();
        for kind in EntityKind::iter() {
            match link.subscribe_children(kind).await {
                Ok(feed) => feeds.push((kind, feed)),
                Err(e) => {
                    link.close().await;
                    return Err(e);
                }
            }
        }

        let handle = WorkerHandle::create(token, TransportKind::Duplex);
        tokio::spawn(run_worker(handle.clone(), link, feeds));
        handle.set_running();
        Ok(handle)
    }
}

// ── Event loop ──────────────────────────────────────────────────────

async fn run_worker<L: DuplexLink>(
    handle: WorkerHandle,
    link: L,
    child_feeds: Vec<(EntityKind, ChildFeed)>,
) {
    let mut topology = SubscriptionTopology::new();
    let (value_tx, mut value_rx) = mpsc::channel::<ValueUpdate>(VALUE_CHANNEL_CAPACITY);

    let mut children: StreamMap<EntityKind, ReceiverStream<ChildEvent>> = StreamMap::new();
    for (kind, feed) in child_feeds {
        children.insert(kind, ReceiverStream::new(feed.events));
    }

    let cancel = handle.cancel_token();
    let auth_lost = link.auth_lost();

    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break ExitReason::Stopped,
            _ = auth_lost.cancelled() => break ExitReason::AuthLost,
            update = value_rx.recv() => {
                // The loop holds a sender clone, so `recv` never yields `None`.
                if let Some(update) = update {
                    apply_value_update(&handle, &topology, update);
                }
            }
            event = children.next() => {
                match event {
                    Some((kind, ChildEvent::Added(id))) => {
                        if !topology.contains(kind, &id) {
                            match open_value_watch(&link, &mut topology, kind, &id, &value_tx).await {
                                Ok(()) => {}
                                Err(e) if e.is_auth() => break ExitReason::AuthLost,
                                Err(e) => {
                                    tracing::warn!(
                                        token = %handle.token(),
                                        kind = %kind,
                                        id = %id,
                                        error = %e,
                                        "value watch failed"
                                    );
                                }
                            }
                        }
                    }
                    Some((kind, ChildEvent::Removed(id))) => {
                        release_watch(&link, &mut topology, kind, &id).await;
                    }
                    None => {
                        tracing::warn!(token = %handle.token(), "all child subscriptions ended");
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
                tracing::info!(
                    token = %handle.token(),
                    transport = %handle.transport(),
                    "worker disconnected"
                );
            }
            // Resources are released by stop(), driven by the pool.
            cancel.cancelled().await;
        }
        ExitReason::LinkDead => {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = auth_lost.cancelled() => {
                    if handle.set_disconnected() {
                        tracing::info!(token = %handle.token(), "worker disconnected");
                    }
                    cancel.cancelled().await;
                }
            }
        }
    }

    // Teardown: every handle released exactly once, then the session.
    for sub in topology.drain_all() {
        sub.close();
        if let Some(id) = sub.link_sub {
            link.unsubscribe(id).await;
        }
    }
    link.close().await;
    handle.set_stopped();
    tracing::debug!(token = %handle.token(), "duplex worker stopped");
}

// ── Watch management ────────────────────────────────────────────────

async fn open_value_watch<L: DuplexLink>(
    link: &L,
    topology: &mut SubscriptionTopology,
    kind: EntityKind,
    id: &str,
    value_tx: &mpsc::Sender<ValueUpdate>,
) -> Result<(), CoreError> {
    let feed = link.subscribe_value(kind, id).await?;
    let epoch = topology.allocate_epoch();
    let canceller = CancellationToken::new();

    tokio::spawn(forward_values(
        feed.events,
        kind,
        id.to_owned(),
        epoch,
        value_tx.clone(),
        canceller.clone(),
    ));

    topology.insert(
        kind,
        id.to_owned(),
        SubscriptionHandle::new(epoch, Some(feed.id), canceller),
    );
    Ok(())
}

async fn release_watch<L: DuplexLink>(
    link: &L,
    topology: &mut SubscriptionTopology,
    kind: EntityKind,
    id: &str,
) {
    if let Some(handle) = topology.remove(kind, id) {
        handle.close();
        if let Some(sub) = handle.link_sub {
            link.unsubscribe(sub).await;
        }
    }
}

/// Forward value events into the worker loop, tagged with the epoch of
/// the owning handle, until cancelled or the feed ends.
async fn forward_values(
    mut events: mpsc::Receiver<EntityRecord>,
    kind: EntityKind,
    id: String,
    epoch: u64,
    tx: mpsc::Sender<ValueUpdate>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            record = events.recv() => {
                let Some(record) = record else { break };
                let update = ValueUpdate { kind, id: id.clone(), epoch, record };
                if tx.send(update).await.is_err() {
                    break;
                }
            }
        }
    }
}
