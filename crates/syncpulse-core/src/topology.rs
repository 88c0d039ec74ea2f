// ── Subscription topology ──
//
// Per-worker bookkeeping of which entities are watched and the live
// handle for each. The same diff algorithm serves both transports: the
// duplex variant feeds it single-id deltas, the push variant feeds it
// full current-id sets recomputed from snapshots.
//
// Epochs make rapid remove-then-re-add safe: every handle gets a fresh
// epoch, value updates are tagged with the epoch of the handle that
// produced them, and the worker discards updates whose epoch no longer
// matches the tracked handle. A lingering forwarder for a closed handle
// can therefore never overwrite the record owned by its replacement.

use std::collections::{HashMap, HashSet};

use tokio_util::sync::CancellationToken;

use crate::model::EntityKind;

// ── SubscriptionHandle ──────────────────────────────────────────────

/// One live watch on one entity path.
///
/// Owned exclusively by the topology entry that registered it; removal
/// hands it back to the caller, who must release it exactly once via
/// [`close`](Self::close) (plus the link-level unsubscribe if `link_sub`
/// is set).
#[derive(Debug)]
pub struct SubscriptionHandle {
    /// Monotonic tag distinguishing this handle from any earlier handle
    /// for the same (kind, id).
    pub epoch: u64,

    /// Link-level subscription id for duplex value watches; `None` for
    /// push streams, which are torn down by `canceller` alone.
    pub link_sub: Option<u64>,

    canceller: CancellationToken,
}

impl SubscriptionHandle {
    pub fn new(epoch: u64, link_sub: Option<u64>, canceller: CancellationToken) -> Self {
        Self { epoch, link_sub, canceller }
    }

    /// Stop the forwarder task (and, for push streams, the stream itself).
    pub fn close(&self) {
        self.canceller.cancel();
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.canceller.is_cancelled()
    }
}

// ── Diff result ─────────────────────────────────────────────────────

/// Ids to open and handles to release for one reconciliation step.
#[derive(Debug, Default)]
pub struct TopologyDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl TopologyDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

// ── SubscriptionTopology ────────────────────────────────────────────

/// Mapping `EntityKind → (id → SubscriptionHandle)`.
///
/// Invariants: no id appears twice for the same kind; every handle
/// present was registered here and not yet released.
#[derive(Debug, Default)]
pub struct SubscriptionTopology {
    tracked: HashMap<EntityKind, HashMap<String, SubscriptionHandle>>,
    next_epoch: u64,
}

impl SubscriptionTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the reconciliation delta between the tracked ids of `kind`
    /// and `current`. Applying the same set twice yields an empty delta.
    pub fn diff(&self, kind: EntityKind, current: &HashSet<String>) -> TopologyDelta {
        let tracked = self.tracked.get(&kind);

        let removed = tracked
            .map(|ids| {
                ids.keys()
                    .filter(|id| !current.contains(*id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let added = current
            .iter()
            .filter(|id| !tracked.is_some_and(|ids| ids.contains_key(*id)))
            .cloned()
            .collect();

        TopologyDelta { added, removed }
    }

    pub fn contains(&self, kind: EntityKind, id: &str) -> bool {
        self.tracked
            .get(&kind)
            .is_some_and(|ids| ids.contains_key(id))
    }

    /// Allocate a fresh epoch for a handle about to be registered.
    pub fn allocate_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    /// Register a handle for (kind, id). Panics in debug builds if the id
    /// is already tracked -- callers diff first.
    pub fn insert(&mut self, kind: EntityKind, id: String, handle: SubscriptionHandle) {
        let ids = self.tracked.entry(kind).or_default();
        debug_assert!(!ids.contains_key(&id), "duplicate topology entry");
        ids.insert(id, handle);
    }

    /// Remove the handle for (kind, id), handing ownership to the caller
    /// for release.
    pub fn remove(&mut self, kind: EntityKind, id: &str) -> Option<SubscriptionHandle> {
        self.tracked.get_mut(&kind)?.remove(id)
    }

    /// Whether an epoch-tagged update still belongs to the tracked handle.
    pub fn is_current(&self, kind: EntityKind, id: &str, epoch: u64) -> bool {
        self.tracked
            .get(&kind)
            .and_then(|ids| ids.get(id))
            .is_some_and(|handle| handle.epoch == epoch)
    }

    /// Drain every handle for teardown.
    pub fn drain_all(&mut self) -> Vec<SubscriptionHandle> {
        self.tracked
            .drain()
            .flat_map(|(_, ids)| ids.into_values())
            .collect()
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.values().map(HashMap::len).sum()
    }

    #[cfg(test)]
    pub(crate) fn tracked_ids(&self, kind: EntityKind) -> HashSet<String> {
        self.tracked
            .get(&kind)
            .map(|ids| ids.keys().cloned().collect())
            .unwrap_or_default()
    }
}

// ── Tests ───────────────────────────────────────────────────────────
