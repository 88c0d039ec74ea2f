#![allow(clippy::unwrap_used)]
// End-to-end scenarios over channel-backed fake transports: worker
// bootstrap, delivery polling, disconnect/replace cycles, push-stream
// reconciliation, and tick scheduling.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use strum::IntoEnumIterator;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use syncpulse_core::{
    AccessToken, AdminStore, ChildEvent, ChildFeed, CoreError, DuplexLink, DuplexTransport,
    DuplexWorkerFactory, EntityKind, EntityRecord, PoolView, PushFeed, PushTransport,
    PushWorkerFactory, RetryBudget, TestOrchestrator, TickSettings, ValueFeed, WorkerPool,
    WorkerState,
};

// ── Fake duplex store ───────────────────────────────────────────────

#[derive(Default)]
struct HubState {
    root: Value,
    child_subs: Vec<(EntityKind, mpsc::Sender<ChildEvent>)>,
    value_subs: HashMap<u64, ValueSub>,
    next_sub: u64,
    auth_losses: HashMap<String, CancellationToken>,
}

struct ValueSub {
    kind: EntityKind,
    id: String,
    tx: mpsc::Sender<EntityRecord>,
}

/// In-process stand-in for the realtime store, shared by the fake admin
/// session and every fake duplex link.
#[derive(Clone)]
struct Hub {
    state: Arc<Mutex<HubState>>,
}

impl Hub {
    fn new(root: Value) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState { root, ..HubState::default() })),
        }
    }

    fn root(&self) -> Value {
        self.state.lock().unwrap().root.clone()
    }

    /// Apply an admin write and publish value events to matching watches.
    fn apply_write(&self, path: &str, data: &Value) {
        let mut st = self.state.lock().unwrap();

        let mut written = None;
        for kind in EntityKind::iter() {
            let prefix = format!("{}/", kind.collection_path());
            if let Some(id) = path.strip_prefix(&prefix) {
                let collection = collection_mut(&mut st.root, kind);
                let entity = collection.entry(id.to_owned()).or_insert_with(|| json!({}));
                if let (Some(obj), Some(patch)) = (entity.as_object_mut(), data.as_object()) {
                    for (k, v) in patch {
                        obj.insert(k.clone(), v.clone());
                    }
                }
                written = Some((kind, id.to_owned(), entity.clone()));
                break;
            }
        }

        let Some((kind, id, value)) = written else { panic!("write to unknown path {path}") };
        let record = EntityRecord::from_value(kind, &id, &value).unwrap();
        let watchers: Vec<mpsc::Sender<EntityRecord>> = st
            .value_subs
            .values()
            .filter(|s| s.kind == kind && s.id == id)
            .map(|s| s.tx.clone())
            .collect();
        drop(st);

        for tx in watchers {
            let _ = tx.try_send(record.clone());
        }
    }

    /// Add an entity and announce it to child subscribers.
    fn add_entity(&self, kind: EntityKind, id: &str, properties: Value) {
        let mut st = self.state.lock().unwrap();
        collection_mut(&mut st.root, kind).insert(id.to_owned(), properties);
        let subs: Vec<mpsc::Sender<ChildEvent>> = st
            .child_subs
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, tx)| tx.clone())
            .collect();
        drop(st);
        for tx in subs {
            let _ = tx.try_send(ChildEvent::Added(id.to_owned()));
        }
    }

    /// Remove an entity and announce it to child subscribers.
    fn remove_entity(&self, kind: EntityKind, id: &str) {
        let mut st = self.state.lock().unwrap();
        collection_mut(&mut st.root, kind).remove(id);
        let subs: Vec<mpsc::Sender<ChildEvent>> = st
            .child_subs
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, tx)| tx.clone())
            .collect();
        drop(st);
        for tx in subs {
            let _ = tx.try_send(ChildEvent::Removed(id.to_owned()));
        }
    }

    /// Cancel the auth-lost token registered by `token`'s current link.
    fn revoke(&self, token: &AccessToken) {
        let st = self.state.lock().unwrap();
        if let Some(lost) = st.auth_losses.get(token.secret()) {
            lost.cancel();
        }
    }

    fn value_sub_count(&self) -> usize {
        self.state.lock().unwrap().value_subs.len()
    }
}

fn collection_mut(root: &mut Value, kind: EntityKind) -> &mut serde_json::Map<String, Value> {
    let node = match kind {
        EntityKind::Structure => &mut root["structures"],
        EntityKind::Thermostat => &mut root["devices"]["thermostats"],
        EntityKind::SmokeAlarm => &mut root["devices"]["smoke_co_alarms"],
    };
    if !node.is_object() {
        *node = json!({});
    }
    node.as_object_mut().unwrap()
}

// ── Fake duplex transport ───────────────────────────────────────────

#[derive(Clone)]
struct FakeDuplexTransport {
    hub: Hub,
    reject: Arc<Mutex<HashSet<String>>>,
    allow_connects: Arc<watch::Sender<bool>>,
    connects: Arc<AtomicUsize>,
}

impl FakeDuplexTransport {
    fn new(hub: Hub) -> Self {
        let (allow, _) = watch::channel(true);
        Self {
            hub,
            reject: Arc::new(Mutex::new(HashSet::new())),
            allow_connects: Arc::new(allow),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn reject_token(&self, token: &AccessToken) {
        self.reject.lock().unwrap().insert(token.secret().to_owned());
    }

    /// Gate new connections: `false` parks them until reopened.
    fn set_connects_allowed(&self, allowed: bool) {
        self.allow_connects.send_replace(allowed);
    }

    fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl DuplexTransport for FakeDuplexTransport {
    type Link = FakeLink;

    async fn connect(&self, token: &AccessToken) -> Result<FakeLink, CoreError> {
        let mut allowed = self.allow_connects.subscribe();
        loop {
            if *allowed.borrow_and_update() {
                break;
            }
            allowed.changed().await.unwrap();
        }

        if self.reject.lock().unwrap().contains(token.secret()) {
            return Err(CoreError::AuthenticationFailed { message: "token revoked".into() });
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        let auth_lost = CancellationToken::new();
        self.hub
            .state
            .lock()
            .unwrap()
            .auth_losses
            .insert(token.secret().to_owned(), auth_lost.clone());

        Ok(FakeLink { hub: self.hub.clone(), auth_lost })
    }
}

struct FakeLink {
    hub: Hub,
    auth_lost: CancellationToken,
}

impl DuplexLink for FakeLink {
    async fn read_root(&self) -> Result<Value, CoreError> {
        let root = self.hub.root();
        if root.is_null() {
            return Err(CoreError::NoData);
        }
        Ok(root)
    }

    async fn subscribe_children(&self, kind: EntityKind) -> Result<ChildFeed, CoreError> {
        let (tx, rx) = mpsc::channel(64);
        let mut st = self.hub.state.lock().unwrap();
        let root = st.root.clone();

        // The store replays current membership as child-added events.
        if let Some(collection) = kind.collection_in(&root) {
            for id in collection.keys() {
                let _ = tx.try_send(ChildEvent::Added(id.clone()));
            }
        }
        st.child_subs.push((kind, tx));
        Ok(ChildFeed { events: rx })
    }

    async fn subscribe_value(&self, kind: EntityKind, id: &str) -> Result<ValueFeed, CoreError> {
        let (tx, rx) = mpsc::channel(64);
        let mut st = self.hub.state.lock().unwrap();
        let root = st.root.clone();

        // Value watches emit the current value immediately.
        if let Some(value) = kind.collection_in(&root).and_then(|c| c.get(id)) {
            if let Some(record) = EntityRecord::from_value(kind, id, value) {
                let _ = tx.try_send(record);
            }
        }

        st.next_sub += 1;
        let sub_id = st.next_sub;
        st.value_subs.insert(sub_id, ValueSub { kind, id: id.to_owned(), tx });
        Ok(ValueFeed { id: sub_id, events: rx })
    }

    async fn unsubscribe(&self, id: u64) {
        self.hub.state.lock().unwrap().value_subs.remove(&id);
    }

    fn auth_lost(&self) -> CancellationToken {
        self.auth_lost.clone()
    }

    async fn close(&self) {}
}

// ── Fake admin session ──────────────────────────────────────────────

#[derive(Clone)]
struct FakeAdmin {
    hub: Hub,
    auth_calls: Arc<AtomicUsize>,
}

impl FakeAdmin {
    fn new(hub: Hub) -> Self {
        Self { hub, auth_calls: Arc::new(AtomicUsize::new(0)) }
    }
}

impl AdminStore for FakeAdmin {
    async fn ensure_authenticated(&self) -> Result<(), CoreError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_root(&self) -> Result<Value, CoreError> {
        let root = self.hub.root();
        if root.is_null() {
            return Err(CoreError::NoData);
        }
        Ok(root)
    }

    async fn write(&self, path: &str, data: Value) -> Result<(), CoreError> {
        self.hub.apply_write(path, &data);
        Ok(())
    }
}

// ── Fake push transport ─────────────────────────────────────────────

#[derive(Default)]
struct PushState {
    senders: HashMap<String, mpsc::Sender<syncpulse_core::PushUpdate>>,
    closers: HashMap<String, Vec<CancellationToken>>,
    reject_paths: HashSet<String>,
    opens: Vec<String>,
}

#[derive(Clone, Default)]
struct FakePushTransport {
    state: Arc<Mutex<PushState>>,
}

impl FakePushTransport {
    fn send_snapshot(&self, path: &str, snapshot: Value) {
        let tx = self.state.lock().unwrap().senders.get(path).cloned().unwrap();
        tx.try_send(syncpulse_core::PushUpdate::Snapshot(snapshot)).unwrap();
    }

    fn send_auth_revoked(&self, path: &str) {
        let tx = self.state.lock().unwrap().senders.get(path).cloned().unwrap();
        tx.try_send(syncpulse_core::PushUpdate::AuthRevoked).unwrap();
    }

    fn open_count(&self, path: &str) -> usize {
        self.state.lock().unwrap().opens.iter().filter(|p| *p == path).count()
    }

    /// Whether the most recent stream for `path` has been closed.
    fn last_closed(&self, path: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .closers
            .get(path)
            .and_then(|v| v.last())
            .is_some_and(CancellationToken::is_cancelled)
    }
}

impl PushTransport for FakePushTransport {
    async fn open_stream(&self, _token: &AccessToken, path: &str) -> Result<PushFeed, CoreError> {
        let mut st = self.state.lock().unwrap();
        if st.reject_paths.contains(path) {
            return Err(CoreError::AuthenticationFailed { message: format!("{path} rejected") });
        }

        let (tx, rx) = mpsc::channel(64);
        let closer = CancellationToken::new();
        st.senders.insert(path.to_owned(), tx);
        st.closers.entry(path.to_owned()).or_default().push(closer.clone());
        st.opens.push(path.to_owned());
        Ok(PushFeed::new(rx, closer))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn home_root() -> Value {
    json!({
        "structures": { "s1": { "name": "Home" } },
        "devices": {
            "thermostats": { "t1": { "target_temperature_f": 70 } },
            "smoke_co_alarms": { "a1": { "battery_health": "ok" } }
        }
    })
}

fn tokens() -> Vec<AccessToken> {
    vec![
        AccessToken::new("c.tenant-alpha-000001"),
        AccessToken::new("c.tenant-bravo-000002"),
        AccessToken::new("c.tenant-delta-000003"),
    ]
}

fn fast_settings() -> TickSettings {
    TickSettings {
        retry: RetryBudget::new(50, Duration::from_millis(10)),
        ..TickSettings::default()
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

fn all_observed(view: &PoolView, value: i64) -> bool {
    let workers = view.snapshot();
    !workers.is_empty()
        && workers.iter().all(|w| {
            w.last_update(EntityKind::Thermostat)
                .and_then(|r| r.property("target_temperature_f").cloned())
                == Some(json!(value))
        })
}

// ── Scenario A: all workers observe the update ──────────────────────

#[tokio::test]
async fn scenario_a_all_workers_observe_update() {
    let hub = Hub::new(home_root());
    let pool = WorkerPool::new(DuplexWorkerFactory::new(FakeDuplexTransport::new(hub.clone())));

    for token in tokens() {
        pool.start_worker(token).await.unwrap();
    }
    assert_eq!(pool.worker_count().await, 3);

    let view = pool.view();
    wait_until("workers observing the initial value", || all_observed(&view, 70)).await;

    let orchestrator =
        TestOrchestrator::new(FakeAdmin::new(hub.clone()), vec![pool.view()], fast_settings());
    let outcome = orchestrator.tick().await.unwrap();

    assert_eq!(outcome.target_id, "t1");
    assert_eq!(outcome.old_value, 70);
    assert_eq!(outcome.new_value, 71);

    let report = &outcome.reports[0];
    assert_eq!(report.total, 3);
    assert_eq!(report.delivered, 3);
    assert_eq!(report.lost(), 0);
    assert!(report.passed());

    // A second tick moves 71 -> 72 against the updated store.
    let outcome = orchestrator.tick().await.unwrap();
    assert_eq!(outcome.old_value, 71);
    assert_eq!(outcome.new_value, 72);
    assert!(outcome.reports[0].passed());

    pool.shutdown().await;
    assert!(
        pool.view().snapshot().iter().all(|w| w.state() == WorkerState::Stopped),
        "all workers stopped"
    );
    // Every value watch was released during teardown.
    assert_eq!(hub.value_sub_count(), 0);
}

// ── Scenario B: revocation, replacement, and snapshot exclusion ─────

#[tokio::test]
async fn scenario_b_revoked_worker_is_replaced() {
    let hub = Hub::new(home_root());
    let transport = FakeDuplexTransport::new(hub.clone());
    let pool = WorkerPool::new(DuplexWorkerFactory::new(transport.clone()));

    let tokens = tokens();
    for token in &tokens {
        pool.start_worker(token.clone()).await.unwrap();
    }
    let view = pool.view();
    wait_until("initial fleet running", || all_observed(&view, 70)).await;
    assert_eq!(transport.connect_count(), 3);

    let victim = tokens[1].clone();
    let old_worker = view
        .snapshot()
        .iter()
        .find(|w| w.token() == &victim)
        .cloned()
        .unwrap();

    // Park replacements so we can observe the excluded-from-snapshot state.
    transport.set_connects_allowed(false);
    hub.revoke(&victim);

    wait_until("old worker leaving the pool", || {
        view.snapshot().iter().all(|w| !w.same_worker(&old_worker))
    })
    .await;
    assert_eq!(view.snapshot().len(), 2);

    // A tick taken now only counts the two live workers.
    let orchestrator =
        TestOrchestrator::new(FakeAdmin::new(hub.clone()), vec![pool.view()], fast_settings());
    let outcome = orchestrator.tick().await.unwrap();
    assert_eq!(outcome.reports[0].total, 2);
    assert_eq!(outcome.reports[0].delivered, 2);

    // Release the replacement; it joins from the next tick onward.
    transport.set_connects_allowed(true);
    wait_until("replacement joining the pool", || view.snapshot().len() == 3).await;
    assert_eq!(transport.connect_count(), 4);

    let snapshot = view.snapshot();
    let unique: HashSet<&str> = snapshot.iter().map(|w| w.token().secret()).collect();
    assert_eq!(unique.len(), 3, "at most one worker per token");
    assert!(snapshot.iter().all(|w| w.state() == WorkerState::Running));
    assert_eq!(old_worker.state(), WorkerState::Stopped);

    let outcome = orchestrator.tick().await.unwrap();
    assert_eq!(outcome.reports[0].total, 3);
    assert_eq!(outcome.reports[0].delivered, 3);

    pool.shutdown().await;
}

#[tokio::test]
async fn simultaneous_revocations_replace_independently() {
    let hub = Hub::new(home_root());
    let transport = FakeDuplexTransport::new(hub.clone());
    let pool = WorkerPool::new(DuplexWorkerFactory::new(transport.clone()));

    let tokens = tokens();
    for token in &tokens {
        pool.start_worker(token.clone()).await.unwrap();
    }
    let view = pool.view();
    wait_until("initial fleet running", || all_observed(&view, 70)).await;

    let first_generation = view.snapshot();
    for token in &tokens {
        hub.revoke(token);
    }

    wait_until("every worker replaced", || {
        let snapshot = view.snapshot();
        snapshot.len() == 3
            && snapshot
                .iter()
                .all(|w| first_generation.iter().all(|old| !w.same_worker(old)))
            && snapshot.iter().all(|w| w.state() == WorkerState::Running)
    })
    .await;

    let snapshot = view.snapshot();
    let unique: HashSet<&str> = snapshot.iter().map(|w| w.token().secret()).collect();
    assert_eq!(unique.len(), 3);

    pool.shutdown().await;
}

#[tokio::test]
async fn duplex_worker_tracks_membership_changes() {
    let hub = Hub::new(home_root());
    let pool = WorkerPool::new(DuplexWorkerFactory::new(FakeDuplexTransport::new(hub.clone())));
    pool.start_worker(AccessToken::new("c.tenant-alpha-000001")).await.unwrap();

    let view = pool.view();
    wait_until("initial value observed", || all_observed(&view, 70)).await;
    // One value watch per entity: s1, t1, a1.
    assert_eq!(hub.value_sub_count(), 3);

    // A new thermostat appears; the worker opens a watch for it.
    hub.add_entity(EntityKind::Thermostat, "t9", json!({ "target_temperature_f": 60 }));
    wait_until("new entity watched", || hub.value_sub_count() == 4).await;

    // Updates to the new entity flow into last_update for its kind.
    hub.apply_write("/devices/thermostats/t9", &json!({ "target_temperature_f": 61 }));
    wait_until("new entity value observed", || {
        view.snapshot()[0]
            .last_update(EntityKind::Thermostat)
            .is_some_and(|r| r.id == "t9" && r.property("target_temperature_f") == Some(&json!(61)))
    })
    .await;

    // Removal releases exactly that watch.
    hub.remove_entity(EntityKind::Thermostat, "t9");
    wait_until("removed entity released", || hub.value_sub_count() == 3).await;

    pool.shutdown().await;
    assert_eq!(hub.value_sub_count(), 0);
}

#[tokio::test]
async fn start_failure_leaves_no_worker() {
    let hub = Hub::new(home_root());
    let transport = FakeDuplexTransport::new(hub);
    let bad = AccessToken::new("c.revoked-tenant-0009");
    transport.reject_token(&bad);

    let pool = WorkerPool::new(DuplexWorkerFactory::new(transport));
    let err = pool.start_worker(bad).await.unwrap_err();
    assert!(err.is_auth());
    assert_eq!(pool.worker_count().await, 0);
}

// ── Scenario C: empty collection aborts the tick only ───────────────

#[tokio::test]
async fn scenario_c_empty_collection_skips_tick() {
    let hub = Hub::new(json!({
        "structures": { "s1": { "name": "Home" } },
        "devices": { "thermostats": {}, "smoke_co_alarms": {} }
    }));

    let orchestrator = TestOrchestrator::new(
        FakeAdmin::new(hub),
        Vec::new(),
        fast_settings(),
    );

    let err = orchestrator.tick().await.unwrap_err();
    assert!(matches!(err, CoreError::NoEntities { kind: EntityKind::Thermostat }));

    // The failure is per-tick: the next tick runs again without issue.
    let err = orchestrator.tick().await.unwrap_err();
    assert!(matches!(err, CoreError::NoEntities { .. }));
}

#[tokio::test]
async fn missing_snapshot_reports_no_data() {
    let orchestrator = TestOrchestrator::new(
        FakeAdmin::new(Hub::new(Value::Null)),
        Vec::new(),
        fast_settings(),
    );
    let err = orchestrator.tick().await.unwrap_err();
    assert!(matches!(err, CoreError::NoData));
}

// ── Push-stream worker lifecycle ────────────────────────────────────

#[tokio::test]
async fn push_worker_reconciles_snapshots() {
    let transport = FakePushTransport::default();
    let pool = WorkerPool::new(PushWorkerFactory::new(transport.clone()));
    pool.start_worker(AccessToken::new("c.tenant-alpha-000001")).await.unwrap();

    // One stream per top-level collection.
    for kind in EntityKind::iter() {
        assert_eq!(transport.open_count(kind.collection_path()), 1);
    }

    // First put seeds the topology; entity streams open lazily.
    transport.send_snapshot(
        "/devices/thermostats",
        json!({ "t1": { "target_temperature_f": 70 }, "t2": { "target_temperature_f": 65 } }),
    );
    wait_until("entity streams opening", || {
        transport.open_count("/devices/thermostats/t1") == 1
            && transport.open_count("/devices/thermostats/t2") == 1
    })
    .await;

    // Entity put updates the worker's last-observed record.
    transport.send_snapshot("/devices/thermostats/t1", json!({ "target_temperature_f": 71 }));
    let view = pool.view();
    wait_until("value observed", || {
        view.snapshot()[0]
            .last_update(EntityKind::Thermostat)
            .and_then(|r| r.property("target_temperature_f").cloned())
            == Some(json!(71))
    })
    .await;

    // Re-applying an identical membership set opens nothing new.
    transport.send_snapshot(
        "/devices/thermostats",
        json!({ "t1": { "target_temperature_f": 71 }, "t2": { "target_temperature_f": 65 } }),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.open_count("/devices/thermostats/t1"), 1);
    assert_eq!(transport.open_count("/devices/thermostats/t2"), 1);

    // Removal closes the entity stream; re-adding opens a fresh one.
    transport.send_snapshot("/devices/thermostats", json!({ "t2": { "target_temperature_f": 65 } }));
    wait_until("removed entity stream closing", || {
        transport.last_closed("/devices/thermostats/t1")
    })
    .await;

    transport.send_snapshot(
        "/devices/thermostats",
        json!({ "t1": { "target_temperature_f": 72 }, "t2": { "target_temperature_f": 65 } }),
    );
    wait_until("re-added entity stream opening", || {
        transport.open_count("/devices/thermostats/t1") == 2
    })
    .await;

    pool.shutdown().await;
    for kind in EntityKind::iter() {
        assert!(transport.last_closed(kind.collection_path()), "collection stream closed");
    }
}

#[tokio::test]
async fn push_worker_disconnects_on_stream_revocation() {
    let transport = FakePushTransport::default();
    let pool = WorkerPool::new(PushWorkerFactory::new(transport.clone()));
    pool.start_worker(AccessToken::new("c.tenant-alpha-000001")).await.unwrap();

    let view = pool.view();
    let first = view.snapshot()[0].clone();

    transport.send_auth_revoked("/structures");

    // The pool replaces the worker with a fresh one for the same token.
    wait_until("worker replaced after revocation", || {
        let snapshot = view.snapshot();
        snapshot.len() == 1 && !snapshot[0].same_worker(&first)
    })
    .await;
    assert_eq!(first.state(), WorkerState::Stopped);
    assert_eq!(view.snapshot()[0].state(), WorkerState::Running);

    pool.shutdown().await;
}

#[tokio::test]
async fn push_start_fails_closed_on_unauthorized_stream() {
    let transport = FakePushTransport::default();
    transport
        .state
        .lock()
        .unwrap()
        .reject_paths
        .insert("/devices/thermostats".into());

    let pool = WorkerPool::new(PushWorkerFactory::new(transport.clone()));
    let err = pool
        .start_worker(AccessToken::new("c.tenant-alpha-000001"))
        .await
        .unwrap_err();
    assert!(err.is_auth());
    assert_eq!(pool.worker_count().await, 0);

    // The structures stream opened before the failure was closed again.
    assert!(transport.last_closed("/structures"));
}

// ── Tick scheduling: no overlap when a tick outlives the interval ───

#[derive(Clone)]
struct SlowAdmin {
    hub: Hub,
    delay: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
}

impl SlowAdmin {
    fn new(hub: Hub, delay: Duration) -> Self {
        Self {
            hub,
            delay,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl AdminStore for SlowAdmin {
    async fn ensure_authenticated(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn read_root(&self) -> Result<Value, CoreError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.hub.root())
    }

    async fn write(&self, path: &str, data: Value) -> Result<(), CoreError> {
        self.hub.apply_write(path, &data);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn tick_overrun_does_not_overlap() {
    let admin = SlowAdmin::new(Hub::new(home_root()), Duration::from_millis(300));
    let settings = TickSettings {
        interval: Duration::from_millis(100),
        retry: RetryBudget::new(1, Duration::from_millis(1)),
        ..TickSettings::default()
    };

    let orchestrator = Arc::new(TestOrchestrator::new(admin.clone(), Vec::new(), settings));
    let cancel = CancellationToken::new();

    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        let cancel = cancel.clone();
        tokio::spawn(async move { orchestrator.run(cancel).await })
    };

    tokio::time::sleep(Duration::from_secs(3)).await;
    cancel.cancel();
    runner.await.unwrap();

    assert!(admin.reads.load(Ordering::SeqCst) >= 2, "multiple ticks ran");
    assert_eq!(
        admin.max_in_flight.load(Ordering::SeqCst),
        1,
        "ticks are serialized even when a tick outlives the interval"
    );
}
