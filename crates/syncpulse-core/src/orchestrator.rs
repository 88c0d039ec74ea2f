// ── Test orchestrator ──
//
// Drives the write-then-verify cycle: authenticate once (cached), read
// the store, mutate one randomly chosen entity's monitored property with
// the wrap-around increment, then fan-out-poll every worker in every
// configured pool for delivery of the new value.
//
// Ticks are serialized: a tick runs to completion before the next one is
// scheduled, so a poll that outlives the interval delays the next tick
// rather than overlapping it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rand::Rng;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::model::{AccessToken, EntityKind};
use crate::pool::PoolView;
use crate::retry::{RetryBudget, poll_until};
use crate::transport::AdminStore;

/// The property each tick mutates and verifies.
pub const MONITORED_PROPERTY: &str = "target_temperature_f";

// ── Settings ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TickSettings {
    /// Interval between tick starts.
    pub interval: Duration,
    /// Per-worker delivery poll budget.
    pub retry: RetryBudget,
    /// Which collection the tick mutates.
    pub target_kind: EntityKind,
    /// Which property the tick mutates and polls.
    pub property: String,
}

impl Default for TickSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            retry: RetryBudget::new(60, Duration::from_millis(500)),
            target_kind: EntityKind::Thermostat,
            property: MONITORED_PROPERTY.into(),
        }
    }
}

// ── Reports ─────────────────────────────────────────────────────────

/// Aggregated delivery result for one pool in one tick.
#[derive(Debug, Clone)]
pub struct PoolReport {
    pub transport: crate::model::TransportKind,
    pub total: usize,
    pub delivered: usize,
    pub lost_tokens: Vec<AccessToken>,
    pub max_elapsed_ms: u64,
}

impl PoolReport {
    pub fn lost(&self) -> usize {
        self.lost_tokens.len()
    }

    pub fn passed(&self) -> bool {
        self.lost_tokens.is_empty()
    }
}

/// Everything one successful tick did.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub started_at: DateTime<Utc>,
    pub target_id: String,
    pub old_value: i64,
    pub new_value: i64,
    pub reports: Vec<PoolReport>,
}

// ── Wrap rule ───────────────────────────────────────────────────────

/// Wrap-around increment for the monitored property: `v + 1`, except the
/// step that would land on 90 wraps to 50.
pub fn next_value(value: i64) -> i64 {
    let mut next = value + 1;
    if next == 90 {
        next = 50;
    }
    next
}

// ── TestOrchestrator ────────────────────────────────────────────────

pub struct TestOrchestrator<A: AdminStore> {
    admin: A,
    pools: Vec<PoolView>,
    settings: TickSettings,
}

impl<A: AdminStore> TestOrchestrator<A> {
    pub fn new(admin: A, pools: Vec<PoolView>, settings: TickSettings) -> Self {
        Self { admin, pools, settings }
    }

    pub fn settings(&self) -> &TickSettings {
        &self.settings
    }

    /// Run the periodic tick loop until cancelled.
    ///
    /// A tick that fails (missing snapshot, empty collection, store
    /// error) is logged; the loop continues with the next tick.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "tick failed");
                    }
                }
            }
        }
    }

    /// One write-then-verify cycle.
    pub async fn tick(&self) -> Result<TickOutcome, CoreError> {
        let started_at = Utc::now();

        // Authenticate once; cached by the admin session thereafter.
        self.admin.ensure_authenticated().await?;

        let root = self.admin.read_root().await?;
        let kind = self.settings.target_kind;
        let collection = kind
            .collection_in(&root)
            .ok_or(CoreError::NoEntities { kind })?;
        if collection.is_empty() {
            return Err(CoreError::NoEntities { kind });
        }

        // Choose one entity uniformly at random.
        let keys: Vec<&String> = collection.keys().collect();
        let target_id = {
            let index = rand::thread_rng().gen_range(0..keys.len());
            keys[index].clone()
        };

        let property = self.settings.property.as_str();
        let old_value = collection
            .get(&target_id)
            .and_then(|entity| entity.get(property))
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| CoreError::MissingProperty {
                id: target_id.clone(),
                property: property.to_owned(),
            })?;
        let new_value = next_value(old_value);

        tracing::info!(device = %target_id, value = new_value, "sending update");
        self.admin
            .write(
                &kind.entity_path(&target_id),
                serde_json::json!({ property: new_value }),
            )
            .await?;

        // Fan-out: all pools, and all workers within each pool, in parallel.
        let expected = serde_json::Value::from(new_value);
        let polls = self.pools.iter().map(|view| self.poll_pool(view, &expected));
        let reports: Vec<PoolReport> = join_all(polls).await;

        for report in &reports {
            emit_report(report);
        }

        Ok(TickOutcome { started_at, target_id, old_value, new_value, reports })
    }

    /// Poll every worker in one pool snapshot for the expected value.
    async fn poll_pool(&self, view: &PoolView, expected: &serde_json::Value) -> PoolReport {
        let workers = view.snapshot();
        let kind = self.settings.target_kind;
        let budget = self.settings.retry;

        let checks = workers.iter().map(|worker| {
            let worker = worker.clone();
            let property = self.settings.property.as_str();
            async move {
                let outcome = poll_until(budget, || {
                    worker
                        .last_update(kind)
                        .is_some_and(|record| record.property(property) == Some(expected))
                })
                .await;
                (worker, outcome)
            }
        });

        let results = join_all(checks).await;

        let total = results.len();
        let mut delivered = 0usize;
        let mut lost_tokens = Vec::new();
        let mut max_elapsed_ms = 0u64;
        for (worker, outcome) in results {
            max_elapsed_ms = max_elapsed_ms.max(outcome.elapsed_ms());
            if outcome.delivered {
                delivered += 1;
            } else {
                lost_tokens.push(worker.token().clone());
            }
        }

        PoolReport {
            transport: view.transport(),
            total,
            delivered,
            lost_tokens,
            max_elapsed_ms,
        }
    }
}

// ── Reporting ───────────────────────────────────────────────────────

/// One concise pass/fail line per pool per tick; failing tokens are
/// listed separately for diagnosis.
fn emit_report(report: &PoolReport) {
    if report.passed() {
        tracing::info!(
            transport = %report.transport,
            total = report.total,
            delivered = report.delivered,
            lost = 0usize,
            max_elapsed_ms = report.max_elapsed_ms,
            "sync test passed"
        );
    } else {
        tracing::error!(
            transport = %report.transport,
            total = report.total,
            delivered = report.delivered,
            lost = report.lost(),
            max_elapsed_ms = report.max_elapsed_ms,
            "sync test failed"
        );
        let tokens: Vec<String> = report.lost_tokens.iter().map(AccessToken::redacted).collect();
        tracing::error!(
            transport = %report.transport,
            clients = ?tokens,
            "lost updates for subscriber clients"
        );
    }
}

// ── Tests ───────────────────────────────────────────────────────────
