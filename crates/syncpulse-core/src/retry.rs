// ── Bounded retry polling ──
//
// The reusable primitive behind delivery checks: evaluate a predicate up
// to `attempts` times, spaced `interval` apart, and report how long the
// whole poll took. No external cancellation -- the only early exit is the
// predicate turning true.

use std::time::Duration;

use tokio::time::Instant;

/// Retry budget: up to `attempts` checks spaced `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryBudget {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Worst-case wall time of one poll under this budget.
    pub fn max_wait(&self) -> Duration {
        self.interval * self.attempts
    }
}

/// Result of one bounded poll.
#[derive(Debug, Clone, Copy)]
pub struct PollOutcome {
    pub delivered: bool,
    pub elapsed: Duration,
}

impl PollOutcome {
    /// Elapsed wall-clock time in whole milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Poll `check` until it returns `true` or the budget is exhausted.
///
/// The first check happens immediately; no sleep follows the final one.
/// Elapsed time runs from just before the first check to the moment of
/// success or exhaustion.
pub async fn poll_until<F>(budget: RetryBudget, mut check: F) -> PollOutcome
where
    F: FnMut() -> bool,
{
    let start = Instant::now();

    for attempt in 0..budget.attempts {
        if check() {
            return PollOutcome { delivered: true, elapsed: start.elapsed() };
        }
        if attempt + 1 < budget.attempts {
            tokio::time::sleep(budget.interval).await;
        }
    }

    PollOutcome { delivered: false, elapsed: start.elapsed() }
}

// ── Tests ───────────────────────────────────────────────────────────
