// syncpulse-core: The verification engine between syncpulse-api and the binary.
//
// Workers mirror the store's entity tree per tenant over one of two
// transports; pools keep the worker fleet alive; the orchestrator drives
// write-then-verify ticks and aggregates per-pool delivery reports.

pub mod admin;
pub mod connect;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod pool;
pub mod retry;
pub mod topology;
pub mod transport;
pub mod worker;

// ── Primary re-exports ──────────────────────────────────────────────
pub use admin::AdminSession;
pub use connect::{HttpPushTransport, WsDuplexTransport};
pub use error::CoreError;
pub use model::{AccessToken, EntityKind, EntityRecord, TransportKind};
pub use orchestrator::{
    MONITORED_PROPERTY, PoolReport, TestOrchestrator, TickOutcome, TickSettings, next_value,
};
pub use pool::{PoolView, WorkerPool};
pub use retry::{PollOutcome, RetryBudget, poll_until};
pub use topology::{SubscriptionHandle, SubscriptionTopology};
pub use transport::{
    AdminStore, ChildEvent, ChildFeed, DuplexLink, DuplexTransport, PushFeed, PushTransport,
    PushUpdate, ValueFeed,
};
pub use worker::duplex::DuplexWorkerFactory;
pub use worker::push::PushWorkerFactory;
pub use worker::{WorkerFactory, WorkerHandle, WorkerState};
