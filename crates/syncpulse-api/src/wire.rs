// ── Duplex wire protocol ──
//
// JSON frames tagged with `"t"`. Client frames carry a request id (`rid`)
// echoed back in the matching ack; event frames reference the subscription
// id (`sub`) assigned by the store in the `listen` ack.

use serde::{Deserialize, Serialize};

/// The three subscription event kinds the store emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// One child id appeared under the watched path.
    ChildAdded,
    /// One child id disappeared from under the watched path.
    ChildRemoved,
    /// The value at the watched path changed (full value per event).
    Value,
}

/// Frames sent by the client over the duplex session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        rid: u64,
        token: String,
    },
    Unauth {
        rid: u64,
    },
    Listen {
        rid: u64,
        path: String,
        query: EventKind,
    },
    Unlisten {
        rid: u64,
        sub: u64,
    },
    Query {
        rid: u64,
        path: String,
    },
    Put {
        rid: u64,
        path: String,
        data: serde_json::Value,
    },
}

/// Frames received from the store over the duplex session.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Response to a client frame, matched by `rid`.
    Ack {
        rid: u64,
        #[serde(default)]
        ok: bool,
        /// Subscription id, present on successful `listen` acks.
        #[serde(default)]
        sub: Option<u64>,
        /// Result payload, present on successful `query` acks.
        #[serde(default)]
        data: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },
    /// Subscription event for a live `listen`.
    Event {
        sub: u64,
        kind: EventKind,
        /// Child id for `child_added` / `child_removed` events.
        #[serde(default)]
        key: Option<String>,
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
    /// The store revoked this session's authentication.
    AuthRevoked,
}

/// One event delivered to a duplex subscriber.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub kind: EventKind,
    /// Child id for `child_added` / `child_removed`; `None` for `value`.
    pub key: Option<String>,
    pub data: Option<serde_json::Value>,
}
