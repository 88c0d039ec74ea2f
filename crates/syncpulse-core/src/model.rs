// ── Core domain types ──
//
// AccessToken, EntityKind, and EntityRecord form the foundation of every
// worker and orchestrator operation. EntityKind knows where each
// collection lives in the hierarchical store; AccessToken guarantees
// credentials never leak whole into logs.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ── AccessToken ─────────────────────────────────────────────────────

/// Opaque credential identifying one tenant client (or the privileged
/// master identity). Immutable once assigned to a worker.
///
/// `Debug` and `Display` render the redacted `first5…last5` form so a
/// token never appears whole in logs or reports.
#[derive(Clone)]
pub struct AccessToken(Arc<str>);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::from(token.into()))
    }

    /// The full secret, for handing to the transport layer only.
    pub fn secret(&self) -> &str {
        &self.0
    }

    /// Redacted rendering: first five and last five characters.
    pub fn redacted(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 10 {
            return "…".into();
        }
        let head: String = chars.iter().take(5).collect();
        let tail: String = chars.iter().skip(chars.len() - 5).collect();
        format!("{head}…{tail}")
    }
}

impl PartialEq for AccessToken {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for AccessToken {}

impl std::hash::Hash for AccessToken {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken({})", self.redacted())
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.redacted())
    }
}

// ── EntityKind ──────────────────────────────────────────────────────

/// The three entity kinds the store exposes at its top level.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    Structure,
    Thermostat,
    SmokeAlarm,
}

impl EntityKind {
    /// Store path of this kind's top-level collection.
    pub fn collection_path(self) -> &'static str {
        match self {
            Self::Structure => "/structures",
            Self::Thermostat => "/devices/thermostats",
            Self::SmokeAlarm => "/devices/smoke_co_alarms",
        }
    }

    /// Store path of one entity of this kind.
    pub fn entity_path(self, id: &str) -> String {
        format!("{}/{id}", self.collection_path())
    }

    /// Locate this kind's collection object inside a root snapshot.
    pub fn collection_in(self, root: &serde_json::Value) -> Option<&serde_json::Map<String, serde_json::Value>> {
        let node = match self {
            Self::Structure => root.get("structures"),
            Self::Thermostat => root.get("devices")?.get("thermostats"),
            Self::SmokeAlarm => root.get("devices")?.get("smoke_co_alarms"),
        };
        node?.as_object()
    }
}

// ── EntityRecord ────────────────────────────────────────────────────

/// One addressable item in the store: an id plus its property map.
///
/// Produced from store snapshots; never mutated locally.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub id: String,
    pub kind: EntityKind,
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl EntityRecord {
    /// Build a record from a snapshot value; `None` unless it is an object.
    pub fn from_value(kind: EntityKind, id: &str, value: &serde_json::Value) -> Option<Self> {
        value.as_object().map(|properties| Self {
            id: id.to_owned(),
            kind,
            properties: properties.clone(),
        })
    }

    pub fn property(&self, name: &str) -> Option<&serde_json::Value> {
        self.properties.get(name)
    }
}

// ── TransportKind ───────────────────────────────────────────────────

/// Which of the two streaming transports a worker or pool uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Persistent bidirectional session with incremental child events.
    Duplex,
    /// Independent per-path push streams with full-snapshot events.
    Stream,
}

impl TransportKind {
    /// Short label used in per-tick report lines.
    pub fn label(self) -> &'static str {
        match self {
            Self::Duplex => "duplex",
            Self::Stream => "stream",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ── Tests ───────────────────────────────────────────────────────────
