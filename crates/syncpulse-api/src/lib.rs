// syncpulse-api: Async wire-level clients for the realtime store.
//
// Two physically distinct transports, selectable per consumer:
//   - `duplex`: one persistent bidirectional WebSocket session carrying
//     authentication, queries, writes, and incremental subscription events.
//   - `push`: independent long-lived HTTP streams, one per watched path,
//     each delivering full-subtree snapshots as newline-delimited JSON.

pub mod duplex;
pub mod error;
pub mod push;
pub mod transport;
pub mod wire;

pub use duplex::{AuthState, DuplexSession, Subscription};
pub use error::Error;
pub use push::{PushClient, PushEvent, PushStream};
pub use transport::{TlsMode, TransportConfig};
pub use wire::{EventKind, StoreEvent};
