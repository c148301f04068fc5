//! Client side of resilient chat delivery: one reconnecting transport, a
//! room-scoped protocol on top of it, an offline queue that replays actions
//! in order, and a reconciler that merges optimistic sends with confirmed
//! history.

pub mod config;
pub mod connection;
pub mod offline_queue;
pub mod protocol_client;
pub mod reconciler;
pub mod session;
pub mod transport;

pub use config::{load_settings, ClientSettings};
pub use connection::{BackoffPolicy, ConnectionManager, ConnectionOptions, ConnectionState};
pub use offline_queue::{
    DeliveryFailure, DrainOutcome, OfflineActionQueue, OutgoingMessage, QueueEvent, QueuedAction,
};
pub use protocol_client::{ChatEvent, ChatProtocol, ProtocolClient, ProtocolError};
pub use reconciler::{
    DeliveryReconciler, DeliveryState, LocalId, OptimisticMessageRecord, ReconcileError,
    ReconcilerUpdate, TimelineEntry,
};
pub use session::ChatSession;
pub use transport::{
    Transport, TransportConnector, TransportError, TransportEvent, TransportSession,
    WebSocketConnector,
};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
