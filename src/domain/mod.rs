//! Domain layer: identifiers, flags, topology, backoff and events.
//!
//! This module holds the plain data model of the relay: how connections are
//! identified, how a connection string maps to OR/AND groups, how the
//! reconnection delay evolves and what the pool reports when connection
//! state changes.

pub mod backoff;
pub mod connection_id;
pub mod event_bus;
pub mod flags;
pub mod pool_event;
pub mod profile;
pub mod topology;

pub use backoff::Backoff;
pub use connection_id::ConnectionId;
pub use event_bus::EventBus;
pub use flags::{EventFlags, PoolFlags};
pub use pool_event::{ConnectionEvent, ConnectionInfo, ConnectionState, JournalTarget, PoolEvent};
pub use profile::{ClientProfile, Permission};
pub use topology::Topology;
