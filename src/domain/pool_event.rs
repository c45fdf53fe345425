//! Domain events reflecting connection state changes.
//!
//! Every liveness transition, received message and journal spill emits a
//! [`PoolEvent`] through the [`super::EventBus`]. Handlers registered on the
//! pool see the same transitions as [`ConnectionEvent`]s.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{ConnectionId, EventFlags};
use crate::transport::Message;

/// Liveness of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Connected; messages are sent directly.
    Alive,
    /// Not connected; messages go to the failover journal.
    Dead,
}

/// Snapshot of one connection, as reported to handlers and callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Endpoint address as written in the connection string.
    pub addr: String,
    /// Current liveness.
    pub state: ConnectionState,
    /// Index of the owning AND-group in OR order.
    pub group: usize,
    /// Messages waiting in the connection's private journal.
    pub backlog: usize,
    /// Delay before the next reconnection attempt, in seconds.
    pub retry_interval_secs: u64,
}

/// Where a spilled or flushed message was journaled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum JournalTarget {
    /// The pool-wide journal.
    Global,
    /// The private journal of a connection.
    Connection {
        /// Connection identifier.
        id: ConnectionId,
        /// Endpoint address.
        addr: String,
    },
}

/// Event published on the pool's event bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum PoolEvent {
    /// A connection became alive.
    ConnectionAlive {
        /// Connection identifier.
        connection: ConnectionId,
        /// Endpoint address.
        addr: String,
        /// Transition timestamp.
        timestamp: DateTime<Utc>,
    },

    /// A connection went down.
    ConnectionDead {
        /// Connection identifier.
        connection: ConnectionId,
        /// Endpoint address.
        addr: String,
        /// Human-readable failure reason.
        reason: String,
        /// Transition timestamp.
        timestamp: DateTime<Utc>,
    },

    /// A message arrived on a connection.
    Input {
        /// Connection identifier.
        connection: ConnectionId,
        /// Endpoint address.
        addr: String,
        /// Message tag.
        tag: u8,
        /// Serialized message length.
        len: usize,
        /// Reception timestamp.
        timestamp: DateTime<Utc>,
    },

    /// A message was written to a failover journal.
    Spooled {
        /// Journal receiving the message.
        target: JournalTarget,
        /// Backlog after the write.
        backlog: usize,
        /// Spill timestamp.
        timestamp: DateTime<Utc>,
    },

    /// A journal backlog was replayed.
    Flushed {
        /// Journal that was replayed.
        target: JournalTarget,
        /// Messages sent during this flush.
        flushed: usize,
        /// Messages still waiting afterwards.
        remaining: usize,
        /// Flush timestamp.
        timestamp: DateTime<Utc>,
    },
}

impl PoolEvent {
    /// Returns the connection this event is about, if any.
    #[must_use]
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            Self::ConnectionAlive { connection, .. }
            | Self::ConnectionDead { connection, .. }
            | Self::Input { connection, .. } => Some(*connection),
            Self::Spooled { target, .. } | Self::Flushed { target, .. } => match target {
                JournalTarget::Global => None,
                JournalTarget::Connection { id, .. } => Some(*id),
            },
        }
    }

    /// Returns the handler flag matching this event, if any.
    #[must_use]
    pub const fn flag(&self) -> Option<EventFlags> {
        match self {
            Self::ConnectionAlive { .. } => Some(EventFlags::ALIVE),
            Self::ConnectionDead { .. } => Some(EventFlags::DEAD),
            Self::Input { .. } => Some(EventFlags::INPUT),
            Self::Spooled { .. } | Self::Flushed { .. } => None,
        }
    }

    /// Returns the event type as a static string slice.
    #[must_use]
    pub const fn event_type_str(&self) -> &'static str {
        match self {
            Self::ConnectionAlive { .. } => "connection_alive",
            Self::ConnectionDead { .. } => "connection_dead",
            Self::Input { .. } => "input",
            Self::Spooled { .. } => "spooled",
            Self::Flushed { .. } => "flushed",
        }
    }
}

/// Event handed to a per-connection handler.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    /// Which event happened (exactly one flag).
    pub flag: EventFlags,
    /// State of the connection when the event was recorded.
    pub connection: ConnectionInfo,
    /// Received message, for [`EventFlags::INPUT`].
    pub message: Option<Message>,
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn dead_event_serializes_with_type_tag() {
        let event = PoolEvent::ConnectionDead {
            connection: ConnectionId::new(0, 0),
            addr: "10.0.0.1:4690".to_string(),
            reason: "connection refused".to_string(),
            timestamp: Utc::now(),
        };
        let Ok(json) = serde_json::to_string(&event) else {
            panic!("serialization failed");
        };
        assert!(json.contains("connection_dead"));
        assert!(json.contains("connection refused"));
        assert_eq!(event.flag(), Some(EventFlags::DEAD));
    }

    #[test]
    fn global_spill_has_no_connection() {
        let event = PoolEvent::Spooled {
            target: JournalTarget::Global,
            backlog: 3,
            timestamp: Utc::now(),
        };
        assert_eq!(event.connection(), None);
        assert_eq!(event.flag(), None);
        assert_eq!(event.event_type_str(), "spooled");
    }

    #[test]
    fn private_flush_reports_connection() {
        let id = ConnectionId::new(2, 1);
        let event = PoolEvent::Flushed {
            target: JournalTarget::Connection {
                id,
                addr: "a".to_string(),
            },
            flushed: 4,
            remaining: 0,
            timestamp: Utc::now(),
        };
        assert_eq!(event.connection(), Some(id));
    }
}
