//! # idmef-relay
//!
//! Reliable delivery of security events from a sensor to its collectors.
//!
//! Events are routed through a [`service::ConnectionPool`] whose topology is
//! an OR-list of AND-groups (`a && b || c`). Every message reaches all
//! members of the first group that still has a live connection; members that
//! are down, and the whole pool when every group is down, spool the message
//! to a crash-consistent [`persistence::FailoverJournal`]. Dead connections
//! are retried with exponential backoff and replay their backlog in order
//! once they are back.
//!
//! ## Architecture
//!
//! ```text
//! Sensor (broadcast / broadcast_async)
//!     │
//!     ├── ConnectionPool (service/)
//!     │     ├── reactor: check_event / process_events / recv
//!     │     ├── timers: reconnection backoff
//!     │     └── EventBus + handlers (domain/)
//!     │
//!     ├── Link / Connector (transport/)
//!     │     └── TCP, 16-byte framed messages
//!     │
//!     └── FailoverJournal (persistence/)
//!           └── data spool + 20-byte recovery records
//! ```

pub mod config;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod service;
pub mod transport;
