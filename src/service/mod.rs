//! Service layer: the connection pool.
//!
//! [`ConnectionPool`] owns the topology, tracks connection liveness, routes
//! messages and replays failover backlogs. Its state sits behind one async
//! mutex; transitions recorded under that lock are published to handlers and
//! to the [`crate::domain::EventBus`] once it is released.

mod arena;
mod async_queue;
mod delivery;
pub mod handler;
pub mod pool;
mod reactor;
mod state;
mod timer;

#[cfg(test)]
mod tests;

pub use handler::{ConnectionCallback, EventHandler, GlobalCallback};
pub use pool::{CHECK_INTERVAL, ConnectionPool};
