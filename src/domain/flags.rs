//! Pool behaviour flags and event masks.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Behaviour switches of a [`crate::service::ConnectionPool`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PoolFlags: u8 {
        /// Retry dead connections on a backoff timer.
        const RECONNECT = 0b01;
        /// Spool undeliverable messages to failover journals.
        const FAILOVER = 0b10;
    }
}

bitflags! {
    /// Connection events a handler can subscribe to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct EventFlags: u8 {
        /// A connection has a message ready to read.
        const INPUT = 0b001;
        /// A connection went down.
        const DEAD = 0b010;
        /// A connection came (back) up.
        const ALIVE = 0b100;
    }
}

impl Default for PoolFlags {
    fn default() -> Self {
        Self::RECONNECT | Self::FAILOVER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_flags_enable_reconnect_and_failover() {
        let flags = PoolFlags::default();
        assert!(flags.contains(PoolFlags::RECONNECT));
        assert!(flags.contains(PoolFlags::FAILOVER));
    }

    #[test]
    fn event_masks_combine() {
        let wanted = EventFlags::DEAD | EventFlags::ALIVE;
        assert!(wanted.intersects(EventFlags::DEAD));
        assert!(!wanted.intersects(EventFlags::INPUT));
    }
}
