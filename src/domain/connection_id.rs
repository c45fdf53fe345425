//! Type-safe connection identifier.
//!
//! [`ConnectionId`] addresses one slot of the pool's connection arena. The
//! generation half makes an id stale once its connection is deleted, even if
//! the slot is later reused.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a connection inside a [`crate::service::ConnectionPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId {
    index: u32,
    generation: u32,
}

impl ConnectionId {
    /// Creates an id from an arena slot index and its generation.
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Returns the arena slot index.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Returns the slot generation this id was issued for.
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cnx-{}.{}", self.index, self.generation)
    }
}
