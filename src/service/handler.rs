//! Event handlers registered on a pool.

use std::fmt;
use std::sync::Arc;

use super::state::Notice;
use crate::domain::{ConnectionEvent, EventBus, EventFlags};

/// Callback of a global handler, receiving the OR of one pass's flags.
pub type GlobalCallback = Arc<dyn Fn(EventFlags) + Send + Sync>;

/// Callback of a per-connection handler.
pub type ConnectionCallback = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// A handler for connection events.
///
/// A pool keeps one handler of each kind; registering a new one replaces the
/// previous handler of the same kind. Handlers run after the pool lock is
/// released and may call back into the pool.
#[derive(Clone)]
pub enum EventHandler {
    /// Called once per pass with every flag raised during that pass.
    Global {
        /// Flags that trigger the callback.
        wanted: EventFlags,
        /// The callback.
        callback: GlobalCallback,
    },
    /// Called once per affected connection.
    Connection {
        /// Flags that trigger the callback.
        wanted: EventFlags,
        /// The callback.
        callback: ConnectionCallback,
    },
}

impl EventHandler {
    /// Creates a global handler.
    pub fn global(wanted: EventFlags, callback: impl Fn(EventFlags) + Send + Sync + 'static) -> Self {
        Self::Global {
            wanted,
            callback: Arc::new(callback),
        }
    }

    /// Creates a per-connection handler.
    pub fn connection(
        wanted: EventFlags,
        callback: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            wanted,
            callback: Arc::new(callback),
        }
    }

    /// Flags this handler subscribes to.
    #[must_use]
    pub const fn wanted(&self) -> EventFlags {
        match self {
            Self::Global { wanted, .. } | Self::Connection { wanted, .. } => *wanted,
        }
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Global { .. } => "Global",
            Self::Connection { .. } => "Connection",
        };
        f.debug_struct("EventHandler")
            .field("kind", &kind)
            .field("wanted", &self.wanted())
            .finish_non_exhaustive()
    }
}

/// The two handler slots of a pool.
#[derive(Debug, Clone, Default)]
pub(crate) struct HandlerSlots {
    global: Option<EventHandler>,
    connection: Option<EventHandler>,
}

impl HandlerSlots {
    pub(crate) fn set(&mut self, handler: EventHandler) {
        match handler {
            EventHandler::Global { .. } => self.global = Some(handler),
            EventHandler::Connection { .. } => self.connection = Some(handler),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.global = None;
        self.connection = None;
    }

    /// Union of the flags wanted by both slots.
    pub(crate) fn wanted(&self) -> EventFlags {
        [&self.global, &self.connection]
            .into_iter()
            .flatten()
            .fold(EventFlags::empty(), |acc, handler| acc | handler.wanted())
    }

    /// Publishes `notices` on `bus` and runs the handlers.
    ///
    /// The per-connection handler sees each notice in order; the global one
    /// runs once at the end.
    pub(crate) fn dispatch(&self, notices: Vec<Notice>, bus: &EventBus) {
        if notices.is_empty() {
            return;
        }
        let mut pass = EventFlags::empty();
        for notice in notices {
            pass |= notice.flag();
            if let Some(EventHandler::Connection { wanted, callback }) = &self.connection
                && let Some(event) = &notice.connection
                && wanted.intersects(event.flag)
            {
                callback(event);
            }
            let _ = bus.publish(notice.event);
        }
        if let Some(EventHandler::Global { wanted, callback }) = &self.global
            && wanted.intersects(pass)
        {
            callback(pass);
        }
    }
}
