//! Connection pool: topology, liveness and failover orchestration.

use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;

use super::async_queue::{self, Job};
use super::handler::{EventHandler, HandlerSlots};
use super::state::{Notice, PoolState};
use crate::domain::{
    ClientProfile, ConnectionId, ConnectionInfo, EventBus, EventFlags, Permission, PoolEvent,
    PoolFlags, Topology,
};
use crate::error::RelayError;
use crate::transport::{Connector, Link, Message};

/// Period of the background driver: reconnection timers and the
/// check-for-pending-data pass both run at this granularity.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) struct PoolInner<C: Connector> {
    pub(crate) connector: C,
    pub(crate) profile: ClientProfile,
    pub(crate) permission: Permission,
    pub(crate) state: Mutex<PoolState<C::Link>>,
    handlers: RwLock<HandlerSlots>,
    bus: EventBus,
    queue: OnceLock<mpsc::UnboundedSender<Job<C>>>,
}

/// Set of collector connections organised as an OR-list of AND-groups.
///
/// A message broadcast through the pool reaches every member of the first
/// group that still has a live connection. Members that are down keep a copy
/// in their private failover journal, and when no group can take the message
/// it lands in the pool-wide journal. Dead connections are retried with an
/// exponential backoff and their backlog is replayed, oldest first, as soon
/// as they come back.
///
/// `ConnectionPool` is a cheap handle: clones share the same pool.
///
/// # Example
///
/// ```no_run
/// use idmef_relay::domain::{ClientProfile, Permission};
/// use idmef_relay::service::ConnectionPool;
/// use idmef_relay::transport::{Message, TcpConnector};
///
/// # async fn run() -> Result<(), idmef_relay::error::RelayError> {
/// let profile = ClientProfile::new("sensor", 1, "/var/spool/idmef-relay");
/// let pool = ConnectionPool::new(TcpConnector::default(), profile, Permission::IDMEF_WRITE);
/// pool.set_connection_string("10.0.0.1:4690 && 10.0.0.2:4690 || 10.0.0.3:4690")
///     .await?;
/// pool.init().await?;
/// pool.broadcast(&Message::idmef("<alert/>")?).await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("profile", &self.inner.profile.name)
            .field("permission", &self.inner.permission)
            .field("handles", &self.handle_count())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Creates a pool with an empty topology and default flags
    /// (reconnect and failover).
    #[must_use]
    pub fn new(connector: C, profile: ClientProfile, permission: Permission) -> Self {
        Self::with_event_capacity(connector, profile, permission, EventBus::DEFAULT_CAPACITY)
    }

    /// Same as [`Self::new`] with a custom event bus capacity.
    #[must_use]
    pub fn with_event_capacity(
        connector: C,
        profile: ClientProfile,
        permission: Permission,
        capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                profile,
                permission,
                state: Mutex::new(PoolState::new()),
                handlers: RwLock::new(HandlerSlots::default()),
                bus: EventBus::new(capacity),
                queue: OnceLock::new(),
            }),
        }
    }

    /// Returns the client profile.
    #[must_use]
    pub fn profile(&self) -> &ClientProfile {
        &self.inner.profile
    }

    /// Returns the permission declared on every connection.
    #[must_use]
    pub fn permission(&self) -> Permission {
        self.inner.permission
    }

    /// Number of live handles on this pool, queued asynchronous broadcasts
    /// included.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Replaces the pool flags.
    pub async fn set_flags(&self, flags: PoolFlags) {
        self.inner.state.lock().await.flags = flags;
    }

    /// Returns the pool flags.
    pub async fn flags(&self) -> PoolFlags {
        self.inner.state.lock().await.flags
    }

    /// Whether [`Self::init`] completed.
    pub async fn is_initialized(&self) -> bool {
        self.inner.state.lock().await.initialized
    }

    /// Replaces the topology with the one described by `expr`.
    ///
    /// Connections whose address appears in both topologies keep their
    /// failover backlog. On an initialized pool the new connections are
    /// connected right away.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidTopology`] if `expr` does not parse, or a
    /// journal error if a failover journal cannot be opened. In both cases
    /// the previous topology stays in place. A connector reporting that setup
    /// is needed yields [`RelayError::SetupNeeded`] after the new topology is
    /// installed.
    pub async fn set_connection_string(&self, expr: &str) -> Result<(), RelayError> {
        let topology: Topology = expr.parse()?;
        let mut st = self.inner.state.lock().await;
        let stale = st.replace_topology(&topology, expr.trim(), &self.inner.profile)?;
        for link in stale {
            link.close().await;
        }
        tracing::info!(topology = %topology, "connection string set");

        let result = if st.initialized {
            self.inner.connect_all(&mut st).await
        } else {
            Ok(())
        };
        self.finish(st);
        result
    }

    /// Returns the current topology source.
    pub async fn connection_string(&self) -> String {
        self.inner.state.lock().await.source.clone()
    }

    /// Connects the pool.
    ///
    /// Validates the profile, opens the global journal when failover is
    /// enabled, attempts every connection once and flushes the global backlog
    /// into the first fully connected group. Unreachable endpoints are not an
    /// error: they are retried in the background.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Profile`] for an unusable profile, a journal
    /// error if the global journal cannot be opened, or
    /// [`RelayError::SetupNeeded`] if a connector reports that the client
    /// needs setup.
    pub async fn init(&self) -> Result<(), RelayError> {
        self.inner.profile.validate()?;
        let mut st = self.inner.state.lock().await;
        st.ensure_global(&self.inner.profile)?;
        let result = self.inner.connect_all(&mut st).await;
        st.initialized = result.is_ok();
        let alive = st
            .ordered_ids()
            .into_iter()
            .filter(|id| st.is_alive(*id))
            .count();
        tracing::info!(
            connections = st.arena.len(),
            alive,
            backlog = st.global_backlog(),
            "connection pool initialized"
        );
        self.finish(st);
        result
    }

    /// Adds a connection to `addr` at the end of the first group.
    ///
    /// On an initialized pool the connection is attempted right away and its
    /// backlog flushed on success.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidTopology`] if `addr` is not a single
    /// address or is already in the pool, a journal error if its failover
    /// journal cannot be opened, or
    /// [`RelayError::SetupNeeded`] from the connector.
    pub async fn add_connection(&self, addr: &str) -> Result<ConnectionId, RelayError> {
        let topology: Topology = addr.parse()?;
        let [group] = topology.groups() else {
            return Err(RelayError::InvalidTopology(format!(
                "`{addr}` is not a single address"
            )));
        };
        let [addr] = group.as_slice() else {
            return Err(RelayError::InvalidTopology(format!(
                "`{addr}` is not a single address"
            )));
        };

        let mut st = self.inner.state.lock().await;
        let id = st.add_record(addr, &self.inner.profile)?;
        tracing::info!(%id, addr = %addr, "connection added");
        let result = if st.initialized {
            self.inner
                .reconnect(&mut st, id, false, Instant::now())
                .await
        } else {
            Ok(())
        };
        self.finish(st);
        result.map(|()| id)
    }

    /// Removes a connection from the pool and closes it.
    ///
    /// Its failover journal stays on disk and is picked up again if the
    /// address is added back.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ConnectionNotFound`] if `id` is not in the pool.
    pub async fn del_connection(&self, id: ConnectionId) -> Result<(), RelayError> {
        let mut st = self.inner.state.lock().await;
        if let Some(link) = st.remove_record(id)? {
            link.close().await;
        }
        tracing::info!(%id, "connection removed");
        self.finish(st);
        Ok(())
    }

    /// Sends `msg` to the first group with a live member, spooling copies
    /// for members that are down.
    ///
    /// Delivery failures are handled inside the pool and never reported
    /// here.
    pub async fn broadcast(&self, msg: &Message) {
        let mut st = self.inner.state.lock().await;
        self.inner.broadcast_locked(&mut st, msg).await;
        self.finish(st);
    }

    /// Queues `msg` for broadcast on a background task and returns
    /// immediately.
    ///
    /// Messages are sent in submission order. The queued job keeps the pool
    /// alive until it completes.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NoRuntime`] when called outside a tokio runtime,
    /// or when the runtime that ran the first asynchronous broadcast is gone.
    pub fn broadcast_async(&self, msg: Message) -> Result<(), RelayError> {
        let handle = Handle::try_current().map_err(|_| RelayError::NoRuntime)?;
        let queue = self
            .inner
            .queue
            .get_or_init(|| async_queue::spawn_worker(&handle));
        queue
            .send(Job::new(self.clone(), msg))
            .map_err(|_| RelayError::NoRuntime)
    }

    /// Marks a connection dead without touching the network.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ConnectionNotFound`] if `id` is not in the pool.
    pub async fn set_connection_dead(&self, id: ConnectionId) -> Result<(), RelayError> {
        let mut st = self.inner.state.lock().await;
        if !st.arena.contains(id) {
            return Err(RelayError::ConnectionNotFound(id));
        }
        let _ = st.mark_dead(id, "marked dead", false, Instant::now());
        self.finish(st);
        Ok(())
    }

    /// Marks a connection alive without a network attempt, then flushes its
    /// backlog and, once its group is complete, the global backlog.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ConnectionNotFound`] if `id` is not in the pool.
    pub async fn set_connection_alive(&self, id: ConnectionId) -> Result<(), RelayError> {
        let mut st = self.inner.state.lock().await;
        if !st.arena.contains(id) {
            return Err(RelayError::ConnectionNotFound(id));
        }
        if st.mark_alive(id, None) {
            self.inner.after_alive(&mut st, id).await;
        }
        self.finish(st);
        Ok(())
    }

    /// Registers `handler`, replacing any handler of the same kind.
    pub fn set_event_handler(&self, handler: EventHandler) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set(handler);
    }

    /// Removes both handlers.
    pub fn clear_event_handlers(&self) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Union of the flags wanted by the registered handlers.
    #[must_use]
    pub fn wanted_events(&self) -> EventFlags {
        self.handlers().wanted()
    }

    /// Subscribes to every event of the pool.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.bus.subscribe()
    }

    /// Snapshots of every connection, in topology order.
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let st = self.inner.state.lock().await;
        st.ordered_ids()
            .into_iter()
            .filter_map(|id| st.info(id))
            .collect()
    }

    /// Snapshot of one connection.
    pub async fn connection(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.inner.state.lock().await.info(id)
    }

    /// Messages waiting in the pool-wide journal.
    pub async fn global_backlog(&self) -> usize {
        self.inner.state.lock().await.global_backlog()
    }

    /// Runs the reconnection timers that are due.
    pub async fn tick(&self) {
        self.run_timers_at(Instant::now()).await;
    }

    pub(crate) async fn run_timers_at(&self, now: Instant) {
        let mut st = self.inner.state.lock().await;
        self.inner.run_due_timers(&mut st, now).await;
        self.finish(st);
    }

    /// Spawns a task driving the pool every [`CHECK_INTERVAL`]: due
    /// reconnection timers run, and pending input is dispatched when a
    /// handler wants [`EventFlags::INPUT`].
    ///
    /// The task holds a weak reference and ends once every handle is gone.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NoRuntime`] when called outside a tokio runtime.
    pub fn spawn_driver(&self) -> Result<JoinHandle<()>, RelayError> {
        let handle = Handle::try_current().map_err(|_| RelayError::NoRuntime)?;
        let weak: Weak<PoolInner<C>> = Arc::downgrade(&self.inner);
        Ok(handle.spawn(async move {
            let mut interval = tokio::time::interval(CHECK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let pool = Self { inner };
                pool.tick().await;
                if pool.wanted_events().contains(EventFlags::INPUT)
                    && let Err(err) = pool.process_events(Some(Duration::ZERO)).await
                {
                    tracing::warn!(error = %err, "event processing failed");
                }
            }
            tracing::debug!("pool driver stopped");
        }))
    }

    pub(crate) fn handlers(&self) -> HandlerSlots {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn state(&self) -> &Mutex<PoolState<C::Link>> {
        &self.inner.state
    }

    /// Releases the lock, then publishes what happened while it was held.
    pub(crate) fn finish(&self, mut st: tokio::sync::MutexGuard<'_, PoolState<C::Link>>) {
        let notices = st.take_notices();
        drop(st);
        self.dispatch(notices);
    }

    pub(crate) fn dispatch(&self, notices: Vec<Notice>) {
        self.handlers().dispatch(notices, &self.inner.bus);
    }

    pub(crate) async fn close_if_current(&self, id: ConnectionId, link: &Arc<C::Link>, reason: &str) {
        let mut st = self.inner.state.lock().await;
        if st.is_current_link(id, link) {
            self.inner.demote(&mut st, id, reason).await;
        }
        self.finish(st);
    }
}
