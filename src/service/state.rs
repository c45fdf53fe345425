//! Lock-protected pool bookkeeping.
//!
//! Everything here is synchronous. The async delivery code in
//! [`super::delivery`] drives it while holding the pool lock, and the
//! transitions it records are queued as [`Notice`]s so they can be dispatched
//! once the lock is released.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use super::arena::Arena;
use super::timer::TimerHeap;
use crate::domain::{
    Backoff, ClientProfile, ConnectionEvent, ConnectionId, ConnectionInfo, ConnectionState,
    EventFlags, JournalTarget, PoolEvent, PoolFlags, Topology,
};
use crate::error::RelayError;
use crate::persistence::FailoverJournal;
use crate::transport::{Link, Message};

/// One endpoint of the pool.
#[derive(Debug)]
pub(crate) struct ConnectionRecord<L> {
    pub(crate) addr: String,
    pub(crate) state: ConnectionState,
    /// Present while connected. An external dead override keeps it.
    pub(crate) link: Option<Arc<L>>,
    pub(crate) journal: Option<FailoverJournal>,
    pub(crate) backoff: Backoff,
    /// Sequence number of the armed reconnection timer.
    pub(crate) timer: Option<u64>,
    pub(crate) group: usize,
}

impl<L> ConnectionRecord<L> {
    fn new(addr: String, group: usize, journal: Option<FailoverJournal>) -> Self {
        Self {
            addr,
            state: ConnectionState::Dead,
            link: None,
            journal,
            backoff: Backoff::new(),
            timer: None,
            group,
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.state == ConnectionState::Alive
    }

    pub(crate) fn backlog(&self) -> usize {
        self.journal
            .as_ref()
            .map_or(0, FailoverJournal::available_count)
    }

    fn info(&self, id: ConnectionId) -> ConnectionInfo {
        ConnectionInfo {
            id,
            addr: self.addr.clone(),
            state: self.state,
            group: self.group,
            backlog: self.backlog(),
            retry_interval_secs: self.backoff.interval().as_secs(),
        }
    }

    fn target(&self, id: ConnectionId) -> JournalTarget {
        JournalTarget::Connection {
            id,
            addr: self.addr.clone(),
        }
    }
}

/// AND-chain of connections.
#[derive(Debug, Default)]
pub(crate) struct Group {
    pub(crate) members: Vec<ConnectionId>,
    pub(crate) dead: usize,
}

impl Group {
    /// At least one member is alive.
    pub(crate) fn is_viable(&self) -> bool {
        self.dead < self.members.len()
    }

    /// Non-empty and every member is alive.
    pub(crate) fn is_fully_alive(&self) -> bool {
        !self.members.is_empty() && self.dead == 0
    }
}

/// A state transition waiting to be published.
#[derive(Debug)]
pub(crate) struct Notice {
    pub(crate) event: PoolEvent,
    /// Payload for the per-connection handler, if it should see this event.
    pub(crate) connection: Option<ConnectionEvent>,
}

impl Notice {
    pub(crate) fn flag(&self) -> EventFlags {
        self.event.flag().unwrap_or_else(EventFlags::empty)
    }
}

#[derive(Debug)]
pub(crate) struct PoolState<L> {
    pub(crate) arena: Arena<ConnectionRecord<L>>,
    pub(crate) groups: Vec<Group>,
    pub(crate) global: Option<FailoverJournal>,
    pub(crate) source: String,
    pub(crate) flags: PoolFlags,
    pub(crate) initialized: bool,
    pub(crate) timers: TimerHeap,
    notices: Vec<Notice>,
}

impl<L: Link> PoolState<L> {
    pub(crate) fn new() -> Self {
        Self {
            arena: Arena::new(),
            groups: Vec::new(),
            global: None,
            source: String::new(),
            flags: PoolFlags::default(),
            initialized: false,
            timers: TimerHeap::default(),
            notices: Vec::new(),
        }
    }

    pub(crate) fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    pub(crate) fn push_notice(&mut self, event: PoolEvent, connection: Option<ConnectionEvent>) {
        self.notices.push(Notice { event, connection });
    }

    pub(crate) fn info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.arena.get(id).map(|record| record.info(id))
    }

    pub(crate) fn addr(&self, id: ConnectionId) -> Option<String> {
        self.arena.get(id).map(|record| record.addr.clone())
    }

    pub(crate) fn target(&self, id: ConnectionId) -> Option<JournalTarget> {
        self.arena.get(id).map(|record| record.target(id))
    }

    pub(crate) fn is_alive(&self, id: ConnectionId) -> bool {
        self.arena.get(id).is_some_and(ConnectionRecord::is_alive)
    }

    pub(crate) fn link(&self, id: ConnectionId) -> Option<Arc<L>> {
        self.arena
            .get(id)
            .filter(|record| record.is_alive())
            .and_then(|record| record.link.as_ref().map(Arc::clone))
    }

    pub(crate) fn backlog(&self, id: ConnectionId) -> usize {
        self.arena.get(id).map_or(0, ConnectionRecord::backlog)
    }

    pub(crate) fn global_backlog(&self) -> usize {
        self.global
            .as_ref()
            .map_or(0, FailoverJournal::available_count)
    }

    /// Connection ids in topology order.
    pub(crate) fn ordered_ids(&self) -> Vec<ConnectionId> {
        self.groups
            .iter()
            .flat_map(|group| group.members.iter().copied())
            .collect()
    }

    pub(crate) fn alive_links(&self) -> Vec<(ConnectionId, Arc<L>)> {
        self.ordered_ids()
            .into_iter()
            .filter_map(|id| self.link(id).map(|link| (id, link)))
            .collect()
    }

    /// Whether `link` is still the live link of `id`.
    pub(crate) fn is_current_link(&self, id: ConnectionId, link: &Arc<L>) -> bool {
        self.link(id).is_some_and(|current| Arc::ptr_eq(&current, link))
    }

    /// Marks `id` dead, arms its reconnection timer and records a DEAD notice.
    ///
    /// With `drop_link` the link is detached and returned so the caller can
    /// close it. Returns `None` if the connection was already dead.
    pub(crate) fn mark_dead(
        &mut self,
        id: ConnectionId,
        reason: &str,
        drop_link: bool,
        now: Instant,
    ) -> Option<Option<Arc<L>>> {
        let record = self.arena.get_mut(id)?;
        if !record.is_alive() {
            return None;
        }
        record.state = ConnectionState::Dead;
        let link = if drop_link { record.link.take() } else { None };
        let group = record.group;
        if let Some(group) = self.groups.get_mut(group) {
            group.dead += 1;
        }
        tracing::warn!(addr = %record.addr, reason, "connection lost, failover enabled");
        self.arm_retry(id, now);
        self.push_transition(id, EventFlags::DEAD, Some(reason));
        Some(link)
    }

    /// Marks `id` alive, optionally installing a fresh link.
    ///
    /// Returns `false` if the connection was already alive.
    pub(crate) fn mark_alive(&mut self, id: ConnectionId, link: Option<L>) -> bool {
        let Some(record) = self.arena.get_mut(id) else {
            return false;
        };
        if record.is_alive() {
            return false;
        }
        record.state = ConnectionState::Alive;
        if let Some(link) = link {
            record.link = Some(Arc::new(link));
        }
        record.backoff.reset();
        record.timer = None;
        let group = record.group;
        if let Some(group) = self.groups.get_mut(group) {
            group.dead = group.dead.saturating_sub(1);
        }
        tracing::info!(addr = %record.addr, "connection established");
        self.push_transition(id, EventFlags::ALIVE, None);
        true
    }

    /// Records a failed connection attempt on a dead connection.
    ///
    /// A retry widens the backoff. A first attempt keeps the initial
    /// interval and reports the connection as dead.
    pub(crate) fn connect_failed(
        &mut self,
        id: ConnectionId,
        reason: &str,
        retry: bool,
        now: Instant,
    ) {
        let Some(record) = self.arena.get_mut(id) else {
            return;
        };
        record.link = None;
        if retry {
            let interval = record.backoff.record_failure();
            tracing::warn!(
                addr = %record.addr,
                reason,
                retry_in_secs = interval.as_secs(),
                "reconnection failed"
            );
        } else {
            tracing::warn!(addr = %record.addr, reason, "could not connect, failover enabled");
        }
        self.arm_retry(id, now);
        if !retry {
            self.push_transition(id, EventFlags::DEAD, Some(reason));
        }
    }

    fn arm_retry(&mut self, id: ConnectionId, now: Instant) {
        if !self.flags.contains(PoolFlags::RECONNECT) {
            return;
        }
        let Some(record) = self.arena.get_mut(id) else {
            return;
        };
        let deadline = now + record.backoff.interval();
        record.timer = Some(self.timers.arm(id, deadline));
    }

    /// Pops the reconnection timers due at `now` whose connection still waits
    /// on them.
    pub(crate) fn due_reconnects(&mut self, now: Instant) -> Vec<ConnectionId> {
        let due = self.timers.pop_due(now);
        let mut ready = Vec::with_capacity(due.len());
        for (id, seq) in due {
            if let Some(record) = self.arena.get_mut(id)
                && record.timer == Some(seq)
            {
                record.timer = None;
                if !record.is_alive() {
                    ready.push(id);
                }
            }
        }
        ready
    }

    fn push_transition(&mut self, id: ConnectionId, flag: EventFlags, reason: Option<&str>) {
        let Some(info) = self.info(id) else {
            return;
        };
        let timestamp = Utc::now();
        let event = if flag == EventFlags::ALIVE {
            PoolEvent::ConnectionAlive {
                connection: id,
                addr: info.addr.clone(),
                timestamp,
            }
        } else {
            PoolEvent::ConnectionDead {
                connection: id,
                addr: info.addr.clone(),
                reason: reason.unwrap_or_default().to_string(),
                timestamp,
            }
        };
        self.push_notice(
            event,
            Some(ConnectionEvent {
                flag,
                connection: info,
                message: None,
            }),
        );
    }

    /// Records a message received on `id`.
    ///
    /// When `to_handler` is false the message is consumed by the caller and
    /// the per-connection handler does not see it.
    pub(crate) fn push_input(&mut self, id: ConnectionId, msg: &Message, to_handler: bool) {
        let Some(info) = self.info(id) else {
            return;
        };
        let event = PoolEvent::Input {
            connection: id,
            addr: info.addr.clone(),
            tag: msg.tag(),
            len: msg.len(),
            timestamp: Utc::now(),
        };
        let connection = to_handler.then(|| ConnectionEvent {
            flag: EventFlags::INPUT,
            connection: info,
            message: Some(msg.clone()),
        });
        self.push_notice(event, connection);
    }

    /// Saves `msg` to the private journal of `id`, opening it on first use.
    pub(crate) fn spill_private(
        &mut self,
        id: ConnectionId,
        msg: &Message,
        profile: &ClientProfile,
    ) -> bool {
        let failover = self.flags.contains(PoolFlags::FAILOVER);
        let Some(record) = self.arena.get_mut(id) else {
            return false;
        };
        if !failover {
            tracing::warn!(addr = %record.addr, "failover disabled, message dropped");
            return false;
        }
        if record.journal.is_none() {
            match open_journal(profile.connection_backup_dir(&record.addr)) {
                Ok(journal) => record.journal = Some(journal),
                Err(err) => {
                    tracing::warn!(addr = %record.addr, error = %err, "message dropped");
                    return false;
                }
            }
        }
        let Some(journal) = record.journal.as_mut() else {
            return false;
        };
        if let Err(err) = journal.save(msg) {
            tracing::warn!(addr = %record.addr, error = %err, "message dropped");
            return false;
        }
        let backlog = journal.available_count();
        let target = record.target(id);
        self.push_notice(
            PoolEvent::Spooled {
                target,
                backlog,
                timestamp: Utc::now(),
            },
            None,
        );
        true
    }

    /// Saves `msg` to the pool-wide journal.
    pub(crate) fn spill_global(&mut self, msg: &Message, profile: &ClientProfile) -> bool {
        if !self.flags.contains(PoolFlags::FAILOVER) {
            tracing::warn!("no connection accepted the message and failover is disabled, dropped");
            return false;
        }
        if self.global.is_none() {
            match open_journal(profile.global_backup_dir()) {
                Ok(journal) => self.global = Some(journal),
                Err(err) => {
                    tracing::warn!(error = %err, "global failover unavailable, message dropped");
                    return false;
                }
            }
        }
        let Some(journal) = self.global.as_mut() else {
            return false;
        };
        if let Err(err) = journal.save(msg) {
            tracing::warn!(error = %err, "global failover write failed, message dropped");
            return false;
        }
        let backlog = journal.available_count();
        self.push_notice(
            PoolEvent::Spooled {
                target: JournalTarget::Global,
                backlog,
                timestamp: Utc::now(),
            },
            None,
        );
        true
    }

    /// Opens the pool-wide journal if failover is enabled.
    pub(crate) fn ensure_global(&mut self, profile: &ClientProfile) -> Result<(), RelayError> {
        if self.flags.contains(PoolFlags::FAILOVER) && self.global.is_none() {
            self.global = Some(open_journal(profile.global_backup_dir())?);
        }
        Ok(())
    }

    /// Replaces the whole topology.
    ///
    /// Private journals of addresses present before and after are carried
    /// over. On error nothing changes. Returns the links of the replaced
    /// connections so the caller can close them.
    pub(crate) fn replace_topology(
        &mut self,
        topology: &Topology,
        source: &str,
        profile: &ClientProfile,
    ) -> Result<Vec<Arc<L>>, RelayError> {
        let failover = self.flags.contains(PoolFlags::FAILOVER);
        let previous: HashSet<String> = self
            .arena
            .iter()
            .filter(|(_, record)| record.journal.is_some())
            .map(|(_, record)| record.addr.clone())
            .collect();

        let mut reused = HashSet::new();
        let mut planned = Vec::with_capacity(topology.address_count());
        for (group, addrs) in topology.groups().iter().enumerate() {
            for addr in addrs {
                let journal = if previous.contains(addr) && reused.insert(addr.clone()) {
                    None
                } else if failover {
                    Some(open_journal(profile.connection_backup_dir(addr))?)
                } else {
                    None
                };
                planned.push((group, addr.clone(), journal));
            }
        }

        let old_ids: Vec<ConnectionId> = self.arena.iter().map(|(id, _)| id).collect();
        let mut carried = Vec::new();
        let mut links = Vec::new();
        for id in old_ids {
            if let Some(mut record) = self.arena.remove(id) {
                if let Some(link) = record.link.take() {
                    links.push(link);
                }
                if let Some(journal) = record.journal.take()
                    && reused.contains(&record.addr)
                {
                    carried.push((record.addr, journal));
                }
            }
        }
        self.timers.clear();
        self.groups = topology.groups().iter().map(|_| Group::default()).collect();

        for (group_index, addr, journal) in planned {
            let journal = journal.or_else(|| {
                let pos = carried.iter().position(|(a, _)| *a == addr)?;
                Some(carried.swap_remove(pos).1)
            });
            let id = self
                .arena
                .insert(ConnectionRecord::new(addr, group_index, journal));
            if let Some(group) = self.groups.get_mut(group_index) {
                group.members.push(id);
                group.dead += 1;
            }
        }

        self.source = source.to_string();
        Ok(links)
    }

    /// Appends a dead connection to the first group.
    pub(crate) fn add_record(
        &mut self,
        addr: &str,
        profile: &ClientProfile,
    ) -> Result<ConnectionId, RelayError> {
        if self.arena.iter().any(|(_, record)| record.addr == addr) {
            return Err(RelayError::InvalidTopology(format!(
                "address `{addr}` is already in the pool"
            )));
        }
        let journal = if self.flags.contains(PoolFlags::FAILOVER) {
            Some(open_journal(profile.connection_backup_dir(addr))?)
        } else {
            None
        };
        if self.groups.is_empty() {
            self.groups.push(Group::default());
        }
        let id = self
            .arena
            .insert(ConnectionRecord::new(addr.to_string(), 0, journal));
        if let Some(group) = self.groups.first_mut() {
            group.members.push(id);
            group.dead += 1;
        }
        self.source = self.render_source();
        Ok(id)
    }

    /// Removes `id` from the pool, returning its link.
    pub(crate) fn remove_record(
        &mut self,
        id: ConnectionId,
    ) -> Result<Option<Arc<L>>, RelayError> {
        let record = self
            .arena
            .remove(id)
            .ok_or(RelayError::ConnectionNotFound(id))?;
        if let Some(group) = self.groups.get_mut(record.group) {
            group.members.retain(|member| *member != id);
            if !record.is_alive() {
                group.dead = group.dead.saturating_sub(1);
            }
        }
        self.source = self.render_source();
        Ok(record.link)
    }

    fn render_source(&self) -> String {
        self.groups
            .iter()
            .filter(|group| !group.members.is_empty())
            .map(|group| {
                group
                    .members
                    .iter()
                    .filter_map(|id| self.arena.get(*id).map(|record| record.addr.as_str()))
                    .collect::<Vec<_>>()
                    .join(" && ")
            })
            .collect::<Vec<_>>()
            .join(" || ")
    }
}

fn open_journal(dir: std::path::PathBuf) -> Result<FailoverJournal, RelayError> {
    let mut journal = FailoverJournal::new(dir)?;
    journal.set_transaction(true);
    Ok(journal)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::transport::mock::MockLink;

    fn profile(dir: &std::path::Path) -> ClientProfile {
        ClientProfile::new("sensor", 1, dir)
    }

    fn topology(s: &str) -> Topology {
        let Ok(t) = s.parse() else {
            panic!("valid topology");
        };
        t
    }

    fn state_with(s: &str, dir: &std::path::Path) -> PoolState<MockLink> {
        let mut state = PoolState::new();
        if let Err(err) = state.replace_topology(&topology(s), s, &profile(dir)) {
            panic!("topology rejected: {err}");
        }
        state
    }

    #[test]
    fn new_connections_start_dead() {
        let Ok(tmp) = tempfile::tempdir() else {
            panic!("tempdir");
        };
        let state = state_with("a && b || c", tmp.path());
        assert_eq!(state.groups.len(), 2);
        assert_eq!(state.groups.first().map(|g| g.dead), Some(2));
        assert!(state.groups.iter().all(|g| !g.is_viable()));
        assert_eq!(state.ordered_ids().len(), 3);
        assert!(tmp.path().join("a").join("data").exists());
    }

    #[test]
    fn alive_then_dead_keeps_counters_consistent() {
        let Ok(tmp) = tempfile::tempdir() else {
            panic!("tempdir");
        };
        let mut state = state_with("a && b", tmp.path());
        let Some(&a) = state.ordered_ids().first() else {
            panic!("missing connection");
        };
        assert!(state.mark_alive(a, None));
        assert!(!state.mark_alive(a, None));
        assert_eq!(state.groups.first().map(|g| g.dead), Some(1));

        let now = Instant::now();
        assert!(state.mark_dead(a, "reset", true, now).is_some());
        assert!(state.mark_dead(a, "reset", true, now).is_none());
        assert_eq!(state.groups.first().map(|g| g.dead), Some(2));

        let flags: Vec<EventFlags> = state.take_notices().iter().map(Notice::flag).collect();
        assert_eq!(flags, vec![EventFlags::ALIVE, EventFlags::DEAD]);
    }

    #[test]
    fn replacing_topology_reuses_journal_of_kept_address() {
        let Ok(tmp) = tempfile::tempdir() else {
            panic!("tempdir");
        };
        let profile = profile(tmp.path());
        let mut state = state_with("a || b", tmp.path());
        let Some(&a) = state.ordered_ids().first() else {
            panic!("missing connection");
        };
        let Ok(msg) = Message::idmef("kept") else {
            panic!("valid message");
        };
        assert!(state.spill_private(a, &msg, &profile));

        let next = topology("c && a");
        assert!(state.replace_topology(&next, "c && a", &profile).is_ok());
        assert!(state.info(a).is_none());
        let Some(&new_a) = state.ordered_ids().get(1) else {
            panic!("missing connection");
        };
        assert_eq!(state.backlog(new_a), 1);
        assert_eq!(state.source, "c && a");
    }

    #[test]
    fn add_and_remove_update_source() {
        let Ok(tmp) = tempfile::tempdir() else {
            panic!("tempdir");
        };
        let profile = profile(tmp.path());
        let mut state = state_with("a || b", tmp.path());
        let Ok(id) = state.add_record("x", &profile) else {
            panic!("add failed");
        };
        assert_eq!(state.source, "a && x || b");
        assert!(matches!(state.remove_record(id), Ok(None)));
        assert_eq!(state.source, "a || b");
        assert!(matches!(
            state.remove_record(id),
            Err(RelayError::ConnectionNotFound(_))
        ));
        assert_eq!(state.groups.first().map(|g| g.dead), Some(1));
    }
}
