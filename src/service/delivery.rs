//! Message routing, journal flushing and reconnection.
//!
//! Every function here runs with the pool lock held and receives the locked
//! [`PoolState`]. Sends and connects are awaited under that lock, which keeps
//! per-connection ordering intact: a backlog is always drained before a new
//! message reaches the same connection.

use std::io;
use std::time::Instant;

use chrono::Utc;

use super::pool::PoolInner;
use super::state::{Group, PoolState};
use crate::domain::{ConnectionId, JournalTarget, PoolEvent};
use crate::error::RelayError;
use crate::persistence::FailoverJournal;
use crate::transport::{Connector, Link, Message};

type State<C> = PoolState<<C as Connector>::Link>;

/// Sends `msg`, retrying for as long as the link reports `WouldBlock`.
pub(crate) async fn send_message<L: Link>(link: &L, msg: &Message) -> io::Result<()> {
    loop {
        match link.send(msg).await {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => tokio::task::yield_now().await,
            other => return other,
        }
    }
}

impl<C: Connector> PoolInner<C> {
    /// Routes `msg` to the first group with a live member, or to the global
    /// journal when every group is down.
    pub(crate) async fn broadcast_locked(&self, st: &mut State<C>, msg: &Message) {
        match st.groups.iter().position(Group::is_viable) {
            Some(group) => self.deliver_group(st, group, msg).await,
            None => {
                let _ = st.spill_global(msg, &self.profile);
            }
        }
    }

    /// Hands `msg` to every member of `group`. A failing member never stops
    /// the chain.
    async fn deliver_group(&self, st: &mut State<C>, group: usize, msg: &Message) {
        let members = st
            .groups
            .get(group)
            .map(|g| g.members.clone())
            .unwrap_or_default();
        for id in members {
            self.deliver(st, id, msg).await;
        }
    }

    async fn deliver(&self, st: &mut State<C>, id: ConnectionId, msg: &Message) {
        if st.is_alive(id) && st.backlog(id) > 0 {
            self.flush_private(st, id).await;
        }
        if st.is_alive(id) {
            let Some(link) = st.link(id) else {
                self.demote(st, id, "not connected").await;
                let _ = st.spill_private(id, msg, &self.profile);
                return;
            };
            match send_message(link.as_ref(), msg).await {
                Ok(()) => return,
                Err(err) => self.demote(st, id, &err.to_string()).await,
            }
        }
        let _ = st.spill_private(id, msg, &self.profile);
    }

    /// Marks `id` dead and closes its link.
    pub(crate) async fn demote(&self, st: &mut State<C>, id: ConnectionId, reason: &str) {
        if let Some(Some(link)) = st.mark_dead(id, reason, true, Instant::now()) {
            link.close().await;
        }
    }

    /// Replays the private backlog of `id` oldest first.
    ///
    /// Returns `true` if the backlog was drained and the connection is still
    /// alive.
    pub(crate) async fn flush_private(&self, st: &mut State<C>, id: ConnectionId) -> bool {
        let available = st.backlog(id);
        if available == 0 {
            return st.is_alive(id);
        }
        let (Some(addr), Some(target)) = (st.addr(id), st.target(id)) else {
            return false;
        };
        tracing::info!(addr = %addr, available, "flushing failover backlog");

        let mut flushed = 0usize;
        let drained = loop {
            let Some(link) = st.link(id) else {
                break false;
            };
            let next = match journal_of(st, id) {
                Some(journal) => journal.get_saved(),
                None => break true,
            };
            let msg = match next {
                Ok(Some(msg)) => msg,
                Ok(None) => break true,
                Err(err) => {
                    tracing::warn!(addr = %addr, error = %err, "cannot read failover backlog");
                    break false;
                }
            };
            match send_message(link.as_ref(), &msg).await {
                Ok(()) => {
                    if let Some(journal) = journal_of(st, id)
                        && let Err(err) = journal.commit(&msg)
                    {
                        tracing::warn!(addr = %addr, error = %err, "cannot commit flushed message");
                    }
                    flushed += 1;
                }
                Err(err) => {
                    if let Some(journal) = journal_of(st, id)
                        && let Err(rollback) = journal.rollback(&msg)
                    {
                        tracing::warn!(addr = %addr, error = %rollback, "cannot roll back message");
                    }
                    self.demote(st, id, &err.to_string()).await;
                    break false;
                }
            }
        };

        let remaining = st.backlog(id);
        report_flush(st, target, flushed, available, remaining, &addr);
        drained
    }

    /// Replays the global backlog into `group` while the group stays fully
    /// alive.
    pub(crate) async fn flush_global(&self, st: &mut State<C>, group: usize) {
        let available = st.global_backlog();
        if available == 0 {
            return;
        }
        tracing::info!(group, available, "flushing global failover backlog");

        let mut flushed = 0usize;
        loop {
            if !st.groups.get(group).is_some_and(Group::is_fully_alive) {
                break;
            }
            let msg = match st.global.as_mut().map(FailoverJournal::get_saved) {
                Some(Ok(Some(msg))) => msg,
                Some(Ok(None)) | None => break,
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "cannot read global failover backlog");
                    break;
                }
            };
            self.deliver_group(st, group, &msg).await;
            // Every member now holds the message, either sent or spooled.
            if let Some(journal) = st.global.as_mut()
                && let Err(err) = journal.commit(&msg)
            {
                tracing::warn!(error = %err, "cannot commit flushed message");
            }
            flushed += 1;
        }

        let remaining = st.global_backlog();
        report_flush(st, JournalTarget::Global, flushed, available, remaining, "any");
    }

    /// Flushes the global backlog into the first fully alive group.
    pub(crate) async fn flush_global_to_first_alive(&self, st: &mut State<C>) {
        if let Some(group) = st.groups.iter().position(Group::is_fully_alive) {
            self.flush_global(st, group).await;
        }
    }

    /// Opens a fresh link for the dead connection `id`.
    ///
    /// `retry` distinguishes a timer-driven attempt (backoff widens on
    /// failure) from a first attempt (DEAD is reported on failure).
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::SetupNeeded`] if the connector reports that the
    /// client cannot connect without reconfiguration. Any other connect
    /// failure is handled here.
    pub(crate) async fn reconnect(
        &self,
        st: &mut State<C>,
        id: ConnectionId,
        retry: bool,
        now: Instant,
    ) -> Result<(), RelayError> {
        let Some(addr) = st.addr(id) else {
            return Ok(());
        };
        let stale = st.arena.get_mut(id).and_then(|record| record.link.take());
        if let Some(stale) = stale {
            stale.close().await;
        }

        match self
            .connector
            .connect(&addr, &self.profile, self.permission)
            .await
        {
            Ok(link) => {
                st.mark_alive(id, Some(link));
                self.after_alive(st, id).await;
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                st.connect_failed(id, &reason, retry, now);
                if err.is_setup_needed() {
                    return Err(RelayError::SetupNeeded { addr, reason });
                }
                Ok(())
            }
        }
    }

    /// Drains the private backlog of a connection that just came up, then the
    /// global backlog if its group is complete again.
    pub(crate) async fn after_alive(&self, st: &mut State<C>, id: ConnectionId) {
        if !self.flush_private(st, id).await {
            return;
        }
        let Some(group) = st.arena.get(id).map(|record| record.group) else {
            return;
        };
        if st.groups.get(group).is_some_and(Group::is_fully_alive) {
            self.flush_global(st, group).await;
        }
    }

    /// Attempts every dead connection once, then flushes the global backlog.
    ///
    /// # Errors
    ///
    /// Returns the first [`RelayError::SetupNeeded`] met; the remaining
    /// connections are still attempted.
    pub(crate) async fn connect_all(&self, st: &mut State<C>) -> Result<(), RelayError> {
        let mut first_error = None;
        for id in st.ordered_ids() {
            if st.is_alive(id) {
                continue;
            }
            if let Err(err) = self.reconnect(st, id, false, Instant::now()).await {
                tracing::error!(error = %err, "connection needs setup");
                first_error.get_or_insert(err);
            }
        }
        self.flush_global_to_first_alive(st).await;
        first_error.map_or(Ok(()), Err)
    }

    /// Retries every connection whose reconnection timer is due at `now`.
    pub(crate) async fn run_due_timers(&self, st: &mut State<C>, now: Instant) {
        for id in st.due_reconnects(now) {
            if let Err(err) = self.reconnect(st, id, true, now).await {
                tracing::error!(error = %err, "reconnection needs setup");
            }
        }
    }
}

fn journal_of<L: Link>(st: &mut PoolState<L>, id: ConnectionId) -> Option<&mut FailoverJournal> {
    st.arena
        .get_mut(id)
        .and_then(|record| record.journal.as_mut())
}

fn report_flush<L: Link>(
    st: &mut PoolState<L>,
    target: JournalTarget,
    flushed: usize,
    available: usize,
    remaining: usize,
    name: &str,
) {
    if flushed == available {
        tracing::info!(journal = name, flushed, "recovered from failover");
    } else {
        tracing::warn!(
            journal = name,
            flushed,
            available,
            "failed recovering from failover"
        );
    }
    st.push_notice(
        PoolEvent::Flushed {
            target,
            flushed,
            remaining,
            timestamp: Utc::now(),
        },
        None,
    );
}
