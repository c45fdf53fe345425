//! Waiting for input on the live connections of a pool.
//!
//! The pool lock is never held while waiting. Each pass snapshots the live
//! links, waits for the first one to become readable and then picks up every
//! other link that is already readable. Passes are cut every
//! [`CHECK_INTERVAL`] so reconnection timers keep running and connections
//! that came up in the meantime are included.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::select_all;

use super::pool::{CHECK_INTERVAL, ConnectionPool};
use crate::domain::ConnectionId;
use crate::error::RelayError;
use crate::transport::{Connector, Link, Message};

type InputCallback<'a> = &'a mut (dyn FnMut(ConnectionId, Message) -> Result<(), RelayError> + Send);

impl<C: Connector> ConnectionPool<C> {
    /// Waits up to `timeout` for input and passes every received message to
    /// `callback`.
    ///
    /// `Some(Duration::ZERO)` polls once and `None` waits until something
    /// happens. A connection whose read fails, or for which `callback`
    /// returns an error, is marked dead. Registered handlers see the DEAD
    /// transitions; INPUT only reaches the global handler since the
    /// messages go to `callback`.
    ///
    /// Returns the number of connections that produced an event, `0` when
    /// the timeout expired first.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; the `Result` leaves room for
    /// connector-level failures.
    pub async fn check_event<F>(
        &self,
        timeout: Option<Duration>,
        mut callback: F,
    ) -> Result<usize, RelayError>
    where
        F: FnMut(ConnectionId, Message) -> Result<(), RelayError> + Send,
    {
        self.poll_events(timeout, Some(&mut callback)).await
    }

    /// Waits up to `timeout` for input and dispatches it to the registered
    /// handlers as [`crate::domain::EventFlags::INPUT`] events.
    ///
    /// Returns the number of connections that produced an event.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; see [`Self::check_event`].
    pub async fn process_events(&self, timeout: Option<Duration>) -> Result<usize, RelayError> {
        self.poll_events(timeout, None).await
    }

    /// Waits up to `timeout` for one message.
    ///
    /// Returns `None` when the timeout expired. Connections failing while
    /// being read are marked dead and the wait goes on.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; see [`Self::check_event`].
    pub async fn recv(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<(ConnectionId, Message)>, RelayError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let ready = self.wait_readable(deadline).await;
            if ready.is_empty() {
                return Ok(None);
            }
            for (id, link) in ready {
                match link.recv().await {
                    Ok(msg) => {
                        let mut st = self.state().lock().await;
                        if !st.is_current_link(id, &link) {
                            continue;
                        }
                        st.push_input(id, &msg, false);
                        self.finish(st);
                        return Ok(Some((id, msg)));
                    }
                    Err(err) => self.close_if_current(id, &link, &err.to_string()).await,
                }
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(None);
            }
        }
    }

    async fn poll_events(
        &self,
        timeout: Option<Duration>,
        mut callback: Option<InputCallback<'_>>,
    ) -> Result<usize, RelayError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let ready = self.wait_readable(deadline).await;
            if ready.is_empty() {
                return Ok(0);
            }
            let mut count = 0;
            for (id, link) in ready {
                let received = link.recv().await;
                let failure = match &received {
                    Ok(msg) => callback
                        .as_deref_mut()
                        .and_then(|cb| cb(id, msg.clone()).err())
                        .map(|err| err.to_string()),
                    Err(err) => Some(err.to_string()),
                };

                let mut st = self.state().lock().await;
                if !st.is_current_link(id, &link) {
                    continue;
                }
                count += 1;
                if let Ok(msg) = &received {
                    st.push_input(id, msg, callback.is_none());
                }
                if let Some(reason) = failure
                    && let Some(Some(link)) = st.mark_dead(id, &reason, true, Instant::now())
                {
                    link.close().await;
                }
                self.finish(st);
            }
            if count > 0 {
                return Ok(count);
            }
        }
    }

    /// Waits until at least one live link is readable, or `deadline`.
    ///
    /// An empty result means the deadline passed.
    async fn wait_readable(&self, deadline: Option<Instant>) -> Vec<(ConnectionId, Arc<C::Link>)> {
        loop {
            self.tick().await;
            let links = self.state().lock().await.alive_links();
            let now = Instant::now();
            let slice_end = deadline.map_or(now + CHECK_INTERVAL, |d| d.min(now + CHECK_INTERVAL));

            if links.is_empty() {
                tokio::time::sleep_until(slice_end.into()).await;
            } else {
                let waits = links.iter().map(|(_, link)| Box::pin(link.readable()));
                if let Ok((_, first, rest)) =
                    tokio::time::timeout_at(slice_end.into(), select_all(waits)).await
                {
                    drop(rest);
                    return links
                        .iter()
                        .enumerate()
                        .filter(|(index, (_, link))| {
                            *index == first || link.readable().now_or_never().is_some()
                        })
                        .map(|(_, (id, link))| (*id, Arc::clone(link)))
                        .collect();
                }
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Vec::new();
            }
        }
    }
}
