//! In-memory network used by the pool tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{Connector, Link, Message, MessageError};
use crate::domain::{ClientProfile, Permission};
use crate::error::ConnectError;

#[derive(Debug, Default)]
struct NetState {
    reachable: HashSet<String>,
    setup_needed: HashSet<String>,
    delivered: HashMap<String, Vec<Message>>,
    inbound: HashMap<String, VecDeque<Message>>,
    connects: HashMap<String, usize>,
}

/// Shared view of the simulated endpoints.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockNetwork {
    state: Arc<Mutex<NetState>>,
}

impl MockNetwork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_reachable(&self, addr: &str, reachable: bool) {
        let mut state = self.state();
        if reachable {
            state.reachable.insert(addr.to_string());
        } else {
            state.reachable.remove(addr);
        }
    }

    pub(crate) fn require_setup(&self, addr: &str) {
        self.state().setup_needed.insert(addr.to_string());
    }

    pub(crate) fn is_reachable(&self, addr: &str) -> bool {
        self.state().reachable.contains(addr)
    }

    /// Payloads received by `addr`, in arrival order.
    pub(crate) fn delivered(&self, addr: &str) -> Vec<Vec<u8>> {
        self.state()
            .delivered
            .get(addr)
            .map(|msgs| msgs.iter().map(|m| m.payload().to_vec()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn connect_attempts(&self, addr: &str) -> usize {
        self.state().connects.get(addr).copied().unwrap_or_default()
    }

    /// Queues a message that `addr` sends back to the client.
    pub(crate) fn push_inbound(&self, addr: &str, msg: Message) {
        self.state()
            .inbound
            .entry(addr.to_string())
            .or_default()
            .push_back(msg);
    }

    fn has_inbound(&self, addr: &str) -> bool {
        self.state()
            .inbound
            .get(addr)
            .is_some_and(|queue| !queue.is_empty())
    }
}

/// Connector over a [`MockNetwork`].
#[derive(Debug, Clone)]
pub(crate) struct MockConnector {
    net: MockNetwork,
}

impl MockConnector {
    pub(crate) fn new(net: MockNetwork) -> Self {
        Self { net }
    }
}

impl Connector for MockConnector {
    type Link = MockLink;

    async fn connect(
        &self,
        addr: &str,
        _profile: &ClientProfile,
        _permission: Permission,
    ) -> Result<MockLink, ConnectError> {
        let mut state = self.net.state();
        *state.connects.entry(addr.to_string()).or_default() += 1;
        if state.setup_needed.contains(addr) {
            return Err(ConnectError::Setup(format!("{addr} requires registration")));
        }
        if !state.reachable.contains(addr) {
            return Err(ConnectError::Unreachable(io::Error::from(
                io::ErrorKind::ConnectionRefused,
            )));
        }
        drop(state);
        Ok(MockLink {
            addr: addr.to_string(),
            net: self.net.clone(),
            alive: AtomicBool::new(true),
        })
    }
}

/// Link over a [`MockNetwork`]; fails as soon as its endpoint is unreachable.
#[derive(Debug)]
pub(crate) struct MockLink {
    addr: String,
    net: MockNetwork,
    alive: AtomicBool,
}

impl Link for MockLink {
    fn peer_addr(&self) -> &str {
        &self.addr
    }

    async fn send(&self, msg: &Message) -> io::Result<()> {
        let mut state = self.net.state();
        if !self.is_alive() || !state.reachable.contains(&self.addr) {
            self.alive.store(false, Ordering::Release);
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        state
            .delivered
            .entry(self.addr.clone())
            .or_default()
            .push(msg.clone());
        Ok(())
    }

    async fn recv(&self) -> Result<Message, MessageError> {
        let next = self
            .net
            .state()
            .inbound
            .get_mut(&self.addr)
            .and_then(VecDeque::pop_front);
        next.ok_or_else(|| {
            self.alive.store(false, Ordering::Release);
            MessageError::Io(io::Error::from(io::ErrorKind::UnexpectedEof))
        })
    }

    async fn readable(&self) -> io::Result<()> {
        loop {
            if self.net.has_inbound(&self.addr) || !self.net.is_reachable(&self.addr) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::Release);
    }
}
