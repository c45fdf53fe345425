//! Transport layer: message framing and the connection primitive.
//!
//! The pool never touches sockets directly. It talks to endpoints through
//! the [`Link`] trait and opens them through a [`Connector`], so the
//! delivery logic runs unchanged over TCP ([`tcp`]) or over an in-memory
//! network in tests.

use std::future::Future;
use std::io;

use crate::domain::{ClientProfile, Permission};
use crate::error::ConnectError;

pub mod message;
#[cfg(test)]
pub(crate) mod mock;
pub mod tcp;

pub use message::{Message, MessageError};
pub use tcp::{TcpConnector, TcpLink};

/// An established connection to one endpoint.
///
/// All methods take `&self` so the reactor can wait for readability while
/// the pool keeps sending on the same link.
pub trait Link: Send + Sync + 'static {
    /// Address the link was opened for.
    fn peer_addr(&self) -> &str;

    /// Sends one message.
    ///
    /// An error of kind [`io::ErrorKind::WouldBlock`] is retryable; any other
    /// error means the link is unusable.
    fn send(&self, msg: &Message) -> impl Future<Output = io::Result<()>> + Send;

    /// Receives one message. Only called after [`Link::readable`] resolved.
    fn recv(&self) -> impl Future<Output = Result<Message, MessageError>> + Send;

    /// Resolves once the link has data to read (or has hit end of stream).
    fn readable(&self) -> impl Future<Output = io::Result<()>> + Send;

    /// Whether the link is still usable.
    fn is_alive(&self) -> bool;

    /// Shuts the link down.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Opens [`Link`]s to addresses taken from a connection string.
pub trait Connector: Send + Sync + 'static {
    /// Link type produced by this connector.
    type Link: Link;

    /// Connects to `addr`, declaring `permission` on behalf of `profile`.
    fn connect(
        &self,
        addr: &str,
        profile: &ClientProfile,
        permission: Permission,
    ) -> impl Future<Output = Result<Self::Link, ConnectError>> + Send;
}
