//! TCP implementation of the connection primitive.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use super::{Connector, Link, Message, MessageError};
use crate::domain::{ClientProfile, Permission};
use crate::error::ConnectError;

/// Handshake payload announced right after the TCP connection is up.
#[derive(Debug, Serialize)]
struct Hello<'a> {
    name: &'a str,
    analyzer_id: u64,
    permission: String,
}

/// Opens [`TcpLink`]s with a bounded connect time.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Creates a connector giving up on a connect after `connect_timeout`.
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl Connector for TcpConnector {
    type Link = TcpLink;

    async fn connect(
        &self,
        addr: &str,
        profile: &ClientProfile,
        permission: Permission,
    ) -> Result<TcpLink, ConnectError> {
        if permission.is_empty() {
            return Err(ConnectError::Setup(format!(
                "profile `{}` declares no permission",
                profile.name
            )));
        }

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;

        let hello = Hello {
            name: &profile.name,
            analyzer_id: profile.analyzer_id,
            permission: permission.to_string(),
        };
        let payload = serde_json::to_vec(&hello)
            .map_err(|e| ConnectError::Setup(format!("cannot encode handshake: {e}")))?;
        let hello = Message::new(Message::TAG_HELLO, Message::PRIORITY_HIGH, payload)
            .map_err(|e| ConnectError::Setup(e.to_string()))?;

        let (reader, mut writer) = stream.into_split();
        hello.write_async(&mut writer).await?;

        tracing::debug!(addr, analyzer_id = profile.analyzer_id, "tcp link established");
        Ok(TcpLink {
            addr: addr.to_string(),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            alive: AtomicBool::new(true),
        })
    }
}

/// A TCP connection carrying framed [`Message`]s.
#[derive(Debug)]
pub struct TcpLink {
    addr: String,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    alive: AtomicBool,
}

impl TcpLink {
    fn mark_failed<E>(&self, err: E) -> E {
        self.alive.store(false, Ordering::Release);
        err
    }
}

impl Link for TcpLink {
    fn peer_addr(&self) -> &str {
        &self.addr
    }

    async fn send(&self, msg: &Message) -> io::Result<()> {
        if !self.is_alive() {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        let mut writer = self.writer.lock().await;
        match msg.write_async(&mut *writer).await {
            Err(err) if err.kind() != io::ErrorKind::WouldBlock => Err(self.mark_failed(err)),
            other => other,
        }
    }

    async fn recv(&self) -> Result<Message, MessageError> {
        let mut reader = self.reader.lock().await;
        Message::read_async(&mut *reader)
            .await
            .map_err(|err| self.mark_failed(err))
    }

    async fn readable(&self) -> io::Result<()> {
        let reader = self.reader.lock().await;
        reader.readable().await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::Release);
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            tracing::debug!(addr = %self.addr, error = %err, "tcp shutdown failed");
        }
    }
}
