//! Background queue behind [`super::ConnectionPool::broadcast_async`].

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use super::pool::ConnectionPool;
use crate::transport::{Connector, Message};

/// A queued broadcast. The pool handle keeps the pool alive until the job
/// has run.
pub(crate) struct Job<C: Connector> {
    pool: ConnectionPool<C>,
    message: Message,
}

impl<C: Connector> Job<C> {
    pub(crate) const fn new(pool: ConnectionPool<C>, message: Message) -> Self {
        Self { pool, message }
    }
}

/// Spawns the single worker consuming jobs in FIFO order.
///
/// The worker stops when the sender is dropped, which happens with the last
/// pool handle.
pub(crate) fn spawn_worker<C: Connector>(handle: &Handle) -> mpsc::UnboundedSender<Job<C>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job<C>>();
    handle.spawn(async move {
        while let Some(job) = rx.recv().await {
            let Job { pool, message } = job;
            pool.broadcast(&message).await;
            drop(pool);
        }
        tracing::debug!("asynchronous broadcast worker stopped");
    });
    tx
}
