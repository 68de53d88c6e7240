//! Connection identity and its outbound queue.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::format::Payload;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message queued for one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Advisory: the client should reload.
    Refresh,
    /// One transformed chunk for a subscribed channel.
    Chunk { channel: Arc<str>, payload: Payload },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitResult {
    Sent,
    /// Queue full; this message was dropped for this connection only.
    Dropped,
    /// Receiver gone; the connection is shutting down.
    Closed,
}

/// Emit capability for one connection: a bounded queue drained by the
/// connection's writer task. Emitting never waits.
#[derive(Debug, Clone)]
pub struct Outbox {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
}

impl Outbox {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: ConnectionId::next(),
                tx,
            },
            rx,
        )
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn emit(&self, msg: Outbound) -> EmitResult {
        match self.tx.try_send(msg) {
            Ok(()) => EmitResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => EmitResult::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => EmitResult::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
