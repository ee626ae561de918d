//! Client connection handling: registry, rate limiting, WebSocket
//! endpoint.

pub mod handler;
pub mod rate_limit;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

use wasl_pairing::ClientSink;
use wasl_proto::ServerMessage;
use wasl_types::ConnId;

/// Close reason for queue overflow and repeat offenders.
pub const CLOSE_SLOW_CONSUMER: &str = "slow_consumer";

/// Close reason on graceful shutdown.
pub const CLOSE_SHUTTING_DOWN: &str = "serverShuttingDown";

struct ClientConn {
    tx: mpsc::Sender<ServerMessage>,
    /// Set once the connection registers; used as the rendezvous peer id.
    peer_id: Option<String>,
}

#[derive(Default)]
struct Inner {
    conns: HashMap<ConnId, ClientConn>,
    /// Reason the writer task should put in its close frame.
    close_reasons: HashMap<ConnId, &'static str>,
    /// Live connection count per client public key.
    per_peer: HashMap<String, usize>,
}

/// Registry of live client connections.
///
/// Implements [`ClientSink`] over bounded per-connection queues: a full
/// queue removes the connection (its writer task then closes the socket
/// with `slow_consumer`), so one stalled client cannot hold memory or
/// block a handler.
pub struct ClientRegistry {
    queue_len: usize,
    max_per_peer: usize,
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl ClientRegistry {
    pub fn new(queue_len: usize, max_per_peer: usize) -> Self {
        Self {
            queue_len: queue_len.max(1),
            max_per_peer: max_per_peer.max(1),
            next_id: AtomicU64::new(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Add a connection; returns its id and the outbound queue to pump.
    pub fn add(&self) -> (ConnId, mpsc::Receiver<ServerMessage>) {
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_len);
        self.lock().conns.insert(
            conn_id,
            ClientConn {
                tx,
                peer_id: None,
            },
        );
        (conn_id, rx)
    }

    /// Bind a connection to a client public key (at `register` time).
    ///
    /// Enforces `max_connections_per_peer`; returns false when the peer
    /// already has too many live connections.
    pub fn bind_peer(&self, conn_id: ConnId, peer_id: &str) -> bool {
        let mut inner = self.lock();
        let count = inner.per_peer.get(peer_id).copied().unwrap_or(0);
        if count >= self.max_per_peer {
            return false;
        }
        let Some(conn) = inner.conns.get_mut(&conn_id) else {
            return false;
        };
        if let Some(previous) = conn.peer_id.replace(peer_id.to_string()) {
            decrement(&mut inner.per_peer, &previous);
        }
        *inner.per_peer.entry(peer_id.to_string()).or_insert(0) += 1;
        true
    }

    /// The peer id a connection registered with, if any.
    pub fn peer_id(&self, conn_id: ConnId) -> Option<String> {
        self.lock().conns.get(&conn_id).and_then(|c| c.peer_id.clone())
    }

    /// Remove a connection; returns its bound peer id.
    pub fn remove(&self, conn_id: ConnId) -> Option<String> {
        let mut inner = self.lock();
        let conn = inner.conns.remove(&conn_id)?;
        if let Some(peer_id) = &conn.peer_id {
            decrement(&mut inner.per_peer, peer_id);
        }
        conn.peer_id
    }

    /// Drop a connection's queue so its writer closes with `reason`.
    pub fn force_close(&self, conn_id: ConnId, reason: &'static str) {
        let mut inner = self.lock();
        if let Some(conn) = inner.conns.remove(&conn_id) {
            if let Some(peer_id) = &conn.peer_id {
                decrement(&mut inner.per_peer, peer_id);
            }
            inner.close_reasons.insert(conn_id, reason);
        }
    }

    /// Drop every connection (graceful shutdown).
    pub fn close_all(&self, reason: &'static str) {
        let mut inner = self.lock();
        let ids: Vec<ConnId> = inner.conns.keys().copied().collect();
        for conn_id in ids {
            inner.conns.remove(&conn_id);
            inner.close_reasons.insert(conn_id, reason);
        }
        inner.per_peer.clear();
    }

    /// The close reason recorded for a connection, consumed once.
    pub fn take_close_reason(&self, conn_id: ConnId) -> Option<&'static str> {
        self.lock().close_reasons.remove(&conn_id)
    }

    /// Live connection count.
    pub fn count(&self) -> usize {
        self.lock().conns.len()
    }

    /// Whether a connection is still registered (not force-closed).
    pub fn is_open(&self, conn_id: ConnId) -> bool {
        self.lock().conns.contains_key(&conn_id)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ClientSink for ClientRegistry {
    fn send(&self, conn_id: ConnId, message: ServerMessage) -> bool {
        let tx = {
            let inner = self.lock();
            match inner.conns.get(&conn_id) {
                Some(conn) => conn.tx.clone(),
                None => return false,
            }
        };

        match tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(conn_id, "client outbound queue overflow");
                self.force_close(conn_id, CLOSE_SLOW_CONSUMER);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.remove(conn_id);
                false
            }
        }
    }
}

fn decrement(per_peer: &mut HashMap<String, usize>, peer_id: &str) {
    if let Some(count) = per_peer.get_mut(peer_id) {
        *count -= 1;
        if *count == 0 {
            per_peer.remove(peer_id);
        }
    }
}
