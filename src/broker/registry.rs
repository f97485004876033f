//! Live connection set.
//!
//! Insert, remove and broadcast enumeration all go through one mutex. A
//! connection removed here is never written to by a broadcast again, and a
//! second removal of the same id is a no-op.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc::UnboundedSender, watch};
use tokio::task::JoinHandle;

use super::session::ConnectionState;
use super::ConnectionId;
use crate::constants::STOP_FLUSH_TIMEOUT;

/// Broker-side handle of one live connection.
#[derive(Debug)]
pub(crate) struct ConnectionHandle {
    /// Encoded messages for the write task.
    pub outbound: UnboundedSender<Vec<u8>>,
    /// Mirrors the session state owned by the read task.
    pub state: watch::Receiver<ConnectionState>,
    pub read_handle: JoinHandle<()>,
    pub write_handle: JoinHandle<()>,
}

impl ConnectionHandle {
    /// Stop reading, flush queued writes, then wait for both tasks.
    ///
    /// The read task is aborted first so nothing new is dispatched. Once both
    /// outbound senders are gone the write task drains its queue and shuts
    /// the socket down; it is aborted if that takes longer than
    /// [`STOP_FLUSH_TIMEOUT`].
    pub(crate) async fn shutdown(self) {
        let Self { outbound, read_handle, mut write_handle, .. } = self;
        read_handle.abort();
        let _ = read_handle.await;
        drop(outbound);

        if tokio::time::timeout(STOP_FLUSH_TIMEOUT, &mut write_handle)
            .await
            .is_err()
        {
            log::warn!("[Broker] Connection did not flush in time, dropping queued writes");
            write_handle.abort();
            let _ = write_handle.await;
        }
    }

    /// Abort both tasks without waiting.
    pub(crate) fn abort(&self) {
        self.read_handle.abort();
        self.write_handle.abort();
    }
}

#[derive(Debug, Default)]
struct Inner {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    /// Set by `close_all`; refuses new registrations until `reopen`.
    closed: bool,
}

/// The broker's single owned map of live connections.
#[derive(Debug, Default)]
pub(crate) struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection built by `spawn`.
    ///
    /// `spawn` runs under the lock, so tasks it starts cannot remove their
    /// own entry before it exists. Returns `false` (without calling `spawn`)
    /// once the registry has been closed.
    pub(crate) fn insert_with<F>(&self, id: ConnectionId, spawn: F) -> bool
    where
        F: FnOnce() -> ConnectionHandle,
    {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        inner.connections.insert(id, spawn());
        true
    }

    /// Remove a connection. Idempotent.
    pub(crate) fn remove(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.lock().connections.remove(&id)
    }

    /// Queue `bytes` on every live connection.
    ///
    /// Returns how many connections accepted the message. A connection whose
    /// write task already ended is skipped.
    pub(crate) fn broadcast(&self, bytes: &[u8]) -> usize {
        let inner = self.lock();
        inner
            .connections
            .values()
            .filter(|conn| conn.outbound.send(bytes.to_vec()).is_ok())
            .count()
    }

    /// Remove every connection and refuse new ones.
    pub(crate) fn close_all(&self) -> Vec<ConnectionHandle> {
        let mut inner = self.lock();
        inner.closed = true;
        inner.connections.drain().map(|(_, conn)| conn).collect()
    }

    /// Accept registrations again after `close_all`.
    pub(crate) fn reopen(&self) {
        self.lock().closed = false;
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub(crate) fn state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.lock().connections.get(&id).map(|conn| *conn.state.borrow())
    }

    pub(crate) fn subscribe(&self, id: ConnectionId) -> Option<watch::Receiver<ConnectionState>> {
        self.lock().connections.get(&id).map(|conn| conn.state.clone())
    }

    pub(crate) fn ids(&self) -> Vec<ConnectionId> {
        self.lock().connections.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn idle_handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (_state_tx, state_rx) = watch::channel(ConnectionState::AwaitingHandshake);
        let handle = ConnectionHandle {
            outbound: tx,
            state: state_rx,
            read_handle: tokio::spawn(std::future::pending()),
            write_handle: tokio::spawn(std::future::pending()),
        };
        (handle, rx)
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = ConnectionRegistry::default();
        let id = ConnectionId::next();
        let (handle, _rx) = idle_handle();
        assert!(registry.insert_with(id, || handle));

        let removed = registry.remove(id).expect("first removal");
        assert!(registry.remove(id).is_none());
        removed.abort();
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_skips_removed_connections() {
        let registry = ConnectionRegistry::default();
        let mut receivers = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = ConnectionId::next();
            let (handle, rx) = idle_handle();
            registry.insert_with(id, || handle);
            receivers.push(rx);
            ids.push(id);
        }

        registry.remove(ids[1]).expect("present").abort();
        assert_eq!(registry.broadcast(b"x"), 2);
        assert_eq!(receivers[0].try_recv().unwrap(), b"x");
        assert!(receivers[1].try_recv().is_err());
        assert_eq!(receivers[2].try_recv().unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_shutdown_flushes_queued_writes() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Active);
        let (flushed_tx, flushed_rx) = tokio::sync::oneshot::channel();
        let handle = ConnectionHandle {
            outbound: tx.clone(),
            state: state_rx,
            read_handle: tokio::spawn(async move {
                let _tx = tx;
                std::future::pending::<()>().await;
            }),
            write_handle: tokio::spawn(async move {
                let mut written = Vec::new();
                while let Some(data) = rx.recv().await {
                    written.push(data);
                }
                let _ = flushed_tx.send(written);
            }),
        };

        handle.outbound.send(b"first".to_vec()).unwrap();
        handle.outbound.send(b"second".to_vec()).unwrap();
        handle.shutdown().await;
        assert_eq!(flushed_rx.await.unwrap(), vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_gives_up_on_stuck_writer() {
        let (handle, _rx) = idle_handle();
        let started = tokio::time::Instant::now();
        handle.shutdown().await;
        assert!(started.elapsed() >= STOP_FLUSH_TIMEOUT);
    }

    #[tokio::test]
    async fn test_closed_registry_refuses_inserts() {
        let registry = ConnectionRegistry::default();
        assert!(registry.close_all().is_empty());

        let (handle, _rx) = idle_handle();
        let mut called = false;
        assert!(!registry.insert_with(ConnectionId::next(), || {
            called = true;
            handle
        }));
        assert!(!called);

        registry.reopen();
        let (handle, _rx) = idle_handle();
        assert!(registry.insert_with(ConnectionId::next(), || handle));
    }
}
