//! Session broker: the credential-store side of the bridge.
//!
//! Listens on a user-only Unix socket, keeps one encrypted session per
//! connection and fans store lock-state changes out to every peer.
//!
//! # Architecture
//!
//! ```text
//! Credential store process
//! ┌─────────────────────────────────────────────────────────────┐
//! │ SessionBroker                                               │
//! │  accept loop ──► ConnectionRegistry (HashMap, one Mutex)    │
//! │                   ├─ conn:1  read task ─► Session ─► store  │
//! │                   │          write task ◄─ mpsc ◄─ broadcast│
//! │                   └─ conn:2  ...                            │
//! └─────────────────────────────────────────────────────────────┘
//!        ▲ unix socket (0600)
//!   Relay processes, one per browser extension
//! ```
//!
//! The broker has no process-exit side effects; [`SessionBroker::stop`] is
//! its only shutdown path.

mod connection;
mod decoder;
mod registry;
mod session;

pub use session::ConnectionState;

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc::UnboundedReceiver, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::BridgeConfig;
use crate::constants::{ACCEPT_RETRY_DELAY, MAX_SOCKET_PATH, STOP_FLUSH_TIMEOUT};
use crate::error::{BridgeError, Result};
use crate::protocol::Notification;
use crate::store::{AssociationApprover, CredentialStore};
use registry::ConnectionRegistry;

/// Unique identifier of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next identifier (process-wide, monotonic).
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn:{:x}", self.0)
    }
}

/// State shared by the broker and its connection tasks.
pub(crate) struct BrokerShared {
    pub(crate) store: Arc<dyn CredentialStore>,
    pub(crate) approver: Arc<dyn AssociationApprover>,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) config: BridgeConfig,
}

impl BrokerShared {
    fn broadcast(&self, notification: Notification) -> usize {
        let delivered = self.registry.broadcast(&notification.to_bytes());
        log::info!(
            "[Broker] Broadcast {} to {delivered} connection(s)",
            notification.action()
        );
        delivered
    }
}

impl fmt::Debug for BrokerShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerShared")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Bound listener plus its accept task.
#[derive(Debug)]
struct Listener {
    socket_path: PathBuf,
    accept_handle: JoinHandle<()>,
}

/// Terminates the local-socket protocol inside the credential-store process.
#[derive(Debug)]
pub struct SessionBroker {
    shared: Arc<BrokerShared>,
    listener: Mutex<Option<Listener>>,
    lock_forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl SessionBroker {
    /// Create a broker answering from `store` and approving through `approver`.
    pub fn new(
        config: BridgeConfig,
        store: Arc<dyn CredentialStore>,
        approver: Arc<dyn AssociationApprover>,
    ) -> Self {
        Self {
            shared: Arc::new(BrokerShared {
                store,
                approver,
                registry: ConnectionRegistry::default(),
                config,
            }),
            listener: Mutex::new(None),
            lock_forwarder: Mutex::new(None),
        }
    }

    /// Start listening on the configured socket path.
    pub fn start_default(&self) -> Result<()> {
        let path = self.shared.config.socket_path.clone();
        self.start(path)
    }

    /// Start listening on `socket_path`.
    ///
    /// Removes a stale socket file, binds the listener, restricts it to the
    /// current user (0600) and spawns the accept loop. Calling this on a
    /// running broker does nothing. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Bind`] if the path is too long, another process is
    /// listening on it, or the socket cannot be created.
    pub fn start(&self, socket_path: impl Into<PathBuf>) -> Result<()> {
        let socket_path = socket_path.into();
        let mut listener = lock(&self.listener);
        if listener.is_some() {
            return Ok(());
        }

        let std_listener = bind(&socket_path)?;
        let tokio_listener =
            UnixListener::from_std(std_listener).map_err(|e| bind_error(&socket_path, &e))?;

        log::info!("[Broker] Listening on {}", socket_path.display());

        self.shared.registry.reopen();
        let accept_handle = tokio::spawn(accept_loop(
            tokio_listener,
            Arc::clone(&self.shared),
            socket_path.clone(),
        ));
        *listener = Some(Listener { socket_path, accept_handle });
        Ok(())
    }

    /// Stop listening and close every connection.
    ///
    /// Every peer is told the store is locked, then each connection stops
    /// reading and gets up to [`STOP_FLUSH_TIMEOUT`] to flush what is queued.
    /// Waits for all connection tasks to finish, so no message is dispatched
    /// after this returns. Safe to call repeatedly.
    pub async fn stop(&self) {
        let listener = lock(&self.listener).take();
        if let Some(listener) = listener {
            listener.accept_handle.abort();
            let _ = listener.accept_handle.await;
            match std::fs::remove_file(&listener.socket_path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => log::warn!(
                    "[Broker] Failed to remove {}: {e}",
                    listener.socket_path.display()
                ),
            }
            log::info!("[Broker] Stopped listening on {}", listener.socket_path.display());
        }

        let forwarder = lock(&self.lock_forwarder).take();
        if let Some(forwarder) = forwarder {
            forwarder.abort();
            let _ = forwarder.await;
        }

        if self.shared.registry.len() > 0 {
            self.shared.broadcast(Notification::StoreLocked);
        }
        let connections = self.shared.registry.close_all();
        if connections.is_empty() {
            return;
        }
        log::info!("[Broker] Closing {} connection(s)", connections.len());
        let mut closing = JoinSet::new();
        for conn in connections {
            closing.spawn(conn.shutdown());
        }
        while closing.join_next().await.is_some() {}
    }

    /// Register an accepted transport and start serving it.
    ///
    /// Returns `None` if the broker has been stopped.
    pub fn accept(&self, stream: UnixStream) -> Option<ConnectionId> {
        register(&self.shared, stream)
    }

    /// Drop a connection. Idempotent.
    pub fn disconnect(&self, id: ConnectionId) {
        if let Some(conn) = self.shared.registry.remove(id) {
            log::info!("[Broker] Disconnecting {id}");
            conn.abort();
        }
    }

    /// Queue `notification` for every live connection.
    ///
    /// Returns the number of connections it was queued for.
    pub fn broadcast(&self, notification: Notification) -> usize {
        self.shared.broadcast(notification)
    }

    /// Translate a store lock-state change into a broadcast.
    pub fn notify_lock_state(&self, locked: bool) -> usize {
        self.broadcast(Notification::for_lock_state(locked))
    }

    /// Broadcast every lock-state event received on `events`.
    ///
    /// Replaces any previous forwarder; stopped by [`SessionBroker::stop`].
    pub fn forward_lock_events(&self, mut events: UnboundedReceiver<bool>) {
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            while let Some(locked) = events.recv().await {
                shared.broadcast(Notification::for_lock_state(locked));
            }
        });
        if let Some(previous) = lock(&self.lock_forwarder).replace(handle) {
            previous.abort();
        }
    }

    /// Whether the listener is running.
    pub fn is_running(&self) -> bool {
        lock(&self.listener).is_some()
    }

    /// Path the broker is listening on, if running.
    pub fn socket_path(&self) -> Option<PathBuf> {
        lock(&self.listener).as_ref().map(|l| l.socket_path.clone())
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Identifiers of live connections.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.shared.registry.ids()
    }

    /// Current state of a live connection.
    pub fn connection_state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.shared.registry.state(id)
    }

    /// Watch a live connection's state transitions.
    pub fn watch_state(&self, id: ConnectionId) -> Option<watch::Receiver<ConnectionState>> {
        self.shared.registry.subscribe(id)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn register(shared: &Arc<BrokerShared>, stream: UnixStream) -> Option<ConnectionId> {
    let id = ConnectionId::next();
    if connection::spawn(shared, id, stream) {
        log::info!("[Broker] Client connected: {id}");
        Some(id)
    } else {
        log::warn!("[Broker] Refusing connection, broker is stopped");
        None
    }
}

fn bind_error(path: &Path, err: &dyn fmt::Display) -> BridgeError {
    BridgeError::Bind {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

/// Create the user-only listening socket at `socket_path`.
fn bind(socket_path: &Path) -> Result<std::os::unix::net::UnixListener> {
    use std::os::unix::fs::PermissionsExt;

    let path_len = socket_path.as_os_str().len();
    if path_len >= MAX_SOCKET_PATH {
        return Err(bind_error(
            socket_path,
            &format!("path too long ({path_len} bytes, max {})", MAX_SOCKET_PATH - 1),
        ));
    }

    if socket_path.exists() {
        // A socket that still answers belongs to another broker.
        if std::os::unix::net::UnixStream::connect(socket_path).is_ok() {
            return Err(bind_error(socket_path, &"another broker is already listening"));
        }
        std::fs::remove_file(socket_path).map_err(|e| bind_error(socket_path, &e))?;
    }

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| bind_error(socket_path, &e))?;
    }

    let listener = std::os::unix::net::UnixListener::bind(socket_path)
        .map_err(|e| bind_error(socket_path, &e))?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| bind_error(socket_path, &e))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| bind_error(socket_path, &e))?;
    Ok(listener)
}

/// Accept loop. Runs as a tokio task until aborted.
async fn accept_loop(listener: UnixListener, shared: Arc<BrokerShared>, socket_path: PathBuf) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                if register(&shared, stream).is_none() {
                    break;
                }
            }
            Err(e) => {
                if !socket_path.exists() {
                    log::info!("[Broker] Socket file removed, stopping accept loop");
                    break;
                }
                log::error!("[Broker] Accept error: {e}");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}
