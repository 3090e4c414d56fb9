//! The naming server: metadata authority and session coordinator.
//!
//! All mutable state lives in one [`Coordinator`] value: the metadata
//! registry, the session table, the storage pool, the search cache and
//! the access-request counter, each table behind its own lock so that
//! lock order (files, folders, sessions, cache) and hold windows are
//! explicit. No table lock is ever held across network I/O; the only
//! sanctioned round-trip-under-serialization is the per-storage-server
//! control worker in [`pool`].
//!
//! [`NamingServer`] owns the listening socket: one router task per
//! accepted connection, plus the long-running heartbeat monitor.

pub mod exec;
pub mod heartbeat;
pub mod pool;
pub mod registry;
pub mod router;
pub mod search;
pub mod sessions;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::NsConfig;
use crate::protocol::message::Message;
use crate::protocol::ops::Opcode;

/// The naming server's entire mutable state.
pub struct Coordinator {
    pub config: NsConfig,
    pub registry: registry::MetadataRegistry,
    pub sessions: sessions::SessionTable,
    pub pool: pool::StoragePool,
    pub search: search::SearchCache,
    request_ids: AtomicU64,
}

impl Coordinator {
    pub fn new(config: NsConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: registry::MetadataRegistry::new(),
            sessions: sessions::SessionTable::new(),
            pool: pool::StoragePool::new(),
            search: search::SearchCache::new(),
            request_ids: AtomicU64::new(1),
        })
    }

    /// Next process-wide access-request id.
    pub(crate) fn next_request_id(&self) -> u64 {
        self.request_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Best-effort SHUTDOWN broadcast to every storage server with an
    /// open control channel, for graceful teardown.
    pub async fn shutdown_storage(&self) {
        for (ss_id, handle, _, _) in self.pool.probe_targets() {
            let Some(handle) = handle else {
                continue;
            };
            let cmd = Message::request(Opcode::Shutdown);
            match handle.call(cmd).await {
                Ok(_) => info!("storage server '{}' acknowledged shutdown", ss_id),
                Err(err) => warn!("shutdown notify to '{}' failed: {}", ss_id, err),
            }
        }
    }
}

/// The listening front of the naming server.
pub struct NamingServer {
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
}

impl NamingServer {
    /// Binds the configured port (0 picks an ephemeral port, which the
    /// tests rely on).
    pub async fn bind(config: NsConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        info!("naming server listening on {}", listener.local_addr()?);
        Ok(Self { coordinator: Coordinator::new(config), listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Accepts connections until `shutdown` flips; then notifies every
    /// storage server and returns.
    pub async fn run_until(self, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        let monitor = heartbeat::spawn(self.coordinator.clone());
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (socket, peer) = accepted?;
                    socket.set_nodelay(true)?;
                    let coordinator = self.coordinator.clone();
                    tokio::spawn(async move {
                        if let Err(err) = router::serve_connection(coordinator, socket, peer).await {
                            debug!("connection from {} ended: {:?}", peer, err);
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("naming server shutting down");
        monitor.abort();
        self.coordinator.shutdown_storage().await;
        Ok(())
    }

    /// Accepts connections forever.
    pub async fn run(self) -> std::io::Result<()> {
        let (_keep_alive, rx) = watch::channel(false);
        self.run_until(rx).await
    }
}
