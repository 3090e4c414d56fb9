//! The storage server: file bytes on local disk plus the editing engine.
//!
//! One storage server process owns a private subtree of the namespace. It
//! registers with the naming server over a persistent control connection
//! (serving CREATE/DELETE/CHECKPOINT/... commands and heartbeats on it),
//! listens for one-shot client connections on its data port, and mirrors
//! the same control handler on a second listener at data port + 1000.
//!
//! Per-file editing state that is not on disk (the sentence lock table
//! and the one-step undo flags) lives in [`StorageState`] and does not
//! survive a restart.

pub mod control;
pub mod data;
pub mod edit;
pub mod locks;
pub mod sentence;
pub mod store;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SsConfig;
use crate::net_util;
use crate::protocol::message::{read_message, write_message, Message, SsRegistration};
use crate::protocol::ops::Opcode;
use crate::storage::control::{handle_control, ControlFlow};
use crate::storage::locks::SentenceLocks;
use crate::storage::store::{DiskStore, DocStore};

/// Delay before retrying a lost naming-server connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Shared state of one storage server process.
pub struct StorageState {
    pub store: Arc<dyn DocStore>,
    pub locks: Arc<SentenceLocks>,
    /// Files whose most recent operation was an UNDO.
    undo_flags: Mutex<HashSet<String>>,
}

impl StorageState {
    pub fn new(store: Arc<dyn DocStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            locks: SentenceLocks::new(),
            undo_flags: Mutex::new(HashSet::new()),
        })
    }

    /// True when the last operation on the file was an undo, which blocks
    /// a second one.
    pub fn undo_blocked(&self, name: &str) -> bool {
        self.undo_flags.lock().expect("undo flag set poisoned").contains(name)
    }

    pub fn set_undo_flag(&self, name: &str) {
        self.undo_flags.lock().expect("undo flag set poisoned").insert(name.to_string());
    }

    /// Any successful write re-arms undo.
    pub fn clear_undo_flag(&self, name: &str) {
        self.undo_flags.lock().expect("undo flag set poisoned").remove(name);
    }
}

/// One storage server process.
pub struct StorageServer {
    id: String,
    ns_addr: String,
    client_port: u16,
    advertise_ip: String,
    state: Arc<StorageState>,
}

impl StorageServer {
    /// Opens the on-disk store and resolves the advertised address.
    pub fn new(
        id: impl Into<String>,
        ns_ip: &str,
        ns_port: u16,
        client_port: u16,
        config: &SsConfig,
    ) -> anyhow::Result<Self> {
        let id = id.into();
        let store = DiskStore::open(&config.storage_root, &config.backup_root, &id)
            .context("opening storage directories")?;
        let advertise_ip = config
            .advertise_ip
            .clone()
            .or_else(net_util::discover_advertise_ip)
            .unwrap_or_else(|| "127.0.0.1".to_string());
        Ok(Self {
            id,
            ns_addr: format!("{ns_ip}:{ns_port}"),
            client_port,
            advertise_ip,
            state: StorageState::new(Arc::new(store)),
        })
    }

    pub fn state(&self) -> Arc<StorageState> {
        Arc::clone(&self.state)
    }

    /// Runs the server until `shutdown` flips or the naming server orders
    /// a shutdown. A lost naming-server connection is retried with
    /// re-registration; the record on the other side is rebound.
    pub async fn run_until(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let data_listener = TcpListener::bind(("0.0.0.0", self.client_port))
            .await
            .context("binding the data port")?;
        let data_port = data_listener.local_addr()?.port();
        let control_port = if self.client_port == 0 { 0 } else { self.client_port + 1000 };
        let control_listener = TcpListener::bind(("0.0.0.0", control_port))
            .await
            .context("binding the control port")?;
        let control_port = control_listener.local_addr()?.port();
        info!(
            "storage server '{}' serving data on port {}, control on port {}",
            self.id, data_port, control_port
        );

        spawn_data_loop(self.state.clone(), data_listener);
        spawn_control_loop(self.state.clone(), control_listener);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                served = self.serve_naming_server(data_port, control_port) => {
                    match served {
                        Ok(ControlFlow::Shutdown) => break,
                        Ok(ControlFlow::Continue) => {
                            warn!("naming server closed the control connection, re-registering");
                        }
                        Err(err) => {
                            warn!("naming server connection failed: {err:#}");
                        }
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        info!("storage server '{}' shutting down", self.id);
        Ok(())
    }

    /// Connects, registers, and serves control commands until the socket
    /// closes or SHUTDOWN arrives.
    async fn serve_naming_server(
        &self,
        data_port: u16,
        control_port: u16,
    ) -> anyhow::Result<ControlFlow> {
        let mut socket = TcpStream::connect(&self.ns_addr)
            .await
            .with_context(|| format!("connecting to naming server at {}", self.ns_addr))?;
        socket.set_nodelay(true)?;

        let files = self
            .state
            .store
            .scan()
            .await
            .map_err(|err| anyhow::anyhow!("scanning storage root: {err}"))?;
        let mut registration = SsRegistration {
            ss_id: self.id.clone(),
            advertise_ip: self.advertise_ip.clone(),
            client_port: data_port as u32,
            control_port: control_port as u32,
            files,
        };
        let payload = loop {
            match registration.pack() {
                Ok(payload) => break payload,
                Err(_) if !registration.files.is_empty() => {
                    // The record's data field bounds the advertised list.
                    warn!(
                        "advertised file list exceeds the record capacity, dropping '{}'",
                        registration.files.last().expect("non-empty list")
                    );
                    registration.files.pop();
                }
                Err(err) => return Err(err.into()),
            }
        };
        let mut request = Message::request(Opcode::RegisterSs);
        request.data = payload;
        write_message(&mut socket, &request).await?;
        let reply = read_message(&mut socket).await?;
        if !reply.status.is_ok() {
            anyhow::bail!("registration rejected: {}", reply.text());
        }
        info!("registered with naming server at {}", self.ns_addr);

        loop {
            let request = read_message(&mut socket).await?;
            let (response, flow) = handle_control(&self.state, &request).await;
            write_message(&mut socket, &response).await?;
            if flow == ControlFlow::Shutdown {
                return Ok(ControlFlow::Shutdown);
            }
        }
    }
}

fn spawn_data_loop(state: Arc<StorageState>, listener: TcpListener) {
    tokio::spawn(async move {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("data accept failed: {}", err);
                    continue;
                }
            };
            let _ = socket.set_nodelay(true);
            let state = state.clone();
            tokio::spawn(async move {
                if let Err(err) = data::serve_data(state, socket).await {
                    debug!("data connection from {} ended: {:?}", peer, err);
                }
            });
        }
    });
}

/// The stand-alone control listener mirrors the persistent channel's
/// command set, one request/response pair per record.
fn spawn_control_loop(state: Arc<StorageState>, listener: TcpListener) {
    tokio::spawn(async move {
        loop {
            let (mut socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("control accept failed: {}", err);
                    continue;
                }
            };
            let state = state.clone();
            tokio::spawn(async move {
                loop {
                    let request = match read_message(&mut socket).await {
                        Ok(request) => request,
                        Err(_) => break,
                    };
                    let (response, flow) = handle_control(&state, &request).await;
                    if write_message(&mut socket, &response).await.is_err() {
                        break;
                    }
                    if flow == ControlFlow::Shutdown {
                        break;
                    }
                }
                debug!("control connection from {} closed", peer);
            });
        }
    });
}
