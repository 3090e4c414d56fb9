#![allow(dead_code)]

//! Shared harness: an in-process naming server plus storage servers on
//! ephemeral ports and tempdir-backed storage, with small client helpers
//! that speak the wire protocol the way a real client would.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

use scribefs::config::{NsConfig, SsConfig};
use scribefs::naming::{Coordinator, NamingServer};
use scribefs::protocol::message::{read_message, write_message, Message};
use scribefs::protocol::ops::{Opcode, Status};
use scribefs::storage::{StorageServer, StorageState};

/// Per-operation timeout: generous enough for paced streams.
pub const OP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct StorageHandle {
    pub state: Arc<StorageState>,
    shutdown: watch::Sender<bool>,
    dir: tempfile::TempDir,
}

pub struct Cluster {
    pub ns_addr: SocketAddr,
    pub coordinator: Arc<Coordinator>,
    storages: HashMap<String, StorageHandle>,
    _ns_shutdown: watch::Sender<bool>,
}

impl Cluster {
    /// Naming server plus one storage server, "ss1", ready to route.
    pub async fn start() -> Cluster {
        let config = NsConfig { port: 0, heartbeat_interval_secs: 1, ..NsConfig::default() };
        let server = NamingServer::bind(config).await.expect("bind naming server");
        let ns_addr = server.local_addr().expect("naming server address");
        let coordinator = server.coordinator();
        let (ns_shutdown, ns_shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = server.run_until(ns_shutdown_rx).await;
        });

        let mut cluster = Cluster {
            ns_addr,
            coordinator,
            storages: HashMap::new(),
            _ns_shutdown: ns_shutdown,
        };
        cluster.spawn_storage("ss1").await;
        cluster
    }

    /// Starts a storage server on fresh tempdir roots.
    pub async fn spawn_storage(&mut self, id: &str) {
        let dir = tempfile::tempdir().expect("storage tempdir");
        self.spawn_storage_in(id, dir).await;
    }

    async fn spawn_storage_in(&mut self, id: &str, dir: tempfile::TempDir) {
        let config = SsConfig {
            advertise_ip: Some("127.0.0.1".to_string()),
            storage_root: dir.path().join("storage"),
            backup_root: dir.path().join("backup"),
        };
        let server = StorageServer::new(id, "127.0.0.1", self.ns_addr.port(), 0, &config)
            .expect("storage server setup");
        let state = server.state();
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = server.run_until(shutdown_rx).await;
        });
        self.storages.insert(id.to_string(), StorageHandle { state, shutdown, dir });
        self.wait_routable(id).await;
    }

    /// Stops a storage server; its control socket closes with it. The
    /// directories are handed back so the server can be restarted on them.
    pub fn stop_storage(&mut self, id: &str) -> tempfile::TempDir {
        let handle = self.storages.remove(id).expect("storage server not running");
        let _ = handle.shutdown.send(true);
        handle.dir
    }

    /// Restarts a storage server on the directories it left behind.
    pub async fn restart_storage(&mut self, id: &str, dir: tempfile::TempDir) {
        self.spawn_storage_in(id, dir).await;
    }

    pub fn storage_state(&self, id: &str) -> Arc<StorageState> {
        Arc::clone(&self.storages.get(id).expect("storage server not running").state)
    }

    /// Polls until the pool reports the server routable.
    pub async fn wait_routable(&self, id: &str) {
        timeout(OP_TIMEOUT, async {
            loop {
                let routable = self
                    .coordinator
                    .pool
                    .snapshot()
                    .into_iter()
                    .any(|s| s.id == id && s.active && !s.failed);
                if routable {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("storage server did not become routable");
    }

    /// Polls until the pool reports the server failed.
    pub async fn wait_failed(&self, id: &str) {
        timeout(OP_TIMEOUT, async {
            loop {
                let failed =
                    self.coordinator.pool.snapshot().into_iter().any(|s| s.id == id && s.failed);
                if failed {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("storage server was not marked failed");
    }

    /// Opens a client session; panics on a rejected login.
    pub async fn client(&self, username: &str) -> TestClient {
        TestClient::connect(self.ns_addr, username)
            .await
            .unwrap_or_else(|reply| panic!("login rejected: {}", reply.text()))
    }

    /// Attempts a login and returns the raw response on rejection.
    pub async fn try_client(&self, username: &str) -> Result<TestClient, Message> {
        TestClient::connect(self.ns_addr, username).await
    }
}

/// A client session connection to the naming server.
#[derive(Debug)]
pub struct TestClient {
    username: String,
    socket: TcpStream,
}

impl TestClient {
    pub async fn connect(ns_addr: SocketAddr, username: &str) -> Result<TestClient, Message> {
        let mut socket = TcpStream::connect(ns_addr).await.expect("connect naming server");
        let mut login = Message::request(Opcode::RegisterClient);
        login.username = username.to_string();
        write_message(&mut socket, &login).await.expect("send login");
        let reply = timeout(OP_TIMEOUT, read_message(&mut socket))
            .await
            .expect("login timeout")
            .expect("login reply");
        if reply.status != Status::Success {
            return Err(reply);
        }
        Ok(TestClient { username: username.to_string(), socket })
    }

    /// One request/response round trip on the session connection. An
    /// empty username is filled in with the session's.
    pub async fn request(&mut self, mut msg: Message) -> Message {
        if msg.username.is_empty() {
            msg.username = self.username.clone();
        }
        write_message(&mut self.socket, &msg).await.expect("send request");
        timeout(OP_TIMEOUT, read_message(&mut self.socket))
            .await
            .expect("response timeout")
            .expect("response")
    }

    pub async fn create(&mut self, name: &str) -> Message {
        let mut msg = Message::request(Opcode::Create);
        msg.filename = name.to_string();
        self.request(msg).await
    }

    /// Issues a redirect-group operation and returns the naming server's
    /// response (SsInfo on success).
    pub async fn redirect(&mut self, opcode: Opcode, name: &str) -> Message {
        let mut msg = Message::request(opcode);
        msg.filename = name.to_string();
        self.request(msg).await
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

/// Performs a one-shot data-plane operation against a redirect target.
pub async fn data_request(redirect: &Message, mut req: Message, username: &str) -> Message {
    assert_eq!(redirect.status, Status::SsInfo, "expected a redirect: {}", redirect.text());
    let addr = format!("{}:{}", redirect.ss_ip, redirect.ss_port);
    let mut socket = TcpStream::connect(&addr).await.expect("connect storage server");
    if req.username.is_empty() {
        req.username = username.to_string();
    }
    write_message(&mut socket, &req).await.expect("send data request");
    timeout(OP_TIMEOUT, read_message(&mut socket))
        .await
        .expect("data response timeout")
        .expect("data response")
}

/// Reads STREAM frames until the stop packet; returns the Data payloads.
pub async fn stream_collect(redirect: &Message, name: &str, username: &str) -> Vec<String> {
    assert_eq!(redirect.status, Status::SsInfo, "expected a redirect: {}", redirect.text());
    let addr = format!("{}:{}", redirect.ss_ip, redirect.ss_port);
    let mut socket = TcpStream::connect(&addr).await.expect("connect storage server");
    let mut req = Message::request(Opcode::Stream);
    req.filename = name.to_string();
    req.username = username.to_string();
    write_message(&mut socket, &req).await.expect("send stream request");

    let mut frames = Vec::new();
    loop {
        let frame = timeout(OP_TIMEOUT, read_message(&mut socket))
            .await
            .expect("stream frame timeout")
            .expect("stream frame");
        match frame.status {
            Status::Data => frames.push(frame.text()),
            Status::Success => {
                assert!(frame.data.is_empty(), "stop packet must carry no data");
                return frames;
            }
            other => panic!("unexpected stream status {other:?}: {}", frame.text()),
        }
    }
}

/// An open sentence-editing session on a storage server.
pub struct EditSession {
    socket: TcpStream,
    name: String,
    username: String,
}

impl EditSession {
    /// Requests the WRITE redirect and opens the session; returns the
    /// storage server's first response alongside the session.
    pub async fn open(
        client: &mut TestClient,
        name: &str,
        sentence: i64,
    ) -> (EditSession, Message) {
        let redirect = client.redirect(Opcode::Write, name).await;
        assert_eq!(redirect.status, Status::SsInfo, "expected a redirect: {}", redirect.text());
        let addr = format!("{}:{}", redirect.ss_ip, redirect.ss_port);
        let mut socket = TcpStream::connect(&addr).await.expect("connect storage server");
        let mut req = Message::request(Opcode::Write);
        req.filename = name.to_string();
        req.username = client.username().to_string();
        req.sentence_num = sentence;
        write_message(&mut socket, &req).await.expect("send write request");
        let first = timeout(OP_TIMEOUT, read_message(&mut socket))
            .await
            .expect("write ack timeout")
            .expect("write ack");
        (
            EditSession {
                socket,
                name: name.to_string(),
                username: client.username().to_string(),
            },
            first,
        )
    }

    /// Sends one word-insert update.
    pub async fn insert(&mut self, word_index: i64, text: &str) -> Message {
        let mut msg = Message::request(Opcode::Write);
        msg.filename = self.name.clone();
        msg.username = self.username.clone();
        msg.word_index = word_index;
        msg.set_text(text);
        write_message(&mut self.socket, &msg).await.expect("send word update");
        timeout(OP_TIMEOUT, read_message(&mut self.socket))
            .await
            .expect("update response timeout")
            .expect("update response")
    }

    /// Sends the commit marker and returns the commit response.
    pub async fn commit(&mut self) -> Message {
        self.insert(0, "ETIRW").await
    }
}

/// Seeds a file's bytes directly in the storage backend, for tests that
/// need known contents without running an editing session first.
pub async fn seed_file(state: &StorageState, name: &str, bytes: &[u8]) {
    state.store.replace(name, bytes).await.expect("seed file contents");
}
