//! The storage-server registry and the per-server control channel.
//!
//! Registration parks the storage server's socket with a dedicated worker
//! task that owns it outright. Callers (the request router and the
//! heartbeat monitor alike) submit a command through an in-process queue
//! and await a reply handle. Because the protocol carries no correlation
//! ids, one-request-in-flight per storage server is a hard invariant; the
//! single worker consuming a FIFO queue is what enforces it.
//!
//! A failed server keeps its record (its files stay known, just
//! unreachable); re-registration reuses the record, replaces the worker,
//! and clears the failure flags.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::protocol::message::{read_message, write_message, Message};
use crate::protocol::ops::{OpError, OpResult};

/// Address clients should dial for data-plane operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SsEndpoint {
    pub ip: String,
    pub client_port: u16,
}

/// Point-in-time view of one record, for LIST_SS and the monitor.
#[derive(Clone, Debug)]
pub struct SsStatus {
    pub id: String,
    pub ip: String,
    pub client_port: u16,
    pub control_port: u16,
    pub active: bool,
    pub failed: bool,
    pub last_heartbeat: Instant,
}

struct SsRecord {
    ip: String,
    client_port: u16,
    control_port: u16,
    active: bool,
    failed: bool,
    last_heartbeat: Instant,
    /// Registration order; the highest active one is the USE default.
    registered_seq: u64,
    handle: Option<ControlHandle>,
}

struct ControlJob {
    msg: Message,
    reply: oneshot::Sender<std::io::Result<Message>>,
}

/// Handle to the worker task owning one control socket.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<ControlJob>,
}

impl ControlHandle {
    /// Spawns the worker for a freshly registered control socket.
    fn spawn(ss_id: String, mut socket: TcpStream) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ControlJob>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = async {
                    write_message(&mut socket, &job.msg).await?;
                    read_message(&mut socket).await
                }
                .await;
                let broken = result.is_err();
                let _ = job.reply.send(result);
                if broken {
                    break;
                }
            }
            debug!("control worker for '{}' finished", ss_id);
        });
        Self { tx }
    }

    /// One request/response round trip over the control socket. Jobs are
    /// processed strictly in submission order.
    pub async fn call(&self, msg: Message) -> std::io::Result<Message> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ControlJob { msg, reply: reply_tx })
            .map_err(|_| broken_channel())?;
        reply_rx.await.map_err(|_| broken_channel())?
    }
}

fn broken_channel() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "control channel closed")
}

#[derive(Default)]
pub struct StoragePool {
    records: Mutex<HashMap<String, SsRecord>>,
    seq: AtomicU64,
}

impl StoragePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single entry point for first registration and re-registration
    /// after a crash: activates the record, clears failure state, stamps
    /// the heartbeat, and takes ownership of the control socket.
    pub fn register_or_rebind(
        &self,
        ss_id: &str,
        ip: String,
        client_port: u16,
        control_port: u16,
        socket: TcpStream,
    ) {
        let handle = ControlHandle::spawn(ss_id.to_string(), socket);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.lock().expect("ss table poisoned");
        let record = records.entry(ss_id.to_string()).or_insert_with(|| SsRecord {
            ip: ip.clone(),
            client_port,
            control_port,
            active: false,
            failed: false,
            last_heartbeat: Instant::now(),
            registered_seq: seq,
            handle: None,
        });
        record.ip = ip;
        record.client_port = client_port;
        record.control_port = control_port;
        record.active = true;
        record.failed = false;
        record.last_heartbeat = Instant::now();
        record.registered_seq = seq;
        record.handle = Some(handle);
    }

    /// Data-plane endpoint of a routable server.
    pub fn endpoint(&self, ss_id: &str) -> OpResult<SsEndpoint> {
        let records = self.records.lock().expect("ss table poisoned");
        let record = records
            .get(ss_id)
            .ok_or_else(|| OpError::unavailable(format!("unknown storage server '{ss_id}'")))?;
        if !record.active || record.failed {
            return Err(OpError::unavailable(format!("storage server '{ss_id}' is unavailable")));
        }
        Ok(SsEndpoint { ip: record.ip.clone(), client_port: record.client_port })
    }

    /// The USE default: the most recently registered routable server.
    pub fn pick_default(&self) -> Option<String> {
        let records = self.records.lock().expect("ss table poisoned");
        records
            .iter()
            .filter(|(_, r)| r.active && !r.failed)
            .max_by_key(|(_, r)| r.registered_seq)
            .map(|(id, _)| id.clone())
    }

    /// Marks a server failed without touching its socket; the next send
    /// will surface the failure.
    pub fn mark_failed(&self, ss_id: &str) {
        let mut records = self.records.lock().expect("ss table poisoned");
        if let Some(record) = records.get_mut(ss_id) {
            record.failed = true;
            record.active = false;
        }
    }

    /// Marks a server failed and drops its control worker.
    pub fn mark_failed_and_close(&self, ss_id: &str) {
        let mut records = self.records.lock().expect("ss table poisoned");
        if let Some(record) = records.get_mut(ss_id) {
            record.failed = true;
            record.active = false;
            record.handle = None;
        }
    }

    /// Records a successful heartbeat; returns true when this revived a
    /// previously failed server.
    pub fn heartbeat_ok(&self, ss_id: &str) -> bool {
        let mut records = self.records.lock().expect("ss table poisoned");
        match records.get_mut(ss_id) {
            Some(record) => {
                record.last_heartbeat = Instant::now();
                let recovered = record.failed;
                record.failed = false;
                record.active = true;
                recovered
            }
            None => false,
        }
    }

    /// Control handle of a routable server.
    fn handle(&self, ss_id: &str) -> OpResult<ControlHandle> {
        let records = self.records.lock().expect("ss table poisoned");
        let record = records
            .get(ss_id)
            .ok_or_else(|| OpError::unavailable(format!("unknown storage server '{ss_id}'")))?;
        if record.failed {
            return Err(OpError::unavailable(format!("storage server '{ss_id}' is unavailable")));
        }
        record
            .handle
            .clone()
            .ok_or_else(|| OpError::unavailable(format!("no control channel to '{ss_id}'")))
    }

    /// Sends one control command and awaits its reply. A transport
    /// failure closes the channel and marks the server failed.
    pub async fn send_control(&self, ss_id: &str, msg: Message) -> OpResult<Message> {
        let handle = self.handle(ss_id)?;
        match handle.call(msg).await {
            Ok(reply) => Ok(reply),
            Err(err) => {
                warn!("control channel to '{}' broke: {}", ss_id, err);
                self.mark_failed_and_close(ss_id);
                Err(OpError::unavailable(format!("storage server '{ss_id}' is unreachable")))
            }
        }
    }

    /// Snapshot of every record for LIST_SS and the heartbeat monitor.
    pub fn snapshot(&self) -> Vec<SsStatus> {
        let records = self.records.lock().expect("ss table poisoned");
        let mut statuses: Vec<SsStatus> = records
            .iter()
            .map(|(id, r)| SsStatus {
                id: id.clone(),
                ip: r.ip.clone(),
                client_port: r.client_port,
                control_port: r.control_port,
                active: r.active,
                failed: r.failed,
                last_heartbeat: r.last_heartbeat,
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Probe targets for the monitor: id, handle (when a channel is
    /// open), heartbeat age, and failure flag.
    pub fn probe_targets(&self) -> Vec<(String, Option<ControlHandle>, std::time::Duration, bool)> {
        let records = self.records.lock().expect("ss table poisoned");
        records
            .iter()
            .map(|(id, r)| {
                (id.clone(), r.handle.clone(), r.last_heartbeat.elapsed(), r.failed)
            })
            .collect()
    }
}
