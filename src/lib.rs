//! scribefs is a distributed document-editing file system in Rust.
//!
//! One naming server coordinates any number of storage servers over a
//! fixed-record TCP protocol; clients edit documents at sentence and word
//! granularity with exclusive sentence locks, atomic commits, and a
//! single-step undo.
//!
//! ## Main Components
//!
//! - `protocol`: the shared wire format, one fixed-size record per
//!   message, the opcode/status vocabulary, and the binary codec.
//!
//! - `naming`: the naming server. Metadata registry (files, folders,
//!   ACLs, checkpoints, access requests), session table, storage-server
//!   registry with one control worker per server, the request router,
//!   the heartbeat monitor, and the bounded search cache.
//!
//! - `storage`: the storage server. The on-disk document store, the
//!   control-command handler, the data-plane handlers (read, stream,
//!   undo), and the sentence editing state machine with its lock table
//!   and backup-based undo.
//!
//! - `config` / `net_util`: TOML configuration for both roles and the
//!   advertised-address discovery helper.
//!
//! ## Topology
//!
//! Clients hold one persistent session connection to the naming server;
//! data-bearing operations are redirected to the file's home storage
//! server and performed over short-lived direct connections. Each storage
//! server keeps one persistent control connection to the naming server,
//! carrying metadata commands and heartbeats with a single request in
//! flight at a time.

pub mod config;
pub mod naming;
pub mod net_util;
pub mod protocol;
pub mod storage;
