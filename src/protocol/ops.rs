//! Operation codes, status codes and flag bits of the scribefs protocol.
//!
//! Every record carries an [`Opcode`] naming the requested operation and a
//! [`Status`] carrying the outcome. Both are 4-byte enums on the wire;
//! unknown values are rejected at decode time, which realizes the
//! malformed-record arm of the error taxonomy without any handler code.
//!
//! [`OpError`] is the crate-internal error currency: a wire status plus the
//! human-readable message that travels in the record's data field. Handlers
//! return `Result<_, OpError>` and a single serializer at the connection
//! boundary turns either arm into exactly one response record.

use std::fmt;

use num_derive::{FromPrimitive, ToPrimitive};

use crate::{DeserializeEnum, SerializeEnum};

/// Request types understood by the naming and storage servers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum Opcode {
    /// Storage server registration; the data field carries the packed
    /// registration payload and the connection becomes a control channel.
    RegisterSs = 0,
    /// Client login; at most one session per username.
    #[default]
    RegisterClient = 1,
    /// Create an empty file on a storage server.
    Create = 2,
    /// Read a file (data plane; the NS answers with a redirect).
    Read = 3,
    /// Open a sentence editing session (data plane).
    Write = 4,
    /// Delete a file everywhere.
    Delete = 5,
    /// List files visible to the requester.
    View = 6,
    /// File metadata, refreshed lazily from the home storage server.
    Info = 7,
    /// Word-paced streaming read (data plane).
    Stream = 8,
    /// List active sessions.
    ListUsers = 9,
    /// Grant a user access to an owned file.
    AddAccess = 10,
    /// Revoke a user's access to an owned file.
    RemAccess = 11,
    /// Run a stored file as a shell script on the naming host (config-gated).
    Exec = 12,
    /// Single-step undo of the last committed write (data plane).
    Undo = 13,
    /// Pattern search over visible file names.
    Search = 14,
    /// Create a folder in the namespace.
    CreateFolder = 15,
    /// Move a file into a folder.
    Move = 16,
    /// List the contents of one folder.
    ViewFolder = 17,
    /// Record a named checkpoint of a file's current bytes.
    Checkpoint = 18,
    /// Fetch the bytes of a checkpoint.
    ViewCheckpoint = 19,
    /// Overwrite a file with one of its checkpoints.
    Revert = 20,
    /// List a file's checkpoints.
    ListCheckpoints = 21,
    /// Ask a file's owner for access.
    RequestAccess = 22,
    /// List pending access requests on owned files.
    ViewRequests = 23,
    /// Approve or deny a pending access request.
    RespondRequest = 24,
    /// Control-plane liveness probe.
    Heartbeat = 25,
    /// Graceful shutdown of the receiving server.
    Shutdown = 26,
    /// Reserved for future content replication.
    Replicate = 27,
    /// List known storage servers and their liveness.
    ListSs = 28,
}
SerializeEnum!(Opcode);
DeserializeEnum!(Opcode);

/// Response and error codes.
///
/// The first four are non-error outcomes; everything after maps onto the
/// error taxonomy (protocol, authorisation, existence, conflict, range,
/// liveness, local I/O).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum Status {
    /// Operation succeeded. Also the stop packet terminating a stream.
    #[default]
    Success = 0,
    /// Redirect: the record's ss_ip/ss_port name the file's home server.
    SsInfo = 1,
    /// Intermediate stream frame carrying one token.
    Data = 2,
    /// Bare acknowledgement.
    Ack = 3,
    /// No such file.
    FileNotFound = 100,
    /// Caller lacks the required capability.
    PermissionDenied = 101,
    /// Sentence already locked; doubles as "user already logged in".
    FileLocked = 102,
    /// Name collision on create.
    FileExists = 103,
    /// Malformed or semantically invalid request.
    InvalidRequest = 104,
    /// Local I/O failure on a server.
    ServerError = 105,
    /// The file's home storage server is not routable.
    SsUnavailable = 106,
    /// Sentence index outside the current sentence list.
    SentenceOutOfRange = 107,
    /// Word index outside the current sentence.
    WordOutOfRange = 108,
    /// Destination folder unknown.
    FolderNotFound = 109,
    /// Folder already exists.
    FolderExists = 110,
    /// No checkpoint with the given tag.
    CheckpointNotFound = 111,
    /// No pending access requests to show.
    NoPendingRequests = 112,
    /// No access request with the given id.
    RequestNotFound = 113,
}
SerializeEnum!(Status);
DeserializeEnum!(Status);

impl Status {
    /// True for the non-error outcome codes.
    pub fn is_ok(self) -> bool {
        matches!(self, Status::Success | Status::SsInfo | Status::Data | Status::Ack)
    }
}

/// Flag bits carried in the record's `flags` field.
pub mod flags {
    /// Read capability in access grants and requests.
    pub const ACCESS_READ: u32 = 1 << 0;
    /// Write capability; granting write implies read.
    pub const ACCESS_WRITE: u32 = 1 << 1;
    /// VIEW modifier `-a`: include files the caller cannot access.
    pub const VIEW_ALL: u32 = 1 << 2;
    /// VIEW modifier `-l`: refresh size/word/char stats from the home SS.
    pub const VIEW_LONG: u32 = 1 << 3;
    /// RESPONDREQUEST: approve (set) or deny (clear).
    pub const APPROVE: u32 = 1 << 4;
}

/// A failed operation: wire status plus the message shown to the user.
///
/// Range errors additionally carry the current bound, surfaced to the
/// client in the response's word_index field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpError {
    pub status: Status,
    pub message: String,
    pub bound: Option<i64>,
}

impl OpError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self { status, message: message.into(), bound: None }
    }

    /// Attaches the current valid bound for range errors.
    pub fn with_bound(mut self, bound: i64) -> Self {
        self.bound = Some(bound);
        self
    }

    pub fn file_not_found(name: &str) -> Self {
        Self::new(Status::FileNotFound, format!("file '{name}' not found"))
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(Status::PermissionDenied, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(Status::InvalidRequest, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(Status::ServerError, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Status::SsUnavailable, message)
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.status, self.message)
    }
}

impl std::error::Error for OpError {}

impl From<std::io::Error> for OpError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => {
                Self::new(Status::FileNotFound, format!("{err}"))
            }
            _ => Self::new(Status::ServerError, format!("i/o error: {err}")),
        }
    }
}

/// Shorthand for handler results.
pub type OpResult<T> = Result<T, OpError>;
