//! The fixed-layout wire record exchanged on every scribefs connection.
//!
//! Control plane (client to NS, NS to SS) and data plane (client to SS)
//! share one record shape in both directions. The record has a constant
//! encoded size ([`RECORD_SIZE`]) so every peer performs exactly one full
//! read per message; string fields are fixed-width and zero padded, the
//! data field is a bounded payload with an explicit length.
//!
//! Requests elicit exactly one response record, with one exception: STREAM
//! produces any number of [`Status::Data`] frames followed by a
//! [`Status::Success`] stop packet with empty data.

use std::io::{Read, Write};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::ops::{OpError, Opcode, Status};
use crate::protocol::wire::{
    self, deserialize, invalid_data, read_fixed_str, write_fixed_str, Deserialize, Serialize,
};
use crate::{DeserializeStruct, SerializeStruct};

/// Width of the username field in bytes.
pub const USERNAME_WIDTH: usize = 64;
/// Width of the filename field in bytes.
pub const FILENAME_WIDTH: usize = 256;
/// Width of the folder field in bytes.
pub const FOLDER_WIDTH: usize = 256;
/// Width of the checkpoint tag field in bytes.
pub const TAG_WIDTH: usize = 64;
/// Width of the redirect IP field in bytes.
pub const SS_IP_WIDTH: usize = 48;
/// Capacity of the data payload in bytes.
pub const DATA_CAP: usize = 4096;

/// Encoded size of one record:
/// opcode + status + flags (3 x u32), the five fixed string fields,
/// sentence_num + word_index (2 x i64), request_id (u64), ss_port (u32),
/// data_length (u32) and the data buffer.
pub const RECORD_SIZE: usize = 3 * 4
    + USERNAME_WIDTH
    + FILENAME_WIDTH
    + FOLDER_WIDTH
    + TAG_WIDTH
    + 2 * 8
    + 8
    + SS_IP_WIDTH
    + 4
    + 4
    + DATA_CAP;

/// One protocol record.
///
/// Unused fields stay at their defaults; the opcode determines which fields
/// a receiver consults. Responses echo the request's opcode.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    /// Requested operation; echoed back on responses.
    pub opcode: Opcode,
    /// Outcome code; meaningful on responses only.
    pub status: Status,
    /// Operation-specific flag bits (see [`crate::protocol::ops::flags`]).
    pub flags: u32,
    /// Requesting user, or the target user for access operations.
    pub username: String,
    /// Target file or folder name.
    pub filename: String,
    /// Destination folder for MOVE / VIEWFOLDER.
    pub folder: String,
    /// Checkpoint tag for checkpoint operations.
    pub checkpoint_tag: String,
    /// 0-based sentence index for WRITE.
    pub sentence_num: i64,
    /// Word insertion index; on range errors, carries the current bound.
    pub word_index: i64,
    /// Access-request id for RESPONDREQUEST.
    pub request_id: u64,
    /// Redirect target address for data-plane operations.
    pub ss_ip: String,
    /// Redirect target port.
    pub ss_port: u32,
    /// Opaque payload: UTF-8 text or a packed registration record.
    pub data: Vec<u8>,
}

impl Serialize for Message {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        if self.data.len() > DATA_CAP {
            return Err(invalid_data(format!(
                "data payload of {} bytes exceeds capacity {}",
                self.data.len(),
                DATA_CAP
            )));
        }
        self.opcode.serialize(dest)?;
        self.status.serialize(dest)?;
        self.flags.serialize(dest)?;
        write_fixed_str(&self.username, USERNAME_WIDTH, dest)?;
        write_fixed_str(&self.filename, FILENAME_WIDTH, dest)?;
        write_fixed_str(&self.folder, FOLDER_WIDTH, dest)?;
        write_fixed_str(&self.checkpoint_tag, TAG_WIDTH, dest)?;
        self.sentence_num.serialize(dest)?;
        self.word_index.serialize(dest)?;
        self.request_id.serialize(dest)?;
        write_fixed_str(&self.ss_ip, SS_IP_WIDTH, dest)?;
        self.ss_port.serialize(dest)?;
        (self.data.len() as u32).serialize(dest)?;
        dest.write_all(&self.data)?;
        let zeros = [0_u8; 64];
        let mut remaining = DATA_CAP - self.data.len();
        while remaining > 0 {
            let chunk = remaining.min(zeros.len());
            dest.write_all(&zeros[..chunk])?;
            remaining -= chunk;
        }
        Ok(())
    }
}

impl Deserialize for Message {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        self.opcode.deserialize(src)?;
        self.status.deserialize(src)?;
        self.flags.deserialize(src)?;
        self.username = read_fixed_str(USERNAME_WIDTH, src)?;
        self.filename = read_fixed_str(FILENAME_WIDTH, src)?;
        self.folder = read_fixed_str(FOLDER_WIDTH, src)?;
        self.checkpoint_tag = read_fixed_str(TAG_WIDTH, src)?;
        self.sentence_num.deserialize(src)?;
        self.word_index.deserialize(src)?;
        self.request_id.deserialize(src)?;
        self.ss_ip = read_fixed_str(SS_IP_WIDTH, src)?;
        self.ss_port.deserialize(src)?;
        let mut data_length: u32 = 0;
        data_length.deserialize(src)?;
        let mut buf = vec![0_u8; DATA_CAP];
        src.read_exact(&mut buf)?;
        if data_length as usize > DATA_CAP {
            return Err(invalid_data("data length exceeds capacity"));
        }
        buf.truncate(data_length as usize);
        self.data = buf;
        Ok(())
    }
}

impl Message {
    /// Builds a request with the given opcode; other fields default.
    pub fn request(opcode: Opcode) -> Self {
        Message { opcode, ..Default::default() }
    }

    /// Builds a response echoing the request's opcode and principal fields.
    pub fn reply(req: &Message, status: Status) -> Self {
        Message {
            opcode: req.opcode,
            status,
            username: req.username.clone(),
            filename: req.filename.clone(),
            ..Default::default()
        }
    }

    /// Success response to `req` carrying a text payload.
    pub fn ok(req: &Message, text: impl AsRef<str>) -> Self {
        let mut msg = Self::reply(req, Status::Success);
        msg.set_text(text.as_ref());
        msg
    }

    /// Error response to `req`; the message travels in the data field and
    /// a range error's bound in word_index.
    pub fn error(req: &Message, err: &OpError) -> Self {
        let mut msg = Self::reply(req, err.status);
        msg.set_text(&err.message);
        if let Some(bound) = err.bound {
            msg.word_index = bound;
        }
        msg
    }

    /// Stores a text payload, truncated at the data capacity on a char
    /// boundary.
    pub fn set_text(&mut self, text: &str) {
        let mut end = text.len().min(DATA_CAP);
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        self.data = text.as_bytes()[..end].to_vec();
    }

    /// Stores a byte payload, truncated at the data capacity.
    pub fn set_data(&mut self, bytes: &[u8]) {
        let end = bytes.len().min(DATA_CAP);
        self.data = bytes[..end].to_vec();
    }

    /// The data payload decoded as text (lossy).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Payload of a REGISTER_SS record: the server's identity, the address
/// and ports it advertises, and the files found under its storage root.
/// An empty address lets the naming server fall back to the connection's
/// peer address.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SsRegistration {
    pub ss_id: String,
    pub advertise_ip: String,
    pub client_port: u32,
    pub control_port: u32,
    pub files: Vec<String>,
}
SerializeStruct!(SsRegistration, ss_id, advertise_ip, client_port, control_port, files);
DeserializeStruct!(SsRegistration, ss_id, advertise_ip, client_port, control_port, files);

impl SsRegistration {
    /// Encodes the registration for the data field.
    ///
    /// The payload must fit the record's data capacity; callers advertise
    /// fewer files rather than exceed it.
    pub fn pack(&self) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.serialize(&mut buf)?;
        if buf.len() > DATA_CAP {
            return Err(invalid_data(format!(
                "registration payload of {} bytes exceeds data capacity",
                buf.len()
            )));
        }
        Ok(buf)
    }

    /// Decodes a registration from a record's data field.
    pub fn unpack(data: &[u8]) -> std::io::Result<Self> {
        deserialize::<SsRegistration>(&mut std::io::Cursor::new(data))
    }
}

/// Reads exactly one record from the stream.
pub async fn read_message<R: AsyncRead + Unpin>(src: &mut R) -> std::io::Result<Message> {
    wire::read_record::<Message, R>(src, RECORD_SIZE).await
}

/// Writes exactly one record to the stream.
pub async fn write_message<W: AsyncWrite + Unpin>(
    dest: &mut W,
    msg: &Message,
) -> std::io::Result<()> {
    wire::write_record(dest, RECORD_SIZE, msg).await
}
