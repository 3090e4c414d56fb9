//! Binary codec for the scribefs wire format.
//!
//! Every message exchanged between clients, the naming server and the
//! storage servers is one fixed-layout record (see [`crate::protocol::message`]).
//! This module provides the serialization machinery underneath that record:
//!
//! - The [`Serialize`] and [`Deserialize`] traits implemented by every wire type
//! - Declarative macros for deriving the traits on structs and `#[repr(u32)]` enums
//! - Fixed-width, zero-padded string fields so records keep a constant size
//! - Length-prefixed variable fields for the registration payload
//! - Async helpers that read or write exactly one record per call
//!
//! All integers are big-endian on the wire. Variable-length fields are
//! padded to 4-byte alignment, so a packed payload can be re-parsed from
//! any offset that the writer produced.

use std::io::{Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Standard endianness for every integer field on the wire.
pub type WireEndian = byteorder::BigEndian;

/// Alignment unit for variable-length payload fields.
pub const ALIGNMENT: usize = 4;

/// Serializes a value into its wire representation.
pub trait Serialize {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()>;
}

/// Deserializes a value in place from its wire representation.
///
/// The in-place form keeps the macros below trivial: a struct is decoded by
/// default-constructing it and filling each field in declaration order.
pub trait Deserialize {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()>;
}

/// Decodes one value of type `T` from `src`.
pub fn deserialize<T: Default + Deserialize>(src: &mut impl Read) -> std::io::Result<T> {
    let mut value = T::default();
    value.deserialize(src)?;
    Ok(value)
}

/// Builds an `InvalidData` error with the given message.
pub fn invalid_data(m: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, m.into())
}

/// Implements [`Serialize`] for a struct by serializing each named field in order.
#[macro_export]
macro_rules! SerializeStruct {
    ($t:ident, $($element:ident),*) => {
        impl $crate::protocol::wire::Serialize for $t {
            fn serialize<W: ::std::io::Write>(&self, dest: &mut W) -> ::std::io::Result<()> {
                $($crate::protocol::wire::Serialize::serialize(&self.$element, dest)?;)*
                Ok(())
            }
        }
    };
}

/// Implements [`Deserialize`] for a struct by decoding each named field in order.
#[macro_export]
macro_rules! DeserializeStruct {
    ($t:ident, $($element:ident),*) => {
        impl $crate::protocol::wire::Deserialize for $t {
            fn deserialize<R: ::std::io::Read>(&mut self, src: &mut R) -> ::std::io::Result<()> {
                $($crate::protocol::wire::Deserialize::deserialize(&mut self.$element, src)?;)*
                Ok(())
            }
        }
    };
}

/// Implements [`Serialize`] for a `#[repr(u32)]` enum as a 4-byte integer.
#[macro_export]
macro_rules! SerializeEnum {
    ($t:ident) => {
        impl $crate::protocol::wire::Serialize for $t {
            fn serialize<W: ::std::io::Write>(&self, dest: &mut W) -> ::std::io::Result<()> {
                use byteorder::WriteBytesExt;
                dest.write_u32::<$crate::protocol::wire::WireEndian>(*self as u32)
            }
        }
    };
}

/// Implements [`Deserialize`] for a `#[repr(u32)]` enum, rejecting unknown values.
#[macro_export]
macro_rules! DeserializeEnum {
    ($t:ident) => {
        impl $crate::protocol::wire::Deserialize for $t {
            fn deserialize<R: ::std::io::Read>(&mut self, src: &mut R) -> ::std::io::Result<()> {
                use byteorder::ReadBytesExt;
                use num_traits::cast::FromPrimitive;
                let raw: u32 = src.read_u32::<$crate::protocol::wire::WireEndian>()?;
                match FromPrimitive::from_u32(raw) {
                    Some(v) => {
                        *self = v;
                        Ok(())
                    }
                    None => Err($crate::protocol::wire::invalid_data(format!(
                        "invalid value {} for {}",
                        raw,
                        stringify!($t)
                    ))),
                }
            }
        }
    };
}

impl Serialize for u32 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_u32::<WireEndian>(*self)
    }
}

impl Deserialize for u32 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = src.read_u32::<WireEndian>()?;
        Ok(())
    }
}

impl Serialize for u64 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_u64::<WireEndian>(*self)
    }
}

impl Deserialize for u64 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = src.read_u64::<WireEndian>()?;
        Ok(())
    }
}

impl Serialize for i64 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_i64::<WireEndian>(*self)
    }
}

impl Deserialize for i64 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = src.read_i64::<WireEndian>()?;
        Ok(())
    }
}

/// Variable-length bytes: a 4-byte length prefix, the bytes, then zero
/// padding up to 4-byte alignment.
impl Serialize for Vec<u8> {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        if self.len() >= u32::MAX as usize {
            return Err(invalid_data("byte field too long"));
        }
        let length = self.len() as u32;
        length.serialize(dest)?;
        dest.write_all(self)?;
        write_padding(self.len(), dest)
    }
}

impl Deserialize for Vec<u8> {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let mut length: u32 = 0;
        length.deserialize(src)?;
        self.resize(length as usize, 0);
        src.read_exact(self)?;
        read_padding(length as usize, src)
    }
}

/// Variable-length UTF-8 string, encoded like `Vec<u8>`.
impl Serialize for String {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        if self.len() >= u32::MAX as usize {
            return Err(invalid_data("string field too long"));
        }
        let length = self.len() as u32;
        length.serialize(dest)?;
        dest.write_all(self.as_bytes())?;
        write_padding(self.len(), dest)
    }
}

impl Deserialize for String {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let mut raw: Vec<u8> = Vec::new();
        raw.deserialize(src)?;
        *self =
            String::from_utf8(raw).map_err(|_| invalid_data("string field is not valid UTF-8"))?;
        Ok(())
    }
}

/// String list: a 4-byte count followed by each string.
impl Serialize for Vec<String> {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        if self.len() >= u32::MAX as usize {
            return Err(invalid_data("list field too long"));
        }
        (self.len() as u32).serialize(dest)?;
        for item in self {
            item.serialize(dest)?;
        }
        Ok(())
    }
}

impl Deserialize for Vec<String> {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let mut length: u32 = 0;
        length.deserialize(src)?;
        self.clear();
        for _ in 0..length {
            self.push(deserialize::<String>(src)?);
        }
        Ok(())
    }
}

/// Writes zero padding after a variable field of `len` bytes.
pub fn write_padding(len: usize, dest: &mut impl Write) -> std::io::Result<()> {
    let padding = [0_u8; ALIGNMENT];
    dest.write_all(&padding[..(ALIGNMENT - len % ALIGNMENT) % ALIGNMENT])
}

/// Consumes the zero padding after a variable field of `len` bytes.
pub fn read_padding(len: usize, src: &mut impl Read) -> std::io::Result<()> {
    let mut padding = [0_u8; ALIGNMENT];
    src.read_exact(&mut padding[..(ALIGNMENT - len % ALIGNMENT) % ALIGNMENT])
}

/// Writes `s` into a fixed field of `width` bytes, zero padded.
///
/// Overlong values are a caller bug at the protocol boundary, reported as
/// `InvalidData` rather than silently truncated.
pub fn write_fixed_str(s: &str, width: usize, dest: &mut impl Write) -> std::io::Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() > width {
        return Err(invalid_data(format!("field of {} bytes exceeds width {}", bytes.len(), width)));
    }
    dest.write_all(bytes)?;
    let mut remaining = width - bytes.len();
    let zeros = [0_u8; 64];
    while remaining > 0 {
        let chunk = remaining.min(zeros.len());
        dest.write_all(&zeros[..chunk])?;
        remaining -= chunk;
    }
    Ok(())
}

/// Reads a fixed field of `width` bytes and strips the zero padding.
pub fn read_fixed_str(width: usize, src: &mut impl Read) -> std::io::Result<String> {
    let mut buf = vec![0_u8; width];
    src.read_exact(&mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(width);
    buf.truncate(end);
    String::from_utf8(buf).map_err(|_| invalid_data("fixed field is not valid UTF-8"))
}

/// Reads exactly one wire record of `size` bytes and decodes it.
///
/// The fixed record size is what lets every reader in the system perform a
/// single full read per message; partial reads are absorbed by `read_exact`.
pub async fn read_record<T, R>(src: &mut R, size: usize) -> std::io::Result<T>
where
    T: Default + Deserialize,
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0_u8; size];
    src.read_exact(&mut buf).await?;
    deserialize::<T>(&mut std::io::Cursor::new(buf))
}

/// Encodes one wire record and writes it fully.
pub async fn write_record<T, W>(dest: &mut W, size: usize, value: &T) -> std::io::Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(size);
    value.serialize(&mut buf)?;
    if buf.len() != size {
        return Err(invalid_data(format!("encoded record is {} bytes, expected {}", buf.len(), size)));
    }
    dest.write_all(&buf).await?;
    dest.flush().await
}
