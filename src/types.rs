//! Core types shared across the ring: vnode handles, versioned values, and
//! the lock manager's operation log.
//!
//! `Vnode` and `OpsLogEntry` carry hand-written wire codecs because
//! interoperating nodes must agree on their byte layout exactly (a 20-byte
//! id followed by a length-prefixed host string; a fixed-layout log record).
//! The codecs feed the serde impls, so the same bytes flow through the
//! bincode envelope used by the TCP transport.

use crate::error::{Result, TransportError};
use bytes::{Buf, BufMut, BytesMut};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Size of a vnode identifier on the wire, in bytes (160-bit hash).
pub const ID_BYTES: usize = 20;

/// Largest sane wire string, shared by the codecs below.
const MAX_WIRE_STRING: usize = 64 * 1024;

/// A vnode handle, local or remote. Immutable after creation; ordered and
/// compared by id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Vnode {
    /// Virtual node identifier: big-endian hash bytes.
    pub id: Vec<u8>,
    /// Host identifier, `host:port` for TCP rings.
    pub host: String,
}

impl Vnode {
    pub fn new(id: Vec<u8>, host: impl Into<String>) -> Self {
        Self {
            id,
            host: host.into(),
        }
    }

    /// Encode as `{20-byte id, u32 BE host length, host bytes}`.
    pub fn encode_to(&self, buf: &mut BytesMut) -> Result<()> {
        if self.id.len() != ID_BYTES {
            return Err(TransportError::Serialization(format!(
                "vnode id must be {} bytes on the wire, got {}",
                ID_BYTES,
                self.id.len()
            ))
            .into());
        }
        buf.reserve(ID_BYTES + 4 + self.host.len());
        buf.put_slice(&self.id);
        buf.put_u32(self.host.len() as u32);
        buf.put_slice(self.host.as_bytes());
        Ok(())
    }

    /// Decode the layout produced by [`Vnode::encode_to`].
    pub fn decode_from(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < ID_BYTES + 4 {
            return Err(short_buffer("vnode"));
        }
        let mut id = vec![0u8; ID_BYTES];
        buf.copy_to_slice(&mut id);
        let host_len = buf.get_u32() as usize;
        if host_len > MAX_WIRE_STRING || buf.remaining() < host_len {
            return Err(short_buffer("vnode host"));
        }
        let mut host = vec![0u8; host_len];
        buf.copy_to_slice(&mut host);
        let host = String::from_utf8(host)
            .map_err(|e| TransportError::Deserialization(format!("vnode host: {e}")))?;
        Ok(Self { id, host })
    }
}

impl fmt::Display for Vnode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.id {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Serialize for Vnode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut buf = BytesMut::new();
        self.encode_to(&mut buf)
            .map_err(|e| serde::ser::Error::custom(e.to_string()))?;
        serializer.serialize_bytes(&buf)
    }
}

impl<'de> Deserialize<'de> for Vnode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct VnodeVisitor;

        impl<'de> Visitor<'de> for VnodeVisitor {
            type Value = Vnode;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("wire-encoded vnode bytes")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Vnode, E> {
                let mut buf = v;
                Vnode::decode_from(&mut buf).map_err(|e| E::custom(e.to_string()))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Vnode, A::Error> {
                let mut bytes = Vec::new();
                while let Some(b) = seq.next_element::<u8>()? {
                    bytes.push(b);
                }
                self.visit_bytes(&bytes)
            }
        }

        deserializer.deserialize_byte_buf(VnodeVisitor)
    }
}

/// A single version of a stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvValue {
    pub version: u32,
    pub value: Vec<u8>,
    pub committed: bool,
}

impl KvValue {
    pub fn uncommitted(version: u32, value: Vec<u8>) -> Self {
        Self {
            version,
            value,
            committed: false,
        }
    }
}

/// Operation kind recorded in the lock manager's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOp {
    Write,
    Commit,
    Abort,
    Invalidate,
}

impl LockOp {
    fn tag(self) -> u8 {
        match self {
            LockOp::Write => 0,
            LockOp::Commit => 1,
            LockOp::Abort => 2,
            LockOp::Invalidate => 3,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(LockOp::Write),
            1 => Some(LockOp::Commit),
            2 => Some(LockOp::Abort),
            3 => Some(LockOp::Invalidate),
            _ => None,
        }
    }
}

impl fmt::Display for LockOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockOp::Write => "WRITE",
            LockOp::Commit => "COMMIT",
            LockOp::Abort => "ABORT",
            LockOp::Invalidate => "INVALIDATE",
        };
        f.write_str(s)
    }
}

/// One record of the lock manager's append-only operation log.
///
/// `op_num` is strictly monotonic within a single lock manager term. The
/// `timeout` is an absolute unix-epoch deadline in nanoseconds, present only
/// for WRITE records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpsLogEntry {
    pub op_num: u64,
    pub op: LockOp,
    pub key: String,
    pub version: u32,
    pub timeout: Option<i64>,
}

impl OpsLogEntry {
    /// Encode as `{u64 BE op_num, u8 tag, u32 BE key length, key bytes,
    /// u32 BE version, u8 presence, i64 BE unix-nano timeout}`.
    pub fn encode_to(&self, buf: &mut BytesMut) {
        buf.reserve(8 + 1 + 4 + self.key.len() + 4 + 1 + 8);
        buf.put_u64(self.op_num);
        buf.put_u8(self.op.tag());
        buf.put_u32(self.key.len() as u32);
        buf.put_slice(self.key.as_bytes());
        buf.put_u32(self.version);
        match self.timeout {
            Some(nanos) => {
                buf.put_u8(1);
                buf.put_i64(nanos);
            }
            None => buf.put_u8(0),
        }
    }

    /// Decode the layout produced by [`OpsLogEntry::encode_to`].
    pub fn decode_from(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 8 + 1 + 4 {
            return Err(short_buffer("ops-log entry"));
        }
        let op_num = buf.get_u64();
        let tag = buf.get_u8();
        let op = LockOp::from_tag(tag).ok_or_else(|| {
            TransportError::Deserialization(format!("ops-log entry: unknown op tag {tag}"))
        })?;
        let key_len = buf.get_u32() as usize;
        if key_len > MAX_WIRE_STRING || buf.remaining() < key_len + 4 + 1 {
            return Err(short_buffer("ops-log key"));
        }
        let mut key = vec![0u8; key_len];
        buf.copy_to_slice(&mut key);
        let key = String::from_utf8(key)
            .map_err(|e| TransportError::Deserialization(format!("ops-log key: {e}")))?;
        let version = buf.get_u32();
        let timeout = match buf.get_u8() {
            0 => None,
            1 => {
                if buf.remaining() < 8 {
                    return Err(short_buffer("ops-log timeout"));
                }
                Some(buf.get_i64())
            }
            other => {
                return Err(TransportError::Deserialization(format!(
                    "ops-log entry: bad timeout presence byte {other}"
                ))
                .into())
            }
        };
        Ok(Self {
            op_num,
            op,
            key,
            version,
            timeout,
        })
    }
}

impl Serialize for OpsLogEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut buf = BytesMut::new();
        self.encode_to(&mut buf);
        serializer.serialize_bytes(&buf)
    }
}

impl<'de> Deserialize<'de> for OpsLogEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct EntryVisitor;

        impl<'de> Visitor<'de> for EntryVisitor {
            type Value = OpsLogEntry;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("wire-encoded ops-log entry bytes")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<OpsLogEntry, E> {
                let mut buf = v;
                OpsLogEntry::decode_from(&mut buf).map_err(|e| E::custom(e.to_string()))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<OpsLogEntry, A::Error> {
                let mut bytes = Vec::new();
                while let Some(b) = seq.next_element::<u8>()? {
                    bytes.push(b);
                }
                self.visit_bytes(&bytes)
            }
        }

        deserializer.deserialize_byte_buf(EntryVisitor)
    }
}

fn short_buffer(what: &str) -> crate::error::Error {
    TransportError::Deserialization(format!("truncated buffer while decoding {what}")).into()
}
