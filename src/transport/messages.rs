//! Wire messages for the TCP transport.
//!
//! Every RPC has a request variant carrying its typed body; responses carry
//! an error discriminator (the `Error` variant) and, for lock operations,
//! the manager's commit point. Messages are bincode-encoded and framed with
//! a `u32` big-endian length prefix. `Vnode` and `OpsLogEntry` fields pass
//! through their fixed wire codecs (see `types`), so interoperating nodes
//! agree on those layouts byte for byte.

use crate::error::{Result, TransportError};
use crate::types::{KvValue, OpsLogEntry, Vnode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Upper bound on a framed message, matching the server's read cap.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// A request addressed to a host (vnode listing) or to one of its vnodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    ListVnodes,
    Ping { target: Vnode },
    GetPredecessor { target: Vnode },
    GetPredecessorList { target: Vnode },
    Notify { target: Vnode, sender: Vnode },
    FindSuccessors { target: Vnode, n: u32, key: Vec<u8> },
    ClearPredecessor { target: Vnode, leaving: Vnode },
    SkipSuccessor { target: Vnode, leaving: Vnode },

    RLock {
        target: Vnode,
        key: String,
        sender_id: String,
        sender_addr: String,
    },
    WLock {
        target: Vnode,
        key: String,
        version: u32,
        timeout_secs: u32,
        sender_id: String,
    },
    CommitWLock {
        target: Vnode,
        key: String,
        version: u32,
        sender_id: String,
    },
    AbortWLock {
        target: Vnode,
        key: String,
        version: u32,
        sender_id: String,
    },
    InvalidateRLock { target: Vnode, lock_id: String },
    FetchOpsLog { target: Vnode },
    UpdateVersionMap {
        target: Vnode,
        version_map: HashMap<String, u32>,
    },

    Get { target: Vnode, key: String, version: u32 },
    Set {
        target: Vnode,
        key: String,
        version: u32,
        value: Vec<u8>,
    },
    List { target: Vnode },
    BulkSet {
        target: Vnode,
        key: String,
        values: Vec<KvValue>,
    },
    SyncKeys {
        target: Vnode,
        owner: Vnode,
        key: String,
        versions: Vec<u32>,
    },
    MissingKeys {
        target: Vnode,
        replica: Vnode,
        key: String,
        versions: Vec<u32>,
    },
    PurgeVersions {
        target: Vnode,
        key: String,
        max_version: u32,
    },

    JoinRing {
        target: Vnode,
        ring_id: String,
        joiner: Vnode,
    },
    LeaveRing { target: Vnode, ring_id: String },
}

impl Request {
    /// The vnode this request is addressed to, when there is one.
    pub fn target(&self) -> Option<&Vnode> {
        match self {
            Request::ListVnodes => None,
            Request::Ping { target }
            | Request::GetPredecessor { target }
            | Request::GetPredecessorList { target }
            | Request::Notify { target, .. }
            | Request::FindSuccessors { target, .. }
            | Request::ClearPredecessor { target, .. }
            | Request::SkipSuccessor { target, .. }
            | Request::RLock { target, .. }
            | Request::WLock { target, .. }
            | Request::CommitWLock { target, .. }
            | Request::AbortWLock { target, .. }
            | Request::InvalidateRLock { target, .. }
            | Request::FetchOpsLog { target }
            | Request::UpdateVersionMap { target, .. }
            | Request::Get { target, .. }
            | Request::Set { target, .. }
            | Request::List { target }
            | Request::BulkSet { target, .. }
            | Request::SyncKeys { target, .. }
            | Request::MissingKeys { target, .. }
            | Request::PurgeVersions { target, .. }
            | Request::JoinRing { target, .. }
            | Request::LeaveRing { target, .. } => Some(target),
        }
    }
}

/// Response bodies. `Error` is the error discriminator shared by every
/// request type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// The remote handler failed; carries its rendered error.
    Error { message: String },

    /// The target vnode is not registered on the remote host. Kept apart
    /// from `Error` so callers can recognize a routable-but-gone vnode.
    UnknownVnode { vnode: String },

    /// Plain acknowledgement.
    Ack,

    /// Liveness answer.
    Pong { alive: bool },

    /// A list of vnodes (successor lists, predecessor lists, members).
    Vnodes { vnodes: Vec<Vnode> },

    /// An optional vnode (predecessor queries).
    MaybeVnode { vnode: Option<Vnode> },

    /// Lock grant: id, version, timeout, commit point.
    Lock {
        lock_id: String,
        version: u32,
        timeout_secs: u32,
        commit_point: u64,
    },

    /// Commit/abort acknowledgement with the resulting commit point.
    CommitPoint { commit_point: u64 },

    /// A stored value.
    Value { value: Vec<u8> },

    /// A key listing.
    Keys { keys: Vec<String> },

    /// An op-log snapshot.
    OpsLog { entries: Vec<OpsLogEntry> },
}

/// Encode a message and prepend the `u32` big-endian length frame.
pub fn frame<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let data = bincode::serialize(msg)
        .map_err(|e| TransportError::Serialization(e.to_string()))?;
    if data.len() > MAX_MESSAGE_BYTES {
        return Err(TransportError::Serialization(format!(
            "message of {} bytes exceeds the {} byte frame cap",
            data.len(),
            MAX_MESSAGE_BYTES
        ))
        .into());
    }
    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&(data.len() as u32).to_be_bytes());
    framed.extend_from_slice(&data);
    Ok(framed)
}

/// Decode a message body (the frame header already consumed).
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| TransportError::Deserialization(e.to_string()).into())
}
