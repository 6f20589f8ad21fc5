//! Error types for the ring store.

use std::io;
use thiserror::Error;

/// Result type alias for ring store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the ring store.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport and network communication errors.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Lock manager errors.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Versioned store errors.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Every preceding node failed during routing.
    #[error("exhausted all preceding nodes")]
    RoutingExhausted,

    /// Asked for more successors than the ring maintains.
    #[error("cannot ask for more successors than num_successors ({max})")]
    TooManySuccessors { max: usize },

    /// The remote host reported no vnodes during a join.
    #[error("remote host {0} has no vnodes")]
    NoRemoteVnodes(String),

    /// All known successors are dead.
    #[error("all known successors dead")]
    AllSuccessorsDead,

    /// The local successor list is empty; stabilization is suspended.
    #[error("vnode has no successor")]
    NoSuccessor,

    /// Declared in the interface but not implemented.
    #[error("not implemented: {0}")]
    Unimplemented(&'static str),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Two merged errors from a compound operation (e.g. leave).
    #[error("{0}; {1}")]
    Merged(Box<Error>, Box<Error>),
}

impl Error {
    /// Merge two optional errors, keeping both when present.
    pub fn merge(a: Option<Error>, b: Option<Error>) -> Option<Error> {
        match (a, b) {
            (None, b) => b,
            (a, None) => a,
            (Some(a), Some(b)) => Some(Error::Merged(Box::new(a), Box::new(b))),
        }
    }
}

/// Transport and network communication errors.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Failed to send a message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Failed to receive a message.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The target vnode is not registered with this transport.
    #[error("unknown vnode: {0}")]
    UnknownVnode(String),

    /// The remote side reported an error.
    #[error("remote error: {0}")]
    Remote(String),

    /// No remote transport is configured for off-host calls.
    #[error("no remote transport configured")]
    NoRemote,
}

/// Lock manager errors.
#[derive(Error, Debug)]
pub enum LockError {
    /// RLock requested for a key with no committed version.
    #[error("read lock not possible: key {key:?} not present in lock manager")]
    NoCommittedVersion { key: String },

    /// A write lock already exists; carries the version being written.
    #[error("write lock not possible: key {key:?} is currently being updated at version {version}")]
    AlreadyLocked { key: String, version: u32 },

    /// Requested version is not newer than the committed version.
    #[error("committed version {committed} is higher than requested version for key {key:?}")]
    StaleVersion { key: String, committed: u32 },

    /// No write lock held for the key.
    #[error("lock not available for key {key:?}")]
    NotLocked { key: String },

    /// The lock is held at a different version than the one stated.
    #[error("requested version {requested} does not match locked version {locked} for key {key:?}")]
    VersionMismatch {
        key: String,
        locked: u32,
        requested: u32,
    },

    /// A replayed op-log record could not be applied.
    #[error("corrupt ops-log record at op {op_num}: {reason}")]
    CorruptLog { op_num: u64, reason: String },
}

/// Versioned store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The key is not present.
    #[error("key not found: {0:?}")]
    KeyNotFound(String),

    /// The key exists but not at the requested version.
    #[error("version {version} not found for key {key:?}")]
    VersionNotFound { key: String, version: u32 },

    /// No committed version exists for the key.
    #[error("no committed version for key {0:?}")]
    NoCommittedVersion(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_errors() {
        assert!(Error::merge(None, None).is_none());

        let only = Error::merge(Some(Error::RoutingExhausted), None).unwrap();
        assert!(matches!(only, Error::RoutingExhausted));

        let both = Error::merge(Some(Error::RoutingExhausted), Some(Error::NoSuccessor)).unwrap();
        let msg = both.to_string();
        assert!(msg.contains("exhausted all preceding nodes"));
        assert!(msg.contains("no successor"));
    }

    #[test]
    fn test_lock_error_display() {
        let e = LockError::StaleVersion {
            key: "a".to_string(),
            committed: 3,
        };
        assert!(e.to_string().contains("higher than requested"));
    }
}
