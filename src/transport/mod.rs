//! Transport abstraction.
//!
//! The ring core consumes the [`Transport`] trait for every remote
//! interaction and exposes the [`VnodeRpc`] trait for every operation a
//! peer may invoke on a local vnode. Keeping both as trait objects lets the
//! loopback, TCP, and test-harness transports interchange freely.

pub mod local;
pub mod messages;
pub mod tcp;

pub use local::LocalTransport;
pub use tcp::TcpTransport;

use crate::error::Result;
use crate::types::{KvValue, OpsLogEntry, Vnode};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// RPC surface the ring consumes. One method per wire operation; targets
/// are vnode handles except for host-level vnode listing.
#[async_trait]
pub trait Transport: Send + Sync {
    // Routing.
    async fn list_vnodes(&self, host: &str) -> Result<Vec<Vnode>>;
    async fn ping(&self, target: &Vnode) -> Result<bool>;
    async fn get_predecessor(&self, target: &Vnode) -> Result<Option<Vnode>>;
    async fn get_predecessor_list(&self, target: &Vnode) -> Result<Vec<Vnode>>;
    /// Notify `target` of a purported predecessor; returns the target's
    /// successor list.
    async fn notify(&self, target: &Vnode, sender: &Vnode) -> Result<Vec<Vnode>>;
    async fn find_successors(&self, target: &Vnode, n: usize, key: &[u8]) -> Result<Vec<Vnode>>;
    async fn clear_predecessor(&self, target: &Vnode, leaving: &Vnode) -> Result<()>;
    async fn skip_successor(&self, target: &Vnode, leaving: &Vnode) -> Result<()>;

    // Locks. Lock responses carry the manager's commit point.
    async fn rlock(
        &self,
        target: &Vnode,
        key: &str,
        sender_id: &str,
        sender_addr: &str,
    ) -> Result<(String, u32, u64)>;
    async fn wlock(
        &self,
        target: &Vnode,
        key: &str,
        version: u32,
        timeout_secs: u32,
        sender_id: &str,
    ) -> Result<(String, u32, u32, u64)>;
    async fn commit_wlock(
        &self,
        target: &Vnode,
        key: &str,
        version: u32,
        sender_id: &str,
    ) -> Result<u64>;
    async fn abort_wlock(
        &self,
        target: &Vnode,
        key: &str,
        version: u32,
        sender_id: &str,
    ) -> Result<u64>;
    async fn invalidate_rlock(&self, target: &Vnode, lock_id: &str) -> Result<()>;
    /// Fetch the target manager's op-log for handover replay.
    async fn fetch_ops_log(&self, target: &Vnode) -> Result<Vec<OpsLogEntry>>;
    /// Ship a version map to the target (the newly authoritative manager).
    async fn update_version_map(
        &self,
        target: &Vnode,
        version_map: HashMap<String, u32>,
    ) -> Result<()>;

    // Storage.
    async fn get(&self, target: &Vnode, key: &str, version: u32) -> Result<Vec<u8>>;
    async fn set(&self, target: &Vnode, key: &str, version: u32, value: Vec<u8>) -> Result<()>;
    async fn list(&self, target: &Vnode) -> Result<Vec<String>>;
    async fn bulk_set(&self, target: &Vnode, key: &str, values: Vec<KvValue>) -> Result<()>;
    async fn sync_keys(
        &self,
        target: &Vnode,
        owner: &Vnode,
        key: &str,
        versions: Vec<u32>,
    ) -> Result<()>;
    async fn missing_keys(
        &self,
        target: &Vnode,
        replica: &Vnode,
        key: &str,
        versions: Vec<u32>,
    ) -> Result<()>;
    async fn purge_versions(&self, target: &Vnode, key: &str, max_version: u32) -> Result<()>;

    // Tracker.
    async fn join_ring(&self, target: &Vnode, ring_id: &str, joiner: &Vnode) -> Result<Vec<Vnode>>;
    async fn leave_ring(&self, target: &Vnode, ring_id: &str) -> Result<()>;

    /// Whether the vnode is served by this transport instance.
    fn is_local_vnode(&self, vn: &Vnode) -> bool;

    /// Register a local vnode's RPC handler.
    fn register(&self, vnode: Vnode, rpc: Arc<dyn VnodeRpc>);
}

/// Operations a peer may invoke on a registered local vnode. Implemented by
/// the ring's local vnodes; transports dispatch inbound requests here.
#[async_trait]
pub trait VnodeRpc: Send + Sync {
    async fn get_predecessor(&self) -> Result<Option<Vnode>>;
    async fn get_predecessor_list(&self) -> Result<Vec<Vnode>>;
    async fn notify(&self, maybe_pred: Vnode) -> Result<Vec<Vnode>>;
    async fn find_successors(&self, n: usize, key: &[u8]) -> Result<Vec<Vnode>>;
    async fn clear_predecessor(&self, leaving: Vnode) -> Result<()>;
    async fn skip_successor(&self, leaving: Vnode) -> Result<()>;

    async fn rlock(
        &self,
        key: &str,
        sender_id: &str,
        sender_addr: &str,
    ) -> Result<(String, u32, u64)>;
    async fn wlock(
        &self,
        key: &str,
        version: u32,
        timeout_secs: u32,
        sender_id: &str,
    ) -> Result<(String, u32, u32, u64)>;
    async fn commit_wlock(&self, key: &str, version: u32, sender_id: &str) -> Result<u64>;
    async fn abort_wlock(&self, key: &str, version: u32, sender_id: &str) -> Result<u64>;
    async fn invalidate_rlock(&self, lock_id: &str) -> Result<()>;
    async fn fetch_ops_log(&self) -> Result<Vec<OpsLogEntry>>;
    async fn update_version_map(&self, version_map: HashMap<String, u32>) -> Result<()>;

    async fn get(&self, key: &str, version: u32) -> Result<Vec<u8>>;
    async fn set(&self, key: &str, version: u32, value: Vec<u8>) -> Result<()>;
    async fn list(&self) -> Result<Vec<String>>;
    async fn bulk_set(&self, key: &str, values: Vec<KvValue>) -> Result<()>;
    async fn sync_keys(&self, owner: Vnode, key: &str, versions: Vec<u32>) -> Result<()>;
    async fn missing_keys(&self, replica: Vnode, key: &str, versions: Vec<u32>) -> Result<()>;
    async fn purge_versions(&self, key: &str, max_version: u32) -> Result<()>;

    async fn join_ring(&self, ring_id: &str, joiner: Vnode) -> Result<Vec<Vnode>>;
    async fn leave_ring(&self, ring_id: &str) -> Result<()>;
}

/// Registry key for a vnode handler: host plus hex id.
pub(crate) fn registry_key(vn: &Vnode) -> String {
    format!("{}/{vn}", vn.host)
}
