//! Loopback transport.
//!
//! Wraps an optional remote transport and short-circuits every call whose
//! target vnode is registered locally, so vnodes sharing a process never
//! touch the network. Registration is forwarded to the remote transport so
//! inbound requests reach the same handlers.

use crate::error::{Result, TransportError};
use crate::transport::{registry_key, Transport, VnodeRpc};
use crate::types::{KvValue, OpsLogEntry, Vnode};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Transport that dispatches to in-process vnodes and falls back to an
/// inner remote transport for everything else.
pub struct LocalTransport {
    remote: Option<Arc<dyn Transport>>,
    registry: DashMap<String, (Vnode, Arc<dyn VnodeRpc>)>,
}

impl LocalTransport {
    /// Purely local transport; off-host calls fail with `NoRemote`.
    pub fn new() -> Self {
        Self {
            remote: None,
            registry: DashMap::new(),
        }
    }

    /// Loopback wrapper around a remote transport.
    pub fn wrap(remote: Arc<dyn Transport>) -> Self {
        Self {
            remote: Some(remote),
            registry: DashMap::new(),
        }
    }

    fn local(&self, vn: &Vnode) -> Option<Arc<dyn VnodeRpc>> {
        self.registry.get(&registry_key(vn)).map(|e| e.1.clone())
    }

    fn remote(&self) -> Result<&Arc<dyn Transport>> {
        self.remote
            .as_ref()
            .ok_or_else(|| TransportError::NoRemote.into())
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn list_vnodes(&self, host: &str) -> Result<Vec<Vnode>> {
        let mut local: Vec<Vnode> = self
            .registry
            .iter()
            .filter(|e| e.value().0.host == host)
            .map(|e| e.value().0.clone())
            .collect();
        if !local.is_empty() {
            local.sort();
            return Ok(local);
        }
        self.remote()?.list_vnodes(host).await
    }

    async fn ping(&self, target: &Vnode) -> Result<bool> {
        if self.local(target).is_some() {
            return Ok(true);
        }
        self.remote()?.ping(target).await
    }

    async fn get_predecessor(&self, target: &Vnode) -> Result<Option<Vnode>> {
        match self.local(target) {
            Some(rpc) => rpc.get_predecessor().await,
            None => self.remote()?.get_predecessor(target).await,
        }
    }

    async fn get_predecessor_list(&self, target: &Vnode) -> Result<Vec<Vnode>> {
        match self.local(target) {
            Some(rpc) => rpc.get_predecessor_list().await,
            None => self.remote()?.get_predecessor_list(target).await,
        }
    }

    async fn notify(&self, target: &Vnode, sender: &Vnode) -> Result<Vec<Vnode>> {
        match self.local(target) {
            Some(rpc) => rpc.notify(sender.clone()).await,
            None => self.remote()?.notify(target, sender).await,
        }
    }

    async fn find_successors(&self, target: &Vnode, n: usize, key: &[u8]) -> Result<Vec<Vnode>> {
        match self.local(target) {
            Some(rpc) => rpc.find_successors(n, key).await,
            None => self.remote()?.find_successors(target, n, key).await,
        }
    }

    async fn clear_predecessor(&self, target: &Vnode, leaving: &Vnode) -> Result<()> {
        match self.local(target) {
            Some(rpc) => rpc.clear_predecessor(leaving.clone()).await,
            None => self.remote()?.clear_predecessor(target, leaving).await,
        }
    }

    async fn skip_successor(&self, target: &Vnode, leaving: &Vnode) -> Result<()> {
        match self.local(target) {
            Some(rpc) => rpc.skip_successor(leaving.clone()).await,
            None => self.remote()?.skip_successor(target, leaving).await,
        }
    }

    async fn rlock(
        &self,
        target: &Vnode,
        key: &str,
        sender_id: &str,
        sender_addr: &str,
    ) -> Result<(String, u32, u64)> {
        match self.local(target) {
            Some(rpc) => rpc.rlock(key, sender_id, sender_addr).await,
            None => self.remote()?.rlock(target, key, sender_id, sender_addr).await,
        }
    }

    async fn wlock(
        &self,
        target: &Vnode,
        key: &str,
        version: u32,
        timeout_secs: u32,
        sender_id: &str,
    ) -> Result<(String, u32, u32, u64)> {
        match self.local(target) {
            Some(rpc) => rpc.wlock(key, version, timeout_secs, sender_id).await,
            None => {
                self.remote()?
                    .wlock(target, key, version, timeout_secs, sender_id)
                    .await
            }
        }
    }

    async fn commit_wlock(
        &self,
        target: &Vnode,
        key: &str,
        version: u32,
        sender_id: &str,
    ) -> Result<u64> {
        match self.local(target) {
            Some(rpc) => rpc.commit_wlock(key, version, sender_id).await,
            None => {
                self.remote()?
                    .commit_wlock(target, key, version, sender_id)
                    .await
            }
        }
    }

    async fn abort_wlock(
        &self,
        target: &Vnode,
        key: &str,
        version: u32,
        sender_id: &str,
    ) -> Result<u64> {
        match self.local(target) {
            Some(rpc) => rpc.abort_wlock(key, version, sender_id).await,
            None => {
                self.remote()?
                    .abort_wlock(target, key, version, sender_id)
                    .await
            }
        }
    }

    async fn invalidate_rlock(&self, target: &Vnode, lock_id: &str) -> Result<()> {
        match self.local(target) {
            Some(rpc) => rpc.invalidate_rlock(lock_id).await,
            None => self.remote()?.invalidate_rlock(target, lock_id).await,
        }
    }

    async fn fetch_ops_log(&self, target: &Vnode) -> Result<Vec<OpsLogEntry>> {
        match self.local(target) {
            Some(rpc) => rpc.fetch_ops_log().await,
            None => self.remote()?.fetch_ops_log(target).await,
        }
    }

    async fn update_version_map(
        &self,
        target: &Vnode,
        version_map: HashMap<String, u32>,
    ) -> Result<()> {
        match self.local(target) {
            Some(rpc) => rpc.update_version_map(version_map).await,
            None => self.remote()?.update_version_map(target, version_map).await,
        }
    }

    async fn get(&self, target: &Vnode, key: &str, version: u32) -> Result<Vec<u8>> {
        match self.local(target) {
            Some(rpc) => rpc.get(key, version).await,
            None => self.remote()?.get(target, key, version).await,
        }
    }

    async fn set(&self, target: &Vnode, key: &str, version: u32, value: Vec<u8>) -> Result<()> {
        match self.local(target) {
            Some(rpc) => rpc.set(key, version, value).await,
            None => self.remote()?.set(target, key, version, value).await,
        }
    }

    async fn list(&self, target: &Vnode) -> Result<Vec<String>> {
        match self.local(target) {
            Some(rpc) => rpc.list().await,
            None => self.remote()?.list(target).await,
        }
    }

    async fn bulk_set(&self, target: &Vnode, key: &str, values: Vec<KvValue>) -> Result<()> {
        match self.local(target) {
            Some(rpc) => rpc.bulk_set(key, values).await,
            None => self.remote()?.bulk_set(target, key, values).await,
        }
    }

    async fn sync_keys(
        &self,
        target: &Vnode,
        owner: &Vnode,
        key: &str,
        versions: Vec<u32>,
    ) -> Result<()> {
        match self.local(target) {
            Some(rpc) => rpc.sync_keys(owner.clone(), key, versions).await,
            None => self.remote()?.sync_keys(target, owner, key, versions).await,
        }
    }

    async fn missing_keys(
        &self,
        target: &Vnode,
        replica: &Vnode,
        key: &str,
        versions: Vec<u32>,
    ) -> Result<()> {
        match self.local(target) {
            Some(rpc) => rpc.missing_keys(replica.clone(), key, versions).await,
            None => {
                self.remote()?
                    .missing_keys(target, replica, key, versions)
                    .await
            }
        }
    }

    async fn purge_versions(&self, target: &Vnode, key: &str, max_version: u32) -> Result<()> {
        match self.local(target) {
            Some(rpc) => rpc.purge_versions(key, max_version).await,
            None => self.remote()?.purge_versions(target, key, max_version).await,
        }
    }

    async fn join_ring(&self, target: &Vnode, ring_id: &str, joiner: &Vnode) -> Result<Vec<Vnode>> {
        match self.local(target) {
            Some(rpc) => rpc.join_ring(ring_id, joiner.clone()).await,
            None => self.remote()?.join_ring(target, ring_id, joiner).await,
        }
    }

    async fn leave_ring(&self, target: &Vnode, ring_id: &str) -> Result<()> {
        match self.local(target) {
            Some(rpc) => rpc.leave_ring(ring_id).await,
            None => self.remote()?.leave_ring(target, ring_id).await,
        }
    }

    fn is_local_vnode(&self, vn: &Vnode) -> bool {
        self.registry.contains_key(&registry_key(vn))
    }

    fn register(&self, vnode: Vnode, rpc: Arc<dyn VnodeRpc>) {
        if let Some(remote) = &self.remote {
            remote.register(vnode.clone(), rpc.clone());
        }
        self.registry.insert(registry_key(&vnode), (vnode, rpc));
    }
}
