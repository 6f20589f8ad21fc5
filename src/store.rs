//! Versioned key-value storage for a single vnode.
//!
//! Every key holds multiple versions. Writes land uncommitted; the commit
//! watermark is flipped by the lock manager when the matching write lock
//! commits, and replication carries the full `KvValue` (flag included) so
//! replicas converge on the same committed view.
//!
//! Repair is pull-based: after stabilization refreshes the neighbour lists,
//! `local_repl` offers version vectors to the successor replicas
//! (`sync_keys`) and `global_repl` asks predecessors for anything this vnode
//! is missing (`missing_keys`). Both are fire-and-forget; the next round
//! retries whatever failed.

use crate::arithmetic::between_right_incl;
use crate::config::IdHasher;
use crate::error::{Result, StoreError};
use crate::transport::Transport;
use crate::types::{KvValue, Vnode};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Default)]
struct StoreInner {
    /// key -> version -> value. BTreeMap keeps versions ordered so the
    /// latest committed scan is a reverse walk.
    data: HashMap<String, BTreeMap<u32, KvValue>>,

    /// Neighbour lists captured at the end of the last stabilization round.
    predecessors: Vec<Vnode>,
    successors: Vec<Vnode>,
}

/// Per-vnode multi-version store. Clones share the same underlying state,
/// so background replication tasks can hold their own handle.
#[derive(Clone)]
pub struct KvStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner::default())),
        }
    }

    /// Read a value. `version == 0` means the latest committed version.
    pub fn get(&self, key: &str, version: u32) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        let versions = inner
            .data
            .get(key)
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))?;

        if version == 0 {
            return versions
                .values()
                .rev()
                .find(|v| v.committed)
                .map(|v| v.value.clone())
                .ok_or_else(|| StoreError::NoCommittedVersion(key.to_string()).into());
        }

        versions
            .get(&version)
            .map(|v| v.value.clone())
            .ok_or_else(|| {
                StoreError::VersionNotFound {
                    key: key.to_string(),
                    version,
                }
                .into()
            })
    }

    /// Write a value at a version. The version stays uncommitted until the
    /// lock manager commits the owning write lock.
    pub fn set(&self, key: &str, version: u32, value: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.write();
        inner
            .data
            .entry(key.to_string())
            .or_default()
            .insert(version, KvValue::uncommitted(version, value));
        Ok(())
    }

    /// Mark a version committed. Invoked by the lock manager's commit path
    /// on the vnode hosting it; replication spreads the flag from there.
    pub(crate) fn mark_committed(&self, key: &str, version: u32) {
        let mut inner = self.inner.write();
        if let Some(v) = inner.data.get_mut(key).and_then(|m| m.get_mut(&version)) {
            v.committed = true;
        }
    }

    /// All keys present locally.
    pub fn list(&self) -> Vec<String> {
        self.inner.read().data.keys().cloned().collect()
    }

    /// Merge replicated values for a key. Committed flags only ever turn
    /// on; a replica never un-commits a version it already accepted.
    pub fn bulk_set(&self, key: &str, values: Vec<KvValue>) -> Result<()> {
        let mut inner = self.inner.write();
        let versions = inner.data.entry(key.to_string()).or_default();
        for incoming in values {
            match versions.get_mut(&incoming.version) {
                Some(existing) => {
                    existing.committed |= incoming.committed;
                    existing.value = incoming.value;
                }
                None => {
                    versions.insert(incoming.version, incoming);
                }
            }
        }
        Ok(())
    }

    /// Versions held locally for a key, ascending.
    pub fn versions_of(&self, key: &str) -> Vec<u32> {
        self.inner
            .read()
            .data
            .get(key)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Versions from `offered` that are not present locally.
    pub fn missing_versions(&self, key: &str, offered: &[u32]) -> Vec<u32> {
        let inner = self.inner.read();
        match inner.data.get(key) {
            Some(m) => offered
                .iter()
                .copied()
                .filter(|v| !m.contains_key(v))
                .collect(),
            None => offered.to_vec(),
        }
    }

    /// Values for the versions of `key` NOT in `already_held`; used to
    /// answer a replica's `missing_keys` pull.
    pub fn delta_versions(&self, key: &str, already_held: &[u32]) -> Vec<KvValue> {
        let inner = self.inner.read();
        inner
            .data
            .get(key)
            .map(|m| {
                m.values()
                    .filter(|v| !already_held.contains(&v.version))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop all versions `<= max_version` of a key. Used when ownership
    /// migrates and local data is no longer needed.
    pub fn purge_versions(&self, key: &str, max_version: u32) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(m) = inner.data.get_mut(key) {
            m.retain(|&v, _| v > max_version);
            if m.is_empty() {
                inner.data.remove(key);
            }
        }
        Ok(())
    }

    /// Refresh the neighbour lists used by the replication passes.
    pub(crate) fn update_neighbors(&self, predecessors: Vec<Vnode>, successors: Vec<Vnode>) {
        let mut inner = self.inner.write();
        inner.predecessors = predecessors;
        inner.successors = successors;
    }

    fn neighbors(&self) -> (Vec<Vnode>, Vec<Vnode>) {
        let inner = self.inner.read();
        (inner.predecessors.clone(), inner.successors.clone())
    }

    /// Push-offer pass: for every key this vnode owns, offer its version
    /// vector to the successor replicas. Replicas pull deltas back through
    /// `missing_keys`.
    pub(crate) async fn local_repl(
        &self,
        transport: Arc<dyn Transport>,
        local: Vnode,
        hasher: &dyn IdHasher,
        num_successors: usize,
    ) {
        let (preds, succs) = self.neighbors();
        let pred = preds.first().cloned();
        let keys = self.list();

        for key in keys {
            let hash = hasher.digest(&[key.as_bytes()]);
            let owned = match &pred {
                Some(p) => between_right_incl(&p.id, &local.id, &hash),
                // No known predecessor: treat everything as owned.
                None => true,
            };
            if !owned {
                continue;
            }

            let versions = self.versions_of(&key);
            let mut offered_to = Vec::new();
            for succ in succs.iter().take(num_successors) {
                if succ.id == local.id || offered_to.contains(&succ.id) {
                    continue;
                }
                offered_to.push(succ.id.clone());
                if let Err(e) = transport
                    .sync_keys(succ, &local, &key, versions.clone())
                    .await
                {
                    debug!(key = %key, replica = %succ, error = %e, "sync_keys offer failed");
                }
            }
        }
    }

    /// Pull pass: ask predecessors for versions of keys in this vnode's
    /// replication range that are missing locally.
    pub(crate) async fn global_repl(
        &self,
        transport: Arc<dyn Transport>,
        local: Vnode,
        hasher: &dyn IdHasher,
    ) {
        let (preds, _) = self.neighbors();
        // The farthest known predecessor bounds the range of keys this
        // vnode either owns or replicates for its predecessors.
        let Some(low) = preds.last().cloned() else {
            return;
        };

        let mut asked = Vec::new();
        for pred in preds {
            if pred.id == local.id || asked.contains(&pred.id) {
                continue;
            }
            asked.push(pred.id.clone());

            let keys = match transport.list(&pred).await {
                Ok(keys) => keys,
                Err(e) => {
                    debug!(pred = %pred, error = %e, "list during global repl failed");
                    continue;
                }
            };

            for key in keys {
                let hash = hasher.digest(&[key.as_bytes()]);
                if !between_right_incl(&low.id, &local.id, &hash) {
                    continue;
                }
                let held = self.versions_of(&key);
                if let Err(e) = transport
                    .missing_keys(&pred, &local, &key, held)
                    .await
                {
                    warn!(key = %key, pred = %pred, error = %e, "missing_keys pull failed");
                }
            }
        }
    }
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_missing_key() {
        let store = KvStore::new();
        assert!(store.get("nope", 0).is_err());
        assert!(store.get("nope", 3).is_err());
    }

    #[test]
    fn test_set_then_get_exact_version() {
        let store = KvStore::new();
        store.set("a", 1, b"hello".to_vec()).unwrap();
        assert_eq!(store.get("a", 1).unwrap(), b"hello");
        assert!(store.get("a", 2).is_err());
    }

    #[test]
    fn test_latest_committed_read() {
        let store = KvStore::new();
        store.set("a", 1, b"v1".to_vec()).unwrap();
        // Nothing committed yet.
        assert!(store.get("a", 0).is_err());

        store.mark_committed("a", 1);
        assert_eq!(store.get("a", 0).unwrap(), b"v1");

        // A newer uncommitted version does not win the version-0 read.
        store.set("a", 2, b"v2".to_vec()).unwrap();
        assert_eq!(store.get("a", 0).unwrap(), b"v1");

        store.mark_committed("a", 2);
        assert_eq!(store.get("a", 0).unwrap(), b"v2");
    }

    #[test]
    fn test_bulk_set_merges_committed_flags() {
        let store = KvStore::new();
        store.set("k", 1, b"x".to_vec()).unwrap();
        store
            .bulk_set(
                "k",
                vec![
                    KvValue {
                        version: 1,
                        value: b"x".to_vec(),
                        committed: true,
                    },
                    KvValue {
                        version: 2,
                        value: b"y".to_vec(),
                        committed: false,
                    },
                ],
            )
            .unwrap();

        assert_eq!(store.get("k", 0).unwrap(), b"x");
        assert_eq!(store.versions_of("k"), vec![1, 2]);

        // A later replication round cannot clear the committed flag.
        store
            .bulk_set(
                "k",
                vec![KvValue {
                    version: 1,
                    value: b"x".to_vec(),
                    committed: false,
                }],
            )
            .unwrap();
        assert_eq!(store.get("k", 0).unwrap(), b"x");
    }

    #[test]
    fn test_missing_and_delta_versions() {
        let store = KvStore::new();
        store.set("k", 1, b"a".to_vec()).unwrap();
        store.set("k", 3, b"c".to_vec()).unwrap();

        assert_eq!(store.missing_versions("k", &[1, 2, 3, 4]), vec![2, 4]);
        assert_eq!(store.missing_versions("other", &[1, 2]), vec![1, 2]);

        let delta = store.delta_versions("k", &[1]);
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].version, 3);
    }

    #[test]
    fn test_purge_versions() {
        let store = KvStore::new();
        store.set("k", 1, b"a".to_vec()).unwrap();
        store.set("k", 2, b"b".to_vec()).unwrap();
        store.set("k", 3, b"c".to_vec()).unwrap();

        store.purge_versions("k", 2).unwrap();
        assert_eq!(store.versions_of("k"), vec![3]);

        store.purge_versions("k", 3).unwrap();
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_list() {
        let store = KvStore::new();
        store.set("a", 1, b"1".to_vec()).unwrap();
        store.set("b", 1, b"2".to_vec()).unwrap();
        let mut keys = store.list();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }
}
