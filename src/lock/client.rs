//! Client-side lock bookkeeping.
//!
//! Each vnode carries a `LockClient` holding the read and write locks it
//! currently owns. Read locks double as a cache: a read served from the
//! cache skips the lock manager entirely, and stays valid until the manager
//! sends an `invalidate_rlock` for it.

use crate::error::{LockError, Result};
use crate::ring::RingCore;
use crate::transport::Transport;
use crate::types::Vnode;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

/// A read lock held by this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RLockVal {
    pub lock_id: String,
    pub version: u32,
}

/// A write lock held by this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WLockVal {
    pub lock_id: String,
    pub version: u32,
    pub timeout_secs: u32,
    pub commit_point: u64,
}

/// Lock manager client owned by a local vnode.
pub struct LockClient {
    local: Vnode,
    rlocks: Mutex<HashMap<String, RLockVal>>,
    wlocks: Mutex<HashMap<String, WLockVal>>,
}

impl LockClient {
    pub(crate) fn new(local: Vnode) -> Self {
        Self {
            local,
            rlocks: Mutex::new(HashMap::new()),
            wlocks: Mutex::new(HashMap::new()),
        }
    }

    /// The cached read lock for a key, if any.
    pub fn cached_rlock(&self, key: &str) -> Option<RLockVal> {
        self.rlocks.lock().get(key).cloned()
    }

    /// Acquire a read lock, serving from the cache unless `force` is set.
    /// Returns the committed version to read.
    pub(crate) async fn rlock(&self, ring: &RingCore, key: &str, force: bool) -> Result<RLockVal> {
        if !force {
            if let Some(cached) = self.cached_rlock(key) {
                debug!(key, version = cached.version, "read lock served from cache");
                return Ok(cached);
            }
        }

        let lm = ring.lock_manager_vnode().await?;
        let sender_id = self.local.to_string();
        let (lock_id, version, _commit_point) = ring
            .transport()
            .rlock(&lm, key, &sender_id, &self.local.host)
            .await?;

        let val = RLockVal { lock_id, version };
        self.rlocks.lock().insert(key.to_string(), val.clone());
        Ok(val)
    }

    /// Acquire a write lock. `version == 0` requests the next version after
    /// the committed one.
    pub(crate) async fn wlock(
        &self,
        ring: &RingCore,
        key: &str,
        version: u32,
        timeout_secs: u32,
    ) -> Result<WLockVal> {
        let lm = ring.lock_manager_vnode().await?;
        let sender_id = self.local.to_string();
        let (lock_id, version, timeout_secs, commit_point) = ring
            .transport()
            .wlock(&lm, key, version, timeout_secs, &sender_id)
            .await?;

        let val = WLockVal {
            lock_id,
            version,
            timeout_secs,
            commit_point,
        };
        self.wlocks.lock().insert(key.to_string(), val.clone());
        Ok(val)
    }

    /// Commit a write lock previously obtained through this client.
    pub(crate) async fn commit_wlock(&self, ring: &RingCore, key: &str, version: u32) -> Result<u64> {
        self.held_wlock(key, version)?;

        let lm = ring.lock_manager_vnode().await?;
        let sender_id = self.local.to_string();
        let commit_point = ring
            .transport()
            .commit_wlock(&lm, key, version, &sender_id)
            .await?;

        self.wlocks.lock().remove(key);
        Ok(commit_point)
    }

    /// Abort a write lock previously obtained through this client.
    pub(crate) async fn abort_wlock(&self, ring: &RingCore, key: &str, version: u32) -> Result<u64> {
        self.held_wlock(key, version)?;

        let lm = ring.lock_manager_vnode().await?;
        let sender_id = self.local.to_string();
        let commit_point = ring
            .transport()
            .abort_wlock(&lm, key, version, &sender_id)
            .await?;

        self.wlocks.lock().remove(key);
        Ok(commit_point)
    }

    /// Drop the read lock matching `lock_id`. Invoked when the lock
    /// manager invalidates a stale reader; the next read re-acquires.
    pub fn invalidate_rlock(&self, lock_id: &str) -> bool {
        let mut rlocks = self.rlocks.lock();
        let before = rlocks.len();
        rlocks.retain(|_, v| v.lock_id != lock_id);
        let dropped = rlocks.len() < before;
        if dropped {
            debug!(lock_id, "read lock invalidated");
        }
        dropped
    }

    fn held_wlock(&self, key: &str, version: u32) -> Result<()> {
        let wlocks = self.wlocks.lock();
        match wlocks.get(key) {
            Some(held) if held.version == version => Ok(()),
            Some(held) => Err(LockError::VersionMismatch {
                key: key.to_string(),
                locked: held.version,
                requested: version,
            }
            .into()),
            None => Err(LockError::NotLocked {
                key: key.to_string(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ID_BYTES;

    fn client() -> LockClient {
        LockClient::new(Vnode::new(vec![7; ID_BYTES], "local:1"))
    }

    #[test]
    fn test_invalidate_drops_matching_entry() {
        let c = client();
        c.rlocks.lock().insert(
            "a".to_string(),
            RLockVal {
                lock_id: "lock-1".to_string(),
                version: 2,
            },
        );
        c.rlocks.lock().insert(
            "b".to_string(),
            RLockVal {
                lock_id: "lock-2".to_string(),
                version: 1,
            },
        );

        assert!(c.invalidate_rlock("lock-1"));
        assert!(c.cached_rlock("a").is_none());
        assert!(c.cached_rlock("b").is_some());

        // Unknown ids are a no-op.
        assert!(!c.invalidate_rlock("lock-1"));
    }

    #[test]
    fn test_held_wlock_checks() {
        let c = client();
        assert!(c.held_wlock("a", 1).is_err());

        c.wlocks.lock().insert(
            "a".to_string(),
            WLockVal {
                lock_id: "l".to_string(),
                version: 3,
                timeout_secs: 5,
                commit_point: 9,
            },
        );
        assert!(c.held_wlock("a", 3).is_ok());
        assert!(c.held_wlock("a", 2).is_err());
    }
}
