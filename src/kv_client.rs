//! User-facing key-value client.
//!
//! Composes the lock protocol with replicated storage: reads take a read
//! lock (or hit the read-lock cache) and fetch the committed version from
//! the owning replica set; writes take a write lock, install the new
//! version on every replica, commit, then finalize the replicas so
//! version-0 reads observe the commit.

use crate::error::{Error, Result};
use crate::ring::RingCore;
use crate::transport::Transport;
use crate::types::KvValue;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default write-lock timeout handed to the lock manager.
const DEFAULT_WLOCK_TIMEOUT_SECS: u32 = 10;

/// Key-value client bound to a ring.
pub struct KvClient {
    core: Arc<RingCore>,
    wlock_timeout_secs: u32,
}

impl KvClient {
    pub(crate) fn new(core: Arc<RingCore>) -> Self {
        Self {
            core,
            wlock_timeout_secs: DEFAULT_WLOCK_TIMEOUT_SECS,
        }
    }

    /// Override the write-lock timeout used by [`KvClient::put`].
    pub fn with_wlock_timeout(mut self, secs: u32) -> Self {
        self.wlock_timeout_secs = secs;
        self
    }

    /// Read the latest committed value of `key`.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let client = &self.core.first_vnode().lm_client;
        let rlock = client.rlock(&self.core, key, false).await?;

        let replicas = self
            .core
            .lookup(self.core.config.num_successors, key.as_bytes())
            .await?;

        let mut last_err = Error::RoutingExhausted;
        for replica in &replicas {
            match self
                .core
                .transport()
                .get(replica, key, rlock.version)
                .await
            {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(key, replica = %replica, error = %e, "replica read failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Write a new version of `key` and return the committed version.
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<u32> {
        let client = &self.core.first_vnode().lm_client;
        let wlock = client
            .wlock(&self.core, key, 0, self.wlock_timeout_secs)
            .await?;

        let replicas = self
            .core
            .lookup(self.core.config.num_successors, key.as_bytes())
            .await?;

        for replica in &replicas {
            if let Err(e) = self
                .core
                .transport()
                .set(replica, key, wlock.version, value.clone())
                .await
            {
                warn!(key, replica = %replica, error = %e, "replica write failed, aborting");
                if let Err(abort_err) = client.abort_wlock(&self.core, key, wlock.version).await {
                    warn!(key, error = %abort_err, "abort after failed write also failed");
                }
                return Err(e);
            }
        }

        client.commit_wlock(&self.core, key, wlock.version).await?;

        // Finalize: flip the committed flag on every replica so version-0
        // reads see the new version without waiting for repair.
        let committed = vec![KvValue {
            version: wlock.version,
            value,
            committed: true,
        }];
        for replica in &replicas {
            if let Err(e) = self
                .core
                .transport()
                .bulk_set(replica, key, committed.clone())
                .await
            {
                debug!(key, replica = %replica, error = %e, "commit finalization failed");
            }
        }

        Ok(wlock.version)
    }
}
