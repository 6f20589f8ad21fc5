//! Local vnode: ring state, the stabilization protocol, and the RPC
//! handler surface.
//!
//! Lock order within a vnode: predecessor list, then successor list, then
//! finger table. The successor and predecessor lists use async locks
//! because stabilization holds them across transport calls; the finger
//! table is only ever touched between awaits.

use crate::arithmetic::{between, between_right_incl, power_offset, rand_stabilize};
use crate::config::Config;
use crate::delegate::DelegateEvent;
use crate::error::{Error, Result};
use crate::lock::{LockClient, LockManager};
use crate::ring::RingCore;
use crate::store::KvStore;
use crate::tracker::Tracker;
use crate::transport::{Transport, VnodeRpc};
use crate::types::{KvValue, OpsLogEntry, Vnode};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct FingerTable {
    entries: Vec<Option<Vnode>>,
    /// Round-robin index of the entry repaired next.
    next: usize,
}

/// A vnode hosted by this process.
pub(crate) struct LocalVnode {
    pub(crate) vnode: Vnode,
    ring: Weak<RingCore>,

    /// `successors[0]` is the immediate clockwise neighbour.
    successors: RwLock<Vec<Option<Vnode>>>,

    /// `predecessors[0]` is the immediate predecessor.
    predecessors: RwLock<Vec<Option<Vnode>>>,

    finger: parking_lot::Mutex<FingerTable>,

    /// Time of the last completed stabilization round.
    stabilized: parking_lot::Mutex<Option<Instant>>,

    /// Set when stabilization hit an unrecoverable state; rounds are
    /// skipped until an operator intervenes.
    fatal: AtomicBool,

    task: parking_lot::Mutex<Option<JoinHandle<()>>>,

    pub(crate) store: KvStore,
    pub(crate) lm: LockManager,
    pub(crate) lm_client: LockClient,
    pub(crate) tracker: Tracker,
}

impl LocalVnode {
    pub(crate) fn new(
        idx: u16,
        config: &Config,
        ring: Weak<RingCore>,
        block_lm: bool,
    ) -> Arc<Self> {
        let id = config
            .hasher
            .digest(&[config.hostname.as_bytes(), &idx.to_be_bytes()]);
        let vnode = Vnode::new(id, config.hostname.clone());

        Arc::new(Self {
            ring,
            successors: RwLock::new(vec![None; config.num_successors]),
            predecessors: RwLock::new(vec![None; config.num_successors + 1]),
            finger: parking_lot::Mutex::new(FingerTable {
                entries: vec![None; config.hash_bits()],
                next: 0,
            }),
            stabilized: parking_lot::Mutex::new(None),
            fatal: AtomicBool::new(false),
            task: parking_lot::Mutex::new(None),
            store: KvStore::new(),
            lm: LockManager::new(block_lm),
            lm_client: LockClient::new(vnode.clone()),
            tracker: Tracker::new(),
            vnode,
        })
    }

    pub(crate) fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    pub(crate) fn last_stabilized(&self) -> Option<Instant> {
        *self.stabilized.lock()
    }

    /// Non-empty prefix copy of the successor list.
    pub(crate) async fn successor_list(&self) -> Vec<Vnode> {
        self.successors.read().await.iter().flatten().cloned().collect()
    }

    pub(crate) async fn predecessor(&self) -> Option<Vnode> {
        self.predecessors.read().await[0].clone()
    }

    pub(crate) async fn predecessor_list(&self) -> Vec<Vnode> {
        self.predecessors
            .read()
            .await
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub(crate) fn finger_entry(&self, k: usize) -> Option<Vnode> {
        self.finger.lock().entries.get(k).cloned().flatten()
    }

    /// Seed the successor list; used at construction and during joins.
    pub(crate) async fn install_successors(&self, list: &[Vnode]) {
        let mut succs = self.successors.write().await;
        for (idx, s) in list.iter().take(succs.len()).enumerate() {
            succs[idx] = Some(s.clone());
        }
    }

    pub(crate) async fn install_predecessors(&self, list: &[Vnode]) {
        let mut preds = self.predecessors.write().await;
        for (idx, p) in list.iter().take(preds.len()).enumerate() {
            preds[idx] = Some(p.clone());
        }
    }

    /// Start the self-rescheduling stabilization task: sleep a random
    /// interval, honor a pending shutdown, run one round, repeat.
    pub(crate) fn schedule(self: Arc<Self>) {
        let vn = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Some(ring) = vn.ring.upgrade() else { return };
                let delay = rand_stabilize(&ring.config);
                drop(ring);
                tokio::time::sleep(delay).await;

                let Some(ring) = vn.ring.upgrade() else { return };
                if ring.is_shutdown_requested() {
                    ring.signal_vnode_stopped();
                    return;
                }
                vn.stabilize(&ring).await;
            }
        });
        *self.task.lock() = Some(handle);
    }

    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().take()
    }

    /// One stabilization round. Steps are individually retryable: each
    /// failure is logged and the round moves on.
    pub(crate) async fn stabilize(&self, ring: &Arc<RingCore>) {
        if self.is_fatal() {
            return;
        }

        if let Err(e) = self.check_new_successor(ring).await {
            match e {
                Error::NoSuccessor => {
                    error!(vnode = %self.vnode, "successor list empty; suspending stabilization");
                    self.fatal.store(true, Ordering::SeqCst);
                    return;
                }
                e => warn!(vnode = %self.vnode, error = %e, "error checking for new successor"),
            }
        }

        if let Err(e) = self.notify_successor(ring).await {
            warn!(vnode = %self.vnode, error = %e, "error notifying successor");
        }

        if let Err(e) = self.fix_finger_table(ring).await {
            warn!(vnode = %self.vnode, error = %e, "error fixing finger table");
        }

        if let Err(e) = self.check_predecessor(ring).await {
            warn!(vnode = %self.vnode, error = %e, "error checking predecessor");
        }

        if let Err(e) = self.update_predecessor_list(ring).await {
            warn!(vnode = %self.vnode, error = %e, "error updating predecessor list");
        }

        // Reconcile the lock-manager role against the current routing
        // state. Notify-driven evaluation alone can strand a stale
        // manager when its routing converges after its last predecessor
        // change; re-checking every round makes handover self-healing.
        if !ring.config.ring_id.is_empty() && !self.lm.is_blocked() {
            self.evaluate_lm_ownership(ring).await;
        }

        // Hand the fresh neighbour lists to the store and kick off the
        // replication passes in the background.
        let preds = self.predecessor_list().await;
        let succs = self.successor_list().await;
        self.store.update_neighbors(preds, succs);
        self.spawn_replication(ring);

        *self.stabilized.lock() = Some(Instant::now());
    }

    fn spawn_replication(&self, ring: &Arc<RingCore>) {
        let num_successors = ring.config.num_successors;

        let store = self.store.clone();
        let local = self.vnode.clone();
        let transport = ring.transport();
        let hasher = ring.config.hasher.clone();
        tokio::spawn(async move {
            store
                .local_repl(transport, local, &*hasher, num_successors)
                .await;
        });

        let store = self.store.clone();
        let local = self.vnode.clone();
        let transport = ring.transport();
        let hasher = ring.config.hasher.clone();
        tokio::spawn(async move {
            store.global_repl(transport, local, &*hasher).await;
        });
    }

    /// Step 1: ask the successor for its predecessor and adopt it when it
    /// falls between us, advancing past dead successors on failure. The
    /// successor lock is held for the whole step.
    async fn check_new_successor(&self, ring: &Arc<RingCore>) -> Result<()> {
        let trans = ring.transport();
        let mut succs = self.successors.write().await;

        'check: loop {
            let succ = succs[0].clone().ok_or(Error::NoSuccessor)?;
            if succ.id == self.vnode.id {
                // Single-vnode ring; nothing to reconcile.
                return Ok(());
            }

            match trans.get_predecessor(&succ).await {
                Ok(maybe_succ) => {
                    if let Some(cand) = maybe_succ {
                        if between(&self.vnode.id, &succ.id, &cand.id)
                            && trans.ping(&cand).await.unwrap_or(false)
                        {
                            succs.rotate_right(1);
                            succs[0] = Some(cand);
                        }
                    }
                    return Ok(());
                }
                Err(e) => {
                    let known = known_count(&succs);
                    if known > 1 {
                        for i in 0..known {
                            let Some(head) = succs[0].clone() else { break };
                            if trans.ping(&head).await.unwrap_or(false) {
                                // Found a live successor; re-check it.
                                continue 'check;
                            }
                            // Don't eliminate the last successor we know of.
                            if i + 1 == known {
                                return Err(Error::AllSuccessorsDead);
                            }
                            succs.remove(0);
                            succs.push(None);
                        }
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Step 2: notify the successor of ourselves and splice its successor
    /// list into ours.
    async fn notify_successor(&self, ring: &Arc<RingCore>) -> Result<()> {
        let succ = {
            let succs = self.successors.read().await;
            succs[0].clone().ok_or(Error::NoSuccessor)?
        };
        if succ.id == self.vnode.id {
            return Ok(());
        }

        let succ_list = ring.transport().notify(&succ, &self.vnode).await?;

        let mut succs = self.successors.write().await;
        let max_succ = succs.len();
        for (idx, s) in succ_list.iter().take(max_succ - 1).enumerate() {
            // Never install ourselves as our own successor.
            if s.id == self.vnode.id {
                break;
            }
            succs[idx + 1] = Some(s.clone());
        }
        Ok(())
    }

    /// Step 3: repair the next finger entry, opportunistically filling
    /// subsequent entries the same successor covers.
    async fn fix_finger_table(&self, ring: &Arc<RingCore>) -> Result<()> {
        let hash_bits = ring.config.hash_bits();
        let next = self.finger.lock().next;
        let offset = power_offset(&self.vnode.id, next, hash_bits);

        let nodes = self.handle_find_successors(1, &offset).await?;
        let node = nodes.first().cloned().ok_or(Error::RoutingExhausted)?;

        let mut finger = self.finger.lock();
        finger.entries[next] = Some(node.clone());
        finger.next = next;

        loop {
            let ahead = finger.next + 1;
            if ahead >= hash_bits {
                break;
            }
            let offset = power_offset(&self.vnode.id, ahead, hash_bits);
            if between_right_incl(&self.vnode.id, &node.id, &offset) {
                finger.entries[ahead] = Some(node.clone());
                finger.next = ahead;
            } else {
                break;
            }
        }

        finger.next = (finger.next + 1) % hash_bits;
        Ok(())
    }

    /// Step 4: ping the predecessor; clear it when dead so a later notify
    /// can refill it.
    async fn check_predecessor(&self, ring: &Arc<RingCore>) -> Result<()> {
        let pred = self.predecessor().await;
        let Some(pred) = pred else { return Ok(()) };

        let alive = ring.transport().ping(&pred).await?;
        if !alive {
            let mut preds = self.predecessors.write().await;
            if preds[0].as_ref().map(|p| p.id == pred.id).unwrap_or(false) {
                info!(vnode = %self.vnode, pred = %pred, "predecessor dead, clearing");
                preds[0] = None;
            }
        }
        Ok(())
    }

    /// Step 5: splice the predecessor's predecessor list into ours.
    async fn update_predecessor_list(&self, ring: &Arc<RingCore>) -> Result<()> {
        let pred = self.predecessor().await;
        let Some(pred) = pred else { return Ok(()) };

        let pred_list = ring.transport().get_predecessor_list(&pred).await?;

        let mut preds = self.predecessors.write().await;
        let max_pred = preds.len();
        for (idx, p) in pred_list.iter().take(max_pred - 1).enumerate() {
            if p.id == self.vnode.id {
                break;
            }
            preds[idx + 1] = Some(p.clone());
        }
        Ok(())
    }

    /// Routing: find up to `n` successors of `key`.
    pub(crate) async fn handle_find_successors(&self, n: usize, key: &[u8]) -> Result<Vec<Vnode>> {
        let ring = self.ring()?;
        let succs = self.successors.read().await;
        let succ0 = succs[0].clone().ok_or(Error::NoSuccessor)?;

        if succ0.id == self.vnode.id {
            // Single-vnode ring owns the whole id space.
            return Ok(vec![self.vnode.clone()]);
        }

        if between_right_incl(&self.vnode.id, &succ0.id, key) {
            return Ok(succs.iter().flatten().take(n).cloned().collect());
        }

        // Walk the closest preceding nodes, nearest to the key first.
        for candidate in self.closest_preceding(&succs, key) {
            match ring.transport().find_successors(&candidate, n, key).await {
                Ok(found) => return Ok(found),
                Err(e) => {
                    warn!(vnode = %self.vnode, candidate = %candidate, error = %e,
                          "failed to contact preceding node");
                }
            }
        }

        // Fall back to any non-immediate successor covering the key.
        let known = known_count(&succs);
        for i in 1..known.saturating_sub(n).saturating_add(1) {
            if let Some(s) = &succs[i] {
                if between_right_incl(&self.vnode.id, &s.id, key) {
                    return Ok(succs[i..].iter().flatten().take(n).cloned().collect());
                }
            }
        }

        Err(Error::RoutingExhausted)
    }

    /// Merge finger table and successor list into candidates strictly
    /// between us and the key, ordered nearest-to-the-key first.
    fn closest_preceding(&self, succs: &[Option<Vnode>], key: &[u8]) -> Vec<Vnode> {
        let mut candidates: Vec<Vnode> = Vec::new();
        {
            let finger = self.finger.lock();
            for entry in finger.entries.iter().flatten() {
                if between(&self.vnode.id, key, &entry.id) {
                    candidates.push(entry.clone());
                }
            }
        }
        for entry in succs.iter().flatten() {
            if between(&self.vnode.id, key, &entry.id) {
                candidates.push(entry.clone());
            }
        }

        // Ring order starting just after our id: unwrapped ids first, then
        // the wrapped tail. The closest preceding node is the last, so
        // sort ascending and reverse.
        let base = self.vnode.id.clone();
        candidates.sort_by(|a, b| {
            let a_wrapped = a.id <= base;
            let b_wrapped = b.id <= base;
            a_wrapped.cmp(&b_wrapped).then_with(|| a.id.cmp(&b.id))
        });
        candidates.dedup_by(|a, b| a.id == b.id);
        candidates.reverse();
        candidates
    }

    /// RPC: a node claims to be our predecessor. Adopt it when it falls
    /// between the current predecessor and us (or when we have none), then
    /// re-evaluate lock-manager ownership outside the lock.
    pub(crate) async fn handle_notify(&self, maybe_pred: Vnode) -> Result<Vec<Vnode>> {
        if maybe_pred.id == self.vnode.id {
            return Ok(self.successor_list().await);
        }

        let adopted = {
            let mut preds = self.predecessors.write().await;
            let current = preds[0].clone();
            let adopt = match &current {
                // First-ever predecessor: adopt unconditionally.
                None => true,
                Some(cur) => between(&cur.id, &self.vnode.id, &maybe_pred.id),
            };
            if adopt {
                preds[0] = Some(maybe_pred.clone());
                Some(current)
            } else {
                None
            }
        };

        if let Some(prev) = adopted {
            if let Some(ring) = self.ring.upgrade() {
                ring.emit(DelegateEvent::NewPredecessor {
                    local: self.vnode.clone(),
                    new_pred: maybe_pred.clone(),
                    prev_pred: prev.clone(),
                })
                .await;

                let changed = prev.map(|p| p.id != maybe_pred.id).unwrap_or(true);
                if changed && !self.lm.is_blocked() {
                    self.evaluate_lm_ownership(&ring).await;
                }
            }
        }

        Ok(self.successor_list().await)
    }

    /// Re-run the ring-id lookup and reconcile this vnode's lock-manager
    /// role with the result.
    pub(crate) async fn evaluate_lm_ownership(&self, ring: &Arc<RingCore>) {
        let ring_id = ring.config.ring_id.clone();
        if ring_id.is_empty() {
            return;
        }

        let owner = match ring.lookup(1, ring_id.as_bytes()).await {
            Ok(owners) if !owners.is_empty() => owners[0].clone(),
            Ok(_) | Err(_) => {
                warn!(vnode = %self.vnode, "lookup for lock manager failed");
                return;
            }
        };

        if owner.id == self.vnode.id {
            if !self.lm.is_current() {
                self.sync_lm_from_successor(ring).await;
            }
        } else if self.lm.is_current() {
            info!(vnode = %self.vnode, new_lm = %owner,
                  "lost lock manager status, shipping version map");
            let version_map = self.lm.version_map_snapshot();
            if let Err(e) = ring.transport().update_version_map(&owner, version_map).await {
                error!(error = %e, "failed to ship version map to the new lock manager");
            }
            self.lm.set_current(false);
        }
    }

    /// Become the active lock manager: fetch the old manager's op-log from
    /// our successor and replay it. A malformed log aborts the promotion;
    /// an unreachable successor promotes with whatever state was shipped.
    async fn sync_lm_from_successor(&self, ring: &Arc<RingCore>) {
        let succ = {
            let succs = self.successors.read().await;
            succs[0].clone()
        };

        match succ {
            Some(succ) if succ.id != self.vnode.id => {
                match ring.transport().fetch_ops_log(&succ).await {
                    Ok(entries) => match self.lm.replay_log(&entries) {
                        Ok(()) => {
                            info!(vnode = %self.vnode, "assumed lock manager role");
                            self.lm.set_current(true);
                        }
                        Err(e) => {
                            error!(vnode = %self.vnode, error = %e,
                                   "ops-log replay failed, aborting lock manager handover");
                        }
                    },
                    Err(e) => {
                        warn!(vnode = %self.vnode, error = %e,
                              "old lock manager unreachable, promoting with shipped state");
                        self.lm.set_current(true);
                    }
                }
            }
            _ => {
                self.lm.set_current(true);
            }
        }
    }

    /// Blocking-join hook: unblock the lock manager and evaluate ownership
    /// once the join has had time to stabilize.
    pub(crate) async fn check_lm_status(&self) {
        self.lm.unblock();
        if let Some(ring) = self.ring.upgrade() {
            self.evaluate_lm_ownership(&ring).await;
        }
    }

    /// Leave the ring: tell the delegate, have the predecessor skip us and
    /// the successor clear us. Both errors are reported, not suppressed.
    pub(crate) async fn leave(&self, ring: &Arc<RingCore>) -> Result<()> {
        let pred = self.predecessor().await;
        let succ = {
            let succs = self.successors.read().await;
            succs[0].clone()
        };

        ring.emit(DelegateEvent::Leaving {
            local: self.vnode.clone(),
            pred: pred.clone(),
            succ: succ.clone(),
        })
        .await;

        let trans = ring.transport();
        let mut err = None;
        if let Some(pred) = &pred {
            if pred.id != self.vnode.id {
                err = Error::merge(err, trans.skip_successor(pred, &self.vnode).await.err());
            }
        }
        if let Some(succ) = &succ {
            if succ.id != self.vnode.id {
                err = Error::merge(err, trans.clear_predecessor(succ, &self.vnode).await.err());
            }
        }
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// RPC: a leaving predecessor asks us to forget it.
    pub(crate) async fn handle_clear_predecessor(&self, leaving: Vnode) -> Result<()> {
        let cleared = {
            let mut preds = self.predecessors.write().await;
            if preds[0].as_ref().map(|p| p.id == leaving.id).unwrap_or(false) {
                preds[0] = None;
                true
            } else {
                false
            }
        };
        if cleared {
            if let Some(ring) = self.ring.upgrade() {
                ring.emit(DelegateEvent::PredecessorLeaving {
                    local: self.vnode.clone(),
                    remote: leaving,
                })
                .await;
            }
        }
        Ok(())
    }

    /// RPC: a leaving successor asks us to advance past it.
    pub(crate) async fn handle_skip_successor(&self, leaving: Vnode) -> Result<()> {
        let skipped = {
            let mut succs = self.successors.write().await;
            if succs[0].as_ref().map(|s| s.id == leaving.id).unwrap_or(false) {
                succs.remove(0);
                succs.push(None);
                true
            } else {
                false
            }
        };
        if skipped {
            if let Some(ring) = self.ring.upgrade() {
                ring.emit(DelegateEvent::SuccessorLeaving {
                    local: self.vnode.clone(),
                    remote: leaving,
                })
                .await;
            }
        }
        Ok(())
    }

    fn ring(&self) -> Result<Arc<RingCore>> {
        self.ring
            .upgrade()
            .ok_or_else(|| Error::Internal("ring has been dropped".to_string()))
    }
}

fn known_count(succs: &[Option<Vnode>]) -> usize {
    succs
        .iter()
        .rposition(|s| s.is_some())
        .map(|i| i + 1)
        .unwrap_or(0)
}

#[async_trait]
impl VnodeRpc for LocalVnode {
    async fn get_predecessor(&self) -> Result<Option<Vnode>> {
        Ok(self.predecessor().await)
    }

    async fn get_predecessor_list(&self) -> Result<Vec<Vnode>> {
        Ok(self.predecessor_list().await)
    }

    async fn notify(&self, maybe_pred: Vnode) -> Result<Vec<Vnode>> {
        self.handle_notify(maybe_pred).await
    }

    async fn find_successors(&self, n: usize, key: &[u8]) -> Result<Vec<Vnode>> {
        self.handle_find_successors(n, key).await
    }

    async fn clear_predecessor(&self, leaving: Vnode) -> Result<()> {
        self.handle_clear_predecessor(leaving).await
    }

    async fn skip_successor(&self, leaving: Vnode) -> Result<()> {
        self.handle_skip_successor(leaving).await
    }

    async fn rlock(
        &self,
        key: &str,
        sender_id: &str,
        sender_addr: &str,
    ) -> Result<(String, u32, u64)> {
        self.lm.create_rlock(key, sender_id, sender_addr)
    }

    async fn wlock(
        &self,
        key: &str,
        version: u32,
        timeout_secs: u32,
        sender_id: &str,
    ) -> Result<(String, u32, u32, u64)> {
        self.lm.create_wlock(key, version, timeout_secs, sender_id)
    }

    async fn commit_wlock(&self, key: &str, version: u32, sender_id: &str) -> Result<u64> {
        let (commit_point, invalidations) = self.lm.commit_wlock(key, version, sender_id)?;

        // The committed version is now authoritative for version-0 reads
        // served by this vnode; replication spreads the flag outward.
        self.store.mark_committed(key, version);

        if !invalidations.is_empty() {
            let ring = self.ring()?;
            for (holder, lock_id) in invalidations {
                if let Err(e) = ring.transport().invalidate_rlock(&holder, &lock_id).await {
                    // Stale-reader invalidation is best effort.
                    debug!(holder = %holder.host, error = %e, "rlock invalidation failed");
                }
            }
        }
        Ok(commit_point)
    }

    async fn abort_wlock(&self, key: &str, version: u32, sender_id: &str) -> Result<u64> {
        self.lm.abort_wlock(key, version, sender_id)
    }

    async fn invalidate_rlock(&self, lock_id: &str) -> Result<()> {
        self.lm_client.invalidate_rlock(lock_id);
        Ok(())
    }

    async fn fetch_ops_log(&self) -> Result<Vec<OpsLogEntry>> {
        Ok(self.lm.ops_log_snapshot())
    }

    async fn update_version_map(&self, version_map: HashMap<String, u32>) -> Result<()> {
        self.lm.update_version_map(version_map);
        Ok(())
    }

    async fn get(&self, key: &str, version: u32) -> Result<Vec<u8>> {
        self.store.get(key, version)
    }

    async fn set(&self, key: &str, version: u32, value: Vec<u8>) -> Result<()> {
        self.store.set(key, version, value)
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.store.list())
    }

    async fn bulk_set(&self, key: &str, values: Vec<KvValue>) -> Result<()> {
        self.store.bulk_set(key, values)
    }

    /// An owner offered its version vector; pull whatever we lack.
    async fn sync_keys(&self, owner: Vnode, key: &str, versions: Vec<u32>) -> Result<()> {
        let missing = self.store.missing_versions(key, &versions);
        if missing.is_empty() {
            return Ok(());
        }
        let ring = self.ring()?;
        let held = self.store.versions_of(key);
        ring.transport()
            .missing_keys(&owner, &self.vnode, key, held)
            .await
    }

    /// A replica reported the versions it holds; push it the rest.
    async fn missing_keys(&self, replica: Vnode, key: &str, versions: Vec<u32>) -> Result<()> {
        let delta = self.store.delta_versions(key, &versions);
        if delta.is_empty() {
            return Ok(());
        }
        let ring = self.ring()?;
        ring.transport().bulk_set(&replica, key, delta).await
    }

    async fn purge_versions(&self, key: &str, max_version: u32) -> Result<()> {
        self.store.purge_versions(key, max_version)
    }

    async fn join_ring(&self, ring_id: &str, joiner: Vnode) -> Result<Vec<Vnode>> {
        self.tracker.handle_join_ring(ring_id, joiner)
    }

    async fn leave_ring(&self, ring_id: &str) -> Result<()> {
        self.tracker.handle_leave_ring(ring_id)
    }
}
