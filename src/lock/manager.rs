//! Lock manager server.
//!
//! Every vnode owns a `LockManager`, but only the vnode that is the
//! immediate successor of `hash(ring_id)` is the *active* manager at any
//! moment. Lock RPCs are served by whichever instance receives them (the
//! client's lookup is what routes to the right one); `current_lm` tracks
//! whether this instance is the ring's authority for handover purposes.
//!
//! Lock discipline: the lock-table mutex is acquired before the ops-log
//! mutex, always in that order. Neither is held across an await.

use crate::error::{LockError, Result};
use crate::types::{LockOp, OpsLogEntry, Vnode};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Sweep cadence for expired write locks.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Length of a lock id in raw bytes (hex-encoded on the wire).
const LOCK_ID_BYTES: usize = 20;

/// State of an outstanding write lock. At most one per key.
#[derive(Debug, Clone)]
pub struct WLockEntry {
    pub node_id: String,
    pub lock_id: String,
    pub version: u32,
    pub deadline: SystemTime,
}

/// One read-lock holder: the lock id handed out and where to send the
/// invalidation when the key changes.
#[derive(Debug, Clone)]
pub struct RLockHolder {
    pub lock_id: String,
    pub remote_addr: String,
}

#[derive(Default)]
struct LockTables {
    /// Highest committed version per key; absent means version 0.
    version_map: HashMap<String, u32>,
    /// key -> node id -> holder.
    rlocks: HashMap<String, HashMap<String, RLockHolder>>,
    wlocks: HashMap<String, WLockEntry>,
}

#[derive(Default)]
struct OpsLog {
    entries: Vec<OpsLogEntry>,
    curr_op_num: u64,
}

impl OpsLog {
    fn append(&mut self, op: LockOp, key: &str, version: u32, timeout: Option<i64>) -> u64 {
        self.curr_op_num += 1;
        self.entries.push(OpsLogEntry {
            op_num: self.curr_op_num,
            op,
            key: key.to_string(),
            version,
            timeout,
        });
        self.curr_op_num
    }
}

/// State shared with the expiry sweeper task.
#[derive(Default)]
struct LmShared {
    tables: Mutex<LockTables>,
    ops_log: Mutex<OpsLog>,
}

/// In-memory lock manager with a replicated operation log.
pub struct LockManager {
    /// Whether this instance currently serves as the ring's lock manager.
    current_lm: AtomicBool,

    /// Blocking-join mode: suspend ownership evaluation until unblocked.
    block: AtomicBool,

    shared: Arc<LmShared>,

    sweeper: Mutex<Option<JoinHandle<()>>>,
    sweeper_cancel: CancellationToken,
}

impl LockManager {
    pub fn new(block: bool) -> Self {
        Self {
            current_lm: AtomicBool::new(false),
            block: AtomicBool::new(block),
            shared: Arc::new(LmShared::default()),
            sweeper: Mutex::new(None),
            sweeper_cancel: CancellationToken::new(),
        }
    }

    pub fn is_current(&self) -> bool {
        self.current_lm.load(Ordering::SeqCst)
    }

    pub(crate) fn set_current(&self, current: bool) {
        self.current_lm.store(current, Ordering::SeqCst);
    }

    pub fn is_blocked(&self) -> bool {
        self.block.load(Ordering::SeqCst)
    }

    pub(crate) fn unblock(&self) {
        self.block.store(false, Ordering::SeqCst);
    }

    /// Committed version of a key; 0 when never committed.
    pub fn committed_version(&self, key: &str) -> u32 {
        self.shared
            .tables
            .lock()
            .version_map
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot of the full version map, for shipping to a new manager.
    pub fn version_map_snapshot(&self) -> HashMap<String, u32> {
        self.shared.tables.lock().version_map.clone()
    }

    /// Create a read lock. Fails when the key has no committed version.
    /// Returns `(lock_id, version, commit_point)`.
    pub fn create_rlock(
        &self,
        key: &str,
        node_id: &str,
        remote_addr: &str,
    ) -> Result<(String, u32, u64)> {
        let mut tables = self.shared.tables.lock();
        let version = tables.version_map.get(key).copied().unwrap_or(0);
        if version == 0 {
            return Err(LockError::NoCommittedVersion {
                key: key.to_string(),
            }
            .into());
        }

        let lock_id = gen_lock_id();
        tables.rlocks.entry(key.to_string()).or_default().insert(
            node_id.to_string(),
            RLockHolder {
                lock_id: lock_id.clone(),
                remote_addr: remote_addr.to_string(),
            },
        );
        let commit_point = self.shared.ops_log.lock().curr_op_num;

        debug!(key, node_id, version, "read lock granted");
        Ok((lock_id, version, commit_point))
    }

    /// Report whether a write lock exists for the key, and at what version.
    pub fn check_wlock(&self, key: &str) -> Option<u32> {
        self.shared.tables.lock().wlocks.get(key).map(|w| w.version)
    }

    /// Create a write lock.
    ///
    /// `requested_version == 0` asks for "next after committed". A stale
    /// explicit version is rejected; an existing lock is reported with the
    /// version currently being written. Returns
    /// `(lock_id, version, timeout_secs, commit_point)` where the commit
    /// point is the op number of the WRITE record.
    pub fn create_wlock(
        &self,
        key: &str,
        requested_version: u32,
        timeout_secs: u32,
        node_id: &str,
    ) -> Result<(String, u32, u32, u64)> {
        self.ensure_sweeper();

        let mut tables = self.shared.tables.lock();
        if let Some(existing) = tables.wlocks.get(key) {
            return Err(LockError::AlreadyLocked {
                key: key.to_string(),
                version: existing.version,
            }
            .into());
        }

        let committed = tables.version_map.get(key).copied().unwrap_or(0);
        let version = if requested_version <= committed {
            if requested_version == 0 {
                committed + 1
            } else {
                return Err(LockError::StaleVersion {
                    key: key.to_string(),
                    committed,
                }
                .into());
            }
        } else {
            requested_version
        };

        let lock_id = gen_lock_id();
        let deadline = SystemTime::now() + Duration::from_secs(timeout_secs as u64);

        let commit_point = {
            let mut log = self.shared.ops_log.lock();
            log.append(LockOp::Write, key, version, Some(unix_nanos(deadline)))
        };
        tables.wlocks.insert(
            key.to_string(),
            WLockEntry {
                node_id: node_id.to_string(),
                lock_id: lock_id.clone(),
                version,
                deadline,
            },
        );

        debug!(key, node_id, version, commit_point, "write lock granted");
        Ok((lock_id, version, timeout_secs, commit_point))
    }

    /// Commit a write lock.
    ///
    /// Bumps the version map, logs a COMMIT record, and drops the lock.
    /// Returns the commit point plus the read-lock holders to invalidate;
    /// the caller owns firing the invalidation RPCs (the manager holds no
    /// transport handle). No invalidations are due for a key's first
    /// commit.
    pub fn commit_wlock(
        &self,
        key: &str,
        version: u32,
        _node_id: &str,
    ) -> Result<(u64, Vec<(Vnode, String)>)> {
        let mut tables = self.shared.tables.lock();
        let locked =
            tables
                .wlocks
                .get(key)
                .map(|w| w.version)
                .ok_or_else(|| LockError::NotLocked {
                    key: key.to_string(),
                })?;
        if locked != version {
            return Err(LockError::VersionMismatch {
                key: key.to_string(),
                locked,
                requested: version,
            }
            .into());
        }

        tables.version_map.insert(key.to_string(), version);
        let commit_point = {
            let mut log = self.shared.ops_log.lock();
            log.append(LockOp::Commit, key, version, None)
        };
        tables.wlocks.remove(key);

        let mut invalidations = Vec::new();
        if version > 1 {
            if let Some(holders) = tables.rlocks.get(key) {
                for (holder_id, holder) in holders {
                    invalidations.push((
                        Vnode::new(parse_hex_id(holder_id), holder.remote_addr.clone()),
                        holder.lock_id.clone(),
                    ));
                }
            }
        }

        info!(key, version, commit_point, "write lock committed");
        Ok((commit_point, invalidations))
    }

    /// Abort a write lock: log an ABORT record and drop the lock.
    pub fn abort_wlock(&self, key: &str, version: u32, _node_id: &str) -> Result<u64> {
        let mut tables = self.shared.tables.lock();
        let locked =
            tables
                .wlocks
                .get(key)
                .map(|w| w.version)
                .ok_or_else(|| LockError::NotLocked {
                    key: key.to_string(),
                })?;
        if locked != version {
            return Err(LockError::VersionMismatch {
                key: key.to_string(),
                locked,
                requested: version,
            }
            .into());
        }

        let commit_point = {
            let mut log = self.shared.ops_log.lock();
            log.append(LockOp::Abort, key, version, None)
        };
        tables.wlocks.remove(key);

        debug!(key, version, "write lock aborted");
        Ok(commit_point)
    }

    /// Merge an incoming version map from a demoted manager. Versions only
    /// move forward.
    pub fn update_version_map(&self, incoming: HashMap<String, u32>) {
        let mut tables = self.shared.tables.lock();
        for (key, version) in incoming {
            let slot = tables.version_map.entry(key).or_insert(0);
            if version > *slot {
                *slot = version;
            }
        }
    }

    /// Snapshot of the op-log, for shipping to a new manager.
    pub fn ops_log_snapshot(&self) -> Vec<OpsLogEntry> {
        self.shared.ops_log.lock().entries.clone()
    }

    /// Rebuild lock state from a fetched op-log.
    ///
    /// Applies records in sequence onto fresh tables, then merges the
    /// result into the live state (committed versions only move forward)
    /// and adopts the log so the next handover can replay it. The op
    /// counter lands strictly above every replayed number. A malformed
    /// record aborts the replay with no state change.
    pub fn replay_log(&self, entries: &[OpsLogEntry]) -> Result<()> {
        let mut version_map: HashMap<String, u32> = HashMap::new();
        let mut wlocks: HashMap<String, WLockEntry> = HashMap::new();
        let mut last_op = 0u64;

        for entry in entries {
            if entry.op_num <= last_op {
                return Err(LockError::CorruptLog {
                    op_num: entry.op_num,
                    reason: format!("op number not increasing (previous {last_op})"),
                }
                .into());
            }
            last_op = entry.op_num;

            match entry.op {
                LockOp::Write => {
                    let nanos = entry.timeout.ok_or_else(|| LockError::CorruptLog {
                        op_num: entry.op_num,
                        reason: "WRITE record without a timeout".to_string(),
                    })?;
                    wlocks.insert(
                        entry.key.clone(),
                        WLockEntry {
                            node_id: String::new(),
                            lock_id: String::new(),
                            version: entry.version,
                            deadline: from_unix_nanos(nanos),
                        },
                    );
                }
                LockOp::Commit => {
                    version_map.insert(entry.key.clone(), entry.version);
                    wlocks.remove(&entry.key);
                }
                LockOp::Abort => {
                    wlocks.remove(&entry.key);
                }
                LockOp::Invalidate => {
                    // Read-lock holders of the failed manager are gone;
                    // nothing to carry over.
                }
            }
        }

        let mut tables = self.shared.tables.lock();
        for (key, version) in version_map {
            let slot = tables.version_map.entry(key).or_insert(0);
            if version > *slot {
                *slot = version;
            }
        }
        tables.wlocks.extend(wlocks);

        let mut log = self.shared.ops_log.lock();
        log.entries = entries.to_vec();
        if last_op > log.curr_op_num {
            log.curr_op_num = last_op;
        }

        info!(
            replayed = entries.len(),
            next_op = log.curr_op_num + 1,
            "ops-log replayed"
        );
        Ok(())
    }

    /// Drop log records with `op_num <= up_to`. Retention policy belongs to
    /// the host; the ring never truncates on its own.
    pub fn truncate_log(&self, up_to: u64) {
        let mut log = self.shared.ops_log.lock();
        log.entries.retain(|e| e.op_num > up_to);
    }

    /// Start the expiry sweeper if it is not already running.
    fn ensure_sweeper(&self) {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return;
        }

        let shared = self.shared.clone();
        let cancel = self.sweeper_cancel.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => sweep_expired(&shared),
                }
            }
        }));
    }

    /// Stop the sweeper and wait for it to exit.
    pub(crate) async fn shutdown(&self) {
        self.sweeper_cancel.cancel();
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Drop write locks whose deadline has passed, recording an ABORT for each
/// so the op-log reflects every lock outcome.
fn sweep_expired(shared: &LmShared) {
    let now = SystemTime::now();
    let mut tables = shared.tables.lock();
    let expired: Vec<(String, u32)> = tables
        .wlocks
        .iter()
        .filter(|(_, w)| w.deadline <= now)
        .map(|(k, w)| (k.clone(), w.version))
        .collect();
    if expired.is_empty() {
        return;
    }

    let mut log = shared.ops_log.lock();
    for (key, version) in expired {
        log.append(LockOp::Abort, &key, version, None);
        tables.wlocks.remove(&key);
        debug!(key = %key, version, "write lock expired");
    }
}

/// Generate a 160-bit crypto-random lock id, hex encoded.
fn gen_lock_id() -> String {
    let mut bytes = [0u8; LOCK_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(LOCK_ID_BYTES * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Decode a hex vnode id back to bytes; falls back to the raw string bytes
/// for ids that were never hex in the first place.
fn parse_hex_id(s: &str) -> Vec<u8> {
    if s.len() % 2 == 0 && !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit()) {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap_or(0))
            .collect()
    } else {
        s.as_bytes().to_vec()
    }
}

fn unix_nanos(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn from_unix_nanos(nanos: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rlock_requires_committed_version() {
        let lm = LockManager::new(false);
        assert!(lm.create_rlock("a", "n1", "host:1").is_err());
    }

    #[tokio::test]
    async fn test_wlock_assigns_next_version() {
        let lm = LockManager::new(false);
        let (lock_id, version, timeout, cp) = lm.create_wlock("a", 0, 5, "n1").unwrap();
        assert_eq!(lock_id.len(), LOCK_ID_BYTES * 2);
        assert_eq!(version, 1);
        assert_eq!(timeout, 5);
        assert_eq!(cp, 1);
        lm.shutdown().await;
    }

    #[tokio::test]
    async fn test_wlock_conflict_reports_locked_version() {
        let lm = LockManager::new(false);
        lm.create_wlock("a", 0, 5, "n1").unwrap();
        let err = lm.create_wlock("a", 0, 5, "n2").unwrap_err();
        match err {
            crate::error::Error::Lock(LockError::AlreadyLocked { version, .. }) => {
                assert_eq!(version, 1)
            }
            other => panic!("unexpected error: {other}"),
        }
        lm.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_wlock_rejected() {
        let lm = LockManager::new(false);
        let (_, v, _, _) = lm.create_wlock("a", 0, 5, "n1").unwrap();
        lm.commit_wlock("a", v, "n1").unwrap();

        let err = lm.create_wlock("a", 1, 5, "n2").unwrap_err();
        match err {
            crate::error::Error::Lock(LockError::StaleVersion { committed, .. }) => {
                assert_eq!(committed, 1)
            }
            other => panic!("unexpected error: {other}"),
        }
        lm.shutdown().await;
    }

    #[tokio::test]
    async fn test_commit_updates_version_map_and_log() {
        let lm = LockManager::new(false);
        let (_, v, _, write_cp) = lm.create_wlock("a", 0, 5, "n1").unwrap();
        let (commit_cp, invalidations) = lm.commit_wlock("a", v, "n1").unwrap();

        assert_eq!(write_cp, 1);
        assert_eq!(commit_cp, 2);
        assert!(invalidations.is_empty()); // first commit never invalidates
        assert_eq!(lm.committed_version("a"), 1);
        assert!(lm.check_wlock("a").is_none());

        let log = lm.ops_log_snapshot();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].op, LockOp::Write);
        assert_eq!(log[1].op, LockOp::Commit);
        lm.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_commit_invalidates_readers() {
        let lm = LockManager::new(false);
        let (_, v1, _, _) = lm.create_wlock("a", 0, 5, "n1").unwrap();
        lm.commit_wlock("a", v1, "n1").unwrap();

        let reader_id = "ab".repeat(20);
        let (rlock_id, rv, _) = lm.create_rlock("a", &reader_id, "reader:9").unwrap();
        assert_eq!(rv, 1);

        let (_, v2, _, _) = lm.create_wlock("a", 0, 5, "n3").unwrap();
        let (_, invalidations) = lm.commit_wlock("a", v2, "n3").unwrap();
        assert_eq!(invalidations.len(), 1);
        assert_eq!(invalidations[0].0.host, "reader:9");
        assert_eq!(invalidations[0].0.id, vec![0xab; 20]);
        assert_eq!(invalidations[0].1, rlock_id);
        lm.shutdown().await;
    }

    #[tokio::test]
    async fn test_commit_version_mismatch() {
        let lm = LockManager::new(false);
        lm.create_wlock("a", 0, 5, "n1").unwrap();
        assert!(lm.commit_wlock("a", 9, "n1").is_err());
        assert!(lm.commit_wlock("missing", 1, "n1").is_err());
        lm.shutdown().await;
    }

    #[tokio::test]
    async fn test_abort_drops_lock_and_logs() {
        let lm = LockManager::new(false);
        let (_, v, _, _) = lm.create_wlock("a", 0, 5, "n1").unwrap();
        lm.abort_wlock("a", v, "n1").unwrap();
        assert!(lm.check_wlock("a").is_none());
        assert_eq!(lm.committed_version("a"), 0);

        let log = lm.ops_log_snapshot();
        assert_eq!(log[1].op, LockOp::Abort);
        lm.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_sweep_appends_abort() {
        let lm = LockManager::new(false);
        lm.create_wlock("a", 0, 0, "n1").unwrap(); // expires immediately

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(lm.check_wlock("a").is_none());
        let log = lm.ops_log_snapshot();
        assert_eq!(log.last().unwrap().op, LockOp::Abort);
        lm.shutdown().await;
    }

    #[tokio::test]
    async fn test_op_nums_strictly_increase() {
        let lm = LockManager::new(false);
        for i in 0..5 {
            let key = format!("k{i}");
            let (_, v, _, _) = lm.create_wlock(&key, 0, 5, "n").unwrap();
            lm.commit_wlock(&key, v, "n").unwrap();
        }
        let log = lm.ops_log_snapshot();
        for pair in log.windows(2) {
            assert!(pair[1].op_num > pair[0].op_num);
        }
        lm.shutdown().await;
    }

    #[tokio::test]
    async fn test_replay_reconstructs_state() {
        let lm = LockManager::new(false);
        let (_, v1, _, _) = lm.create_wlock("a", 0, 5, "n1").unwrap();
        lm.commit_wlock("a", v1, "n1").unwrap();
        let (_, v2, _, _) = lm.create_wlock("a", 0, 60, "n1").unwrap();
        let log = lm.ops_log_snapshot();

        let successor = LockManager::new(false);
        successor.replay_log(&log).unwrap();

        assert_eq!(successor.committed_version("a"), 1);
        // The outstanding WRITE is carried over as a held lock.
        assert_eq!(successor.check_wlock("a"), Some(v2));

        // New ops land strictly above the replayed numbers.
        let (_, v, _, _) = successor.create_wlock("b", 0, 5, "n2").unwrap();
        let (cp, _) = successor.commit_wlock("b", v, "n2").unwrap();
        assert!(cp > log.last().unwrap().op_num);
        lm.shutdown().await;
        successor.shutdown().await;
    }

    #[test]
    fn test_replay_is_deterministic() {
        let entries = vec![
            OpsLogEntry {
                op_num: 1,
                op: LockOp::Write,
                key: "a".into(),
                version: 1,
                timeout: Some(0),
            },
            OpsLogEntry {
                op_num: 2,
                op: LockOp::Commit,
                key: "a".into(),
                version: 1,
                timeout: None,
            },
        ];

        let first = LockManager::new(false);
        first.replay_log(&entries).unwrap();
        let second = LockManager::new(false);
        second.replay_log(&entries).unwrap();
        assert_eq!(first.version_map_snapshot(), second.version_map_snapshot());
    }

    #[test]
    fn test_replay_rejects_non_monotonic_log() {
        let entries = vec![
            OpsLogEntry {
                op_num: 2,
                op: LockOp::Commit,
                key: "a".into(),
                version: 1,
                timeout: None,
            },
            OpsLogEntry {
                op_num: 2,
                op: LockOp::Commit,
                key: "b".into(),
                version: 1,
                timeout: None,
            },
        ];
        let lm = LockManager::new(false);
        assert!(lm.replay_log(&entries).is_err());
        // Aborted replay leaves no state behind.
        assert_eq!(lm.committed_version("a"), 0);
    }

    #[tokio::test]
    async fn test_truncate_log() {
        let lm = LockManager::new(false);
        for i in 0..3 {
            let key = format!("k{i}");
            let (_, v, _, _) = lm.create_wlock(&key, 0, 5, "n").unwrap();
            lm.commit_wlock(&key, v, "n").unwrap();
        }
        assert_eq!(lm.ops_log_snapshot().len(), 6);

        lm.truncate_log(4);
        let log = lm.ops_log_snapshot();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|e| e.op_num > 4));

        // The counter keeps counting from where it was.
        let (_, v, _, _) = lm.create_wlock("z", 0, 5, "n").unwrap();
        let (cp, _) = lm.commit_wlock("z", v, "n").unwrap();
        assert_eq!(cp, 8);
        lm.shutdown().await;
    }

    #[test]
    fn test_update_version_map_moves_forward_only() {
        let lm = LockManager::new(false);
        lm.update_version_map(HashMap::from([("a".to_string(), 3)]));
        lm.update_version_map(HashMap::from([("a".to_string(), 2), ("b".to_string(), 1)]));
        assert_eq!(lm.committed_version("a"), 3);
        assert_eq!(lm.committed_version("b"), 1);
    }

    #[test]
    fn test_parse_hex_id() {
        assert_eq!(parse_hex_id("ab01"), vec![0xab, 0x01]);
        assert_eq!(parse_hex_id("node-1"), b"node-1".to_vec());
    }
}
