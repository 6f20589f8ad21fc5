//! Ring controller: vnode lifecycle, lookup, delegate dispatch, shutdown.

use crate::arithmetic::nearest_vnode;
use crate::config::Config;
use crate::delegate::{spawn_dispatcher, DelegateEvent, DELEGATE_QUEUE_DEPTH};
use crate::error::{Error, Result};
use crate::kv_client::KvClient;
use crate::transport::{LocalTransport, Transport};
use crate::types::Vnode;
use crate::vnode::LocalVnode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Seconds a blocking join waits before the lock managers unblock and
/// evaluate ring-id ownership.
const JOIN_STABILIZE_WAIT: Duration = Duration::from_secs(5);

/// Shared ring state. Vnodes hold a weak handle back to this; everything
/// else in the process reaches it through [`Ring`].
pub(crate) struct RingCore {
    pub(crate) config: Config,
    transport: Arc<LocalTransport>,
    pub(crate) vnodes: Vec<Arc<LocalVnode>>,

    delegate_tx: parking_lot::Mutex<Option<mpsc::Sender<DelegateEvent>>>,
    delegate_task: parking_lot::Mutex<Option<JoinHandle<()>>>,

    shutdown_requested: AtomicBool,
    stopped_tx: mpsc::Sender<()>,
    stopped_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl RingCore {
    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub(crate) fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// A stabilization task observed the shutdown flag and exited.
    pub(crate) fn signal_vnode_stopped(&self) {
        let _ = self.stopped_tx.try_send(());
    }

    /// Queue an event for the delegate task; a no-op without a delegate.
    pub(crate) async fn emit(&self, event: DelegateEvent) {
        let tx = self.delegate_tx.lock().clone();
        if let Some(tx) = tx {
            if tx.send(event).await.is_err() {
                debug!("delegate channel closed, event dropped");
            }
        }
    }

    /// The local vnode nearest a hashed key: the last one with an id below
    /// it, wrapping to the highest.
    fn nearest_local(&self, key_hash: &[u8]) -> Arc<LocalVnode> {
        for vn in self.vnodes.iter().rev() {
            if vn.vnode.id.as_slice() < key_hash {
                return vn.clone();
            }
        }
        self.vnodes[self.vnodes.len() - 1].clone()
    }

    /// Hash a key and route to up to `n` successors of it.
    pub(crate) async fn lookup(&self, n: usize, key: &[u8]) -> Result<Vec<Vnode>> {
        if n > self.config.num_successors {
            return Err(Error::TooManySuccessors {
                max: self.config.num_successors,
            });
        }

        let key_hash = self.config.hasher.digest(&[key]);
        let nearest = self.nearest_local(&key_hash);
        let mut successors = nearest.handle_find_successors(n, &key_hash).await?;
        successors.truncate(n);
        Ok(successors)
    }

    /// The vnode currently serving as lock manager: the successor of
    /// `hash(ring_id)`.
    pub(crate) async fn lock_manager_vnode(&self) -> Result<Vnode> {
        let owners = self.lookup(1, self.config.ring_id.as_bytes()).await?;
        owners.into_iter().next().ok_or(Error::RoutingExhausted)
    }

    pub(crate) fn first_vnode(&self) -> &Arc<LocalVnode> {
        &self.vnodes[0]
    }

    fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    /// Two-phase barrier: raise the flag, then wait for every vnode's
    /// stabilization task to observe it and check out.
    async fn stop_vnodes(&self) {
        self.request_shutdown();
        let mut rx = self.stopped_rx.lock().await;
        for _ in 0..self.vnodes.len() {
            let _ = rx.recv().await;
        }
        drop(rx);

        for vn in &self.vnodes {
            if let Some(task) = vn.take_task() {
                let _ = task.await;
            }
        }
    }

    /// Deliver the shutdown callback, then drain and close the channel.
    async fn stop_delegate(&self) {
        let tx = self.delegate_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(DelegateEvent::Shutdown).await;
        }
        let task = self.delegate_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn stop_lock_managers(&self) {
        for vn in &self.vnodes {
            vn.lm.shutdown().await;
        }
    }
}

/// A Chord-style ring of local vnodes over a pluggable transport.
pub struct Ring {
    core: Arc<RingCore>,
}

impl Ring {
    /// Create a standalone ring with an in-process loopback transport.
    pub async fn create(config: Config) -> Result<Self> {
        Self::create_with_transport(config, None).await
    }

    /// Create a ring on top of a remote-capable transport.
    pub async fn create_with_transport(
        config: Config,
        transport: Option<Arc<dyn Transport>>,
    ) -> Result<Self> {
        let core = init_core(config, transport, false)?;
        set_local_neighbors(&core).await;
        seed_lock_manager(&core).await;
        schedule(&core);
        Ok(Self { core })
    }

    /// Join an existing ring through a known host.
    pub async fn join(
        config: Config,
        transport: Arc<dyn Transport>,
        existing: &str,
    ) -> Result<Self> {
        Self::join_inner(config, transport, existing, false).await
    }

    /// Join with the lock managers blocked until the ring has had
    /// [`JOIN_STABILIZE_WAIT`] to heal, then evaluate LM ownership.
    pub async fn blocking_join(
        config: Config,
        transport: Arc<dyn Transport>,
        existing: &str,
    ) -> Result<Self> {
        Self::join_inner(config, transport, existing, true).await
    }

    async fn join_inner(
        config: Config,
        transport: Arc<dyn Transport>,
        existing: &str,
        block_lm: bool,
    ) -> Result<Self> {
        let num_successors = config.num_successors;
        let core = init_core(config, Some(transport), block_lm)?;

        let hosts = core.transport.list_vnodes(existing).await?;
        if hosts.is_empty() {
            return Err(Error::NoRemoteVnodes(existing.to_string()));
        }
        debug!(existing, fetched = hosts.len(), "fetched remote vnodes");

        // Acquire a live successor set for every local vnode.
        for vn in &core.vnodes {
            let nearest = nearest_vnode(&hosts, &vn.vnode.id)
                .ok_or_else(|| Error::NoRemoteVnodes(existing.to_string()))?;
            let succs = core
                .transport
                .find_successors(nearest, num_successors, &vn.vnode.id)
                .await?;
            if succs.is_empty() {
                return Err(Error::Internal(
                    "failed to find successors for local vnodes".to_string(),
                ));
            }
            vn.install_successors(&succs).await;
        }

        // Fast first stabilization, then regular scheduling.
        for vn in &core.vnodes {
            vn.stabilize(&core).await;
        }
        schedule(&core);

        if block_lm {
            for vn in &core.vnodes {
                let vn = vn.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(JOIN_STABILIZE_WAIT).await;
                    vn.check_lm_status().await;
                });
            }
        }

        Ok(Self { core })
    }

    /// Look up to `n` successors of `key`. `n` must not exceed the
    /// configured successor count.
    pub async fn lookup(&self, n: usize, key: &[u8]) -> Result<Vec<Vnode>> {
        self.core.lookup(n, key).await
    }

    /// Handle for the first local vnode.
    pub fn local_vnode(&self) -> Vnode {
        self.core.first_vnode().vnode.clone()
    }

    /// Handles for every local vnode, ordered by id.
    pub fn local_vnodes(&self) -> Vec<Vnode> {
        self.core.vnodes.iter().map(|v| v.vnode.clone()).collect()
    }

    /// A key-value client bound to this ring.
    pub fn kv_client(&self) -> KvClient {
        KvClient::new(self.core.clone())
    }

    /// The vnode currently authoritative for locks on this ring.
    pub async fn lock_manager_vnode(&self) -> Result<Vnode> {
        self.core.lock_manager_vnode().await
    }

    /// False when any local vnode hit a fatal stabilization state.
    pub fn is_healthy(&self) -> bool {
        self.core.vnodes.iter().all(|v| !v.is_fatal())
    }

    /// Gracefully leave the ring, then shut down.
    pub async fn leave(self) -> Result<()> {
        self.core.stop_vnodes().await;

        let mut err = None;
        for vn in &self.core.vnodes {
            err = Error::merge(err, vn.leave(&self.core).await.err());
        }

        self.core.stop_lock_managers().await;
        self.core.stop_delegate().await;
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Shut down local vnodes and background tasks. Blocks until every
    /// stabilization task has terminated.
    pub async fn shutdown(self) {
        self.core.stop_vnodes().await;
        self.core.stop_lock_managers().await;
        self.core.stop_delegate().await;
        info!(hostname = %self.core.config.hostname, "ring shut down");
    }

    pub(crate) fn core(&self) -> &Arc<RingCore> {
        &self.core
    }
}

/// Build the core with its vnodes; ids are sorted so a single host ring is
/// in ring order from the start.
fn init_core(
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    block_lm: bool,
) -> Result<Arc<RingCore>> {
    config.validate().map_err(Error::Config)?;

    let local = Arc::new(match transport {
        Some(remote) => LocalTransport::wrap(remote),
        None => LocalTransport::new(),
    });

    let (stopped_tx, stopped_rx) = mpsc::channel(config.num_vnodes.max(1));

    let delegate = config.delegate.clone();
    let (delegate_tx, delegate_task) = match delegate {
        Some(delegate) => {
            let (tx, rx) = mpsc::channel(DELEGATE_QUEUE_DEPTH);
            let task = spawn_dispatcher(delegate, rx);
            (Some(tx), Some(task))
        }
        None => (None, None),
    };

    let core = Arc::new_cyclic(|weak| {
        let mut vnodes: Vec<Arc<LocalVnode>> = (0..config.num_vnodes)
            .map(|i| LocalVnode::new(i as u16, &config, weak.clone(), block_lm))
            .collect();
        vnodes.sort_by(|a, b| a.vnode.id.cmp(&b.vnode.id));

        RingCore {
            config,
            transport: local,
            vnodes,
            delegate_tx: parking_lot::Mutex::new(delegate_tx),
            delegate_task: parking_lot::Mutex::new(delegate_task),
            shutdown_requested: AtomicBool::new(false),
            stopped_tx,
            stopped_rx: tokio::sync::Mutex::new(stopped_rx),
        }
    });

    for vn in &core.vnodes {
        core.transport.register(vn.vnode.clone(), vn.clone());
    }

    info!(
        hostname = %core.config.hostname,
        vnodes = core.vnodes.len(),
        "ring initialized"
    );
    Ok(core)
}

/// Seed successors and predecessors cyclically by index so a single-host
/// ring is coherent before the first stabilization round. A lone vnode
/// points at itself so lookups resolve.
async fn set_local_neighbors(core: &Arc<RingCore>) {
    let num_v = core.vnodes.len();
    if num_v == 1 {
        let vn = &core.vnodes[0];
        let self_handle = vn.vnode.clone();
        vn.install_successors(&[self_handle]).await;
        return;
    }

    let num_suc = core.config.num_successors.min(num_v - 1);
    let num_pred = (core.config.num_successors + 1).min(num_v - 1);

    for (idx, vn) in core.vnodes.iter().enumerate() {
        let succs: Vec<Vnode> = (0..num_suc)
            .map(|i| core.vnodes[(idx + i + 1) % num_v].vnode.clone())
            .collect();
        vn.install_successors(&succs).await;

        let preds: Vec<Vnode> = (0..num_pred)
            .map(|i| core.vnodes[(idx + num_v - i - 1) % num_v].vnode.clone())
            .collect();
        vn.install_predecessors(&preds).await;
    }
}

/// The host creating a ring is its first lock manager: mark the vnode
/// owning `hash(ring_id)` as current so handover has an authority to
/// migrate from. Joining hosts start with no authority.
async fn seed_lock_manager(core: &Arc<RingCore>) {
    if core.config.ring_id.is_empty() {
        return;
    }
    match core.lookup(1, core.config.ring_id.as_bytes()).await {
        Ok(owners) => {
            if let Some(owner) = owners.first() {
                if let Some(vn) = core.vnodes.iter().find(|v| v.vnode.id == owner.id) {
                    debug!(vnode = %vn.vnode, "seeded as initial lock manager");
                    vn.lm.set_current(true);
                }
            }
        }
        Err(e) => warn!(error = %e, "initial lock manager lookup failed"),
    }
}

fn schedule(core: &Arc<RingCore>) {
    for vn in &core.vnodes {
        vn.clone().schedule();
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("hostname", &self.core.config.hostname)
            .field("vnodes", &self.core.vnodes.len())
            .field("ring_id", &self.core.config.ring_id)
            .finish()
    }
}
