//! TCP transport.
//!
//! A listener task accepts framed bincode requests and dispatches them to
//! the vnode handlers registered on this host; outbound calls dial the
//! target host per request. Every network operation runs under a bounded
//! timeout so a dead peer yields an error instead of a hung stabilization
//! round.

use crate::error::{Result, TransportError};
use crate::transport::messages::{decode, frame, Request, Response, MAX_MESSAGE_BYTES};
use crate::transport::{registry_key, Transport, VnodeRpc};
use crate::types::{KvValue, OpsLogEntry, Vnode};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

type Registry = Arc<DashMap<String, (Vnode, Arc<dyn VnodeRpc>)>>;

/// TCP implementation of [`Transport`].
pub struct TcpTransport {
    listen_addr: String,
    io_timeout: Duration,
    registry: Registry,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl TcpTransport {
    /// Bind a listener and start accepting requests.
    pub async fn bind(listen: &str, io_timeout: Duration) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(listen).await.map_err(|e| {
            TransportError::ConnectionFailed {
                addr: listen.to_string(),
                reason: e.to_string(),
            }
        })?;
        let listen_addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .map_err(TransportError::Io)?;

        let registry: Registry = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();
        let transport = Arc::new(Self {
            listen_addr: listen_addr.clone(),
            io_timeout,
            registry: registry.clone(),
            listener_task: Mutex::new(None),
            cancel: cancel.clone(),
        });

        let task = tokio::spawn(accept_loop(listener, registry, cancel));
        *transport.listener_task.lock() = Some(task);

        info!(addr = %listen_addr, "tcp transport listening");
        Ok(transport)
    }

    /// The bound listen address, `host:port`.
    pub fn local_addr(&self) -> &str {
        &self.listen_addr
    }

    /// Stop the listener and wait for it to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.listener_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Dial a host, send one request, await its response.
    async fn call(&self, host: &str, req: &Request) -> Result<Response> {
        let framed = frame(req)?;

        let mut stream = timeout(self.io_timeout, TcpStream::connect(host))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed {
                addr: host.to_string(),
                reason: e.to_string(),
            })?;

        timeout(self.io_timeout, stream.write_all(&framed))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let response = timeout(self.io_timeout, read_frame(&mut stream))
            .await
            .map_err(|_| TransportError::Timeout)??;

        match decode::<Response>(&response)? {
            Response::Error { message } => Err(TransportError::Remote(message).into()),
            Response::UnknownVnode { vnode } => Err(TransportError::UnknownVnode(vnode).into()),
            other => Ok(other),
        }
    }

    fn unexpected(what: &str) -> crate::error::Error {
        TransportError::Deserialization(format!("unexpected response to {what}")).into()
    }
}

async fn accept_loop(listener: TcpListener, registry: Registry, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("tcp transport accept loop stopped");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "accepted connection");
                        let registry = registry.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, registry, cancel).await {
                                debug!(error = %e, "connection handler error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "failed to accept connection"),
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    registry: Registry,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let body = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = read_frame(&mut stream) => match read {
                Ok(body) => body,
                // Peer closed between requests.
                Err(crate::error::Error::Transport(TransportError::Io(ref e)))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(())
                }
                Err(e) => return Err(e),
            },
        };

        let request: Request = decode(&body)?;
        let response = dispatch(&registry, request).await;
        let framed = frame(&response)?;
        stream
            .write_all(&framed)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    }
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(TransportError::Io)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(TransportError::ReceiveFailed("message too large".to_string()).into());
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.map_err(TransportError::Io)?;
    Ok(body)
}

/// Route a request to the registered handler for its target vnode.
async fn dispatch(registry: &Registry, request: Request) -> Response {
    let rpc = match request.target() {
        None => {
            // Host-level vnode listing.
            let mut vnodes: Vec<Vnode> =
                registry.iter().map(|e| e.value().0.clone()).collect();
            vnodes.sort();
            return Response::Vnodes { vnodes };
        }
        Some(target) => match registry.get(&registry_key(target)) {
            Some(entry) => entry.value().1.clone(),
            None => {
                return Response::UnknownVnode {
                    vnode: target.to_string(),
                }
            }
        },
    };

    match request {
        Request::ListVnodes => unreachable!("handled above"),
        Request::Ping { .. } => Response::Pong { alive: true },
        Request::GetPredecessor { .. } => match rpc.get_predecessor().await {
            Ok(vnode) => Response::MaybeVnode { vnode },
            Err(e) => err(e),
        },
        Request::GetPredecessorList { .. } => match rpc.get_predecessor_list().await {
            Ok(vnodes) => Response::Vnodes { vnodes },
            Err(e) => err(e),
        },
        Request::Notify { sender, .. } => match rpc.notify(sender).await {
            Ok(vnodes) => Response::Vnodes { vnodes },
            Err(e) => err(e),
        },
        Request::FindSuccessors { n, key, .. } => {
            match rpc.find_successors(n as usize, &key).await {
                Ok(vnodes) => Response::Vnodes { vnodes },
                Err(e) => err(e),
            }
        }
        Request::ClearPredecessor { leaving, .. } => match rpc.clear_predecessor(leaving).await {
            Ok(()) => Response::Ack,
            Err(e) => err(e),
        },
        Request::SkipSuccessor { leaving, .. } => match rpc.skip_successor(leaving).await {
            Ok(()) => Response::Ack,
            Err(e) => err(e),
        },
        Request::RLock {
            key,
            sender_id,
            sender_addr,
            ..
        } => match rpc.rlock(&key, &sender_id, &sender_addr).await {
            Ok((lock_id, version, commit_point)) => Response::Lock {
                lock_id,
                version,
                timeout_secs: 0,
                commit_point,
            },
            Err(e) => err(e),
        },
        Request::WLock {
            key,
            version,
            timeout_secs,
            sender_id,
            ..
        } => match rpc.wlock(&key, version, timeout_secs, &sender_id).await {
            Ok((lock_id, version, timeout_secs, commit_point)) => Response::Lock {
                lock_id,
                version,
                timeout_secs,
                commit_point,
            },
            Err(e) => err(e),
        },
        Request::CommitWLock {
            key,
            version,
            sender_id,
            ..
        } => match rpc.commit_wlock(&key, version, &sender_id).await {
            Ok(commit_point) => Response::CommitPoint { commit_point },
            Err(e) => err(e),
        },
        Request::AbortWLock {
            key,
            version,
            sender_id,
            ..
        } => match rpc.abort_wlock(&key, version, &sender_id).await {
            Ok(commit_point) => Response::CommitPoint { commit_point },
            Err(e) => err(e),
        },
        Request::InvalidateRLock { lock_id, .. } => match rpc.invalidate_rlock(&lock_id).await {
            Ok(()) => Response::Ack,
            Err(e) => err(e),
        },
        Request::FetchOpsLog { .. } => match rpc.fetch_ops_log().await {
            Ok(entries) => Response::OpsLog { entries },
            Err(e) => err(e),
        },
        Request::UpdateVersionMap { version_map, .. } => {
            match rpc.update_version_map(version_map).await {
                Ok(()) => Response::Ack,
                Err(e) => err(e),
            }
        }
        Request::Get { key, version, .. } => match rpc.get(&key, version).await {
            Ok(value) => Response::Value { value },
            Err(e) => err(e),
        },
        Request::Set {
            key,
            version,
            value,
            ..
        } => match rpc.set(&key, version, value).await {
            Ok(()) => Response::Ack,
            Err(e) => err(e),
        },
        Request::List { .. } => match rpc.list().await {
            Ok(keys) => Response::Keys { keys },
            Err(e) => err(e),
        },
        Request::BulkSet { key, values, .. } => match rpc.bulk_set(&key, values).await {
            Ok(()) => Response::Ack,
            Err(e) => err(e),
        },
        Request::SyncKeys {
            owner,
            key,
            versions,
            ..
        } => match rpc.sync_keys(owner, &key, versions).await {
            Ok(()) => Response::Ack,
            Err(e) => err(e),
        },
        Request::MissingKeys {
            replica,
            key,
            versions,
            ..
        } => match rpc.missing_keys(replica, &key, versions).await {
            Ok(()) => Response::Ack,
            Err(e) => err(e),
        },
        Request::PurgeVersions {
            key, max_version, ..
        } => match rpc.purge_versions(&key, max_version).await {
            Ok(()) => Response::Ack,
            Err(e) => err(e),
        },
        Request::JoinRing {
            ring_id, joiner, ..
        } => match rpc.join_ring(&ring_id, joiner).await {
            Ok(vnodes) => Response::Vnodes { vnodes },
            Err(e) => err(e),
        },
        Request::LeaveRing { ring_id, .. } => match rpc.leave_ring(&ring_id).await {
            Ok(()) => Response::Ack,
            Err(e) => err(e),
        },
    }
}

fn err(e: crate::error::Error) -> Response {
    Response::Error {
        message: e.to_string(),
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn list_vnodes(&self, host: &str) -> Result<Vec<Vnode>> {
        match self.call(host, &Request::ListVnodes).await? {
            Response::Vnodes { vnodes } => Ok(vnodes),
            _ => Err(Self::unexpected("list_vnodes")),
        }
    }

    async fn ping(&self, target: &Vnode) -> Result<bool> {
        let req = Request::Ping {
            target: target.clone(),
        };
        // An unreachable peer is reported dead, not as an error; routing
        // and predecessor checks treat the two very differently.
        match self.call(&target.host, &req).await {
            Ok(Response::Pong { alive }) => Ok(alive),
            Ok(_) => Err(Self::unexpected("ping")),
            Err(e) => {
                debug!(target = %target.host, error = %e, "ping failed");
                Ok(false)
            }
        }
    }

    async fn get_predecessor(&self, target: &Vnode) -> Result<Option<Vnode>> {
        let req = Request::GetPredecessor {
            target: target.clone(),
        };
        match self.call(&target.host, &req).await? {
            Response::MaybeVnode { vnode } => Ok(vnode),
            _ => Err(Self::unexpected("get_predecessor")),
        }
    }

    async fn get_predecessor_list(&self, target: &Vnode) -> Result<Vec<Vnode>> {
        let req = Request::GetPredecessorList {
            target: target.clone(),
        };
        match self.call(&target.host, &req).await? {
            Response::Vnodes { vnodes } => Ok(vnodes),
            _ => Err(Self::unexpected("get_predecessor_list")),
        }
    }

    async fn notify(&self, target: &Vnode, sender: &Vnode) -> Result<Vec<Vnode>> {
        let req = Request::Notify {
            target: target.clone(),
            sender: sender.clone(),
        };
        match self.call(&target.host, &req).await? {
            Response::Vnodes { vnodes } => Ok(vnodes),
            _ => Err(Self::unexpected("notify")),
        }
    }

    async fn find_successors(&self, target: &Vnode, n: usize, key: &[u8]) -> Result<Vec<Vnode>> {
        let req = Request::FindSuccessors {
            target: target.clone(),
            n: n as u32,
            key: key.to_vec(),
        };
        match self.call(&target.host, &req).await? {
            Response::Vnodes { vnodes } => Ok(vnodes),
            _ => Err(Self::unexpected("find_successors")),
        }
    }

    async fn clear_predecessor(&self, target: &Vnode, leaving: &Vnode) -> Result<()> {
        let req = Request::ClearPredecessor {
            target: target.clone(),
            leaving: leaving.clone(),
        };
        match self.call(&target.host, &req).await? {
            Response::Ack => Ok(()),
            _ => Err(Self::unexpected("clear_predecessor")),
        }
    }

    async fn skip_successor(&self, target: &Vnode, leaving: &Vnode) -> Result<()> {
        let req = Request::SkipSuccessor {
            target: target.clone(),
            leaving: leaving.clone(),
        };
        match self.call(&target.host, &req).await? {
            Response::Ack => Ok(()),
            _ => Err(Self::unexpected("skip_successor")),
        }
    }

    async fn rlock(
        &self,
        target: &Vnode,
        key: &str,
        sender_id: &str,
        sender_addr: &str,
    ) -> Result<(String, u32, u64)> {
        let req = Request::RLock {
            target: target.clone(),
            key: key.to_string(),
            sender_id: sender_id.to_string(),
            sender_addr: sender_addr.to_string(),
        };
        match self.call(&target.host, &req).await? {
            Response::Lock {
                lock_id,
                version,
                commit_point,
                ..
            } => Ok((lock_id, version, commit_point)),
            _ => Err(Self::unexpected("rlock")),
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
        let req = Request::WLock {
            target: target.clone(),
            key: key.to_string(),
            version,
            timeout_secs,
            sender_id: sender_id.to_string(),
        };
        match self.call(&target.host, &req).await? {
            Response::Lock {
                lock_id,
                version,
                timeout_secs,
                commit_point,
            } => Ok((lock_id, version, timeout_secs, commit_point)),
            _ => Err(Self::unexpected("wlock")),
        }
    }

    async fn commit_wlock(
        &self,
        target: &Vnode,
        key: &str,
        version: u32,
        sender_id: &str,
    ) -> Result<u64> {
        let req = Request::CommitWLock {
            target: target.clone(),
            key: key.to_string(),
            version,
            sender_id: sender_id.to_string(),
        };
        match self.call(&target.host, &req).await? {
            Response::CommitPoint { commit_point } => Ok(commit_point),
            _ => Err(Self::unexpected("commit_wlock")),
        }
    }

    async fn abort_wlock(
        &self,
        target: &Vnode,
        key: &str,
        version: u32,
        sender_id: &str,
    ) -> Result<u64> {
        let req = Request::AbortWLock {
            target: target.clone(),
            key: key.to_string(),
            version,
            sender_id: sender_id.to_string(),
        };
        match self.call(&target.host, &req).await? {
            Response::CommitPoint { commit_point } => Ok(commit_point),
            _ => Err(Self::unexpected("abort_wlock")),
        }
    }

    async fn invalidate_rlock(&self, target: &Vnode, lock_id: &str) -> Result<()> {
        let req = Request::InvalidateRLock {
            target: target.clone(),
            lock_id: lock_id.to_string(),
        };
        match self.call(&target.host, &req).await? {
            Response::Ack => Ok(()),
            _ => Err(Self::unexpected("invalidate_rlock")),
        }
    }

    async fn fetch_ops_log(&self, target: &Vnode) -> Result<Vec<OpsLogEntry>> {
        let req = Request::FetchOpsLog {
            target: target.clone(),
        };
        match self.call(&target.host, &req).await? {
            Response::OpsLog { entries } => Ok(entries),
            _ => Err(Self::unexpected("fetch_ops_log")),
        }
    }

    async fn update_version_map(
        &self,
        target: &Vnode,
        version_map: HashMap<String, u32>,
    ) -> Result<()> {
        let req = Request::UpdateVersionMap {
            target: target.clone(),
            version_map,
        };
        match self.call(&target.host, &req).await? {
            Response::Ack => Ok(()),
            _ => Err(Self::unexpected("update_version_map")),
        }
    }

    async fn get(&self, target: &Vnode, key: &str, version: u32) -> Result<Vec<u8>> {
        let req = Request::Get {
            target: target.clone(),
            key: key.to_string(),
            version,
        };
        match self.call(&target.host, &req).await? {
            Response::Value { value } => Ok(value),
            _ => Err(Self::unexpected("get")),
        }
    }

    async fn set(&self, target: &Vnode, key: &str, version: u32, value: Vec<u8>) -> Result<()> {
        let req = Request::Set {
            target: target.clone(),
            key: key.to_string(),
            version,
            value,
        };
        match self.call(&target.host, &req).await? {
            Response::Ack => Ok(()),
            _ => Err(Self::unexpected("set")),
        }
    }

    async fn list(&self, target: &Vnode) -> Result<Vec<String>> {
        let req = Request::List {
            target: target.clone(),
        };
        match self.call(&target.host, &req).await? {
            Response::Keys { keys } => Ok(keys),
            _ => Err(Self::unexpected("list")),
        }
    }

    async fn bulk_set(&self, target: &Vnode, key: &str, values: Vec<KvValue>) -> Result<()> {
        let req = Request::BulkSet {
            target: target.clone(),
            key: key.to_string(),
            values,
        };
        match self.call(&target.host, &req).await? {
            Response::Ack => Ok(()),
            _ => Err(Self::unexpected("bulk_set")),
        }
    }

    async fn sync_keys(
        &self,
        target: &Vnode,
        owner: &Vnode,
        key: &str,
        versions: Vec<u32>,
    ) -> Result<()> {
        let req = Request::SyncKeys {
            target: target.clone(),
            owner: owner.clone(),
            key: key.to_string(),
            versions,
        };
        match self.call(&target.host, &req).await? {
            Response::Ack => Ok(()),
            _ => Err(Self::unexpected("sync_keys")),
        }
    }

    async fn missing_keys(
        &self,
        target: &Vnode,
        replica: &Vnode,
        key: &str,
        versions: Vec<u32>,
    ) -> Result<()> {
        let req = Request::MissingKeys {
            target: target.clone(),
            replica: replica.clone(),
            key: key.to_string(),
            versions,
        };
        match self.call(&target.host, &req).await? {
            Response::Ack => Ok(()),
            _ => Err(Self::unexpected("missing_keys")),
        }
    }

    async fn purge_versions(&self, target: &Vnode, key: &str, max_version: u32) -> Result<()> {
        let req = Request::PurgeVersions {
            target: target.clone(),
            key: key.to_string(),
            max_version,
        };
        match self.call(&target.host, &req).await? {
            Response::Ack => Ok(()),
            _ => Err(Self::unexpected("purge_versions")),
        }
    }

    async fn join_ring(&self, target: &Vnode, ring_id: &str, joiner: &Vnode) -> Result<Vec<Vnode>> {
        let req = Request::JoinRing {
            target: target.clone(),
            ring_id: ring_id.to_string(),
            joiner: joiner.clone(),
        };
        match self.call(&target.host, &req).await? {
            Response::Vnodes { vnodes } => Ok(vnodes),
            _ => Err(Self::unexpected("join_ring")),
        }
    }

    async fn leave_ring(&self, target: &Vnode, ring_id: &str) -> Result<()> {
        let req = Request::LeaveRing {
            target: target.clone(),
            ring_id: ring_id.to_string(),
        };
        match self.call(&target.host, &req).await? {
            Response::Ack => Ok(()),
            _ => Err(Self::unexpected("leave_ring")),
        }
    }

    fn is_local_vnode(&self, vn: &Vnode) -> bool {
        self.registry.contains_key(&registry_key(vn))
    }

    fn register(&self, vnode: Vnode, rpc: Arc<dyn VnodeRpc>) {
        self.registry.insert(registry_key(&vnode), (vnode, rpc));
    }
}
