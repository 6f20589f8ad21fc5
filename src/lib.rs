//! Distributed key-value store on a Chord-style consistent-hashing ring.
//!
//! Each physical node hosts several *virtual nodes* (vnodes) that maintain
//! the ring through periodic stabilization. One ring member at a time acts
//! as the *lock manager* for the ring: clients take versioned read/write
//! locks on keys, mutate replicated multi-version storage, then commit.
//! The lock manager records every operation in an append-only log so its
//! role can migrate when the ring topology changes.
//!
//! # Example
//!
//! ```rust,no_run
//! use ringstore::{Config, Ring, TcpTransport, Transport};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let tcp = TcpTransport::bind("127.0.0.1:4000", Duration::from_secs(2)).await?;
//!     let config = Config::new(tcp.local_addr())
//!         .with_ring_id("demo-ring");
//!
//!     let transport: Arc<dyn Transport> = tcp.clone();
//!     let ring = Ring::create_with_transport(config, Some(transport)).await?;
//!
//!     let kv = ring.kv_client();
//!     kv.put("user:123", b"alice".to_vec()).await?;
//!     let value = kv.get("user:123").await?;
//!     println!("read back {:?}", value);
//!
//!     ring.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 Application                   │
//! └───────────────────────────────────────────────┘
//!          │ get/put             │ ring events
//!          ▼                     ▼
//! ┌────────────────┐     ┌──────────────┐
//! │    KvClient    │     │ RingDelegate │
//! └────────────────┘     └──────────────┘
//!          │
//!          ▼
//! ┌───────────────────────────────────────────────┐
//! │  Ring: vnodes ── stabilization ── routing     │
//! │   ├─ LockManager (version map + op-log)       │
//! │   ├─ LockClient  (RLock cache)                │
//! │   └─ KvStore     (multi-version, replicated)  │
//! └───────────────────────────────────────────────┘
//!          │
//!          ▼
//! ┌───────────────────────────────────────────────┐
//! │  Transport: loopback / TCP (framed bincode)   │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! # Consistency model
//!
//! - Writes serialize through the ring's lock manager; committed versions
//!   are monotonic per key, within a manager term and across handovers.
//! - Reads are versioned: a read lock returns the committed version to
//!   fetch, and cached read locks are invalidated when the key changes.
//! - Ring membership is eventually consistent; stabilization converges
//!   views within a bounded number of rounds.

pub mod arithmetic;
pub mod config;
pub mod delegate;
pub mod error;
pub mod kv_client;
pub mod lock;
pub mod ring;
pub mod store;
pub mod tracker;
pub mod transport;
pub mod types;

pub mod testing;

mod vnode;

pub use config::{Config, IdHasher, Sha1Hasher};
pub use delegate::RingDelegate;
pub use error::{Error, LockError, Result, StoreError, TransportError};
pub use kv_client::KvClient;
pub use lock::{LockClient, LockManager, RLockVal, WLockVal};
pub use ring::Ring;
pub use store::KvStore;
pub use testing::TestAssertions;
pub use tracker::Tracker;
pub use transport::{LocalTransport, TcpTransport, Transport, VnodeRpc};
pub use types::{KvValue, LockOp, OpsLogEntry, Vnode, ID_BYTES};
