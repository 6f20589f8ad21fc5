//! Versioned lock management: the per-vnode lock manager server and the
//! client-side lock bookkeeping with its read-lock cache.

pub mod client;
pub mod manager;

pub use client::{LockClient, RLockVal, WLockVal};
pub use manager::{LockManager, RLockHolder, WLockEntry};
