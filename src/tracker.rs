//! Ring-id registry for multi-ring bootstrap.
//!
//! A host can participate in several rings at once; the tracker maps each
//! ring id to the vnodes known to be members, so a joiner can discover a
//! bootstrap set by asking any member host.

use crate::error::{Error, Result};
use crate::types::Vnode;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

/// In-memory ring membership registry.
#[derive(Default)]
pub struct Tracker {
    rings: Mutex<HashMap<String, Vec<Vnode>>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `joiner` as a member of `ring_id` and return the members
    /// known before it joined, for use as a bootstrap set.
    pub fn handle_join_ring(&self, ring_id: &str, joiner: Vnode) -> Result<Vec<Vnode>> {
        let mut rings = self.rings.lock();
        let members = rings.entry(ring_id.to_string()).or_default();
        let existing = members.clone();
        if !members.contains(&joiner) {
            debug!(ring_id, joiner = %joiner, "vnode joined ring registry");
            members.push(joiner);
        }
        Ok(existing)
    }

    /// Declared in the transport interface; deliberately unimplemented.
    pub fn handle_leave_ring(&self, _ring_id: &str) -> Result<()> {
        Err(Error::Unimplemented("leave_ring"))
    }

    /// Members currently registered for a ring id.
    pub fn members(&self, ring_id: &str) -> Vec<Vnode> {
        self.rings.lock().get(ring_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ID_BYTES;

    fn vn(b: u8) -> Vnode {
        Vnode::new(vec![b; ID_BYTES], format!("host-{b}"))
    }

    #[test]
    fn test_join_returns_prior_members() {
        let tracker = Tracker::new();

        let first = tracker.handle_join_ring("r", vn(1)).unwrap();
        assert!(first.is_empty());

        let second = tracker.handle_join_ring("r", vn(2)).unwrap();
        assert_eq!(second, vec![vn(1)]);

        // Re-joining does not duplicate.
        tracker.handle_join_ring("r", vn(1)).unwrap();
        assert_eq!(tracker.members("r").len(), 2);
    }

    #[test]
    fn test_rings_are_independent() {
        let tracker = Tracker::new();
        tracker.handle_join_ring("r1", vn(1)).unwrap();
        assert!(tracker.members("r2").is_empty());
    }

    #[test]
    fn test_leave_ring_unimplemented() {
        let tracker = Tracker::new();
        assert!(matches!(
            tracker.handle_leave_ring("r"),
            Err(Error::Unimplemented("leave_ring"))
        ));
    }
}
