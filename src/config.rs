//! Ring configuration and the pluggable identifier hash.

use crate::delegate::RingDelegate;
use sha1::{Digest, Sha1};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Hash function used to place hosts and keys on the identifier circle.
///
/// The ring's identifier space is `2^(output_len() * 8)`; every id produced
/// by one ring must come from the same hasher. The default is SHA-1, giving
/// the 160-bit space the wire format is built around.
pub trait IdHasher: Send + Sync {
    /// Output size in bytes.
    fn output_len(&self) -> usize;

    /// Digest the concatenation of `parts`.
    fn digest(&self, parts: &[&[u8]]) -> Vec<u8>;
}

/// SHA-1 based identifier hash (160-bit ids).
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha1Hasher;

impl IdHasher for Sha1Hasher {
    fn output_len(&self) -> usize {
        20
    }

    fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().to_vec()
    }
}

/// Configuration for a ring node. All knobs are explicit fields; the
/// constructor seeds the defaults the original deployment ran with.
#[derive(Clone)]
pub struct Config {
    /// Local host identifier, `host:port` for TCP rings.
    pub hostname: String,

    /// Number of vnodes this physical node hosts.
    pub num_vnodes: usize,

    /// Identifier hash; determines the size of the id space.
    pub hasher: Arc<dyn IdHasher>,

    /// Minimum delay between stabilization rounds.
    pub stabilize_min: Duration,

    /// Maximum delay between stabilization rounds.
    pub stabilize_max: Duration,

    /// Number of successors (and replicas) each vnode maintains.
    pub num_successors: usize,

    /// Optional delegate invoked on ring events.
    pub delegate: Option<Arc<dyn RingDelegate>>,

    /// Label identifying this ring; its hash locates the lock manager.
    pub ring_id: String,
}

impl Config {
    /// Create a configuration with the stock parameters: 8 vnodes, SHA-1
    /// ids, 5-15 s stabilization, 8 successors, no delegate.
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            num_vnodes: 8,
            hasher: Arc::new(Sha1Hasher),
            stabilize_min: Duration::from_secs(5),
            stabilize_max: Duration::from_secs(15),
            num_successors: 8,
            delegate: None,
            ring_id: String::new(),
        }
    }

    pub fn with_num_vnodes(mut self, n: usize) -> Self {
        self.num_vnodes = n;
        self
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn IdHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn with_stabilize(mut self, min: Duration, max: Duration) -> Self {
        self.stabilize_min = min;
        self.stabilize_max = max;
        self
    }

    pub fn with_num_successors(mut self, n: usize) -> Self {
        self.num_successors = n;
        self
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn RingDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn with_ring_id(mut self, ring_id: impl Into<String>) -> Self {
        self.ring_id = ring_id.into();
        self
    }

    /// Bit size of the identifier space, derived from the hasher.
    pub fn hash_bits(&self) -> usize {
        self.hasher.output_len() * 8
    }

    /// Validate the configuration, failing fast on operator error.
    pub fn validate(&self) -> Result<(), String> {
        if self.hostname.is_empty() {
            return Err("hostname must not be empty".to_string());
        }
        if self.num_vnodes == 0 {
            return Err("num_vnodes must be at least 1".to_string());
        }
        if self.num_successors == 0 {
            return Err("num_successors must be at least 1".to_string());
        }
        if self.stabilize_min >= self.stabilize_max {
            return Err(format!(
                "stabilize_min ({:?}) must be below stabilize_max ({:?})",
                self.stabilize_min, self.stabilize_max
            ));
        }
        if self.hasher.output_len() == 0 {
            return Err("hasher output must be non-empty".to_string());
        }
        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("hostname", &self.hostname)
            .field("num_vnodes", &self.num_vnodes)
            .field("hash_bits", &self.hash_bits())
            .field("stabilize_min", &self.stabilize_min)
            .field("stabilize_max", &self.stabilize_max)
            .field("num_successors", &self.num_successors)
            .field("delegate", &self.delegate.is_some())
            .field("ring_id", &self.ring_id)
            .finish()
    }
}
