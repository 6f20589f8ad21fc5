//! Shared helpers for the integration tests.

use crate::config::Config;
use crate::ring::Ring;
use crate::transport::{TcpTransport, Transport};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Install a test subscriber once; `RUST_LOG` overrides the default level.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// Config tuned for tests: few vnodes and millisecond stabilization.
pub(crate) fn fast_config(host: &str, num_vnodes: usize, num_successors: usize) -> Config {
    init_tracing();
    Config::new(host)
        .with_num_vnodes(num_vnodes)
        .with_num_successors(num_successors)
        .with_stabilize(Duration::from_millis(20), Duration::from_millis(50))
        .with_ring_id("test-ring")
}

/// Bind a TCP transport on an ephemeral port and create a ring on it.
/// Returns the ring and its transport; the hostname is the bound address.
pub(crate) async fn tcp_ring(num_vnodes: usize, num_successors: usize) -> (Ring, Arc<TcpTransport>) {
    let tcp = TcpTransport::bind("127.0.0.1:0", Duration::from_millis(500))
        .await
        .expect("bind tcp transport");
    let config = fast_config(tcp.local_addr(), num_vnodes, num_successors);
    let transport: Arc<dyn Transport> = tcp.clone();
    let ring = Ring::create_with_transport(config, Some(transport))
        .await
        .expect("create ring");
    (ring, tcp)
}

/// Join an existing ring at `existing` through a fresh TCP transport.
pub(crate) async fn tcp_join(
    existing: &str,
    num_vnodes: usize,
    num_successors: usize,
) -> (Ring, Arc<TcpTransport>) {
    let tcp = TcpTransport::bind("127.0.0.1:0", Duration::from_millis(500))
        .await
        .expect("bind tcp transport");
    let config = fast_config(tcp.local_addr(), num_vnodes, num_successors);
    let transport: Arc<dyn Transport> = tcp.clone();
    let ring = Ring::join(config, transport, existing)
        .await
        .expect("join ring");
    (ring, tcp)
}
