//! Testing utilities and end-to-end scenarios.
//!
//! The integration tests build real rings (loopback-only for single-host
//! scenarios, TCP-backed for joins, handover, and failure cases) and
//! assert the protocol's observable guarantees: mutual successor and
//! predecessor agreement at quiescence, lookup convergence, lock and
//! version semantics, and op-log continuity across manager handover.

mod lock_integration_tests;
mod ring_integration_tests;
#[cfg(test)]
mod utils;

use std::time::{Duration, Instant};

/// Assertions for eventually-consistent state.
pub struct TestAssertions;

impl TestAssertions {
    /// Poll `condition` until it holds or `timeout` elapses.
    pub async fn wait_for<F>(condition: F, timeout: Duration) -> bool
    where
        F: Fn() -> bool,
    {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Poll an async `action` until `predicate` accepts its result or
    /// `timeout` elapses; returns the accepted result.
    pub async fn wait_for_result<F, Fut, T, P>(
        mut action: F,
        predicate: P,
        timeout: Duration,
    ) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = T>,
        P: Fn(&T) -> bool,
    {
        let start = Instant::now();
        while start.elapsed() < timeout {
            let result = action().await;
            if predicate(&result) {
                return Some(result);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag_clone.store(true, Ordering::Relaxed);
        });

        let ok = TestAssertions::wait_for(
            || flag.load(Ordering::Relaxed),
            Duration::from_millis(500),
        )
        .await;
        assert!(ok);
    }

    #[tokio::test]
    async fn test_wait_for_result_times_out() {
        let got =
            TestAssertions::wait_for_result(|| async { 1 }, |v| *v == 2, Duration::from_millis(100))
                .await;
        assert!(got.is_none());
    }
}
