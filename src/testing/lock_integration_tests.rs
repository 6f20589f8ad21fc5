//! Lock and storage scenarios: versioned write-read cycles, stale writes,
//! read-lock invalidation, and lock-manager handover.

#[cfg(test)]
mod tests {
    use crate::error::{Error, LockError};
    use crate::testing::utils::{fast_config, tcp_join, tcp_ring};
    use crate::transport::Transport;
    use crate::Ring;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_single_node_write_read_cycle() {
        let ring = Ring::create(fast_config("solo:7200", 1, 2)).await.unwrap();
        let lm = ring.lock_manager_vnode().await.unwrap();
        let transport = ring.core().transport();

        // Write lock assigns version 1, commit point 1.
        let (lock_id, version, timeout_secs, commit_point) =
            transport.wlock(&lm, "a", 0, 5, "n1").await.unwrap();
        assert!(!lock_id.is_empty());
        assert_eq!(version, 1);
        assert_eq!(timeout_secs, 5);
        assert_eq!(commit_point, 1);

        transport.set(&lm, "a", 1, b"hello".to_vec()).await.unwrap();

        // Commit is the second log record.
        let commit_point = transport.commit_wlock(&lm, "a", 1, "n1").await.unwrap();
        assert_eq!(commit_point, 2);

        // A read lock returns the committed version.
        let (rlock_id, rversion, _) = transport.rlock(&lm, "a", "n2", "n2:addr").await.unwrap();
        assert!(!rlock_id.is_empty());
        assert_eq!(rversion, 1);

        assert_eq!(transport.get(&lm, "a", 1).await.unwrap(), b"hello");
        assert_eq!(transport.get(&lm, "a", 0).await.unwrap(), b"hello");

        ring.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_write_rejected() {
        let ring = Ring::create(fast_config("solo:7200", 1, 2)).await.unwrap();
        let lm = ring.lock_manager_vnode().await.unwrap();
        let transport = ring.core().transport();

        let (_, v, _, _) = transport.wlock(&lm, "a", 0, 5, "n1").await.unwrap();
        transport.set(&lm, "a", v, b"hello".to_vec()).await.unwrap();
        transport.commit_wlock(&lm, "a", v, "n1").await.unwrap();

        // Requesting the already-committed version is a stale write.
        let err = transport.wlock(&lm, "a", 1, 5, "n3").await.unwrap_err();
        match err {
            Error::Lock(LockError::StaleVersion { committed, .. }) => assert_eq!(committed, 1),
            other => panic!("unexpected error: {other}"),
        }

        ring.shutdown().await;
    }

    #[tokio::test]
    async fn test_rlock_requires_a_committed_key() {
        let ring = Ring::create(fast_config("solo:7200", 1, 2)).await.unwrap();
        let lm = ring.lock_manager_vnode().await.unwrap();
        let transport = ring.core().transport();

        let err = transport.rlock(&lm, "ghost", "n1", "n1:addr").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Lock(LockError::NoCommittedVersion { .. })
        ));

        ring.shutdown().await;
    }

    #[tokio::test]
    async fn test_rlock_cache_invalidation_on_commit() {
        let ring = Ring::create(fast_config("solo:7200", 1, 2)).await.unwrap();
        let kv = ring.kv_client();
        let client = &ring.core().first_vnode().lm_client;

        assert_eq!(kv.put("a", b"hello".to_vec()).await.unwrap(), 1);

        // The first read caches its read lock.
        assert_eq!(kv.get("a").await.unwrap(), b"hello");
        let cached = client.cached_rlock("a").expect("rlock cached after read");
        assert_eq!(cached.version, 1);

        // A second committed write invalidates the cached reader.
        assert_eq!(kv.put("a", b"world".to_vec()).await.unwrap(), 2);
        assert!(
            client.cached_rlock("a").is_none(),
            "cached rlock must be dropped by invalidation"
        );

        // The next read re-acquires and sees the new version.
        assert_eq!(kv.get("a").await.unwrap(), b"world");
        assert_eq!(client.cached_rlock("a").unwrap().version, 2);

        ring.shutdown().await;
    }

    #[tokio::test]
    async fn test_version_increments_across_writes() {
        let ring = Ring::create(fast_config("solo:7200", 1, 2)).await.unwrap();
        let kv = ring.kv_client();

        for expected in 1..=4u32 {
            let payload = format!("value-{expected}").into_bytes();
            assert_eq!(kv.put("counter", payload.clone()).await.unwrap(), expected);
            assert_eq!(kv.get("counter").await.unwrap(), payload);
        }

        ring.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lock_manager_handover_keeps_versions_monotonic() {
        let (ring_a, tcp_a) = tcp_ring(2, 3).await;
        let kv_a = ring_a.kv_client();

        assert_eq!(kv_a.put("k", b"first".to_vec()).await.unwrap(), 1);

        let (ring_b, tcp_b) = tcp_join(tcp_a.local_addr(), 2, 3).await;

        // Wait until exactly one vnode across both hosts claims the lock
        // manager role, it knows about "k", and both rings route lock
        // traffic to it.
        let deadline = Instant::now() + Duration::from_secs(15);
        let mut settled = false;
        while Instant::now() < deadline && !settled {
            let current: Vec<_> = ring_a
                .core()
                .vnodes
                .iter()
                .chain(ring_b.core().vnodes.iter())
                .filter(|v| v.lm.is_current())
                .collect();
            if current.len() == 1 && current[0].lm.committed_version("k") == 1 {
                let lm_a = ring_a.lock_manager_vnode().await.ok();
                let lm_b = ring_b.lock_manager_vnode().await.ok();
                settled = lm_a.is_some()
                    && lm_a == lm_b
                    && lm_a.map(|v| v.id) == Some(current[0].vnode.id.clone());
            }
            if !settled {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        assert!(settled, "lock manager role did not settle after join");

        // A write through the joined node lands strictly after the first.
        let kv_b = ring_b.kv_client();
        assert_eq!(kv_b.put("k", b"second".to_vec()).await.unwrap(), 2);
        assert_eq!(kv_b.get("k").await.unwrap(), b"second");

        // The serving manager's log kept counting upward: two writes and
        // two commits mean at least four operations.
        let last_op = ring_a
            .core()
            .vnodes
            .iter()
            .chain(ring_b.core().vnodes.iter())
            .filter_map(|v| v.lm.ops_log_snapshot().last().map(|e| e.op_num))
            .max()
            .unwrap_or(0);
        assert!(last_op >= 4, "op-log lost history across handover: {last_op}");

        ring_b.shutdown().await;
        ring_a.shutdown().await;
        tcp_b.shutdown().await;
        tcp_a.shutdown().await;
    }
}
