//! Ring membership and routing scenarios: stabilization invariants, joins,
//! routing convergence, and successor failure.

#[cfg(test)]
mod tests {
    use crate::arithmetic::{between_right_incl, power_offset};
    use crate::testing::utils::{fast_config, tcp_join, tcp_ring};
    use crate::types::Vnode;
    use crate::Ring;
    use std::time::{Duration, Instant};

    /// First vnode whose id is `>=` the offset, wrapping past the highest.
    fn expected_finger(sorted: &[Vnode], offset: &[u8]) -> Vnode {
        sorted
            .iter()
            .find(|v| v.id.as_slice() >= offset)
            .unwrap_or(&sorted[0])
            .clone()
    }

    #[tokio::test]
    async fn test_mutual_successor_predecessor_at_quiescence() {
        let ring = Ring::create(fast_config("host-a:7100", 4, 3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let vnodes = &ring.core().vnodes;
        for vn in vnodes {
            let succ0 = vn.successor_list().await[0].clone();
            let succ_vn = vnodes.iter().find(|v| v.vnode.id == succ0.id).unwrap();
            assert_eq!(
                succ_vn.predecessor().await.unwrap(),
                vn.vnode,
                "successor's predecessor must point back"
            );

            let pred = vn.predecessor().await.unwrap();
            let pred_vn = vnodes.iter().find(|v| v.vnode.id == pred.id).unwrap();
            assert_eq!(
                pred_vn.successor_list().await[0],
                vn.vnode,
                "predecessor's successor must point back"
            );
        }
        ring.shutdown().await;
    }

    #[tokio::test]
    async fn test_finger_table_converges_to_true_successors() {
        let ring = Ring::create(fast_config("host-a:7100", 4, 3)).await.unwrap();
        let mut sorted = ring.local_vnodes();
        sorted.sort();
        let hash_bits = ring.core().config.hash_bits();

        // Wait for a full round-robin sweep of the table.
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut converged = false;
        while Instant::now() < deadline && !converged {
            converged = true;
            'scan: for vn in &ring.core().vnodes {
                for k in 0..hash_bits {
                    let offset = power_offset(&vn.vnode.id, k, hash_bits);
                    let expected = expected_finger(&sorted, &offset);
                    match vn.finger_entry(k) {
                        Some(actual) if actual.id == expected.id => {}
                        _ => {
                            converged = false;
                            break 'scan;
                        }
                    }
                }
            }
            if !converged {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        assert!(converged, "finger tables did not converge");
        ring.shutdown().await;
    }

    #[tokio::test]
    async fn test_finger_entries_satisfy_interval_property() {
        let ring = Ring::create(fast_config("host-a:7100", 4, 3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let hash_bits = ring.core().config.hash_bits();
        for vn in &ring.core().vnodes {
            for k in 0..hash_bits {
                if let Some(entry) = vn.finger_entry(k) {
                    let offset = power_offset(&vn.vnode.id, k, hash_bits);
                    assert!(
                        between_right_incl(&vn.vnode.id, &entry.id, &offset)
                            || entry.id == vn.vnode.id,
                        "finger[{k}] does not cover its offset"
                    );
                }
            }
        }
        ring.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_and_routing_convergence() {
        let (ring_a, tcp_a) = tcp_ring(2, 3).await;
        let (ring_b, tcp_b) = tcp_join(tcp_a.local_addr(), 2, 3).await;

        // Both nodes resolve the same owner for the same key once
        // stabilization has run.
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut agreed = false;
        while Instant::now() < deadline && !agreed {
            let a = ring_a.lookup(1, b"x").await;
            let b = ring_b.lookup(1, b"x").await;
            if let (Ok(a), Ok(b)) = (a, b) {
                agreed = !a.is_empty() && a == b;
            }
            if !agreed {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        assert!(agreed, "lookups did not converge after join");

        ring_b.shutdown().await;
        ring_a.shutdown().await;
        tcp_b.shutdown().await;
        tcp_a.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_sees_both_hosts_in_routing() {
        let (ring_a, tcp_a) = tcp_ring(2, 3).await;
        let (ring_b, tcp_b) = tcp_join(tcp_a.local_addr(), 2, 3).await;

        let host_a = tcp_a.local_addr().to_string();
        let host_b = tcp_b.local_addr().to_string();

        // Some key must land on each host once ownership has spread.
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut both_seen = false;
        while Instant::now() < deadline && !both_seen {
            let mut seen_a = false;
            let mut seen_b = false;
            for i in 0..32u32 {
                let key = format!("probe-{i}");
                if let Ok(found) = ring_a.lookup(1, key.as_bytes()).await {
                    if let Some(owner) = found.first() {
                        seen_a |= owner.host == host_a;
                        seen_b |= owner.host == host_b;
                    }
                }
            }
            both_seen = seen_a && seen_b;
            if !both_seen {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        assert!(both_seen, "ownership never spread across hosts");

        ring_b.shutdown().await;
        ring_a.shutdown().await;
        tcp_b.shutdown().await;
        tcp_a.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_successor_failure_recovery() {
        let (ring_a, tcp_a) = tcp_ring(2, 4).await;
        let (ring_b, tcp_b) = tcp_join(tcp_a.local_addr(), 2, 4).await;
        let (ring_c, tcp_c) = tcp_join(tcp_a.local_addr(), 2, 4).await;

        // Let the three-host ring converge first.
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut converged = false;
        while Instant::now() < deadline && !converged {
            let a = ring_a.lookup(1, b"stable-key").await;
            let c = ring_c.lookup(1, b"stable-key").await;
            if let (Ok(a), Ok(c)) = (a, c) {
                converged = !a.is_empty() && a == c;
            }
            if !converged {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        assert!(converged, "three-node ring did not converge");

        // Kill the middle node without a graceful leave.
        let host_b = tcp_b.local_addr().to_string();
        ring_b.shutdown().await;
        tcp_b.shutdown().await;

        // Within a bounded number of rounds the survivors' views exclude
        // the dead host and lookups still resolve.
        let deadline = Instant::now() + Duration::from_secs(20);
        let mut healed = false;
        while Instant::now() < deadline && !healed {
            let mut all_good = true;
            for i in 0..8u32 {
                let key = format!("after-failure-{i}");
                let a = ring_a.lookup(1, key.as_bytes()).await;
                let c = ring_c.lookup(1, key.as_bytes()).await;
                match (a, c) {
                    (Ok(a), Ok(c))
                        if !a.is_empty() && a == c && a[0].host != host_b => {}
                    _ => {
                        all_good = false;
                        break;
                    }
                }
            }
            healed = all_good;
            if !healed {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        assert!(healed, "ring did not heal after successor failure");

        ring_c.shutdown().await;
        ring_a.shutdown().await;
        tcp_c.shutdown().await;
        tcp_a.shutdown().await;
    }
}
