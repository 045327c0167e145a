//! Concurrent access tests for `MemoryTransport`.
//!
//! Many simulated processes race for the same advisory lock and guarded
//! writes; the in-memory backend must behave like a single atomic store.

#![allow(clippy::expect_used, clippy::panic)]

use std::time::Duration;

use connector_cluster_transport::{ClusterTransport, MemoryCluster};
use tokio::task::JoinSet;

/// Number of simulated processes.
const PROCESSES: usize = 16;

/// Number of lock contention rounds.
const ROUNDS: usize = 50;

const TTL: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Test: exactly one lock winner per round
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lock_exactly_one_winner_per_round() {
    let cluster = MemoryCluster::new();
    let processes: Vec<_> = (0..PROCESSES).map(|_| cluster.connect()).collect();

    for round in 0..ROUNDS {
        let key = format!("round-{round}");
        let mut set = JoinSet::new();
        for process in &processes {
            let process = process.clone();
            let key = key.clone();
            set.spawn(async move {
                let won = process.lock(&key, TTL, false).await.expect("lock should not error");
                (won, process.sender_id().to_owned())
            });
        }

        let mut winners = Vec::new();
        while let Some(result) = set.join_next().await {
            let (won, id) = result.expect("task should not panic");
            if won {
                winners.push(id);
            }
        }

        assert_eq!(winners.len(), 1, "round {round}: exactly one process should win");
        assert_eq!(cluster.lock_owner(&key).as_deref(), Some(winners[0].as_str()));
    }
}

// ---------------------------------------------------------------------------
// Test: guarded writes never land for non-owners
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn guarded_writes_only_from_owner() {
    let cluster = MemoryCluster::new();
    let owner = cluster.connect();
    assert!(owner.lock("guard", TTL, false).await.expect("lock"));

    let mut set = JoinSet::new();
    for i in 0..PROCESSES {
        let process = cluster.connect();
        set.spawn(async move {
            process
                .store("value", format!("intruder-{i}").into_bytes(), None, Some("guard"))
                .await
                .expect("store should not error")
        });
    }
    let owner_write = owner.store("value", b"owner".to_vec(), None, Some("guard"));
    assert!(owner_write.await.expect("owner store"));

    while let Some(result) = set.join_next().await {
        assert!(!result.expect("task should not panic"), "non-owner write must be rejected");
    }

    let stored = owner.get("value").await.expect("get").expect("value present");
    assert_eq!(stored.as_ref(), b"owner");
}

// ---------------------------------------------------------------------------
// Test: lock handoff under forced pre-emption
// ---------------------------------------------------------------------------

#[tokio::test]
async fn forced_preemption_invalidates_previous_owner() {
    let cluster = MemoryCluster::new();
    let first = cluster.connect();
    let second = cluster.connect();

    assert!(first.lock("l", TTL, false).await.expect("lock"));
    assert!(second.lock("l", TTL, true).await.expect("force lock"));

    // The first owner's release attempt must not remove the new owner's record.
    assert!(!first.unlock("l", first.sender_id(), false).await.expect("unlock"));
    assert_eq!(cluster.lock_owner("l").as_deref(), Some(second.sender_id()));
}
