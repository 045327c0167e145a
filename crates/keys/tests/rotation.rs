//! Multi-process key rotation tests over an in-memory cluster.
//!
//! All tests run on tokio's paused clock with a `TokioClock`, so epoch
//! timestamps in key sets move exactly with `tokio::time::advance`.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use connector_cluster_keys::{
    JobStatus, KeyError, KeyGenerator, KeyRotationCoordinator, KeySet, RotationBlock, RotationConfig,
    RotationMessage, RotationOutcome,
    testutil::{FailingKeyGenerator, SequenceKeyGenerator, start_process, test_config},
};
use connector_cluster_transport::{
    Clock, ClusterTransport, ConfigError, ConnectionEvent, MemoryCluster, MemoryTransport, Namespace,
    SharedClock, TransportExt, decode_payload,
    testutil::{TokioClock, connect_processes},
};
use tokio::{task::JoinSet, time::sleep};

fn namespace() -> Namespace {
    Namespace::new("connector")
}

/// Lets listener tasks drain their channels.
async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

async fn start_all(processes: &[MemoryTransport], clock: &SharedClock) -> Vec<KeyRotationCoordinator> {
    let mut coordinators = Vec::new();
    for process in processes {
        let coordinator = start_process(Arc::new(process.clone()), test_config(), Arc::clone(clock))
            .await
            .expect("start coordinator");
        coordinators.push(coordinator);
    }
    coordinators
}

/// Two processes sharing an initial key set.
async fn two_processes() -> (MemoryCluster, Vec<KeyRotationCoordinator>, SharedClock) {
    let (cluster, processes) = connect_processes(2);
    let clock = TokioClock::fixed().shared();
    let coordinators = start_all(&processes, &clock).await;
    for coordinator in &coordinators {
        coordinator.generate_keys().await.expect("key set");
    }
    (cluster, coordinators, clock)
}

fn generation(coordinator: &KeyRotationCoordinator) -> u64 {
    coordinator.key_set().expect("local key set").generation
}

// ---------------------------------------------------------------------------
// Cold start
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrent_cold_start_creates_one_key_set() {
    let (cluster, processes) = connect_processes(5);
    let clock = TokioClock::fixed().shared();
    let coordinators: Vec<_> = start_all(&processes, &clock).await.into_iter().map(Arc::new).collect();

    let mut set = JoinSet::new();
    for coordinator in &coordinators {
        let coordinator = Arc::clone(coordinator);
        set.spawn(async move { coordinator.generate_keys().await.map(|k| k.current.kid.clone()) });
    }
    let mut kids = Vec::new();
    while let Some(result) = set.join_next().await {
        kids.push(result.unwrap().expect("every process obtains keys"));
    }

    kids.dedup();
    assert_eq!(kids.len(), 1, "all processes must agree on one key: {kids:?}");

    let stored: KeySet =
        cluster.connect().get_json(&namespace().key_set()).await.unwrap().expect("stored key set");
    assert_eq!(stored.current.kid, kids[0]);
    assert_eq!(stored.generation, 1);
    assert_eq!(stored.current_start, None);
    assert_eq!(cluster.lock_owner(&namespace().rotation_lock()), None);
}

#[tokio::test(start_paused = true)]
async fn later_process_adopts_stored_key_set() {
    let (_cluster, processes) = connect_processes(2);
    let clock = TokioClock::fixed().shared();
    let first = start_process(Arc::new(processes[0].clone()), test_config(), Arc::clone(&clock))
        .await
        .unwrap();
    let created = first.generate_keys().await.unwrap();

    let generator = SequenceKeyGenerator::new("late");
    let late = KeyRotationCoordinator::start_with(
        Arc::new(processes[1].clone()),
        test_config(),
        Arc::new(generator.clone()),
        clock,
    )
    .await
    .unwrap();

    assert_eq!(late.active_keys().await.unwrap().kid, created.current.kid);
    assert_eq!(generator.generated(), 0, "adopting must not generate keys");
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_report_no_key_set() {
    let cluster = MemoryCluster::new();
    let generator = FailingKeyGenerator::default();
    let config = RotationConfig::builder()
        .generate_attempts(3)
        .attempt_delay(Duration::from_millis(10))
        .build()
        .unwrap();
    let coordinator = KeyRotationCoordinator::start_with(
        Arc::new(cluster.connect()),
        config,
        Arc::new(generator.clone()),
        TokioClock::fixed().shared(),
    )
    .await
    .unwrap();

    let result = coordinator.generate_keys().await;
    assert!(matches!(result, Err(KeyError::NoKeySet { attempts: 3 })), "got {result:?}");
    assert_eq!(generator.calls(), 3);
    assert!(coordinator.active_keys().await.is_err());
    assert_eq!(cluster.lock_owner(&namespace().rotation_lock()), None);
}

// ---------------------------------------------------------------------------
// Rotation windows
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn rotation_respects_activation_and_grace_windows() {
    let (cluster, coordinators, _clock) = two_processes().await;
    let a = &coordinators[0];

    assert!(a.rotate().await.is_rotated());
    settle().await;
    let published = cluster.published_count();

    match a.rotate().await {
        RotationOutcome::Skipped { reason, key_set } => {
            assert_eq!(reason, RotationBlock::ActivationPending);
            assert_eq!(key_set.generation, 2);
        },
        other => panic!("expected skip, got {other:?}"),
    }
    assert_eq!(cluster.published_count(), published, "a skipped rotation broadcasts nothing");

    tokio::time::advance(Duration::from_secs(121)).await;
    match a.rotate().await {
        RotationOutcome::Skipped { reason, .. } => assert_eq!(reason, RotationBlock::GraceWindowOpen),
        other => panic!("expected skip, got {other:?}"),
    }

    tokio::time::advance(Duration::from_secs(480)).await;
    let outcome = a.rotate().await;
    assert_eq!(outcome.key_set().map(|k| k.generation), Some(3));
}

#[tokio::test(start_paused = true)]
async fn rotated_key_activates_everywhere_at_start() {
    let (_cluster, coordinators, _clock) = two_processes().await;
    let (a, b) = (&coordinators[0], &coordinators[1]);
    let old = b.active_keys().await.unwrap().kid;
    let mut watcher = b.subscribe_active_key();

    let RotationOutcome::Rotated(rotated) = a.rotate().await else {
        panic!("first rotation must succeed");
    };
    let new = rotated.current.kid.clone();
    settle().await;

    assert_eq!(generation(b), 2, "broadcast must reach the peer");
    for process in [a, b] {
        assert_eq!(process.active_keys().await.unwrap().kid, old, "new key must wait for its start");
        let kids: Vec<_> = process.public_keys().await.unwrap().into_iter().map(|k| k.kid).collect();
        assert_eq!(kids, [new.clone(), old.clone()]);
    }
    assert!(!watcher.has_changed().unwrap());

    tokio::time::advance(Duration::from_secs(119)).await;
    settle().await;
    assert_eq!(b.active_keys().await.unwrap().kid, old);

    tokio::time::advance(Duration::from_secs(2)).await;
    settle().await;
    for process in [a, b] {
        assert_eq!(process.active_keys().await.unwrap().kid, new);
        assert_eq!(process.public_keys().await.unwrap().len(), 2);
    }
    assert!(watcher.has_changed().unwrap(), "activation must notify watchers");
    assert_eq!(watcher.borrow_and_update().as_ref().map(|k| k.kid.clone()), Some(new.clone()));

    tokio::time::advance(Duration::from_secs(480)).await;
    for process in [a, b] {
        let kids: Vec<_> = process.public_keys().await.unwrap().into_iter().map(|k| k.kid).collect();
        assert_eq!(kids, [new.clone()], "previous key leaves after its grace window");
    }
}

#[tokio::test(start_paused = true)]
async fn scheduled_rotation_runs_on_interval() {
    let cluster = MemoryCluster::new();
    let config = RotationConfig::builder().rotation_interval(Duration::from_secs(3_600)).build().unwrap();
    let coordinator = start_process(Arc::new(cluster.connect()), config, TokioClock::fixed().shared())
        .await
        .unwrap();
    coordinator.generate_keys().await.unwrap();

    tokio::time::advance(Duration::from_secs(3_601)).await;
    settle().await;
    assert_eq!(generation(&coordinator), 2);
}

#[rstest::rstest]
#[case::zero_interval(r#"{"rotation_interval": "0s"}"#, "rotation_interval")]
#[case::zero_heartbeat(r#"{"job_heartbeat": "0s"}"#, "job_heartbeat")]
#[tokio::test(start_paused = true)]
async fn invalid_deserialized_config_is_rejected_at_start(#[case] raw: &str, #[case] field: &str) {
    let config: RotationConfig = serde_json::from_str(raw).unwrap();
    let cluster = MemoryCluster::new();
    let result = start_process(Arc::new(cluster.connect()), config, TokioClock::fixed().shared()).await;
    match result {
        Err(KeyError::Config(ConfigError::BelowMinimum { field: rejected, .. })) => assert_eq!(rejected, field),
        other => panic!("expected config error, got {other:?}"),
    }
    assert_eq!(cluster.listener_count(&namespace().rotation_channel()), 0, "nothing subscribed");
}

// ---------------------------------------------------------------------------
// Message loss and recovery
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn lost_outcome_recovered_at_lock_expiry() {
    let (cluster, coordinators, clock) = two_processes().await;
    let b = &coordinators[1];
    let rogue = cluster.connect_as("rogue");

    rogue
        .publish_json(&namespace().rotation_channel(), &RotationMessage::PendingJwksUpdate {
            process_id: "attempt-1".into(),
            end_of_lock_time: clock.now_millis() + 30_000,
        })
        .await
        .unwrap();
    settle().await;
    assert_eq!(b.pending_rotations(), 1);

    let current = b.key_set().unwrap();
    let rotated = current.rotated(
        SequenceKeyGenerator::new("rogue").generate().await.unwrap(),
        clock.now_secs(),
        120,
        600,
    );
    rogue.store_json(&namespace().key_set(), &rotated, None, None).await.unwrap();
    settle().await;
    assert_eq!(generation(b), 1, "store writes alone are not observed");

    tokio::time::advance(Duration::from_secs(31)).await;
    settle().await;
    assert_eq!(generation(b), 2, "fallback must re-read the store");
    assert_eq!(b.pending_rotations(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_rotation_clears_pending() {
    let (cluster, coordinators, clock) = two_processes().await;
    let b = &coordinators[1];
    let rogue = cluster.connect_as("rogue");
    let channel = namespace().rotation_channel();

    rogue
        .publish_json(&channel, &RotationMessage::PendingJwksUpdate {
            process_id: "attempt-1".into(),
            end_of_lock_time: clock.now_millis() + 30_000,
        })
        .await
        .unwrap();
    settle().await;
    assert_eq!(b.pending_rotations(), 1);

    rogue
        .publish_json(&channel, &RotationMessage::CancelPendingJwksUpdate { process_id: "attempt-1".into() })
        .await
        .unwrap();
    settle().await;
    assert_eq!(b.pending_rotations(), 0);
    assert_eq!(generation(b), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_resyncs_missed_rotation() {
    let (cluster, coordinators, _clock) = two_processes().await;
    let (a, b) = (&coordinators[0], &coordinators[1]);

    cluster.set_message_loss(true);
    assert!(a.rotate().await.is_rotated());
    cluster.set_message_loss(false);
    settle().await;
    assert_eq!(generation(b), 1);
    assert_eq!(b.pending_rotations(), 0, "announcement was lost too");

    cluster.emit_lifecycle(ConnectionEvent::SubscriberReconnected);
    settle().await;
    assert_eq!(generation(b), 2);
}

#[tokio::test(start_paused = true)]
async fn stale_broadcast_does_not_regress_key_set() {
    let (cluster, coordinators, _clock) = two_processes().await;
    let (a, b) = (&coordinators[0], &coordinators[1]);
    let original = b.key_set().unwrap();

    assert!(a.rotate().await.is_rotated());
    settle().await;
    assert_eq!(generation(b), 2);

    cluster
        .connect_as("rogue")
        .publish_json(&namespace().rotation_channel(), &RotationMessage::NewJwksAvailable {
            process_id: "replayed".into(),
            serialized_key_set: serde_json::to_string(&*original).unwrap(),
        })
        .await
        .unwrap();
    settle().await;
    assert_eq!(generation(b), 2);
}

#[tokio::test(start_paused = true)]
async fn malformed_messages_are_dropped() {
    let (cluster, coordinators, _clock) = two_processes().await;
    let b = &coordinators[1];
    let rogue = cluster.connect_as("rogue");
    let channel = namespace().rotation_channel();

    rogue.publish(&channel, serde_json::json!({"no-event": true})).await.unwrap();
    rogue.publish(&channel, serde_json::json!({"event": "reboot-cluster"})).await.unwrap();
    rogue
        .publish(
            &channel,
            serde_json::json!({"event": "new-jwks-available", "processId": "x", "serializedKeySet": "{"}),
        )
        .await
        .unwrap();
    settle().await;

    assert!(!b.is_stopped());
    assert_eq!(generation(b), 1);
}

// ---------------------------------------------------------------------------
// Requests and replies
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn active_key_digests_agree() {
    let (_cluster, coordinators, _clock) = two_processes().await;
    let digests = coordinators[0].collect_active_keys(Duration::from_secs(1)).await.unwrap();

    assert_eq!(digests.keys().collect::<Vec<_>>(), ["process-0", "process-1"]);
    let values: Vec<_> = digests.values().collect();
    assert_eq!(values[0], values[1]);
    let expected = coordinators[1].active_keys().await.unwrap().public_key.md5_hex().unwrap();
    assert_eq!(values[0], &expected);
}

#[tokio::test(start_paused = true)]
async fn requested_rotation_reports_job_status() {
    let (_cluster, coordinators, _clock) = two_processes().await;
    let (a, b) = (&coordinators[0], &coordinators[1]);

    let mut replies = a.request_rotation(Some("nightly".into())).await.unwrap();
    let mut statuses = Vec::new();
    while let Some(envelope) = tokio::time::timeout(Duration::from_secs(10), replies.recv()).await.unwrap() {
        let RotationMessage::JobStatus { process_id, job_name, status } = decode_payload(&envelope).unwrap()
        else {
            panic!("unexpected reply");
        };
        assert_eq!(process_id, "process-1");
        assert_eq!(job_name.as_deref(), Some("nightly"));
        let terminal = status.is_terminal();
        statuses.push(status);
        if terminal {
            break;
        }
    }

    assert_eq!(statuses.first(), Some(&JobStatus::Started));
    assert_eq!(statuses.last(), Some(&JobStatus::Finished { rotated: true }));
    settle().await;
    assert_eq!(generation(a), 2, "the requester adopts the rotated key set");
    assert_eq!(generation(b), 2);
}

#[tokio::test(start_paused = true)]
async fn stale_rotation_request_is_ignored() {
    let (cluster, coordinators, clock) = two_processes().await;
    let rogue = cluster.connect_as("rogue");
    let reply_channel = namespace().key_provider_reply("stale");
    let mut replies = rogue.subscribe(&reply_channel, false).await.unwrap();

    rogue
        .publish_json(&namespace().rotation_channel(), &RotationMessage::RequestUpdateSystemJwks {
            listening_channel: reply_channel,
            request_time: clock.now_millis() - 120_000,
            job_name: None,
        })
        .await
        .unwrap();
    settle().await;

    assert!(replies.try_recv().is_none());
    assert!(coordinators.iter().all(|c| generation(c) == 1));
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_listener() {
    let (cluster, coordinators, _clock) = two_processes().await;
    let channel = namespace().rotation_channel();
    assert_eq!(cluster.listener_count(&channel), 2);

    coordinators[0].shutdown();
    coordinators[0].shutdown();
    settle().await;
    assert!(coordinators[0].is_stopped());
    assert_eq!(cluster.listener_count(&channel), 1);

    drop(coordinators);
    settle().await;
    assert_eq!(cluster.listener_count(&channel), 0);
}

/// Generator that never completes.
#[derive(Debug)]
struct StalledKeyGenerator;

#[async_trait::async_trait]
impl KeyGenerator for StalledKeyGenerator {
    async fn generate(&self) -> connector_cluster_keys::Result<connector_cluster_keys::KeyPair> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_mid_rotation_releases_lock() {
    let (cluster, processes) = connect_processes(2);
    let clock = TokioClock::fixed().shared();
    let requester = start_process(Arc::new(processes[0].clone()), test_config(), Arc::clone(&clock))
        .await
        .unwrap();
    requester.generate_keys().await.unwrap();
    let stalled = KeyRotationCoordinator::start_with(
        Arc::new(processes[1].clone()),
        test_config(),
        Arc::new(StalledKeyGenerator),
        clock,
    )
    .await
    .unwrap();
    stalled.generate_keys().await.unwrap();

    let _replies = requester.request_rotation(None).await.unwrap();
    let lock = namespace().rotation_lock();
    settle().await;
    assert_eq!(cluster.lock_owner(&lock).as_deref(), Some("process-1"), "job is generating under the lock");

    stalled.shutdown();
    settle().await;
    assert_eq!(cluster.lock_owner(&lock), None);
    assert!(requester.rotate().await.is_rotated(), "the next rotation is not blocked for a lock TTL");
}
