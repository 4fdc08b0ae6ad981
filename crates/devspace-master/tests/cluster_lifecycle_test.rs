// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle operations across several masters sharing one in-memory group.

mod common;

use std::time::{Duration, Instant};

use devspace_core::{RuntimeError, Subject, WorkspaceStatus};
use devspace_master::StopOptions;
use devspace_master::cluster::{LockError, PartitionPolicy};
use futures::future::join_all;

use common::{World, drain, owner, settle};

#[tokio::test]
async fn test_concurrent_starts_on_every_node_run_once() {
    let world = World::new(Duration::from_millis(100));
    world.add_workspace("w1", None).await;
    let (_group, nodes) = world
        .cluster("masters", &["n1", "n2", "n3"], PartitionPolicy::FailOpen)
        .await;
    let mut started: Vec<_> = nodes.iter().map(|n| n.bus.started().subscribe()).collect();

    let subject = owner();
    let results = join_all(
        nodes
            .iter()
            .map(|n| n.runtimes.start_workspace(&subject, "w1", None)),
    )
    .await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(RuntimeError::is_conflict)
    );

    let runtimes = nodes[0].runtimes.list_runtimes().await.unwrap();
    assert_eq!(runtimes.len(), 1);
    assert_eq!(runtimes[0].status, WorkspaceStatus::Running);

    // Every node learns about the start exactly once, locally or through replication.
    settle().await;
    for rx in &mut started {
        let events = drain(rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].identity.workspace_id, "w1");
    }
}

#[tokio::test]
async fn test_different_workspaces_start_in_parallel() {
    let delay = Duration::from_millis(300);
    let world = World::new(delay);
    for id in ["w1", "w2", "w3"] {
        world.add_workspace(id, None).await;
    }
    let (_group, nodes) = world
        .cluster("masters", &["n1", "n2", "n3"], PartitionPolicy::FailOpen)
        .await;

    let subject = owner();
    let begin = Instant::now();
    let results = join_all(
        nodes
            .iter()
            .zip(["w1", "w2", "w3"])
            .map(|(n, id)| n.runtimes.start_workspace(&subject, id, None)),
    )
    .await;

    assert!(results.iter().all(Result::is_ok));
    assert!(begin.elapsed() < delay * 3);
}

#[tokio::test]
async fn test_stop_from_another_node() {
    let world = World::new(Duration::ZERO);
    world.add_workspace("w1", None).await;
    let (_group, nodes) = world
        .cluster("masters", &["n1", "n2"], PartitionPolicy::FailOpen)
        .await;
    let mut stopped_on_n1 = nodes[0].bus.stopped().subscribe();

    let subject = owner();
    nodes[0]
        .runtimes
        .start_workspace(&subject, "w1", None)
        .await
        .unwrap();
    nodes[1]
        .runtimes
        .stop_workspace(&subject, "w1", StopOptions::default())
        .await
        .unwrap();

    assert_eq!(
        nodes[0].runtimes.get_status("w1").await.unwrap(),
        WorkspaceStatus::Stopped
    );
    // The runtime was removed from the shared backend.
    assert!(!world.noop.kill("w1"));

    let event = tokio::time::timeout(Duration::from_secs(1), stopped_on_n1.recv())
        .await
        .expect("stopped event not replicated")
        .unwrap();
    assert_eq!(event.workspace_id, "w1");
    assert_eq!(event.stopped_by.as_deref(), Some(common::OWNER));
}

#[tokio::test]
async fn test_held_lock_turns_remote_start_into_conflict() {
    let mut world = World::new(Duration::ZERO);
    world.lock_timeout = Duration::from_millis(200);
    world.add_workspace("w1", None).await;
    let (_group, nodes) = world
        .cluster("masters", &["n1", "n2"], PartitionPolicy::FailOpen)
        .await;

    let guard = nodes[0]
        .cluster
        .locks()
        .write_lock("w1", Duration::from_secs(1))
        .await
        .unwrap();

    let err = nodes[1]
        .runtimes
        .start_workspace(&owner(), "w1", None)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(
        nodes[1].runtimes.get_status("w1").await.unwrap(),
        WorkspaceStatus::Stopped
    );

    guard.release().await;
    nodes[1]
        .runtimes
        .start_workspace(&owner(), "w1", None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_coordinator_crash_frees_its_locks() {
    let world = World::new(Duration::ZERO);
    let (group, nodes) = world
        .cluster("masters", &["n1", "n2", "n3"], PartitionPolicy::FailOpen)
        .await;

    let _held = nodes[0]
        .cluster
        .locks()
        .write_lock("w1", Duration::from_secs(1))
        .await
        .unwrap();
    let blocked = nodes[1]
        .cluster
        .locks()
        .write_lock("w1", Duration::from_millis(200))
        .await;
    assert!(matches!(blocked, Err(LockError::Timeout { .. })));

    group.crash("n1");
    settle().await;

    assert_eq!(nodes[1].cluster.view().members, vec!["n2", "n3"]);
    let guard = nodes[1]
        .cluster
        .locks()
        .write_lock("w1", Duration::from_secs(1))
        .await
        .unwrap();
    assert!(nodes[1].cluster.locks().is_held_locally("w1"));

    // n3 now queues behind n2 at the new coordinator.
    let queued = nodes[2]
        .cluster
        .locks()
        .write_lock("w1", Duration::from_millis(200))
        .await;
    assert!(matches!(queued, Err(LockError::Timeout { .. })));
    guard.release().await;
}

#[tokio::test]
async fn test_status_read_does_not_wait_for_transition() {
    let world = World::new(Duration::from_millis(500));
    world.add_workspace("w1", None).await;
    let (_group, nodes) = world
        .cluster("masters", &["n1", "n2"], PartitionPolicy::FailOpen)
        .await;

    let starter = nodes[0].runtimes.clone();
    let start = tokio::spawn(async move {
        starter
            .start_workspace(&Subject::new(common::OWNER), "w1", None)
            .await
    });

    // n2 sees the in-flight STARTING state while n1 still holds the lock: the read is
    // unsynchronized and the value is stale as soon as the start completes.
    let mut observed = None;
    for _ in 0..50 {
        let begin = Instant::now();
        let status = nodes[1].runtimes.get_status("w1").await.unwrap();
        assert!(begin.elapsed() < Duration::from_millis(100));
        if status == WorkspaceStatus::Starting {
            observed = Some(status);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(observed, Some(WorkspaceStatus::Starting));

    start.await.unwrap().unwrap();
    assert_eq!(
        nodes[1].runtimes.get_status("w1").await.unwrap(),
        WorkspaceStatus::Running
    );
}

#[tokio::test]
async fn test_status_events_are_replicated_in_order() {
    let world = World::new(Duration::ZERO);
    world.add_workspace("w1", None).await;
    let (_group, nodes) = world
        .cluster("masters", &["n1", "n2"], PartitionPolicy::FailOpen)
        .await;
    let mut remote = nodes[1].bus.status().subscribe();

    let subject = owner();
    nodes[0]
        .runtimes
        .start_workspace(&subject, "w1", None)
        .await
        .unwrap();
    nodes[0]
        .runtimes
        .stop_workspace(&subject, "w1", StopOptions::default())
        .await
        .unwrap();
    settle().await;

    let transitions: Vec<_> = drain(&mut remote).into_iter().map(|e| e.status).collect();
    assert_eq!(
        transitions,
        vec![
            WorkspaceStatus::Starting,
            WorkspaceStatus::Running,
            WorkspaceStatus::Stopping,
            WorkspaceStatus::Stopped,
        ]
    );
}

#[tokio::test]
async fn test_default_deny_on_every_node() {
    let world = World::new(Duration::ZERO);
    world.add_workspace("w1", None).await;
    let (_group, nodes) = world
        .cluster("masters", &["n1", "n2"], PartitionPolicy::FailOpen)
        .await;

    let stranger = Subject::new("mallory");
    for node in &nodes {
        let err = node
            .runtimes
            .start_workspace(&stranger, "w1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Forbidden(_)));
    }

    nodes[0]
        .runtimes
        .start_workspace(&owner(), "w1", None)
        .await
        .unwrap();
    let err = nodes[1]
        .runtimes
        .stop_workspace(&stranger, "w1", StopOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Forbidden(_)));
    assert_eq!(
        nodes[1].runtimes.get_status("w1").await.unwrap(),
        WorkspaceStatus::Running
    );
}

#[tokio::test]
async fn test_failed_stop_marks_error_and_can_be_retried() {
    let world = World::new(Duration::ZERO);
    world.add_workspace("w1", None).await;
    let (_group, nodes) = world
        .cluster("masters", &["n1", "n2"], PartitionPolicy::FailOpen)
        .await;
    let mut statuses = nodes[0].bus.status().subscribe();
    let mut stopped = nodes[0].bus.stopped().subscribe();
    let subject = owner();
    nodes[0]
        .runtimes
        .start_workspace(&subject, "w1", None)
        .await
        .unwrap();

    world.noop.fail_next_stops(1);
    let err = nodes[1]
        .runtimes
        .stop_workspace(&subject, "w1", StopOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Infrastructure(_)));
    assert_eq!(
        nodes[0].runtimes.get_status("w1").await.unwrap(),
        WorkspaceStatus::Error
    );
    let record = nodes[0].runtimes.get_runtime("w1").await.unwrap().unwrap();
    assert!(record.error.is_some());
    settle().await;

    nodes[0]
        .runtimes
        .stop_workspace(&subject, "w1", StopOptions::default())
        .await
        .unwrap();
    assert!(!world.noop.kill("w1"));
    settle().await;

    let transitions: Vec<_> = drain(&mut statuses)
        .into_iter()
        .map(|e| (e.prev_status, e.status))
        .collect();
    assert_eq!(
        transitions,
        vec![
            (Some(WorkspaceStatus::Stopped), WorkspaceStatus::Starting),
            (Some(WorkspaceStatus::Starting), WorkspaceStatus::Running),
            (Some(WorkspaceStatus::Running), WorkspaceStatus::Stopping),
            (Some(WorkspaceStatus::Stopping), WorkspaceStatus::Error),
            (Some(WorkspaceStatus::Error), WorkspaceStatus::Stopping),
            (Some(WorkspaceStatus::Stopping), WorkspaceStatus::Stopped),
        ]
    );
    let stopped = drain(&mut stopped);
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].error, None);
}
