// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lock behavior under network partitions and crashes, per partition policy.

mod common;

use std::time::Duration;

use devspace_core::WorkspaceStatus;
use devspace_master::StopOptions;
use devspace_master::cluster::{LockError, PartitionPolicy};

use common::{World, owner, settle};

const LOCK_WAIT: Duration = Duration::from_millis(300);

/// Split {n1, n2} from {n3} and try to lock the same key on both sides.
/// Returns whether the majority and the minority side got the lock.
async fn split_brain(policy: PartitionPolicy) -> (bool, bool) {
    let world = World::new(Duration::ZERO);
    let (group, nodes) = world.cluster("masters", &["n1", "n2", "n3"], policy).await;

    group.partition(&[&["n1", "n2"], &["n3"]]);
    settle().await;
    assert_eq!(nodes[2].cluster.view().members, vec!["n3"]);

    let majority = nodes[1].cluster.locks().write_lock("w1", LOCK_WAIT).await;
    let minority = nodes[2].cluster.locks().write_lock("w1", LOCK_WAIT).await;
    let outcome = (majority.is_ok(), minority.is_ok());

    if let Err(e) = &minority {
        assert!(matches!(
            e,
            LockError::NoQuorum {
                members: 1,
                expected: 3
            }
        ));
    }
    if let Ok(guard) = majority {
        guard.release().await;
    }
    if let Ok(guard) = minority {
        guard.release().await;
    }
    outcome
}

#[tokio::test]
async fn test_fail_open_grants_on_both_sides() {
    assert_eq!(split_brain(PartitionPolicy::FailOpen).await, (true, true));
}

#[tokio::test]
async fn test_require_quorum_refuses_minority() {
    let policy = PartitionPolicy::RequireQuorum {
        expected_members: 3,
    };
    assert_eq!(split_brain(policy).await, (true, false));
}

#[tokio::test]
async fn test_exclusion_restored_after_heal() {
    let world = World::new(Duration::ZERO);
    let (group, nodes) = world
        .cluster("masters", &["n1", "n2", "n3"], PartitionPolicy::FailOpen)
        .await;

    group.partition(&[&["n1", "n2"], &["n3"]]);
    settle().await;
    group.heal();
    settle().await;
    assert_eq!(nodes[2].cluster.view().members, vec!["n1", "n2", "n3"]);

    let guard = nodes[2]
        .cluster
        .locks()
        .write_lock("w1", LOCK_WAIT)
        .await
        .unwrap();
    let contended = nodes[0].cluster.locks().write_lock("w1", LOCK_WAIT).await;
    assert!(matches!(contended, Err(LockError::Timeout { .. })));

    guard.release().await;
    settle().await;
    let guard = nodes[0]
        .cluster
        .locks()
        .write_lock("w1", LOCK_WAIT)
        .await
        .unwrap();
    guard.release().await;
}

#[tokio::test]
async fn test_minority_lifecycle_refused_under_quorum() {
    let world = World::new(Duration::ZERO);
    world.add_workspace("w1", None).await;
    world.add_workspace("w2", None).await;
    let policy = PartitionPolicy::RequireQuorum {
        expected_members: 3,
    };
    let (group, nodes) = world.cluster("masters", &["n1", "n2", "n3"], policy).await;
    let subject = owner();

    nodes[2]
        .runtimes
        .start_workspace(&subject, "w1", None)
        .await
        .unwrap();

    group.partition(&[&["n1", "n2"], &["n3"]]);
    settle().await;

    let err = nodes[2]
        .runtimes
        .start_workspace(&subject, "w2", None)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    let err = nodes[2]
        .runtimes
        .stop_workspace(&subject, "w1", StopOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(
        nodes[2].runtimes.get_status("w1").await.unwrap(),
        WorkspaceStatus::Running
    );

    // The majority keeps working, including on workspaces started by the minority.
    nodes[0]
        .runtimes
        .start_workspace(&subject, "w2", None)
        .await
        .unwrap();
    nodes[1]
        .runtimes
        .stop_workspace(&subject, "w1", StopOptions::default())
        .await
        .unwrap();

    group.heal();
    settle().await;
    nodes[2]
        .runtimes
        .stop_workspace(&subject, "w2", StopOptions::default())
        .await
        .unwrap();
    assert!(nodes[0].runtimes.list_runtimes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_survivor_without_quorum_refuses_locks() {
    let world = World::new(Duration::ZERO);
    let policy = PartitionPolicy::RequireQuorum {
        expected_members: 3,
    };
    let (group, nodes) = world.cluster("masters", &["n1", "n2", "n3"], policy).await;

    group.crash("n1");
    settle().await;
    let guard = nodes[1]
        .cluster
        .locks()
        .write_lock("w1", LOCK_WAIT)
        .await
        .unwrap();
    guard.release().await;

    group.crash("n2");
    settle().await;
    let refused = nodes[2].cluster.locks().write_lock("w1", LOCK_WAIT).await;
    assert!(matches!(refused, Err(LockError::NoQuorum { .. })));
}
