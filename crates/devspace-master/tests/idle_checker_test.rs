// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Idle checker tests driven by a manual clock.

mod common;

use std::time::Duration;

use devspace_core::{Clock, RuntimeError, WorkspaceStatus};
use devspace_core::store::{ActivityStore, WorkspaceActivity};
use devspace_master::activity::{
    ACTIVITY_CHECKER, ActivitySignal, CheckSummary, IDLE_TIMEOUT_REASON, IdleChecker,
    IdleCheckerConfig, RUN_TIMEOUT_REASON,
};
use devspace_master::cluster::PartitionPolicy;
use futures::future::join_all;

use common::{World, drain, owner, settle};

fn checker(node: &common::Node) -> IdleChecker {
    IdleChecker::new(IdleCheckerConfig::default(), node.runtimes.clone())
}

#[tokio::test]
async fn test_idle_workspace_is_stopped_once() {
    let world = World::new(Duration::ZERO);
    world.add_workspace("w1", Some(300)).await;
    let node = world.single_node("n1");
    let mut statuses = node.bus.status().subscribe();
    let mut stopping = node.bus.stopping().subscribe();
    let mut stopped = node.bus.stopped().subscribe();

    node.runtimes
        .start_workspace(&owner(), "w1", None)
        .await
        .unwrap();
    let checker = checker(&node);

    world.clock.advance(Duration::from_secs(301));
    let summary = checker.check_once().await.unwrap();
    assert_eq!(summary.stopped, vec!["w1".to_string()]);
    assert!(summary.failed.is_empty());

    let transitions: Vec<_> = drain(&mut statuses)
        .into_iter()
        .map(|e| (e.status, e.stopped_by))
        .collect();
    assert_eq!(
        transitions,
        vec![
            (WorkspaceStatus::Starting, None),
            (WorkspaceStatus::Running, None),
            (WorkspaceStatus::Stopping, Some(ACTIVITY_CHECKER.to_string())),
            (WorkspaceStatus::Stopped, Some(ACTIVITY_CHECKER.to_string())),
        ]
    );

    let stopping = drain(&mut stopping);
    assert_eq!(stopping.len(), 1);
    assert_eq!(stopping[0].reason.as_deref(), Some(IDLE_TIMEOUT_REASON));

    let stopped = drain(&mut stopped);
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].workspace_id, "w1");
    assert_eq!(stopped[0].stopped_by.as_deref(), Some(ACTIVITY_CHECKER));
    assert_eq!(stopped[0].error, None);

    assert_eq!(
        node.runtimes.get_status("w1").await.unwrap(),
        WorkspaceStatus::Stopped
    );
    assert_eq!(world.store.get("w1").await.unwrap(), None);

    // Nothing left to do on the next pass.
    world.clock.advance(Duration::from_secs(60));
    assert_eq!(checker.check_once().await.unwrap(), CheckSummary::default());
}

#[tokio::test]
async fn test_idle_timeout_boundary() {
    let world = World::new(Duration::ZERO);
    world.add_workspace("w1", Some(300)).await;
    let node = world.single_node("n1");
    node.runtimes
        .start_workspace(&owner(), "w1", None)
        .await
        .unwrap();
    let checker = checker(&node);

    world.clock.advance(Duration::from_secs(299));
    assert!(checker.check_once().await.unwrap().stopped.is_empty());

    // Exactly at the timeout the workspace is not yet idle.
    world.clock.advance(Duration::from_secs(1));
    assert!(checker.check_once().await.unwrap().stopped.is_empty());
    assert_eq!(
        node.runtimes.get_status("w1").await.unwrap(),
        WorkspaceStatus::Running
    );

    world.clock.advance(Duration::from_secs(1));
    assert_eq!(checker.check_once().await.unwrap().stopped, vec!["w1"]);
}

#[tokio::test]
async fn test_activity_postpones_idle_stop() {
    let world = World::new(Duration::ZERO);
    world.add_workspace("w1", Some(300)).await;
    let node = world.single_node("n1");
    node.runtimes
        .start_workspace(&owner(), "w1", None)
        .await
        .unwrap();
    let activity = node.runtimes.activity();
    let checker = checker(&node);

    world.clock.advance(Duration::from_secs(200));
    assert!(activity.on_activity("w1", ActivitySignal::ApiCall).await.unwrap());

    // Within the report interval: dropped, so the idle deadline stays at 500s.
    world.clock.advance(Duration::from_secs(10));
    assert!(
        !activity
            .on_activity("w1", ActivitySignal::WebsocketFrame)
            .await
            .unwrap()
    );
    assert!(!activity.on_activity("w1", ActivitySignal::KeepAlive).await.unwrap());

    world.clock.advance(Duration::from_secs(140));
    assert!(checker.check_once().await.unwrap().stopped.is_empty());

    world.clock.advance(Duration::from_secs(151));
    assert_eq!(checker.check_once().await.unwrap().stopped, vec!["w1"]);
}

#[tokio::test]
async fn test_zero_idle_timeout_never_expires() {
    let world = World::new(Duration::ZERO);
    world.add_workspace("w1", Some(0)).await;
    let node = world.single_node("n1");
    node.runtimes
        .start_workspace(&owner(), "w1", None)
        .await
        .unwrap();

    world.clock.advance(Duration::from_secs(86_400));
    assert!(checker(&node).check_once().await.unwrap().stopped.is_empty());
}

#[tokio::test]
async fn test_run_timeout_stops_active_workspace() {
    let world = World::new(Duration::ZERO);
    world.add_workspace("w1", Some(0)).await;
    let node = world.single_node("n1");
    let mut stopped = node.bus.stopped().subscribe();
    node.runtimes
        .start_workspace(&owner(), "w1", None)
        .await
        .unwrap();
    let checker = IdleChecker::new(
        IdleCheckerConfig {
            run_timeout: Duration::from_secs(600),
            ..Default::default()
        },
        node.runtimes.clone(),
    );

    world.clock.advance(Duration::from_secs(590));
    node.runtimes
        .activity()
        .on_activity("w1", ActivitySignal::ApiCall)
        .await
        .unwrap();
    assert!(checker.check_once().await.unwrap().stopped.is_empty());

    world.clock.advance(Duration::from_secs(11));
    assert_eq!(checker.check_once().await.unwrap().stopped, vec!["w1"]);
    let stopped = drain(&mut stopped);
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].reason.as_deref(), Some(RUN_TIMEOUT_REASON));
}

#[tokio::test]
async fn test_checkers_on_every_node_stop_once() {
    let world = World::new(Duration::ZERO);
    world.add_workspace("w1", Some(300)).await;
    let (_group, nodes) = world
        .cluster("masters", &["n1", "n2", "n3"], PartitionPolicy::FailOpen)
        .await;
    let mut stopped: Vec<_> = nodes.iter().map(|n| n.bus.stopped().subscribe()).collect();

    nodes[0]
        .runtimes
        .start_workspace(&owner(), "w1", None)
        .await
        .unwrap();
    let checkers: Vec<_> = nodes.iter().map(checker).collect();

    world.clock.advance(Duration::from_secs(301));
    let summaries = join_all(checkers.iter().map(|c| c.check_once())).await;
    let summaries: Vec<_> = summaries.into_iter().map(Result::unwrap).collect();

    // Checkers that saw the workspace after the winner stopped it skip it.
    let stops: usize = summaries.iter().map(|s| s.stopped.len()).sum();
    assert_eq!(stops, 1);
    assert!(summaries.iter().all(|s| s.failed.is_empty()));

    settle().await;
    for rx in &mut stopped {
        let events = drain(rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stopped_by.as_deref(), Some(ACTIVITY_CHECKER));
    }
}

#[tokio::test]
async fn test_reconcile_realigns_records() {
    let world = World::new(Duration::ZERO);
    world.add_workspace("w1", Some(300)).await;
    let node = world.single_node("n1");
    node.runtimes
        .start_workspace(&owner(), "w1", None)
        .await
        .unwrap();

    // A record without a runtime and a runtime without a record.
    world
        .store
        .save(WorkspaceActivity::new(
            "ghost",
            WorkspaceStatus::Running,
            world.clock.now(),
            Duration::from_secs(300),
        ))
        .await
        .unwrap();
    world.store.remove("w1").await.unwrap();

    let checker = checker(&node);
    assert_eq!(checker.reconcile().await.unwrap(), 2);
    assert_eq!(world.store.get("ghost").await.unwrap(), None);
    let record = world.store.get("w1").await.unwrap().unwrap();
    assert_eq!(record.status, WorkspaceStatus::Running);
    assert_eq!(record.idle_timeout_secs, 300);

    assert_eq!(checker.reconcile().await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_idle_stop_is_retried_next_pass() {
    let world = World::new(Duration::ZERO);
    world.add_workspace("w1", Some(300)).await;
    let node = world.single_node("n1");
    node.runtimes
        .start_workspace(&owner(), "w1", None)
        .await
        .unwrap();
    let checker = checker(&node);

    world.noop.fail_next_stops(1);
    world.clock.advance(Duration::from_secs(301));
    let first = checker.check_once().await.unwrap();
    assert_eq!(first.failed, vec!["w1"]);
    assert!(first.stopped.is_empty());
    assert_eq!(
        node.runtimes.get_status("w1").await.unwrap(),
        WorkspaceStatus::Error
    );

    // The failed stop must not count as activity.
    let record = world.store.get("w1").await.unwrap().unwrap();
    assert_eq!(record.status, WorkspaceStatus::Running);
    assert!(record.is_idle_expired(world.clock.now()));

    world.clock.advance(Duration::from_secs(60));
    let second = checker.check_once().await.unwrap();
    assert_eq!(second.stopped, vec!["w1"]);
    assert_eq!(
        node.runtimes.get_status("w1").await.unwrap(),
        WorkspaceStatus::Stopped
    );
    assert_eq!(world.store.get("w1").await.unwrap(), None);
    assert!(!world.noop.kill("w1"));
}

#[tokio::test]
async fn test_stop_without_infrastructure_is_reported_as_failure() {
    let world = World::new(Duration::ZERO);
    world.add_workspace("w1", Some(300)).await;
    let owner_node = world.single_node("n1");
    let bare = world.bare_node("n2");
    owner_node
        .runtimes
        .start_workspace(&owner(), "w1", None)
        .await
        .unwrap();

    world.clock.advance(Duration::from_secs(301));
    let summary = checker(&bare).check_once().await.unwrap();
    assert_eq!(summary.failed, vec!["w1"]);
    assert!(summary.skipped.is_empty());
    assert_eq!(
        bare.runtimes.get_status("w1").await.unwrap(),
        WorkspaceStatus::Error
    );
    assert!(world.store.get("w1").await.unwrap().is_some());

    let err = bare
        .runtimes
        .system_stop("w1", Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Infrastructure(_)));

    // A node able to reach the backend picks it up on its next pass.
    world.clock.advance(Duration::from_secs(60));
    let summary = checker(&owner_node).check_once().await.unwrap();
    assert_eq!(summary.stopped, vec!["w1"]);
    assert!(!world.noop.kill("w1"));
}
