mod common;

use std::collections::HashMap;
use std::time::Duration;

use assert_matches::assert_matches;
use common::*;
use meshvault_coordinator::{Checker, Error, GenPieceOutcome, Pass};
use meshvault_locks::LockManager;
use meshvault_storage::{
    ExpandState, FileKind, FileState, FileStore, GroupFile, GroupNode, GroupStore, MemberState,
    TaskStore, UnsafeExpandState,
};

/// A 64-member group holding one file uploaded by node 0, with the first
/// task issued.
async fn group_with_task(h: &Harness) -> u64 {
    let ids = seed_nodes(&h.store, 0..64).await;
    seed_group(&h.store, "g", 0, &ids).await;

    h.coordinator
        .add_file("g", &md5(1), Some("node-000"), 1_000)
        .await
        .unwrap();
    h.coordinator.wait_idle().await;

    h.store
        .expand_node("g", "node-000", &md5(1))
        .await
        .unwrap()
        .expect("task issued on upload")
        .id
}

/// A group of `members` nodes holding one converged file at version 1; only
/// the first `holders` members have it.
async fn converged_group(h: &Harness, class: usize, members: usize, holders: usize) -> Vec<String> {
    let ids = seed_nodes(&h.store, 0..members).await;
    seed_group(&h.store, "g", class, &ids).await;

    h.store
        .put_group_file(GroupFile {
            group: "g".to_string(),
            md5: md5(1),
            size: 1_000,
            ver: 1,
            state: FileState::Normal,
            kind: FileKind::FirstSpread,
            add_ver: 0,
            src_node: None,
            last_add_tm: now(),
        })
        .await
        .unwrap();
    h.store.set_first_finish_ver("g", 1).await.unwrap();

    for id in &ids[..holders] {
        h.store
            .put_member(
                "g",
                GroupNode {
                    node: id.clone(),
                    ver: 1,
                    state: MemberState::Online,
                    max_ver: 1,
                },
            )
            .await
            .unwrap();
    }

    ids
}

#[tokio::test]
async fn test_upload_issues_task_on_source() {
    let h = harness();
    let id = group_with_task(&h).await;

    let task = h.store.expand_node_by_id(id).await.unwrap().unwrap();
    assert_eq!(task.state, ExpandState::Init);
    assert_eq!(task.level, 0);
    assert_eq!(task.ver, 1);
    assert_eq!(h.coordinator.expand_task_level("g", 1).await.unwrap(), 0);
}

#[tokio::test]
async fn test_gen_piece_is_noop_when_members_hold_file() {
    let h = harness();
    let ids = seed_nodes(&h.store, 0..64).await;
    seed_group(&h.store, "g", 0, &ids).await;
    let file = h.coordinator.add_file("g", &md5(1), None, 1_000).await.unwrap();
    h.coordinator.wait_idle().await;

    for id in &ids {
        h.store
            .put_member(
                "g",
                GroupNode {
                    node: id.clone(),
                    ver: file.ver,
                    state: MemberState::Online,
                    max_ver: file.ver,
                },
            )
            .await
            .unwrap();
    }

    let outcome = h.coordinator.gen_piece("g", None, &md5(1)).await.unwrap();

    assert_eq!(outcome, GenPieceOutcome::NotEnoughWork);
    assert!(
        h.store
            .open_expand_nodes("g", &md5(1), now())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_gen_piece_waits_for_open_task() {
    let h = harness();
    group_with_task(&h).await;

    let outcome = h.coordinator.gen_piece("g", None, &md5(1)).await.unwrap();

    assert_eq!(outcome, GenPieceOutcome::InFlight);
}

#[tokio::test]
async fn test_gen_piece_leaves_available_file_alone_unless_asked() {
    let h = harness();
    converged_group(&h, 2, 200, 160).await;

    let outcome = h.coordinator.gen_piece("g", None, &md5(1)).await.unwrap();

    assert_eq!(outcome, GenPieceOutcome::AlreadyAvailable);
    assert!(
        h.store
            .open_expand_nodes("g", &md5(1), now())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_gen_piece_pushes_from_online_member_on_request() {
    let h = harness();
    let ids = converged_group(&h, 2, 200, 160).await;

    let outcome = h
        .coordinator
        .gen_piece("g", Some("node-199"), &md5(1))
        .await
        .unwrap();

    let GenPieceOutcome::Scheduled { task, node, level } = outcome else {
        panic!("expected a task");
    };
    assert!(ids.contains(&node));
    assert_eq!(level, 1);
    let task = h.store.expand_node_by_id(task).await.unwrap().unwrap();
    assert_eq!(task.node, node);
    assert_eq!(task.state, ExpandState::Init);
    assert_eq!(task.level, 1);
}

#[tokio::test]
async fn test_gen_piece_level_follows_online_holders() {
    for (holders, expected) in [(160, 1), (152, 2), (144, 3), (136, 4), (128, 5)] {
        let h = harness();
        converged_group(&h, 2, 200, holders).await;

        let outcome = h
            .coordinator
            .gen_piece("g", Some("node-199"), &md5(1))
            .await
            .unwrap();

        assert_matches!(
            outcome,
            GenPieceOutcome::Scheduled { level, .. } if level == expected,
            "{holders} holders"
        );
    }
}

#[tokio::test]
async fn test_gen_piece_falls_back_to_origin() {
    let h = harness();
    converged_group(&h, 0, 64, 20).await;

    let outcome = h.coordinator.gen_piece("g", None, &md5(1)).await.unwrap();
    assert_eq!(outcome, GenPieceOutcome::NoSource);

    h.store.add_source("node-063", md5(1)).await;
    let outcome = h.coordinator.gen_piece("g", None, &md5(1)).await.unwrap();

    assert_matches!(
        outcome,
        GenPieceOutcome::Scheduled { node, level: 6, .. } if node == "node-063"
    );
}

#[tokio::test]
async fn test_gen_piece_respects_priority_floor() {
    let h = harness();
    converged_group(&h, 2, 200, 160).await;
    h.store.set_config("gen_piece_level", "2").await;
    h.coordinator.refresh_settings().await.unwrap();

    let outcome = h
        .coordinator
        .gen_piece("g", Some("node-199"), &md5(1))
        .await
        .unwrap();
    assert_eq!(outcome, GenPieceOutcome::BelowPriorityFloor);

    // an unavailable file is held back the same way
    let h = harness();
    converged_group(&h, 0, 64, 20).await;
    h.store.add_source("node-063", md5(1)).await;
    h.store.set_config("gen_piece_level", "7").await;
    h.coordinator.refresh_settings().await.unwrap();

    let outcome = h.coordinator.gen_piece("g", None, &md5(1)).await.unwrap();
    assert_eq!(outcome, GenPieceOutcome::BelowPriorityFloor);
    assert!(
        h.store
            .open_expand_nodes("g", &md5(1), now())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_reissued_task_carries_bumped_version() {
    let h = harness();
    group_with_task(&h).await;
    h.coordinator.restart_node_tasks("node-000").await.unwrap();

    let outcome = h.coordinator.gen_piece("g", None, &md5(1)).await.unwrap();

    assert_matches!(outcome, GenPieceOutcome::Scheduled { level: 0, .. });
    let file = h.store.group_file("g", &md5(1)).await.unwrap().unwrap();
    assert_eq!(file.ver, 2);
    let task = h
        .store
        .expand_node("g", "node-000", &md5(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.state, ExpandState::Init);
    assert_eq!(task.ver, 2);
}

#[tokio::test]
async fn test_gen_piece_rejects_deleted_file() {
    let h = harness();
    let ids = seed_nodes(&h.store, 0..64).await;
    seed_group(&h.store, "g", 0, &ids).await;
    h.coordinator.add_file("g", &md5(1), None, 1_000).await.unwrap();
    h.coordinator.delete_file("g", &md5(1)).await.unwrap();

    let result = h.coordinator.gen_piece("g", None, &md5(1)).await;

    assert_matches!(result, Err(Error::InvalidState(_)));
    h.coordinator.wait_idle().await;
}

#[tokio::test]
async fn test_task_lifecycle() {
    let h = harness();
    let id = group_with_task(&h).await;

    let heartbeat = h
        .coordinator
        .update_node(report(0), &HashMap::new(), &[], true)
        .await
        .unwrap();
    assert_eq!(heartbeat.tasks.len(), 1);
    assert_eq!(heartbeat.tasks[0].id, id);
    assert_eq!(heartbeat.tasks[0].state, ExpandState::Notified);

    let assignment = h.coordinator.expand_task_by_id(id).await.unwrap();
    assert_eq!(assignment.task.state, ExpandState::Started);
    assert_eq!(assignment.lacking.len(), 64);
    assert_eq!(assignment.file.md5, md5(1));
    assert_eq!(assignment.group.id, "g");

    h.coordinator.expand_finished(id, true).await.unwrap();
    let task = h.store.expand_node_by_id(id).await.unwrap().unwrap();
    assert_eq!(task.state, ExpandState::Finished);

    // a second report changes nothing
    let again = h.coordinator.expand_finished(id, true).await;
    assert_matches!(again, Err(Error::InvalidState(_)));
    let task = h.store.expand_node_by_id(id).await.unwrap().unwrap();
    assert_eq!(task.state, ExpandState::Finished);
}

#[tokio::test]
async fn test_task_must_be_notified_before_start() {
    let h = harness();
    let id = group_with_task(&h).await;

    let result = h.coordinator.expand_task_by_id(id).await;

    assert_matches!(result, Err(Error::InvalidState(_)));
}

#[tokio::test]
async fn test_failed_task_bumps_file_version() {
    let h = harness();
    let id = group_with_task(&h).await;
    h.coordinator
        .update_node(report(0), &HashMap::new(), &[], true)
        .await
        .unwrap();
    h.coordinator.expand_task("g", "node-000", &md5(1)).await.unwrap();

    h.coordinator.expand_finished(id, false).await.unwrap();

    let task = h.store.expand_node_by_id(id).await.unwrap().unwrap();
    assert_eq!(task.state, ExpandState::Failed);
    assert_eq!(task.failed_times, 1);
    let file = h.store.group_file("g", &md5(1)).await.unwrap().unwrap();
    assert_eq!(file.ver, 2);
}

#[tokio::test]
async fn test_failure_is_recorded_while_group_is_locked() {
    let h = harness();
    let id = group_with_task(&h).await;
    h.coordinator
        .update_node(report(0), &HashMap::new(), &[], true)
        .await
        .unwrap();
    h.coordinator.expand_task_by_id(id).await.unwrap();
    let token = h
        .locks
        .try_acquire("g".to_string(), Duration::from_secs(60), Duration::ZERO)
        .await
        .unwrap()
        .unwrap();

    h.coordinator.expand_finished(id, false).await.unwrap();

    let task = h.store.expand_node_by_id(id).await.unwrap().unwrap();
    assert_eq!(task.state, ExpandState::Failed);
    assert_eq!(task.failed_times, 1);
    let file = h.store.group_file("g", &md5(1)).await.unwrap().unwrap();
    assert_eq!(file.ver, 1);

    // the deferred bump lands once the group is free
    h.locks.release("g".to_string(), token).await.unwrap();
    h.coordinator.wait_idle().await;
    let file = h.store.group_file("g", &md5(1)).await.unwrap().unwrap();
    assert_eq!(file.ver, 2);
}

#[tokio::test]
async fn test_restart_fails_open_tasks() {
    let h = harness();
    let id = group_with_task(&h).await;

    assert_eq!(h.coordinator.restart_node_tasks("node-000").await.unwrap(), 1);

    let task = h.store.expand_node_by_id(id).await.unwrap().unwrap();
    assert_eq!(task.state, ExpandState::Failed);
}

#[tokio::test]
async fn test_reaper_drops_finished_tasks() {
    let mut config = test_config();
    config.tasks.timeout_grace = Duration::ZERO;
    let h = harness_with(config);
    let id = group_with_task(&h).await;
    h.coordinator
        .update_node(report(0), &HashMap::new(), &[], true)
        .await
        .unwrap();
    h.coordinator.expand_task_by_id(id).await.unwrap();
    h.coordinator.expand_finished(id, true).await.unwrap();

    let pass = h.coordinator.run_checker(Checker::TaskTimeouts).await.unwrap();

    assert_eq!(pass, Pass::Completed { processed: 1 });
    assert!(h.store.expand_node_by_id(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_reaper_retries_expired_tasks() {
    let mut config = test_config();
    config.tasks.timeout_grace = Duration::ZERO;
    config.tasks.init_lease = Duration::ZERO;
    let h = harness_with(config);
    let id = group_with_task(&h).await;

    let pass = h.coordinator.run_checker(Checker::TaskTimeouts).await.unwrap();
    h.coordinator.wait_idle().await;

    assert_eq!(pass, Pass::Completed { processed: 1 });
    assert!(h.store.expand_node_by_id(id).await.unwrap().is_some());
    let file = h.store.group_file("g", &md5(1)).await.unwrap().unwrap();
    assert_eq!(file.ver, 2);

    // the checkpoint moved past the task
    let pass = h.coordinator.run_checker(Checker::TaskTimeouts).await.unwrap();
    assert_eq!(pass, Pass::Completed { processed: 0 });
}

#[tokio::test]
async fn test_unsafe_distribution() {
    let h = harness();
    let ids = seed_nodes(&h.store, 0..20).await;
    seed_group(&h.store, "g", 0, &ids).await;
    h.coordinator.add_file("g", &md5(1), None, 100).await.unwrap();
    h.coordinator.wait_idle().await;

    let scheduled = h
        .coordinator
        .schedule_unsafe_distribution("g", &md5(1))
        .await
        .unwrap();
    assert_eq!(scheduled, 20);
    assert!(h.store.is_unsafe_file("g", &md5(1)).await);
    assert_eq!(h.coordinator.all_unsafe_expand_tasks().await.unwrap().len(), 20);

    let tasks = h
        .coordinator
        .unsafe_expand_tasks("node-000", UnsafeExpandState::Init, 10)
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);

    let assignment = h.coordinator.unsafe_expand_task_by_id(tasks[0].id).await.unwrap();
    assert_eq!(assignment.file.md5, md5(1));
    assert_eq!(assignment.group.id, "g");

    h.coordinator.unsafe_expand_finished(tasks[0].id, true).await.unwrap();
    assert_matches!(
        h.coordinator.unsafe_expand_task_by_id(tasks[0].id).await,
        Err(Error::InvalidState(_))
    );

    h.coordinator
        .delete_unsafe_expand_task("g", "node-001", &md5(1))
        .await
        .unwrap();
    assert_eq!(h.coordinator.all_unsafe_expand_tasks().await.unwrap().len(), 19);

    h.coordinator.delete_unsafe_file("g", &md5(1)).await.unwrap();
    assert!(!h.store.is_unsafe_file("g", &md5(1)).await);
}

#[tokio::test]
async fn test_healthy_group_needs_no_unsafe_distribution() {
    let h = harness();
    let ids = seed_nodes(&h.store, 0..64).await;
    seed_group(&h.store, "g", 0, &ids).await;

    let scheduled = h
        .coordinator
        .schedule_unsafe_distribution("g", &md5(1))
        .await
        .unwrap();

    assert_eq!(scheduled, 0);
    assert!(!h.store.is_unsafe_file("g", &md5(1)).await);
}
