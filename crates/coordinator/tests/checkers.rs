mod common;

use std::time::Duration;

use common::*;
use meshvault_coordinator::{Checker, Checkers, ConfigKey, Pass};
use meshvault_storage::{
    CheckerStore, FileKind, FileState, FileStore, GroupFile, GroupStore, MemberState, NodeStore,
};

const DAY: i64 = 24 * 60 * 60;

#[tokio::test]
async fn test_silent_nodes_go_offline() {
    let h = harness();
    let ids = seed_nodes(&h.store, 0..64).await;
    seed_group(&h.store, "g", 0, &ids).await;

    let mut silent = mature_node(0);
    silent.update_tm = now() - 20 * 60;
    let silent_tm = silent.update_tm;
    h.store.put_node(silent).await.unwrap();

    let pass = h.coordinator.run_checker(Checker::NodeTimeouts).await.unwrap();

    assert_eq!(pass, Pass::Completed { processed: 1 });
    let member = h.store.member("g", "node-000").await.unwrap().unwrap();
    assert_eq!(member.state, MemberState::Offline);
    assert_eq!(h.store.online_member_count("g").await.unwrap(), 63);
    let checkpoint = h.store.node_checkpoint().await.unwrap();
    assert_eq!(checkpoint.update_tm, silent_tm);
    assert_eq!(checkpoint.id, "node-000");

    let pass = h.coordinator.run_checker(Checker::NodeTimeouts).await.unwrap();
    assert_eq!(pass, Pass::Completed { processed: 0 });
}

#[tokio::test]
async fn test_nodes_silent_in_the_same_second_span_batches() {
    let h = harness();
    let batch = h.coordinator.config().checkers.node_batch;
    let ids = seed_nodes(&h.store, 0..batch + 1).await;
    let last = ids[batch].clone();
    seed_group(&h.store, "g", 0, &ids[batch - 63..]).await;

    let silent_tm = now() - 20 * 60;
    for i in 0..=batch {
        let mut node = mature_node(i);
        node.update_tm = silent_tm;
        h.store.put_node(node).await.unwrap();
    }

    let first = h.coordinator.run_checker(Checker::NodeTimeouts).await.unwrap();
    let second = h.coordinator.run_checker(Checker::NodeTimeouts).await.unwrap();
    let third = h.coordinator.run_checker(Checker::NodeTimeouts).await.unwrap();

    assert_eq!(first, Pass::Completed { processed: batch });
    assert_eq!(second, Pass::Completed { processed: 1 });
    assert_eq!(third, Pass::Completed { processed: 0 });
    let member = h.store.member("g", &last).await.unwrap().unwrap();
    assert_eq!(member.state, MemberState::Offline);
}

#[tokio::test]
async fn test_repair_refills_thin_groups() {
    let h = harness();
    let ids = seed_nodes(&h.store, 0..100).await;
    seed_group(&h.store, "thin", 0, &ids[..40]).await;

    let pass = h.coordinator.run_checker(Checker::GroupRepair).await.unwrap();
    h.coordinator.wait_idle().await;

    assert_eq!(pass, Pass::Completed { processed: 1 });
    assert_eq!(h.store.online_member_count("thin").await.unwrap(), 64);
}

#[tokio::test]
async fn test_full_class_gets_a_new_group() {
    let mut config = test_config();
    config.groups.auto_create_classes = vec![0];
    let h = harness_with(config);
    seed_nodes(&h.store, 0..70).await;

    let pass = h.coordinator.run_checker(Checker::GroupCreation).await.unwrap();
    h.coordinator.wait_idle().await;

    assert_eq!(pass, Pass::Completed { processed: 1 });
    let groups = h.store.groups().await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].class, 0);

    // the new group is empty, so the class is balanced
    let pass = h.coordinator.run_checker(Checker::GroupCreation).await.unwrap();
    assert_eq!(pass, Pass::Completed { processed: 0 });
}

#[tokio::test]
async fn test_stale_new_files_are_dropped() {
    let h = harness();
    let ids = seed_nodes(&h.store, 0..64).await;
    seed_group(&h.store, "g", 0, &ids).await;
    h.coordinator.add_file("g", &md5(1), None, 1_000).await.unwrap();
    h.store
        .put_group_file(GroupFile {
            group: "g".to_string(),
            md5: md5(2),
            size: 5_000,
            ver: 0,
            state: FileState::Normal,
            kind: FileKind::NewAdd,
            add_ver: 1,
            src_node: Some("node-000".to_string()),
            last_add_tm: now() - 8 * DAY,
        })
        .await
        .unwrap();

    let pass = h.coordinator.run_checker(Checker::StaleNewFiles).await.unwrap();

    assert_eq!(pass, Pass::Completed { processed: 1 });
    assert!(h.store.group_file("g", &md5(2)).await.unwrap().is_none());
    assert!(h.store.group_file("g", &md5(1)).await.unwrap().is_some());
    assert_eq!(h.store.get_group("g").await.unwrap().unwrap().size, 1_000);
    h.coordinator.wait_idle().await;
}

#[tokio::test]
async fn test_online_time_is_aggregated() {
    let h = harness();
    seed_nodes(&h.store, 0..3).await;

    let pass = h.coordinator.run_checker(Checker::OnlineTime).await.unwrap();

    assert_eq!(pass, Pass::Completed { processed: 3 });
    let node = h.store.get_node("node-001").await.unwrap().unwrap();
    assert_eq!(node.online_count, 1);
}

#[tokio::test]
async fn test_long_gone_nodes_are_deleted() {
    let h = harness();
    seed_nodes(&h.store, 0..3).await;
    let mut gone = mature_node(9);
    gone.update_tm = now() - 40 * DAY;
    gone.reg_tm = now() - 90 * DAY;
    h.store.put_node(gone).await.unwrap();

    let pass = h.coordinator.run_checker(Checker::StaleNodes).await.unwrap();

    assert_eq!(pass, Pass::Completed { processed: 1 });
    assert!(h.store.get_node("node-009").await.unwrap().is_none());
    assert!(h.store.get_node("node-000").await.unwrap().is_some());
}

#[tokio::test]
async fn test_config_refresh() {
    let h = harness();
    h.store.set_config("gen_piece_level", "3").await;
    h.store.set_config("con", "not a number").await;

    let pass = h.coordinator.run_checker(Checker::ConfigRefresh).await.unwrap();

    assert_eq!(pass, Pass::Completed { processed: 1 });
    assert_eq!(h.coordinator.settings().get(ConfigKey::GenPieceLevel), 3);
    assert_eq!(h.coordinator.settings().get(ConfigKey::Concurrency), 20);
}

#[tokio::test]
async fn test_passes_respect_cooldowns() {
    let mut config = test_config();
    config.cooldowns.online_time = Duration::from_secs(3600);
    let h = harness_with(config);

    let first = h.coordinator.run_checker(Checker::OnlineTime).await.unwrap();
    let second = h.coordinator.run_checker(Checker::OnlineTime).await.unwrap();

    assert_eq!(first, Pass::Completed { processed: 0 });
    assert_eq!(second, Pass::Skipped);
}

#[tokio::test]
async fn test_checkers_stop_on_shutdown() {
    let mut config = test_config();
    config.checkers.startup_delay = Duration::ZERO;
    config.checkers.node_timeout_interval = Duration::from_millis(10);
    let h = harness_with(config);
    let checkers = Checkers::new(h.coordinator.clone());

    checkers.start();
    checkers.start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(5), checkers.shutdown())
        .await
        .expect("checkers stop");
    h.coordinator.shutdown().await;
}
