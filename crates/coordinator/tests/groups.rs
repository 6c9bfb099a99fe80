mod common;

use std::collections::HashSet;
use std::time::Duration;

use assert_matches::assert_matches;
use common::*;
use meshvault_coordinator::{Error, Expansion};
use meshvault_locks::LockManager;
use meshvault_storage::{FileKind, FileState, FileStore, GroupStore, NodeStore};

#[tokio::test]
async fn test_expansion_refills_group_to_perfect_size() {
    let h = harness();
    let ids = seed_nodes(&h.store, 0..100).await;
    seed_group(&h.store, "g", 0, &ids[..40]).await;

    let expansion = h.coordinator.expand_group("g").await.unwrap();

    assert_eq!(
        expansion,
        Expansion::Expanded {
            added: 24,
            online: 64
        }
    );
    assert_eq!(h.store.online_member_count("g").await.unwrap(), 64);
}

#[tokio::test]
async fn test_expansion_fails_when_pool_is_too_small() {
    let h = harness();
    let ids = seed_nodes(&h.store, 0..50).await;
    seed_group(&h.store, "g", 0, &ids[..40]).await;

    let result = h.coordinator.expand_group("g").await;

    assert_matches!(
        result,
        Err(Error::InsufficientNodes {
            available: 50,
            required: 64
        })
    );
    // members that did join stay
    assert_eq!(h.store.online_member_count("g").await.unwrap(), 50);
}

#[tokio::test]
async fn test_healthy_group_is_left_alone() {
    let h = harness();
    let ids = seed_nodes(&h.store, 0..60).await;
    seed_group(&h.store, "g", 0, &ids[..55]).await;

    let expansion = h.coordinator.expand_group("g").await.unwrap();

    assert_eq!(expansion, Expansion::Sufficient { online: 55 });
}

#[tokio::test]
async fn test_expansion_keeps_one_member_per_prefix() {
    let h = harness();
    let ids = seed_nodes(&h.store, 0..100).await;
    seed_group(&h.store, "g", 0, &ids[..40]).await;

    // heavier twins of the first members, in the same /16
    for i in 0..10 {
        let mut twin = mature_node(i);
        twin.peer.id = format!("twin-{i}");
        twin.peer.ip = node_ip(i).replace(".0.1", ".7.7");
        twin.weight = 2.0;
        h.store.put_node(twin).await.unwrap();
    }

    h.coordinator.expand_group("g").await.unwrap();

    let members = h.store.members("g").await.unwrap();
    assert!(members.iter().all(|member| !member.node.starts_with("twin-")));

    let ids: Vec<String> = members.into_iter().map(|member| member.node).collect();
    let prefixes: HashSet<String> = h
        .store
        .get_nodes(&ids)
        .await
        .unwrap()
        .iter()
        .filter_map(|node| node.peer.ip_prefix())
        .collect();
    assert_eq!(prefixes.len(), ids.len());
}

#[tokio::test]
async fn test_preferred_node_joins_when_no_candidate_qualifies() {
    let h = harness();
    let ids = seed_nodes(&h.store, 0..100).await;
    let group = seed_group(&h.store, "g", 0, &ids[..40]).await;

    // a ceiling of zero active groups rules out every ranked candidate
    let added = h
        .coordinator
        .expand_nodes(&group, 2, 0, Some("node-099"))
        .await
        .unwrap();

    assert_eq!(added, 1);
    assert!(h.store.member("g", "node-099").await.unwrap().is_some());
    assert_eq!(h.store.online_member_count("g").await.unwrap(), 41);

    h.coordinator.wait_idle().await;
}

#[tokio::test]
async fn test_add_file_tops_up_thin_group_in_background() {
    let h = harness();
    let ids = seed_nodes(&h.store, 0..100).await;
    seed_group(&h.store, "g", 0, &ids[..40]).await;

    let file = h.coordinator.add_file("g", &md5(1), None, 1_000).await.unwrap();
    assert_eq!(file.ver, 1);

    h.coordinator.wait_idle().await;

    assert_eq!(h.store.online_member_count("g").await.unwrap(), 64);
}

#[tokio::test]
async fn test_create_group_needs_perfect_pool() {
    let h = harness();
    seed_nodes(&h.store, 0..30).await;

    let result = h.coordinator.create_group(Some(0), None).await;

    assert_matches!(
        result,
        Err(Error::InsufficientNodes {
            available: 30,
            required: 64
        })
    );
    assert!(h.store.groups().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_create_group_rejects_unknown_class() {
    let h = harness();
    seed_nodes(&h.store, 0..70).await;

    let result = h.coordinator.create_group(Some(7), None).await;

    assert_matches!(result, Err(Error::InvalidArgument(_)));
}

#[tokio::test]
async fn test_create_group_starts_with_seed() {
    let h = harness();
    seed_nodes(&h.store, 0..70).await;

    let group = h
        .coordinator
        .create_group(None, Some("node-069"))
        .await
        .unwrap();

    assert_eq!(group.class, 0);
    assert_eq!(group.id.len(), 32);
    assert_eq!(h.store.online_member_count(&group.id).await.unwrap(), 64);
    assert!(h.store.member(&group.id, "node-069").await.unwrap().is_some());

    let seed = h.store.get_node("node-069").await.unwrap().unwrap();
    assert_eq!(seed.active_groups, 1);
}

#[tokio::test]
async fn test_add_file_creates_first_spread_record() {
    let h = harness();
    let ids = seed_nodes(&h.store, 0..64).await;
    seed_group(&h.store, "g", 0, &ids).await;

    let file = h
        .coordinator
        .add_file("g", &md5(1), Some("node-000"), 1_234)
        .await
        .unwrap();

    assert_eq!(file.ver, 1);
    assert_eq!(file.kind, FileKind::FirstSpread);
    assert_eq!(file.state, FileState::Normal);

    let stored = h.store.group_file("g", &md5(1)).await.unwrap().unwrap();
    assert_eq!(stored, file);
    assert_eq!(h.store.get_group("g").await.unwrap().unwrap().size, 1_234);

    h.coordinator.wait_idle().await;
}

#[tokio::test]
async fn test_adding_a_known_file_returns_existing_record() {
    let h = harness();
    let ids = seed_nodes(&h.store, 0..64).await;
    seed_group(&h.store, "g", 0, &ids).await;

    let first = h.coordinator.add_file("g", &md5(1), None, 1_234).await.unwrap();
    let second = h.coordinator.add_file("g", &md5(1), None, 1_234).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.store.get_group("g").await.unwrap().unwrap().size, 1_234);

    h.coordinator.wait_idle().await;
}

#[tokio::test]
async fn test_versions_strictly_increase() {
    let h = harness();
    let ids = seed_nodes(&h.store, 0..64).await;
    seed_group(&h.store, "g", 0, &ids).await;

    let mut versions = Vec::new();
    for n in 1..=3 {
        let file = h.coordinator.add_file("g", &md5(n), None, 1_000).await.unwrap();
        versions.push(file.ver);
    }
    let deleted = h.coordinator.delete_file("g", &md5(2)).await.unwrap();
    versions.push(deleted);

    assert_eq!(versions, vec![1, 2, 3, 4]);

    let group = h.store.get_group("g").await.unwrap().unwrap();
    assert_eq!(group.deleted_ver, 4);
    assert_eq!(group.size, 2_000);

    let file = h.store.group_file("g", &md5(2)).await.unwrap().unwrap();
    assert_eq!(file.state, FileState::Deleted);

    h.coordinator.wait_idle().await;
}

#[tokio::test]
async fn test_add_file_fails_while_group_is_locked() {
    let h = harness();
    let ids = seed_nodes(&h.store, 0..64).await;
    seed_group(&h.store, "g", 0, &ids).await;

    assert!(
        h.locks
            .try_acquire("g".to_string(), Duration::from_secs(60), Duration::ZERO)
            .await
            .unwrap()
            .is_some()
    );

    let result = h.coordinator.add_file("g", &md5(1), None, 1_000).await;

    assert_matches!(result, Err(Error::LockUnavailable(key)) if key == "g");
    assert!(h.store.group_file("g", &md5(1)).await.unwrap().is_none());
    assert_eq!(h.store.get_group("g").await.unwrap().unwrap().size, 0);
}

#[tokio::test]
async fn test_add_file_proceeds_once_lock_is_released() {
    let h = harness();
    let ids = seed_nodes(&h.store, 0..64).await;
    seed_group(&h.store, "g", 0, &ids).await;

    let token = h
        .locks
        .try_acquire("g".to_string(), Duration::from_secs(60), Duration::ZERO)
        .await
        .unwrap()
        .unwrap();

    let locks = h.locks.clone();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        locks.release("g".to_string(), token).await.unwrap();
    });

    let file = h.coordinator.add_file("g", &md5(1), None, 1_000).await.unwrap();
    release.await.unwrap();

    assert_eq!(file.ver, 1);
    h.coordinator.wait_idle().await;
}

#[tokio::test]
async fn test_deleting_twice_leaves_the_ledger_alone() {
    let h = harness();
    let ids = seed_nodes(&h.store, 0..64).await;
    seed_group(&h.store, "g", 0, &ids).await;

    h.coordinator.add_file("g", &md5(1), None, 1_005).await.unwrap();
    h.coordinator.add_file("g", &md5(2), None, 1_005).await.unwrap();

    let first = h.coordinator.delete_file("g", &md5(1)).await;
    let second = h.coordinator.delete_file("g", &md5(1)).await;

    assert_matches!(first, Ok(3));
    assert_matches!(second, Err(Error::NotFound(_)));
    let group = h.store.get_group("g").await.unwrap().unwrap();
    assert_eq!(group.size, 1_005);
    assert_eq!(group.deleted_ver, 3);
    assert_eq!(h.store.group_file("g", &md5(1)).await.unwrap().unwrap().ver, 3);

    h.coordinator.wait_idle().await;
}

#[tokio::test]
async fn test_delete_unknown_file_is_not_found() {
    let h = harness();
    seed_group(&h.store, "g", 0, &[]).await;

    let result = h.coordinator.delete_file("g", &md5(9)).await;

    assert_matches!(result, Err(Error::NotFound(_)));
}
