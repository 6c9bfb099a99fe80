#![allow(dead_code)]

use std::time::Duration;

use meshvault_coordinator::{CooldownConfig, Coordinator, CoordinatorConfig, LockConfig};
use meshvault_locks_memory::MemoryLockManager;
use meshvault_storage::{
    GROUP_PROFILES, Group, GroupNode, GroupStore, NodeDetail, NodeReport, NodeStore, Peer,
};
use meshvault_storage_memory::MemoryStorage;

pub const GIB: u64 = 1024 * 1024 * 1024;
const DAY: i64 = 24 * 60 * 60;

pub type TestCoordinator = Coordinator<MemoryStorage, MemoryLockManager>;

pub struct Harness {
    pub coordinator: TestCoordinator,
    pub store: MemoryStorage,
    pub locks: MemoryLockManager,
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Defaults without cooldowns and with a short lock wait.
pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        cooldowns: CooldownConfig::disabled(),
        locks: LockConfig {
            ttl: Duration::from_secs(5),
            wait: Duration::from_millis(200),
        },
        ..CoordinatorConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: CoordinatorConfig) -> Harness {
    let store = MemoryStorage::new();
    let locks = MemoryLockManager::new();
    let coordinator = Coordinator::new(store.clone(), locks.clone(), config);

    Harness {
        coordinator,
        store,
        locks,
    }
}

pub fn node_id(i: usize) -> String {
    format!("node-{i:03}")
}

/// Every node sits in its own /16.
pub fn node_ip(i: usize) -> String {
    format!("{}.{}.0.1", 10 + i / 250, i % 250)
}

pub fn md5(n: u64) -> String {
    format!("{n:032x}")
}

/// A mature, online node with plenty of room. Lower indexes weigh more.
pub fn mature_node(i: usize) -> NodeDetail {
    let now = now();

    NodeDetail {
        peer: Peer {
            id: node_id(i),
            ip: node_ip(i),
            port: 9000,
            nat_type: 1,
            ..Peer::default()
        }
        .with_upnp_availability(),
        total_space: 100 * GIB,
        left_space: 50 * GIB,
        percent: 50,
        update_tm: now,
        reg_tm: now - 8 * DAY,
        online_tm: now,
        active_groups: 0,
        online_count: 200,
        weight: 1.0 - i as f64 / 10_000.0,
        ..NodeDetail::default()
    }
}

pub async fn seed_nodes(store: &MemoryStorage, range: std::ops::Range<usize>) -> Vec<String> {
    let mut ids = Vec::new();
    for i in range {
        let node = mature_node(i);
        ids.push(node.peer.id.clone());
        store.put_node(node).await.unwrap();
    }
    ids
}

/// Inserts a group of `class` whose members are `members`, all online at
/// version 0.
pub async fn seed_group(store: &MemoryStorage, id: &str, class: usize, members: &[String]) -> Group {
    let group = Group {
        id: id.to_string(),
        class,
        profile: GROUP_PROFILES[class],
        size: 0,
        first_finish_ver: 0,
        deleted_ver: 0,
        created_tm: now(),
    };
    store.insert_group(group.clone()).await.unwrap();

    for member in members {
        store
            .add_member(id, GroupNode::joined(member.clone()))
            .await
            .unwrap();
    }

    group
}

/// An online heartbeat of node `i`.
pub fn report(i: usize) -> NodeReport {
    NodeReport {
        peer: Peer {
            id: node_id(i),
            ip: node_ip(i),
            port: 9000,
            nat_type: 1,
            ..Peer::default()
        },
        total_space: 100 * GIB,
        left_space: 50 * GIB,
        online: true,
        ..NodeReport::default()
    }
}
