use std::collections::HashMap;
use std::ops::Bound;

use async_trait::async_trait;
use meshvault_storage::{NodeCheckpoint, NodeDetail, NodeFilter, NodeStore, Peer};

use crate::{Error, MemoryStorage, State};

impl State {
    fn is_grouped(&self, node: &str) -> bool {
        self.members.values().any(|members| members.contains_key(node))
    }

    fn matches(&self, node: &NodeDetail, filter: &NodeFilter) -> bool {
        node.left_space >= filter.min_free_space
            && node.update_tm > filter.updated_after
            && node.reg_tm < filter.registered_before
            && filter
                .max_active_groups
                .is_none_or(|max| node.active_groups < max)
            && node.online_count >= filter.min_online_count
            && (!filter.ungrouped_only || !self.is_grouped(node.id()))
    }
}

#[async_trait]
impl NodeStore for MemoryStorage {
    async fn get_node(&self, id: &str) -> Result<Option<NodeDetail>, Self::Error> {
        Ok(self.state.lock().await.nodes.get(id).cloned())
    }

    async fn get_nodes(&self, ids: &[String]) -> Result<Vec<NodeDetail>, Self::Error> {
        let state = self.state.lock().await;

        Ok(ids
            .iter()
            .filter_map(|id| state.nodes.get(id).cloned())
            .collect())
    }

    async fn put_node(&self, node: NodeDetail) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        let previous = state.nodes.get(node.id()).map_or(0, |old| old.update_tm);

        if node.update_tm > previous {
            state
                .online_reports
                .entry(node.id().to_string())
                .or_default()
                .push(node.update_tm);
        }
        state.nodes.insert(node.id().to_string(), node);

        Ok(())
    }

    async fn delete_node(&self, id: &str) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state.nodes.remove(id);
        state.online_reports.remove(id);

        Ok(())
    }

    async fn set_node_weight(&self, id: &str, weight: f64) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::UnknownNode(id.to_string()))?;
        node.weight = weight;

        Ok(())
    }

    async fn increment_active_groups(&self, id: &str) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::UnknownNode(id.to_string()))?;
        node.active_groups += 1;

        Ok(())
    }

    async fn available_nodes(
        &self,
        filter: &NodeFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, Self::Error> {
        let state = self.state.lock().await;
        let mut nodes: Vec<&NodeDetail> = state
            .nodes
            .values()
            .filter(|node| state.matches(node, filter))
            .collect();

        nodes.sort_by(|a, b| b.weight.total_cmp(&a.weight).then_with(|| a.id().cmp(b.id())));

        Ok(nodes
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|node| node.id().to_string())
            .collect())
    }

    async fn count_available_nodes(&self, filter: &NodeFilter) -> Result<usize, Self::Error> {
        let state = self.state.lock().await;

        Ok(state
            .nodes
            .values()
            .filter(|node| state.matches(node, filter))
            .count())
    }

    async fn timed_out_nodes(
        &self,
        after: &NodeCheckpoint,
        until: i64,
        limit: usize,
    ) -> Result<Vec<NodeDetail>, Self::Error> {
        let state = self.state.lock().await;
        let mut nodes: Vec<NodeDetail> = state
            .nodes
            .values()
            .filter(|node| {
                node.update_tm <= until
                    && (node.update_tm, node.id()) > (after.update_tm, after.id.as_str())
            })
            .cloned()
            .collect();

        nodes.sort_by(|a, b| a.update_tm.cmp(&b.update_tm).then_with(|| a.id().cmp(b.id())));
        nodes.truncate(limit);

        Ok(nodes)
    }

    async fn inactive_nodes(&self, before: i64, limit: usize) -> Result<Vec<String>, Self::Error> {
        let state = self.state.lock().await;

        Ok(state
            .nodes
            .values()
            .filter(|node| node.update_tm.max(node.reg_tm) < before)
            .take(limit)
            .map(|node| node.id().to_string())
            .collect())
    }

    async fn node_ids(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, Self::Error> {
        let state = self.state.lock().await;
        let lower = after.map_or(Bound::Unbounded, |id| Bound::Excluded(id.to_string()));

        Ok(state
            .nodes
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn online_report_counts(
        &self,
        ids: &[String],
        since: i64,
    ) -> Result<HashMap<String, u32>, Self::Error> {
        let state = self.state.lock().await;

        Ok(ids
            .iter()
            .map(|id| {
                let count = state.online_reports.get(id).map_or(0, |reports| {
                    reports.iter().filter(|tm| **tm >= since).count()
                });
                (id.clone(), u32::try_from(count).unwrap_or(u32::MAX))
            })
            .collect())
    }

    async fn set_online_counts(&self, counts: HashMap<String, u32>) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;

        for (id, count) in counts {
            if let Some(node) = state.nodes.get_mut(&id) {
                node.online_count = count;
            }
        }

        Ok(())
    }

    async fn online_peers(
        &self,
        ids: &[String],
        updated_after: i64,
    ) -> Result<Vec<Peer>, Self::Error> {
        let state = self.state.lock().await;

        Ok(ids
            .iter()
            .filter_map(|id| state.nodes.get(id))
            .filter(|node| node.update_tm > updated_after)
            .map(|node| node.peer.clone())
            .collect())
    }

    async fn delegates(&self, updated_after: i64, limit: usize) -> Result<Vec<Peer>, Self::Error> {
        let state = self.state.lock().await;

        Ok(state
            .nodes
            .values()
            .filter(|node| node.update_tm > updated_after && node.peer.upnp_available)
            .take(limit)
            .map(|node| node.peer.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, weight: f64, update_tm: i64) -> NodeDetail {
        NodeDetail {
            left_space: 10,
            update_tm,
            online_count: 200,
            weight,
            ..NodeDetail::registered(id, 0)
        }
    }

    fn filter() -> NodeFilter {
        NodeFilter {
            min_free_space: 10,
            updated_after: 50,
            registered_before: 1,
            max_active_groups: Some(3),
            min_online_count: 144,
            ungrouped_only: false,
        }
    }

    #[tokio::test]
    async fn test_timed_out_nodes_resume_within_a_second() {
        let storage = MemoryStorage::new();
        for id in ["a", "b", "c"] {
            storage.put_node(node(id, 1.0, 100)).await.unwrap();
        }
        storage.put_node(node("d", 1.0, 90)).await.unwrap();
        // still alive
        storage.put_node(node("e", 1.0, 500)).await.unwrap();

        let first = storage
            .timed_out_nodes(&NodeCheckpoint::default(), 200, 2)
            .await
            .unwrap();
        let ids: Vec<&str> = first.iter().map(NodeDetail::id).collect();
        assert_eq!(ids, vec!["d", "a"]);

        let checkpoint = NodeCheckpoint {
            update_tm: 100,
            id: "a".to_string(),
        };
        let rest = storage.timed_out_nodes(&checkpoint, 200, 10).await.unwrap();
        let ids: Vec<&str> = rest.iter().map(NodeDetail::id).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_available_nodes_ranked_by_weight() {
        let storage = MemoryStorage::new();
        storage.put_node(node("a", 0.1, 100)).await.unwrap();
        storage.put_node(node("b", 0.9, 100)).await.unwrap();
        storage.put_node(node("c", 0.5, 100)).await.unwrap();
        // stale heartbeat
        storage.put_node(node("d", 1.0, 10)).await.unwrap();

        let ids = storage.available_nodes(&filter(), 0, 10).await.unwrap();
        assert_eq!(ids, vec!["b", "c", "a"]);

        let page = storage.available_nodes(&filter(), 1, 1).await.unwrap();
        assert_eq!(page, vec!["c"]);
        assert_eq!(storage.count_available_nodes(&filter()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_online_reports_follow_update_time() {
        let storage = MemoryStorage::new();
        storage.put_node(node("a", 0.0, 100)).await.unwrap();
        storage.put_node(node("a", 0.0, 100)).await.unwrap();
        storage.put_node(node("a", 0.0, 200)).await.unwrap();

        let counts = storage
            .online_report_counts(&["a".to_string(), "b".to_string()], 150)
            .await
            .unwrap();
        assert_eq!(counts["a"], 1);
        assert_eq!(counts["b"], 0);
    }

    #[tokio::test]
    async fn test_node_ids_paginate() {
        let storage = MemoryStorage::new();
        for id in ["c", "a", "b"] {
            storage.put_node(node(id, 0.0, 1)).await.unwrap();
        }

        assert_eq!(storage.node_ids(None, 2).await.unwrap(), vec!["a", "b"]);
        assert_eq!(storage.node_ids(Some("b"), 2).await.unwrap(), vec!["c"]);
    }
}
