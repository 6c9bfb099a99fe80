use std::collections::HashMap;

use async_trait::async_trait;
use meshvault_storage::{ClassUsage, Group, GroupNode, GroupStore, MemberState, Peer};

use crate::{Error, MemoryStorage};

#[async_trait]
impl GroupStore for MemoryStorage {
    async fn insert_group(&self, group: Group) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;

        if state.groups.contains_key(&group.id) {
            return Err(Error::GroupExists(group.id));
        }
        state.members.entry(group.id.clone()).or_default();
        state.groups.insert(group.id.clone(), group);

        Ok(())
    }

    async fn get_group(&self, id: &str) -> Result<Option<Group>, Self::Error> {
        Ok(self.state.lock().await.groups.get(id).cloned())
    }

    async fn groups(&self) -> Result<Vec<Group>, Self::Error> {
        Ok(self.state.lock().await.groups.values().cloned().collect())
    }

    async fn adjust_group_size(&self, id: &str, delta: i64) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        let group = state.group_mut(id)?;
        group.size = group.size.saturating_add_signed(delta);

        Ok(())
    }

    async fn recalculate_group_size(&self, id: &str) -> Result<u64, Self::Error> {
        let mut state = self.state.lock().await;
        let size = state.group_size(id);
        state.group_mut(id)?.size = size;

        Ok(size)
    }

    async fn set_first_finish_ver(&self, id: &str, ver: u64) -> Result<(), Self::Error> {
        self.state.lock().await.group_mut(id)?.first_finish_ver = ver;

        Ok(())
    }

    async fn set_deleted_ver(&self, id: &str, ver: u64) -> Result<(), Self::Error> {
        self.state.lock().await.group_mut(id)?.deleted_ver = ver;

        Ok(())
    }

    async fn class_usage(
        &self,
        node_capacity: u64,
    ) -> Result<HashMap<usize, ClassUsage>, Self::Error> {
        let state = self.state.lock().await;
        let mut usage: HashMap<usize, ClassUsage> = HashMap::new();

        for group in state.groups.values() {
            if group.is_full(node_capacity) {
                continue;
            }
            let entry = usage.entry(group.class).or_default();
            entry.capacity += group.capacity(node_capacity);
            entry.used += group.size;
        }

        Ok(usage)
    }

    async fn add_member(&self, group: &str, member: GroupNode) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;

        if !state.groups.contains_key(group) {
            return Err(Error::UnknownGroup(group.to_string()));
        }
        let members = state.members.entry(group.to_string()).or_default();
        if members.contains_key(&member.node) {
            return Err(Error::MemberExists {
                group: group.to_string(),
                node: member.node,
            });
        }
        members.insert(member.node.clone(), member);

        Ok(())
    }

    async fn put_member(&self, group: &str, member: GroupNode) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        let existing = state
            .members
            .get_mut(group)
            .and_then(|members| members.get_mut(&member.node))
            .ok_or_else(|| Error::UnknownMember {
                group: group.to_string(),
                node: member.node.clone(),
            })?;
        *existing = member;

        Ok(())
    }

    async fn remove_member(&self, group: &str, node: &str) -> Result<(), Self::Error> {
        if let Some(members) = self.state.lock().await.members.get_mut(group) {
            members.remove(node);
        }

        Ok(())
    }

    async fn member(&self, group: &str, node: &str) -> Result<Option<GroupNode>, Self::Error> {
        Ok(self
            .state
            .lock()
            .await
            .members
            .get(group)
            .and_then(|members| members.get(node))
            .cloned())
    }

    async fn members(&self, group: &str) -> Result<Vec<GroupNode>, Self::Error> {
        Ok(self
            .state
            .lock()
            .await
            .members
            .get(group)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn online_member_count(&self, group: &str) -> Result<usize, Self::Error> {
        Ok(self
            .state
            .lock()
            .await
            .members
            .get(group)
            .map_or(0, |members| {
                members.values().filter(|member| member.is_online()).count()
            }))
    }

    async fn online_member_counts(&self) -> Result<HashMap<String, usize>, Self::Error> {
        let state = self.state.lock().await;

        Ok(state
            .members
            .iter()
            .filter_map(|(group, members)| {
                let online = members.values().filter(|member| member.is_online()).count();
                (online > 0).then(|| (group.clone(), online))
            })
            .collect())
    }

    async fn members_at_version(
        &self,
        group: &str,
        ver: u64,
        member_state: Option<MemberState>,
    ) -> Result<usize, Self::Error> {
        Ok(self
            .state
            .lock()
            .await
            .members
            .get(group)
            .map_or(0, |members| {
                members
                    .values()
                    .filter(|member| member.ver >= ver)
                    .filter(|member| member_state.is_none_or(|state| member.state == state))
                    .count()
            }))
    }

    async fn holders(&self, group: &str, ver: u64) -> Result<Vec<Peer>, Self::Error> {
        let state = self.state.lock().await;
        let Some(members) = state.members.get(group) else {
            return Ok(Vec::new());
        };

        Ok(members
            .values()
            .filter(|member| member.is_online() && member.ver >= ver)
            .filter_map(|member| state.nodes.get(&member.node))
            .map(|node| node.peer.clone())
            .collect())
    }

    async fn lacking_members(&self, group: &str, ver: u64) -> Result<Vec<String>, Self::Error> {
        Ok(self
            .state
            .lock()
            .await
            .members
            .get(group)
            .map(|members| {
                members
                    .values()
                    .filter(|member| member.ver < ver)
                    .map(|member| member.node.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn node_groups(&self, node: &str) -> Result<Vec<Group>, Self::Error> {
        let state = self.state.lock().await;

        Ok(state
            .members
            .iter()
            .filter(|(_, members)| members.contains_key(node))
            .filter_map(|(group, _)| state.groups.get(group).cloned())
            .collect())
    }

    async fn node_memberships(
        &self,
        node: &str,
    ) -> Result<HashMap<String, GroupNode>, Self::Error> {
        let state = self.state.lock().await;

        Ok(state
            .members
            .iter()
            .filter_map(|(group, members)| {
                members
                    .get(node)
                    .map(|member| (group.clone(), member.clone()))
            })
            .collect())
    }
}
