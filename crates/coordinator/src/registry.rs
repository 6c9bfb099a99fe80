//! Node registry: registration, heartbeats and placement weights.

use std::collections::HashMap;

use meshvault_locks::LockManager;
use meshvault_storage::{
    DataSource, ExpandNode, Group, GroupNode, MemberState, NodeDetail, NodeReport, Peer,
};
use tracing::{debug, info, warn};

use crate::coordinator::{Coordinator, secs, unix_now};
use crate::error::{Error, Result};
use crate::ledger::add_key;

/// A membership of the heartbeating node, as returned to it.
#[derive(Clone, Debug, PartialEq)]
pub struct MemberView {
    /// The group.
    pub group: Group,
    /// The node's membership after reconciliation.
    pub member: GroupNode,
    /// Latest version drawn in the group.
    pub group_ver: u64,
    /// Latest NEW_ADD version drawn in the group.
    pub add_ver: u64,
}

/// Reply to a heartbeat.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Heartbeat {
    /// Groups the node should look at.
    pub groups: Vec<MemberView>,
    /// Tasks handed to the node.
    pub tasks: Vec<ExpandNode>,
    /// Reported groups the node no longer belongs to.
    pub removed_groups: Vec<String>,
}

/// Placement weight: favours nodes in few groups, randomised by `r` in
/// `[0, 1)`. Nodes seen online fewer than `min_online_count` times weigh 0.
#[must_use]
pub fn node_weight(online_count: u32, active_groups: u32, min_online_count: u32, r: f64) -> f64 {
    if online_count < min_online_count {
        return 0.0;
    }

    (1.0 / ((1.0 + f64::from(active_groups)).log2() + 1.0)) * (r + 1e-15)
}

/// Detail snapshot after a heartbeat.
fn refreshed_detail(
    detail: NodeDetail,
    report: NodeReport,
    percent: u8,
    group_count: usize,
    node_capacity: u64,
    weight: f64,
    now: i64,
) -> NodeDetail {
    let share = report.total_space * u64::from(percent) / 100;
    let used = node_capacity.saturating_mul(group_count as u64);
    let left_space = share.saturating_sub(used).min(report.left_space);

    NodeDetail {
        peer: report.peer.with_upnp_availability(),
        total_space: report.total_space,
        left_space,
        percent,
        online_tm: now,
        update_tm: if report.online { now } else { detail.update_tm },
        weight: if report.online { weight } else { 0.0 },
        up_speed: report.up_speed,
        upload: report.upload,
        download: report.download,
        ..detail
    }
}

impl<D, L> Coordinator<D, L>
where
    D: DataSource,
    L: LockManager,
{
    /// Registers a node. Registering a known node changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the store failed.
    pub async fn add_node(&self, id: &str) -> Result<()> {
        if self
            .store()
            .get_node(id)
            .await
            .map_err(Error::persistence)?
            .is_some()
        {
            return Ok(());
        }

        self.store()
            .put_node(NodeDetail::registered(id, unix_now()))
            .await
            .map_err(Error::persistence)?;
        info!("registered node {}", id);

        Ok(())
    }

    /// Removes a node from its groups, re-expands them and forgets it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the store failed. Expansion
    /// failures are logged.
    pub async fn delete_node(&self, id: &str) -> Result<()> {
        let groups = self
            .store()
            .node_groups(id)
            .await
            .map_err(Error::persistence)?;

        for group in &groups {
            self.store()
                .remove_member(&group.id, id)
                .await
                .map_err(Error::persistence)?;
        }

        let ceiling = self.config().groups.expansion_active_ceiling;
        for group in &groups {
            if let Err(e) = self.expand_to_perfect_size(group, ceiling, None).await {
                warn!("re-expanding {} after deleting {} failed: {}", group.id, id, e);
            }
        }

        self.store()
            .delete_node(id)
            .await
            .map_err(Error::persistence)?;
        info!("deleted node {} from {} groups", id, groups.len());

        Ok(())
    }

    /// Heartbeat returning every group of the node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unregistered node.
    pub async fn update_node(
        &self,
        report: NodeReport,
        versions: &HashMap<String, u64>,
        task_ids: &[u64],
        is_super: bool,
    ) -> Result<Heartbeat> {
        let (groups, tasks) = self.heartbeat(report, versions, task_ids, is_super).await?;

        Ok(Heartbeat {
            groups,
            tasks,
            removed_groups: Vec::new(),
        })
    }

    /// Heartbeat returning only the groups whose version moved past what the
    /// node reported, plus the reported groups it left.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unregistered node.
    pub async fn update_node2(
        &self,
        report: NodeReport,
        versions: &HashMap<String, u64>,
        task_ids: &[u64],
        is_super: bool,
    ) -> Result<Heartbeat> {
        let (groups, tasks) = self.heartbeat(report, versions, task_ids, is_super).await?;

        let mut removed_groups: Vec<String> = versions
            .keys()
            .filter(|id| !groups.iter().any(|view| &view.group.id == *id))
            .cloned()
            .collect();
        removed_groups.sort();

        let groups = groups
            .into_iter()
            .filter(|view| versions.get(&view.group.id) != Some(&view.group_ver))
            .collect();

        Ok(Heartbeat {
            groups,
            tasks,
            removed_groups,
        })
    }

    /// Recomputes the placement weight of the given nodes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the nodes could not be read. Single
    /// failed writes are logged.
    pub async fn reweight(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let min_online_count = self.config().nodes.min_online_count;
        let nodes = self
            .store()
            .get_nodes(ids)
            .await
            .map_err(Error::persistence)?;

        for node in nodes {
            let weight = node_weight(
                node.online_count,
                node.active_groups,
                min_online_count,
                rand::random::<f64>(),
            );
            if let Err(e) = self.store().set_node_weight(node.id(), weight).await {
                warn!("failed to reweight {}: {}", node.id(), e);
            }
        }

        Ok(())
    }

    /// Online nodes reachable from outside, usable as delegates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the store failed.
    pub async fn delegates(&self, limit: usize) -> Result<Vec<Peer>> {
        let updated_after = unix_now() - secs(self.config().nodes.liveness);
        self.store()
            .delegates(updated_after, limit)
            .await
            .map_err(Error::persistence)
    }

    /// Details of the given nodes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the store failed.
    pub async fn nodes(&self, ids: &[String]) -> Result<Vec<NodeDetail>> {
        self.store().get_nodes(ids).await.map_err(Error::persistence)
    }

    /// Online peers among `ids`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the store failed.
    pub async fn online_nodes(&self, ids: &[String]) -> Result<Vec<Peer>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let updated_after = unix_now() - secs(self.config().nodes.liveness);
        self.store()
            .online_peers(ids, updated_after)
            .await
            .map_err(Error::persistence)
    }

    async fn heartbeat(
        &self,
        mut report: NodeReport,
        versions: &HashMap<String, u64>,
        task_ids: &[u64],
        is_super: bool,
    ) -> Result<(Vec<MemberView>, Vec<ExpandNode>)> {
        let id = report.peer.id.clone();
        let detail = self
            .store()
            .get_node(&id)
            .await
            .map_err(Error::persistence)?
            .ok_or_else(|| Error::not_found(format!("node {id}")))?;

        let nodes = &self.config().nodes;
        report.online = report.online && is_super;
        let percent = if is_super {
            nodes.super_percent
        } else {
            nodes.normal_percent
        };

        let groups = self
            .store()
            .node_groups(&id)
            .await
            .map_err(Error::persistence)?;
        let mut memberships = self
            .store()
            .node_memberships(&id)
            .await
            .map_err(Error::persistence)?;

        let active_groups = groups
            .iter()
            .filter(|group| !group.is_full(nodes.node_capacity))
            .count();

        if report.online {
            for group in &groups {
                let (Some(ver), Some(member)) = (versions.get(&group.id), memberships.get_mut(&group.id))
                else {
                    continue;
                };
                if let Some(updated) = self.reconcile_member(group, member, *ver).await? {
                    *member = updated;
                }
            }
        }

        let renewed = self.renew_task_leases(&id, task_ids).await?;
        if renewed > 0 {
            debug!("renewed {} task leases of {}", renewed, id);
        }

        let active_groups = u32::try_from(active_groups).unwrap_or(u32::MAX);
        let weight = node_weight(
            detail.online_count,
            active_groups,
            nodes.min_online_count,
            rand::random::<f64>(),
        );
        let refreshed = refreshed_detail(
            NodeDetail {
                active_groups,
                ..detail
            },
            report,
            percent,
            groups.len(),
            nodes.node_capacity,
            weight,
            unix_now(),
        );
        self.store()
            .put_node(refreshed)
            .await
            .map_err(Error::persistence)?;

        let mut views = Vec::with_capacity(groups.len());
        for group in groups {
            let Some(member) = memberships.remove(&group.id) else {
                continue;
            };
            let group_ver = self
                .store()
                .current_version(&group.id)
                .await
                .map_err(Error::persistence)?;
            let add_ver = self
                .store()
                .current_version(&add_key(&group.id))
                .await
                .map_err(Error::persistence)?;

            views.push(MemberView {
                group,
                member,
                group_ver,
                add_ver,
            });
        }

        let tasks = self.hand_out_tasks(&id).await?;

        Ok((views, tasks))
    }

    /// Applies a reported version to a membership. Returns the stored
    /// membership if it changed.
    async fn reconcile_member(
        &self,
        group: &Group,
        member: &GroupNode,
        ver: u64,
    ) -> Result<Option<GroupNode>> {
        if ver == member.ver && member.is_online() && ver >= member.max_ver {
            return Ok(None);
        }

        let max_ver = member.max_ver.max(ver);
        let regression = self.config().nodes.regression_percent;
        let state = if u128::from(ver) * 100 < u128::from(max_ver) * u128::from(regression) {
            MemberState::Offline
        } else {
            MemberState::Online
        };

        let updated = GroupNode {
            node: member.node.clone(),
            ver,
            state,
            max_ver,
        };
        self.store()
            .put_member(&group.id, updated.clone())
            .await
            .map_err(Error::persistence)?;

        if max_ver > member.max_ver {
            self.refresh_first_finish_ver(&group.id).await?;
        }

        Ok(Some(updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_requires_online_history() {
        assert_eq!(node_weight(143, 0, 144, 0.5), 0.0);
        assert!(node_weight(144, 0, 144, 0.5) > 0.0);
    }

    #[test]
    fn test_weight_prefers_fewer_groups() {
        let idle = node_weight(200, 0, 144, 0.5);
        let busy = node_weight(200, 7, 144, 0.5);

        assert!((idle - 0.5).abs() < 1e-9);
        assert!((busy - 0.125).abs() < 1e-9);
        assert!(node_weight(200, 3, 144, 0.0) > 0.0);
    }

    #[test]
    fn test_refreshed_detail() {
        let detail = NodeDetail {
            update_tm: 10,
            ..NodeDetail::registered("n1", 0)
        };
        let report = NodeReport {
            peer: Peer {
                id: "n1".to_string(),
                ip: "10.0.0.1".to_string(),
                port: 9000,
                nat_type: 1,
                ..Peer::default()
            },
            total_space: 1000,
            left_space: 400,
            online: true,
            ..NodeReport::default()
        };

        let online = refreshed_detail(detail.clone(), report.clone(), 50, 1, 100, 0.7, 99);
        assert_eq!(online.left_space, 400);
        assert_eq!(online.update_tm, 99);
        assert_eq!(online.online_tm, 99);
        assert!(online.peer.upnp_available);
        assert!((online.weight - 0.7).abs() < f64::EPSILON);

        let crowded = refreshed_detail(detail.clone(), report.clone(), 50, 6, 100, 0.7, 99);
        assert_eq!(crowded.left_space, 0);

        let offline = refreshed_detail(
            detail,
            NodeReport {
                online: false,
                ..report
            },
            1,
            0,
            100,
            0.7,
            99,
        );
        assert_eq!(offline.left_space, 10);
        assert_eq!(offline.update_tm, 10);
        assert_eq!(offline.weight, 0.0);
    }
}
