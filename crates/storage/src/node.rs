use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Backend, NodeCheckpoint};

/// NAT types behind which a node still accepts inbound connections.
const REACHABLE_NAT_TYPES: [u8; 2] = [1, 2];

/// Network identity of a node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Node id.
    pub id: String,

    /// Public IPv4 address as reported by the node.
    pub ip: String,

    /// Public port.
    pub port: u16,

    /// NAT classification reported by the node.
    pub nat_type: u8,

    /// Address other nodes should dial when relaying through this node.
    pub upnp_ip: String,

    /// Port other nodes should dial when relaying through this node.
    pub upnp_port: u16,

    /// Whether the node can be dialled directly.
    pub upnp_available: bool,
}

impl Peer {
    /// Returns a copy with the UPnP fields derived from the NAT type.
    #[must_use]
    pub fn with_upnp_availability(mut self) -> Self {
        if REACHABLE_NAT_TYPES.contains(&self.nat_type) {
            self.upnp_ip.clone_from(&self.ip);
            self.upnp_port = self.port;
            self.upnp_available = true;
        } else {
            self.upnp_available = false;
        }
        self
    }

    /// First two octets of the IPv4 address, used for network diversity.
    ///
    /// Returns `None` if the address is not a valid IPv4 address.
    #[must_use]
    pub fn ip_prefix(&self) -> Option<String> {
        let addr: std::net::Ipv4Addr = self.ip.parse().ok()?;
        let [a, b, _, _] = addr.octets();
        Some(format!("{a}.{b}"))
    }
}

/// A heartbeat payload as reported by a node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    /// Network identity.
    pub peer: Peer,

    /// Total disk space in bytes.
    pub total_space: u64,

    /// Free disk space in bytes as seen by the node.
    pub left_space: u64,

    /// Whether the node considers itself online.
    pub online: bool,

    /// Measured upload speed in bytes per second.
    pub up_speed: u64,

    /// Bytes uploaded since the last report.
    pub upload: u64,

    /// Bytes downloaded since the last report.
    pub download: u64,
}

/// The registry record of a node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDetail {
    /// Network identity.
    pub peer: Peer,

    /// Total disk space in bytes.
    pub total_space: u64,

    /// Space still available for replication in bytes.
    pub left_space: u64,

    /// Share of the disk (percent) the node lends to replication.
    pub percent: u8,

    /// Last heartbeat in which the node was online (unix seconds).
    pub update_tm: i64,

    /// Registration time (unix seconds).
    pub reg_tm: i64,

    /// Last heartbeat of any kind (unix seconds).
    pub online_tm: i64,

    /// Number of joined groups that are not full yet.
    pub active_groups: u32,

    /// Online reports over the aggregation window.
    pub online_count: u32,

    /// Selection weight; higher is preferred.
    pub weight: f64,

    /// Measured upload speed in bytes per second.
    pub up_speed: u64,

    /// Bytes uploaded since the last report.
    pub upload: u64,

    /// Bytes downloaded since the last report.
    pub download: u64,
}

impl NodeDetail {
    /// Share of the disk lent by a node registered without a report.
    pub const DEFAULT_PERCENT: u8 = 50;

    /// A freshly registered node that has not reported yet.
    #[must_use]
    pub fn registered(id: impl Into<String>, now: i64) -> Self {
        Self {
            peer: Peer {
                id: id.into(),
                ..Peer::default()
            },
            percent: Self::DEFAULT_PERCENT,
            reg_tm: now,
            ..Self::default()
        }
    }

    /// Node id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.peer.id
    }
}

/// Criteria for selecting candidate nodes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeFilter {
    /// Minimum `left_space` in bytes.
    pub min_free_space: u64,

    /// Only nodes whose `update_tm` is later than this.
    pub updated_after: i64,

    /// Only nodes registered before this.
    pub registered_before: i64,

    /// Only nodes with fewer active groups than this.
    pub max_active_groups: Option<u32>,

    /// Minimum `online_count`.
    pub min_online_count: u32,

    /// Only nodes that belong to no group at all.
    pub ungrouped_only: bool,
}

/// Node registry persistence.
#[async_trait]
pub trait NodeStore: Backend {
    /// Fetches one node.
    async fn get_node(&self, id: &str) -> Result<Option<NodeDetail>, Self::Error>;

    /// Fetches several nodes; unknown ids are skipped.
    async fn get_nodes(&self, ids: &[String]) -> Result<Vec<NodeDetail>, Self::Error>;

    /// Inserts or replaces a node record.
    ///
    /// Implementations count a write whose `update_tm` moved forward as one
    /// online report for [`NodeStore::online_report_counts`].
    async fn put_node(&self, node: NodeDetail) -> Result<(), Self::Error>;

    /// Deletes a node record.
    async fn delete_node(&self, id: &str) -> Result<(), Self::Error>;

    /// Overwrites the selection weight of a node.
    async fn set_node_weight(&self, id: &str, weight: f64) -> Result<(), Self::Error>;

    /// Adds one to the active group counter of a node.
    async fn increment_active_groups(&self, id: &str) -> Result<(), Self::Error>;

    /// Ids of nodes matching the filter, highest weight first.
    async fn available_nodes(
        &self,
        filter: &NodeFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, Self::Error>;

    /// Number of nodes matching the filter.
    async fn count_available_nodes(&self, filter: &NodeFilter) -> Result<usize, Self::Error>;

    /// Nodes with `update_tm <= until` that sort after the checkpoint by
    /// `(update_tm, id)`, in that order.
    async fn timed_out_nodes(
        &self,
        after: &NodeCheckpoint,
        until: i64,
        limit: usize,
    ) -> Result<Vec<NodeDetail>, Self::Error>;

    /// Ids of nodes whose last online heartbeat, or registration if they
    /// never reported, is older than `before`.
    async fn inactive_nodes(&self, before: i64, limit: usize) -> Result<Vec<String>, Self::Error>;

    /// One page of node ids in ascending order, starting after `after`.
    async fn node_ids(&self, after: Option<&str>, limit: usize)
    -> Result<Vec<String>, Self::Error>;

    /// Number of online reports per node since `since`.
    async fn online_report_counts(
        &self,
        ids: &[String],
        since: i64,
    ) -> Result<HashMap<String, u32>, Self::Error>;

    /// Persists aggregated online report counts.
    async fn set_online_counts(&self, counts: HashMap<String, u32>) -> Result<(), Self::Error>;

    /// Peers of the given nodes that were online after `updated_after`.
    async fn online_peers(
        &self,
        ids: &[String],
        updated_after: i64,
    ) -> Result<Vec<Peer>, Self::Error>;

    /// Online peers that accept inbound connections.
    async fn delegates(&self, updated_after: i64, limit: usize) -> Result<Vec<Peer>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upnp_availability_follows_nat_type() {
        let peer = Peer {
            id: "n1".to_string(),
            ip: "10.1.2.3".to_string(),
            port: 4000,
            nat_type: 2,
            ..Peer::default()
        }
        .with_upnp_availability();

        assert!(peer.upnp_available);
        assert_eq!(peer.upnp_ip, "10.1.2.3");
        assert_eq!(peer.upnp_port, 4000);

        let symmetric = Peer {
            nat_type: 4,
            ..peer
        }
        .with_upnp_availability();
        assert!(!symmetric.upnp_available);
    }

    #[test]
    fn test_ip_prefix() {
        let peer = Peer {
            ip: "192.168.7.9".to_string(),
            ..Peer::default()
        };
        assert_eq!(peer.ip_prefix().as_deref(), Some("192.168"));

        let bad = Peer {
            ip: "not-an-ip".to_string(),
            ..Peer::default()
        };
        assert_eq!(bad.ip_prefix(), None);
    }
}
