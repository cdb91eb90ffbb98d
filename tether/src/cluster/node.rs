//! Node identity, capabilities, status and lease.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::time::Timestamp;

/// Identity of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub key: String,
    pub namespace: String,
}

impl NodeId {
    pub fn new(key: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            namespace: namespace.into(),
        }
    }

    /// Fresh random identity in `namespace`.
    pub fn generate(namespace: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), namespace)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.key)
    }
}

/// Addressable types a node can host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    pub addressable_types: BTreeSet<String>,
}

impl NodeCapabilities {
    pub fn supports(&self, addressable_type: &str) -> bool {
        self.addressable_types.contains(addressable_type)
    }
}

/// Lifecycle of a node as seen by the rest of the cluster.
///
/// ```text
/// Starting → Active → Draining → Stopping → Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Starting,
    /// Accepts new placements.
    Active,
    /// Serves existing addressables, takes no new ones.
    Draining,
    Stopping,
    Stopped,
}

/// Time-bounded proof of membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLease {
    /// Secret presented on renewal.
    pub challenge_token: String,
    pub expires_at: Timestamp,
    pub renew_at: Timestamp,
}

impl NodeLease {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }
}

/// Everything the cluster knows about one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub capabilities: NodeCapabilities,
    pub lease: NodeLease,
    pub status: NodeStatus,
    /// Members this node could see when it last joined or renewed.
    pub visible_nodes: BTreeSet<NodeId>,
    /// Bumped by the node directory on every successful write.
    pub version: u64,
}

impl NodeInfo {
    /// Present, leased and not stopped.
    pub fn is_alive(&self, now: Timestamp) -> bool {
        !self.lease.is_expired(now) && self.status != NodeStatus::Stopped
    }

    /// Can accept a new activation of `addressable_type`.
    pub fn is_eligible(&self, addressable_type: &str, now: Timestamp) -> bool {
        self.status == NodeStatus::Active
            && !self.lease.is_expired(now)
            && self.capabilities.supports(addressable_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(status: NodeStatus, expires_at: u64) -> NodeInfo {
        NodeInfo {
            id: NodeId::new("a", "default"),
            capabilities: NodeCapabilities {
                addressable_types: ["Counter".to_string()].into_iter().collect(),
            },
            lease: NodeLease {
                challenge_token: "t".to_string(),
                expires_at: Timestamp::from_millis(expires_at),
                renew_at: Timestamp::from_millis(expires_at / 2),
            },
            status,
            visible_nodes: BTreeSet::new(),
            version: 0,
        }
    }

    #[test]
    fn test_eligibility_requires_active_leased_and_capable() {
        let now = Timestamp::from_millis(100);

        assert!(node(NodeStatus::Active, 200).is_eligible("Counter", now));
        assert!(!node(NodeStatus::Active, 200).is_eligible("Ledger", now));
        assert!(!node(NodeStatus::Active, 100).is_eligible("Counter", now));
        assert!(!node(NodeStatus::Draining, 200).is_eligible("Counter", now));
        assert!(!node(NodeStatus::Starting, 200).is_eligible("Counter", now));
    }

    #[test]
    fn test_draining_node_is_still_alive() {
        let now = Timestamp::from_millis(100);

        assert!(node(NodeStatus::Draining, 200).is_alive(now));
        assert!(!node(NodeStatus::Stopped, 200).is_alive(now));
        assert!(!node(NodeStatus::Active, 50).is_alive(now));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = NodeId::generate("default");
        let b = NodeId::generate("default");
        assert_ne!(a, b);
        assert_eq!(a.namespace, "default");
    }
}
