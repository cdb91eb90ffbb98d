//! Cluster membership: node identity, leases and the node directory.

mod directory;
mod manager;
mod node;

pub use directory::{InMemoryNodeDirectory, NodeDirectory};
pub use manager::ClusterManager;
pub use node::{NodeCapabilities, NodeId, NodeInfo, NodeLease, NodeStatus};
