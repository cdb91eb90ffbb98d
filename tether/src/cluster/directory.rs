//! Storage for cluster membership.

use std::fmt;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::cluster::{NodeId, NodeInfo};

/// Linearizable map of cluster members.
///
/// Writers never overwrite blindly: new members go through
/// [`insert_new`](NodeDirectory::insert_new) and updates through
/// [`compare_and_set`](NodeDirectory::compare_and_set), which only succeeds
/// if the stored record still has the version the writer read.
#[async_trait]
pub trait NodeDirectory: Send + Sync + fmt::Debug {
    async fn get(&self, id: &NodeId) -> Option<NodeInfo>;

    /// Insert `info` unless a record for its id exists. Returns whether it
    /// was inserted.
    async fn insert_new(&self, info: NodeInfo) -> bool;

    /// Replace `expected` with `updated` if the stored version still matches.
    ///
    /// On success the stored record has its version bumped and is returned.
    async fn compare_and_set(&self, expected: &NodeInfo, updated: NodeInfo) -> Option<NodeInfo>;

    async fn remove(&self, id: &NodeId) -> Option<NodeInfo>;

    async fn entries(&self) -> Vec<NodeInfo>;
}

/// Process-local [`NodeDirectory`].
///
/// Shared by every node of an in-process cluster.
#[derive(Debug, Default)]
pub struct InMemoryNodeDirectory {
    nodes: DashMap<NodeId, NodeInfo>,
}

impl InMemoryNodeDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeDirectory for InMemoryNodeDirectory {
    async fn get(&self, id: &NodeId) -> Option<NodeInfo> {
        self.nodes.get(id).map(|entry| entry.value().clone())
    }

    async fn insert_new(&self, info: NodeInfo) -> bool {
        match self.nodes.entry(info.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(info);
                true
            }
        }
    }

    async fn compare_and_set(&self, expected: &NodeInfo, mut updated: NodeInfo) -> Option<NodeInfo> {
        let mut current = self.nodes.get_mut(&expected.id)?;
        if current.version != expected.version {
            return None;
        }
        updated.version = expected.version + 1;
        *current = updated.clone();
        Some(updated)
    }

    async fn remove(&self, id: &NodeId) -> Option<NodeInfo> {
        self.nodes.remove(id).map(|(_, info)| info)
    }

    async fn entries(&self) -> Vec<NodeInfo> {
        self.nodes.iter().map(|entry| entry.value().clone()).collect()
    }
}
