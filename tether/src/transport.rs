//! Moving encoded messages between nodes.
//!
//! The runtime only needs two things from a network: deliver bytes to a
//! node, and hand received bytes to the local pipeline. Framing and
//! chunking of large messages belong to the [`Transport`] implementation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use crate::cluster::NodeId;
use crate::pipeline::PipelineHandle;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("node {0} is not reachable")]
    Unreachable(NodeId),

    #[error("node {0} is already connected")]
    AlreadyConnected(NodeId),

    #[error("receiver rejected message: {0}")]
    Rejected(String),
}

/// Receiving end of a node's connection.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, bytes: Vec<u8>) -> Result<(), TransportError>;
}

impl MessageSink for PipelineHandle {
    fn deliver(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.on_receive(bytes)
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }
}

/// Network between nodes.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Start receiving messages addressed to `node` into `sink`.
    async fn connect(&self, node: &NodeId, sink: Arc<dyn MessageSink>) -> Result<(), TransportError>;

    /// Stop receiving for `node`.
    async fn disconnect(&self, node: &NodeId);

    /// Fire-and-forget delivery of one encoded message.
    async fn send(&self, target: &NodeId, bytes: Vec<u8>) -> Result<(), TransportError>;
}

/// In-process network connecting nodes that share one address space.
#[derive(Default)]
pub struct LocalNetwork {
    sinks: DashMap<NodeId, Arc<dyn MessageSink>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self, node: &NodeId) -> bool {
        self.sinks.contains_key(node)
    }
}

impl fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("connected", &self.sinks.len())
            .finish()
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn connect(&self, node: &NodeId, sink: Arc<dyn MessageSink>) -> Result<(), TransportError> {
        match self.sinks.entry(node.clone()) {
            Entry::Occupied(_) => Err(TransportError::AlreadyConnected(node.clone())),
            Entry::Vacant(slot) => {
                slot.insert(sink);
                tracing::debug!(node = %node, "node connected");
                Ok(())
            }
        }
    }

    async fn disconnect(&self, node: &NodeId) {
        if self.sinks.remove(node).is_some() {
            tracing::debug!(node = %node, "node disconnected");
        }
    }

    async fn send(&self, target: &NodeId, bytes: Vec<u8>) -> Result<(), TransportError> {
        // Clone the sink out so no map guard is held while delivering.
        let sink = self
            .sinks
            .get(target)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::Unreachable(target.clone()))?;
        sink.deliver(bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Vec<u8>>>);

    impl MessageSink for Collect {
        fn deliver(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
            self.0.lock().expect("lock").push(bytes);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_send_reaches_connected_node_only() {
        let network = LocalNetwork::new();
        let a = NodeId::new("a", "default");
        let b = NodeId::new("b", "default");
        let sink = Arc::new(Collect::default());
        network.connect(&a, sink.clone()).await.expect("connect");

        network.send(&a, b"hello".to_vec()).await.expect("send");
        let missing = network.send(&b, b"lost".to_vec()).await;

        assert_eq!(*sink.0.lock().expect("lock"), vec![b"hello".to_vec()]);
        assert_eq!(missing, Err(TransportError::Unreachable(b)));
    }

    #[tokio::test]
    async fn test_double_connect_and_disconnect() {
        let network = LocalNetwork::new();
        let a = NodeId::new("a", "default");
        network.connect(&a, Arc::new(Collect::default())).await.expect("connect");

        let again = network.connect(&a, Arc::new(Collect::default())).await;
        assert_eq!(again, Err(TransportError::AlreadyConnected(a.clone())));

        network.disconnect(&a).await;
        assert!(!network.is_connected(&a));
    }
}
