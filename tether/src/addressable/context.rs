//! Per-activation context handed to addressable methods and hooks.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::addressable::{AddressableProxy, AddressableReference, Key};
use crate::cluster::NodeId;
use crate::pipeline::PipelineHandle;
use crate::time::Timestamp;

/// What a running addressable knows about itself and its surroundings.
#[derive(Clone)]
pub struct AddressableContext {
    reference: AddressableReference,
    node_id: NodeId,
    activated_at: Timestamp,
    deactivation_requested: Arc<AtomicBool>,
    pipeline: PipelineHandle,
}

impl AddressableContext {
    pub(crate) fn new(
        reference: AddressableReference,
        node_id: NodeId,
        activated_at: Timestamp,
        deactivation_requested: Arc<AtomicBool>,
        pipeline: PipelineHandle,
    ) -> Self {
        Self {
            reference,
            node_id,
            activated_at,
            deactivation_requested,
            pipeline,
        }
    }

    /// A context that is not attached to any node; proxies created from it
    /// fail with `ShuttingDown`.
    #[cfg(test)]
    pub(crate) fn detached(reference: AddressableReference) -> Self {
        Self::new(
            reference,
            NodeId::new("detached", "test"),
            Timestamp::ZERO,
            Arc::new(AtomicBool::new(false)),
            PipelineHandle::closed(),
        )
    }

    /// This addressable's own reference.
    pub fn reference(&self) -> &AddressableReference {
        &self.reference
    }

    /// Node hosting this activation.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// When this activation was created.
    pub fn activated_at(&self) -> Timestamp {
        self.activated_at
    }

    /// Ask to be deactivated on the next execution tick.
    ///
    /// Invocations already queued are rerouted to a fresh activation.
    pub fn deactivate_on_idle(&self) {
        self.deactivation_requested.store(true, Ordering::Release);
    }

    /// Proxy to another addressable.
    pub fn proxy(&self, addressable_type: impl Into<String>, key: impl Into<Key>) -> AddressableProxy {
        self.proxy_for(AddressableReference::new(addressable_type, key))
    }

    /// Proxy to an addressable by reference, e.g. one received as an argument.
    pub fn proxy_for(&self, reference: AddressableReference) -> AddressableProxy {
        AddressableProxy::new(reference, self.pipeline.clone())
    }
}

impl fmt::Debug for AddressableContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressableContext")
            .field("reference", &self.reference)
            .field("node_id", &self.node_id)
            .field("activated_at", &self.activated_at)
            .finish_non_exhaustive()
    }
}
