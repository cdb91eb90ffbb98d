//! Resolving the node an invocation should go to.

use std::sync::Arc;

use async_trait::async_trait;

use crate::addressable::{AddressableReference, AddressableRegistry, PlacementPolicy};
use crate::cluster::NodeId;
use crate::directory::Placement;
use crate::error::{PipelineError, PlacementError};
use crate::pipeline::step::{Flow, PipelineStep};
use crate::pipeline::{Envelope, PipelineHandle};

/// Sets `target` on requests.
///
/// A target that is no longer a live cluster member has its stale lease
/// dropped, and the message goes around again with `attempts + 1`, up to
/// the configured ceiling.
pub(crate) struct RoutingStep {
    node_id: NodeId,
    placement: Arc<Placement>,
    registry: Arc<AddressableRegistry>,
    pipeline: PipelineHandle,
    max_attempts: u32,
}

impl RoutingStep {
    pub fn new(
        node_id: NodeId,
        placement: Arc<Placement>,
        registry: Arc<AddressableRegistry>,
        pipeline: PipelineHandle,
        max_attempts: u32,
    ) -> Self {
        Self {
            node_id,
            placement,
            registry,
            pipeline,
            max_attempts,
        }
    }

    async fn resolve(&self, reference: &AddressableReference) -> Result<NodeId, PlacementError> {
        let hosted_here = self.registry.can_host(&reference.addressable_type)
            && self.registry.placement(&reference.addressable_type) == PlacementPolicy::Local;

        if hosted_here {
            // Local placement still respects an activation that exists elsewhere.
            return Ok(self
                .placement
                .locate(reference)
                .await
                .unwrap_or_else(|| self.node_id.clone()));
        }

        self.placement.locate_or_place(reference, &[]).await
    }
}

#[async_trait]
impl PipelineStep for RoutingStep {
    fn name(&self) -> &'static str {
        "routing"
    }

    async fn outbound(&self, mut envelope: Envelope) -> Flow {
        if envelope.message.target.is_some() {
            return Flow::Continue(envelope);
        }
        let Some(reference) = envelope.message.invocation().map(|i| i.reference.clone()) else {
            return Flow::Continue(envelope);
        };

        let attempts = envelope.message.attempts;
        if attempts > self.max_attempts {
            tracing::warn!(reference = %reference, attempts, "giving up on delivery");
            envelope.fail(PipelineError::DeliveryFailed { reference, attempts });
            return Flow::Done;
        }

        let target = match self.resolve(&reference).await {
            Ok(target) => target,
            Err(e) => {
                envelope.fail(e);
                return Flow::Done;
            }
        };

        if target != self.node_id && !self.placement.cluster().is_alive(&target).await {
            tracing::debug!(reference = %reference, target = %target, attempts, "target node gone, rerouting");
            self.placement.directory().remove(&reference, &target).await;
            envelope.message.attempts += 1;
            self.pipeline.requeue(envelope);
            return Flow::Done;
        }

        envelope.message.target = Some(target);
        Flow::Continue(envelope)
    }
}
