//! Pipeline steps.
//!
//! Outbound messages visit the steps in order; inbound messages visit them
//! in reverse:
//!
//! ```text
//! outbound ─▶ Identity ─▶ Routing ─▶ Tracking ─▶ Hosting ─▶ Transport ─▶ network
//! inbound  ◀─ Identity ◀─ Routing ◀─ Tracking ◀─ Hosting ◀─ Transport ◀─ network
//! ```
//!
//! A step either hands the envelope on or takes it out of the pipeline
//! (delivered locally, requeued, or failed).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::NodeId;
use crate::codec::MessageCodec;
use crate::error::PipelineError;
use crate::pipeline::{Envelope, ResponseTracking};
use crate::transport::Transport;

/// What a step did with an envelope.
pub(crate) enum Flow {
    /// Hand it to the next step.
    Continue(Envelope),
    /// The step took ownership.
    Done,
}

#[async_trait]
pub(crate) trait PipelineStep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn outbound(&self, envelope: Envelope) -> Flow {
        Flow::Continue(envelope)
    }

    async fn inbound(&self, envelope: Envelope) -> Flow {
        Flow::Continue(envelope)
    }
}

/// Stamps the source node and a node-unique message id.
pub(crate) struct IdentityStep {
    node_id: NodeId,
    next_message_id: AtomicU64,
}

impl IdentityStep {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            next_message_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl PipelineStep for IdentityStep {
    fn name(&self) -> &'static str {
        "identity"
    }

    async fn outbound(&self, mut envelope: Envelope) -> Flow {
        if envelope.message.message_id.is_none() {
            envelope.message.message_id = Some(self.next_message_id.fetch_add(1, Ordering::Relaxed));
        }
        if envelope.message.source.is_none() {
            envelope.message.source = Some(self.node_id.clone());
        }
        Flow::Continue(envelope)
    }
}

/// Registers awaited requests with [`ResponseTracking`].
///
/// From here on the caller's completion belongs to the tracker; later
/// steps carry only the message id.
pub(crate) struct TrackingStep {
    tracking: Arc<ResponseTracking>,
}

impl TrackingStep {
    pub fn new(tracking: Arc<ResponseTracking>) -> Self {
        Self { tracking }
    }
}

#[async_trait]
impl PipelineStep for TrackingStep {
    fn name(&self) -> &'static str {
        "tracking"
    }

    async fn outbound(&self, mut envelope: Envelope) -> Flow {
        let Some(completion) = envelope.completion.take() else {
            return Flow::Continue(envelope);
        };
        match (envelope.message.message_id, envelope.message.invocation()) {
            (Some(message_id), Some(invocation)) if !invocation.is_one_way() => {
                self.tracking
                    .register(message_id, invocation.reference.clone(), completion);
            }
            _ => envelope.completion = Some(completion),
        }
        Flow::Continue(envelope)
    }

    async fn inbound(&self, envelope: Envelope) -> Flow {
        if !envelope.message.content.is_response() {
            return Flow::Continue(envelope);
        }
        let Some(message_id) = envelope.message.message_id else {
            tracing::warn!(source = ?envelope.message.source, "response without message id, discarding");
            return Flow::Done;
        };
        if let Some(result) = envelope.message.into_result() {
            self.tracking.complete(message_id, result);
        }
        Flow::Done
    }
}

/// Encodes messages and hands them to the [`Transport`].
pub(crate) struct TransportStep {
    transport: Arc<dyn Transport>,
    codec: Arc<dyn MessageCodec>,
    tracking: Arc<ResponseTracking>,
}

impl TransportStep {
    pub fn new(transport: Arc<dyn Transport>, codec: Arc<dyn MessageCodec>, tracking: Arc<ResponseTracking>) -> Self {
        Self {
            transport,
            codec,
            tracking,
        }
    }

    fn fail(&self, envelope: Envelope, error: PipelineError) {
        let message_id = envelope.message.message_id;
        let tracked = envelope.message.invocation().is_some_and(|i| !i.is_one_way());
        tracing::warn!(message_id = ?message_id, target = ?envelope.message.target, "send failed: {}", error);

        match message_id {
            Some(message_id) if tracked && envelope.completion.is_none() => {
                self.tracking.complete(message_id, Err(error.into()));
            }
            _ => envelope.fail(error),
        }
    }
}

#[async_trait]
impl PipelineStep for TransportStep {
    fn name(&self) -> &'static str {
        "transport"
    }

    async fn outbound(&self, envelope: Envelope) -> Flow {
        let Some(target) = envelope.message.target.clone() else {
            self.fail(envelope, PipelineError::Transport("message has no target".to_string()));
            return Flow::Done;
        };

        let bytes = match self.codec.encode(&envelope.message) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail(envelope, PipelineError::Transport(e.to_string()));
                return Flow::Done;
            }
        };

        if let Err(e) = self.transport.send(&target, bytes).await {
            self.fail(envelope, PipelineError::Transport(e.to_string()));
            return Flow::Done;
        }

        tracing::trace!(message_id = ?envelope.message.message_id, target = %target, "message sent");
        Flow::Done
    }
}
