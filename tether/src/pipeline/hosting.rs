//! Handing requests addressed to this node to the execution system.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::cluster::NodeId;
use crate::codec::{MessageCodec, Value};
use crate::error::{InvocationError, PipelineError};
use crate::execution::ExecutionSystem;
use crate::pipeline::step::{Flow, PipelineStep};
use crate::pipeline::{Completion, Envelope, Message, PipelineHandle, ResponseTracking};

type Outcome = oneshot::Receiver<Result<Value, InvocationError>>;

/// Short-circuits requests for local addressables on the way out, and
/// serves requests from other nodes on the way in.
pub(crate) struct HostingStep {
    node_id: NodeId,
    execution: ExecutionSystem,
    tracking: Arc<ResponseTracking>,
    codec: Arc<dyn MessageCodec>,
    pipeline: PipelineHandle,
}

impl HostingStep {
    pub fn new(
        node_id: NodeId,
        execution: ExecutionSystem,
        tracking: Arc<ResponseTracking>,
        codec: Arc<dyn MessageCodec>,
        pipeline: PipelineHandle,
    ) -> Self {
        Self {
            node_id,
            execution,
            tracking,
            codec,
            pipeline,
        }
    }

    /// A completion for a request that needs its result back, plus the
    /// receiving end; `None` for one-way requests.
    fn outcome(message: &Message) -> (Option<Completion>, Option<Outcome>) {
        match message.invocation() {
            Some(invocation) if !invocation.is_one_way() => {
                let (completion, outcome) = oneshot::channel();
                (Some(completion), Some(outcome))
            }
            _ => (None, None),
        }
    }
}

async fn settle(outcome: Outcome) -> Result<Value, InvocationError> {
    outcome
        .await
        .unwrap_or(Err(PipelineError::ShuttingDown.into()))
}

#[async_trait]
impl PipelineStep for HostingStep {
    fn name(&self) -> &'static str {
        "hosting"
    }

    async fn outbound(&self, envelope: Envelope) -> Flow {
        if envelope.message.target.as_ref() != Some(&self.node_id) || envelope.message.invocation().is_none() {
            return Flow::Continue(envelope);
        }

        // Loopback still goes through the wire format so caller and
        // callee never share argument values.
        let message = match self.codec.copy(&envelope.message) {
            Ok(message) => message,
            Err(e) => {
                let message_id = envelope.message.message_id;
                tracing::warn!(message_id = ?message_id, "cannot copy local message: {}", e);
                match message_id {
                    Some(message_id) if envelope.completion.is_none() => {
                        self.tracking.complete(message_id, Err(e.into()));
                    }
                    _ => envelope.fail(e),
                }
                return Flow::Done;
            }
        };

        let (completion, outcome) = Self::outcome(&message);
        if let (Some(outcome), Some(message_id)) = (outcome, message.message_id) {
            let tracking = self.tracking.clone();
            tokio::spawn(async move {
                tracking.complete(message_id, settle(outcome).await);
            });
        }

        let attempts = message.attempts;
        if let Some(invocation) = message.into_invocation() {
            self.execution.handle_invocation(invocation, completion, attempts).await;
        }
        Flow::Done
    }

    async fn inbound(&self, envelope: Envelope) -> Flow {
        if envelope.message.invocation().is_none() {
            return Flow::Continue(envelope);
        }

        let request = envelope.message;
        let (completion, outcome) = Self::outcome(&request);
        if let Some(outcome) = outcome {
            let pipeline = self.pipeline.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let response = Message::response_to(&request, settle(outcome).await);
                if let Err(e) = pipeline.send_message(response).await {
                    tracing::debug!(message_id = ?request.message_id, "response not sent: {}", e);
                }
            });
        }

        let attempts = request.attempts;
        if let Some(invocation) = request.into_invocation() {
            self.execution.handle_invocation(invocation, completion, attempts).await;
        }
        Flow::Done
    }
}
