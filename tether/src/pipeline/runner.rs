//! The pipeline's worker pool.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::codec::MessageCodec;
use crate::error::PipelineError;
use crate::pipeline::step::{Flow, PipelineStep};
use crate::pipeline::{Envelope, PipelineTask};
use crate::task::{stopped, TaskSupervisor};

/// Ordered steps plus the codec for inbound bytes.
pub(crate) struct Pipeline {
    steps: Vec<Arc<dyn PipelineStep>>,
    codec: Arc<dyn MessageCodec>,
}

impl Pipeline {
    pub fn new(steps: Vec<Arc<dyn PipelineStep>>, codec: Arc<dyn MessageCodec>) -> Self {
        Self { steps, codec }
    }

    async fn process(&self, task: PipelineTask) {
        match task {
            PipelineTask::Outbound(envelope) => self.outbound(envelope).await,
            PipelineTask::Inbound(bytes) => match self.codec.decode(&bytes) {
                Ok(message) => self.inbound(Envelope::new(message, None)).await,
                Err(e) => tracing::warn!(bytes = bytes.len(), "dropping undecodable message: {}", e),
            },
        }
    }

    async fn outbound(&self, mut envelope: Envelope) {
        for step in &self.steps {
            match step.outbound(envelope).await {
                Flow::Continue(next) => envelope = next,
                Flow::Done => return,
            }
        }
        tracing::warn!(message_id = ?envelope.message.message_id, "outbound message was not delivered by any step");
        envelope.fail(PipelineError::Transport("message was not delivered".to_string()));
    }

    async fn inbound(&self, mut envelope: Envelope) {
        for step in self.steps.iter().rev() {
            match step.inbound(envelope).await {
                Flow::Continue(next) => envelope = next,
                Flow::Done => return,
            }
        }
        tracing::warn!(
            message_id = ?envelope.message.message_id,
            source = ?envelope.message.source,
            "inbound message was not handled by any step"
        );
    }

    /// Start `count` workers draining `receiver` until `shutdown` is set.
    pub fn spawn_workers(
        self: Arc<Self>,
        receiver: mpsc::Receiver<PipelineTask>,
        count: usize,
        shutdown: watch::Receiver<bool>,
        supervisor: &TaskSupervisor,
    ) -> Vec<JoinHandle<()>> {
        let receiver = Arc::new(Mutex::new(receiver));
        (0..count.max(1))
            .map(|index| {
                let pipeline = self.clone();
                let receiver = receiver.clone();
                let shutdown = shutdown.clone();
                supervisor.spawn_task(&format!("pipeline-worker-{index}"), async move {
                    pipeline.work(index, receiver, shutdown).await;
                    Ok(())
                })
            })
            .collect()
    }

    async fn work(
        &self,
        index: usize,
        receiver: Arc<Mutex<mpsc::Receiver<PipelineTask>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let task = {
                let mut receiver = receiver.lock().await;
                tokio::select! {
                    biased;
                    () = stopped(&mut shutdown) => None,
                    task = receiver.recv() => task,
                }
            };
            let Some(task) = task else {
                break;
            };
            self.process(task).await;
        }
        tracing::debug!(worker = index, "pipeline worker stopped");
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let steps: Vec<&str> = self.steps.iter().map(|step| step.name()).collect();
        f.debug_struct("Pipeline").field("steps", &steps).finish()
    }
}
