//! Entry points into a node's pipeline.

use std::fmt;

use tokio::sync::{mpsc, oneshot};

use crate::addressable::AddressableInvocation;
use crate::codec::Value;
use crate::error::{InvocationError, PipelineError};
use crate::pipeline::Message;

/// Receives the outcome of one invocation.
pub type Completion = oneshot::Sender<Result<Value, InvocationError>>;

/// A message in flight, with the caller waiting on it (if any).
pub(crate) struct Envelope {
    pub message: Message,
    pub completion: Option<Completion>,
}

impl Envelope {
    pub fn new(message: Message, completion: Option<Completion>) -> Self {
        Self { message, completion }
    }

    /// Resolve the waiting caller with `error`.
    pub fn fail(self, error: impl Into<InvocationError>) {
        if let Some(completion) = self.completion {
            let _ = completion.send(Err(error.into()));
        }
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("message", &self.message)
            .field("awaited", &self.completion.is_some())
            .finish()
    }
}

pub(crate) enum PipelineTask {
    Outbound(Envelope),
    Inbound(Vec<u8>),
}

/// Cloneable sender into a node's pipeline buffer.
///
/// Proxies, activations rerouting their queue, and the transport all feed
/// the pipeline through one of these.
#[derive(Clone)]
pub struct PipelineHandle {
    sender: mpsc::Sender<PipelineTask>,
}

impl PipelineHandle {
    pub(crate) fn new(sender: mpsc::Sender<PipelineTask>) -> Self {
        Self { sender }
    }

    /// A handle whose pipeline is already gone.
    #[cfg(test)]
    pub(crate) fn closed() -> Self {
        let (sender, _) = mpsc::channel(1);
        Self { sender }
    }

    fn submit(&self, task: PipelineTask) -> Result<(), PipelineError> {
        self.sender.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PipelineError::BufferFull,
            mpsc::error::TrySendError::Closed(_) => PipelineError::ShuttingDown,
        })
    }

    /// Send a request and wait for its result.
    pub async fn invoke(&self, invocation: AddressableInvocation) -> Result<Value, InvocationError> {
        let (completion, receiver) = oneshot::channel();
        let envelope = Envelope::new(Message::request(invocation), Some(completion));
        self.submit(PipelineTask::Outbound(envelope))?;

        receiver
            .await
            .unwrap_or(Err(PipelineError::ShuttingDown.into()))
    }

    /// Send an invocation nobody waits for.
    pub fn send_one_way(&self, invocation: AddressableInvocation) -> Result<(), PipelineError> {
        let envelope = Envelope::new(Message::request(invocation), None);
        self.submit(PipelineTask::Outbound(envelope))
    }

    /// Hand raw bytes from the transport to the inbound path.
    pub fn on_receive(&self, bytes: Vec<u8>) -> Result<(), PipelineError> {
        self.submit(PipelineTask::Inbound(bytes))
    }

    /// Resubmit an invocation that could not be delivered where it was.
    ///
    /// Waits for buffer space rather than shedding; the caller is already
    /// waiting on `completion`.
    pub(crate) async fn reroute(
        &self,
        invocation: AddressableInvocation,
        completion: Option<Completion>,
        attempts: u32,
    ) {
        let mut message = Message::request(invocation);
        message.attempts = attempts;
        let envelope = Envelope::new(message, completion);

        if let Err(mpsc::error::SendError(PipelineTask::Outbound(envelope))) =
            self.sender.send(PipelineTask::Outbound(envelope)).await
        {
            envelope.fail(PipelineError::ShuttingDown);
        }
    }

    /// Requeue from inside the pipeline; fails the caller if the buffer is full.
    pub(crate) fn requeue(&self, envelope: Envelope) {
        if let Err(e) = self.sender.try_send(PipelineTask::Outbound(envelope)) {
            let (error, task) = match e {
                mpsc::error::TrySendError::Full(task) => (PipelineError::BufferFull, task),
                mpsc::error::TrySendError::Closed(task) => (PipelineError::ShuttingDown, task),
            };
            if let PipelineTask::Outbound(envelope) = task {
                tracing::warn!(message = ?envelope.message.message_id, "could not requeue message: {}", error);
                envelope.fail(error);
            }
        }
    }

    /// Queue a message that expects no completion, e.g. a response.
    pub(crate) async fn send_message(&self, message: Message) -> Result<(), PipelineError> {
        self.sender
            .send(PipelineTask::Outbound(Envelope::new(message, None)))
            .await
            .map_err(|_| PipelineError::ShuttingDown)
    }
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("closed", &self.sender.is_closed())
            .field("free_slots", &self.sender.capacity())
            .finish()
    }
}
