//! Messages exchanged between nodes.

use serde::{Deserialize, Serialize};

use crate::addressable::AddressableInvocation;
use crate::cluster::NodeId;
use crate::codec::Value;
use crate::error::{AddressableError, InvocationError, PipelineError};

/// Correlates a response with its request; unique per source node.
pub type MessageId = u64;

/// Payload of a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageContent {
    InvocationRequest(AddressableInvocation),
    InvocationResponse { value: Value },
    /// The addressable itself failed.
    InvocationResponseError { error: AddressableError },
    /// The runtime failed to execute the invocation.
    Error { description: String },
}

impl MessageContent {
    pub fn is_response(&self) -> bool {
        !matches!(self, MessageContent::InvocationRequest(_))
    }
}

/// Unit of transfer through the pipeline and over the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Set by the pipeline on send.
    pub message_id: Option<MessageId>,
    pub source: Option<NodeId>,
    /// Resolved by routing for requests; the requester for responses.
    pub target: Option<NodeId>,
    /// Routing attempts so far.
    pub attempts: u32,
    pub content: MessageContent,
}

impl Message {
    pub fn request(invocation: AddressableInvocation) -> Self {
        Self {
            message_id: None,
            source: None,
            target: None,
            attempts: 0,
            content: MessageContent::InvocationRequest(invocation),
        }
    }

    /// Response to `request` carrying `result`, addressed to its source.
    pub fn response_to(request: &Message, result: Result<Value, InvocationError>) -> Self {
        let content = match result {
            Ok(value) => MessageContent::InvocationResponse { value },
            Err(InvocationError::Application(error)) => MessageContent::InvocationResponseError { error },
            Err(other) => MessageContent::Error {
                description: other.to_string(),
            },
        };
        Self {
            message_id: request.message_id,
            source: None,
            target: request.source.clone(),
            attempts: 0,
            content,
        }
    }

    pub fn invocation(&self) -> Option<&AddressableInvocation> {
        match &self.content {
            MessageContent::InvocationRequest(invocation) => Some(invocation),
            _ => None,
        }
    }

    pub fn into_invocation(self) -> Option<AddressableInvocation> {
        match self.content {
            MessageContent::InvocationRequest(invocation) => Some(invocation),
            _ => None,
        }
    }

    /// The result a response carries, `None` for requests.
    pub fn into_result(self) -> Option<Result<Value, InvocationError>> {
        match self.content {
            MessageContent::InvocationRequest(_) => None,
            MessageContent::InvocationResponse { value } => Some(Ok(value)),
            MessageContent::InvocationResponseError { error } => Some(Err(error.into())),
            MessageContent::Error { description } => Some(Err(PipelineError::Remote(description).into())),
        }
    }
}
