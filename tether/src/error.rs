//! Error types for the tether runtime.
//!
//! Each subsystem owns its own enum; [`InvocationError`] is what a caller
//! ultimately sees on a failed invocation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::addressable::AddressableReference;
use crate::cluster::NodeId;
use crate::execution::HandleState;

/// Application-level failure raised by an addressable method or hook.
///
/// Serializable so it can travel back to a remote caller unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct AddressableError {
    /// Short machine-readable category, e.g. `"InsufficientFunds"`.
    pub kind: String,
    /// Human-readable detail.
    pub message: String,
}

impl AddressableError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Errors related to placing an addressable on a node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlacementError {
    /// No node in the cluster is eligible to host the addressable.
    #[error("No available node to host {reference}")]
    NoAvailableNode { reference: AddressableReference },
}

/// Errors related to node and addressable leases.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseError {
    /// Renewal presented a challenge token that does not match the stored one.
    #[error("Invalid challenge token for node {node}")]
    InvalidChallenge { node: NodeId },

    /// Renewal arrived after the lease had already expired.
    #[error("Lease for node {node} has expired")]
    LeaseExpired { node: NodeId },

    /// Node is not (or no longer) a cluster member.
    #[error("Node {node} is not a cluster member")]
    NodeNotFound { node: NodeId },

    /// Another node holds the addressable's lease.
    #[error("Lease for {reference} is not held by this node (holder: {holder:?})")]
    NotHolder {
        reference: AddressableReference,
        holder: Option<NodeId>,
    },

    /// Node directory kept rejecting compare-and-set updates.
    #[error("Node directory update for {node} conflicted {attempts} times")]
    UpdateConflict { node: NodeId, attempts: u32 },
}

/// Errors raised while executing an invocation on the hosting node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The addressable's event queue is full.
    #[error("Event queue for {reference} is full (capacity: {capacity})")]
    CapacityExceeded {
        reference: AddressableReference,
        capacity: usize,
    },

    /// No live handle for the addressable on this node.
    #[error("No active addressable for {reference}")]
    NoActiveAddressable { reference: AddressableReference },

    /// The method is not declared by the addressable type.
    #[error("Unknown method {method} on {addressable_type}")]
    UnknownMethod {
        addressable_type: String,
        method: String,
    },

    /// This node has no implementation for the addressable type.
    #[error("Addressable type {0} cannot be hosted on this node")]
    UnsupportedType(String),

    /// `on_activate` failed; queued invocations fail with it.
    #[error("Activation of {reference} failed: {error}")]
    ActivationFailed {
        reference: AddressableReference,
        error: AddressableError,
    },

    /// The method or a lifecycle hook panicked; the activation is retired.
    #[error("Addressable {reference} panicked: {message}")]
    Panicked {
        reference: AddressableReference,
        message: String,
    },

    /// The handle worker went away without completing the invocation.
    #[error("Worker for {reference} stopped before completing the invocation")]
    WorkerLost { reference: AddressableReference },

    /// Handle state machine was asked for an illegal transition.
    #[error("Invalid handle state transition from {from:?} to {to:?}")]
    InvalidStateTransition { from: HandleState, to: HandleState },
}

/// Errors raised by the message pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// No response arrived within the message timeout.
    #[error("No response to message {message_id} within {timeout:?}")]
    ResponseTimeout { message_id: u64, timeout: Duration },

    /// Routing gave up after too many attempts.
    #[error("Delivery of invocation on {reference} failed after {attempts} attempts")]
    DeliveryFailed {
        reference: AddressableReference,
        attempts: u32,
    },

    /// The pipeline's input buffer is full.
    #[error("Pipeline buffer is full")]
    BufferFull,

    /// The transport could not deliver the message.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote node failed the invocation for a non-application reason.
    #[error("Remote node reported: {0}")]
    Remote(String),

    /// The pipeline is shutting down and no longer accepts messages.
    #[error("Pipeline is shutting down")]
    ShuttingDown,
}

/// Errors related to serialization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Failed to encode value: {0}")]
    Encode(String),

    #[error("Failed to decode value: {0}")]
    Decode(String),
}

/// Errors raised while building the addressable registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No implementation was registered for the addressable type.
    #[error("No implementation registered for addressable type {0}")]
    NoImplementation(String),

    /// More than one implementation claims the same addressable type.
    #[error("Addressable type {addressable_type} has multiple implementations: {implementations:?}")]
    MultipleImplementations {
        addressable_type: String,
        implementations: Vec<String>,
    },
}

/// Failure of a single invocation, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    #[error(transparent)]
    Application(#[from] AddressableError),

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl InvocationError {
    /// The application error, when the addressable itself failed.
    pub fn as_application(&self) -> Option<&AddressableError> {
        match self {
            InvocationError::Application(error) => Some(error),
            _ => None,
        }
    }

    /// Whether this failure is a response timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            InvocationError::Pipeline(PipelineError::ResponseTimeout { .. })
        )
    }
}
