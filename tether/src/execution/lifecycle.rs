//! Handle state machine and deactivation reasons.

use serde::{Deserialize, Serialize};

/// Lifecycle of one [`ExecutionHandle`](super::ExecutionHandle).
///
/// ```text
/// Created → Activating → Ready → Deactivating → Deactivated
///                      ↘ Deactivating (activation failed)
/// ```
///
/// Only `Ready` processes invocations; `Deactivated` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum HandleState {
    Created = 0,
    Activating = 1,
    Ready = 2,
    Deactivating = 3,
    Deactivated = 4,
}

impl HandleState {
    pub fn can_transition_to(&self, next: HandleState) -> bool {
        use HandleState::*;
        matches!(
            (self, next),
            (Created, Activating)
                | (Activating, Ready)
                | (Activating, Deactivating)
                | (Created, Deactivating)
                | (Ready, Deactivating)
                | (Deactivating, Deactivated)
        )
    }

    pub fn can_process_invocations(&self) -> bool {
        matches!(self, HandleState::Ready)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, HandleState::Deactivated)
    }

    pub(crate) fn from_u8(value: u8) -> HandleState {
        match value {
            0 => HandleState::Created,
            1 => HandleState::Activating,
            2 => HandleState::Ready,
            3 => HandleState::Deactivating,
            _ => HandleState::Deactivated,
        }
    }
}

/// Why an addressable is being deactivated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeactivationReason {
    /// The addressable asked for it through its context.
    ExternallyTriggered,

    /// Idle for longer than the configured TTL.
    TtlExpired,

    /// The addressable lease could not be renewed, or vanished.
    LeaseRenewalFailed,

    /// The hosting node is stopping.
    NodeShuttingDown,

    /// `on_activate` failed.
    ActivationFailed,
}
