//! Correlation of outstanding requests with their responses.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::addressable::AddressableReference;
use crate::codec::Value;
use crate::error::{InvocationError, PipelineError};
use crate::pipeline::{Completion, MessageId};
use crate::time::{Clock, Timestamp};

struct Pending {
    completion: Completion,
    reference: AddressableReference,
    time_added: Timestamp,
}

/// Outstanding requests of one node, keyed by message id.
///
/// Each entry is resolved exactly once: by its response, by the timeout
/// sweep, or by [`fail_all`](Self::fail_all) on shutdown. Whichever
/// removes the entry from the map resolves it; the others find nothing.
pub struct ResponseTracking {
    pending: DashMap<MessageId, Pending>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl ResponseTracking {
    pub fn new(clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            clock,
            timeout,
        }
    }

    pub(crate) fn register(&self, message_id: MessageId, reference: AddressableReference, completion: Completion) {
        let pending = Pending {
            completion,
            reference,
            time_added: self.clock.now(),
        };
        if let Some(previous) = self.pending.insert(message_id, pending) {
            // Message ids come from a per-node counter; a collision means
            // the caller reused an id.
            tracing::warn!(message_id, reference = %previous.reference, "message id reused while pending");
            let _ = previous
                .completion
                .send(Err(PipelineError::Remote("message id reused".to_string()).into()));
        }
    }

    /// Resolve the request `message_id` with `result`.
    ///
    /// Returns `false`, and logs a warning, if nothing is waiting for it
    /// (already timed out, or never sent from here).
    pub fn complete(&self, message_id: MessageId, result: Result<Value, InvocationError>) -> bool {
        match self.pending.remove(&message_id) {
            Some((_, pending)) => {
                if pending.completion.send(result).is_err() {
                    tracing::debug!(message_id, reference = %pending.reference, "caller stopped waiting");
                }
                true
            }
            None => {
                tracing::warn!(message_id, "response for unknown or timed out message, discarding");
                false
            }
        }
    }

    /// Fail every request older than the message timeout.
    ///
    /// Returns how many were timed out.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<MessageId> = self
            .pending
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.time_added) >= self.timeout)
            .map(|entry| *entry.key())
            .collect();

        let mut timed_out = 0;
        for message_id in expired {
            // A response may have won the race since the scan.
            if let Some((_, pending)) = self.pending.remove(&message_id) {
                tracing::debug!(message_id, reference = %pending.reference, "request timed out");
                let _ = pending.completion.send(Err(PipelineError::ResponseTimeout {
                    message_id,
                    timeout: self.timeout,
                }
                .into()));
                timed_out += 1;
            }
        }
        if timed_out > 0 {
            tracing::warn!(count = timed_out, timeout = ?self.timeout, "requests timed out");
        }
        timed_out
    }

    /// Fail everything still pending, e.g. on shutdown.
    pub fn fail_all(&self, error: PipelineError) {
        let ids: Vec<MessageId> = self.pending.iter().map(|entry| *entry.key()).collect();
        for message_id in ids {
            if let Some((_, pending)) = self.pending.remove(&message_id) {
                let _ = pending.completion.send(Err(error.clone().into()));
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl fmt::Debug for ResponseTracking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseTracking")
            .field("pending", &self.pending.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}
