//! Supervised background tasks.
//!
//! Every long-running loop of a node (pipeline workers, the tick loop, node
//! lease renewal) is spawned through [`TaskSupervisor::spawn_task`]. A loop
//! that returns an error or panics is reported to the node's single
//! [`ErrorHandler`] instead of taking the process down.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Why a background task ended abnormally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),

    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Receives failures of top-level background tasks.
pub trait ErrorHandler: Send + Sync + fmt::Debug {
    fn handle(&self, task: &str, error: &TaskError);
}

/// Logs failures through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn handle(&self, task: &str, error: &TaskError) {
        tracing::error!(task, "background task ended abnormally: {}", error);
    }
}

/// Spawns named tasks and routes their failures to an [`ErrorHandler`].
#[derive(Clone)]
pub struct TaskSupervisor {
    handler: Arc<dyn ErrorHandler>,
}

impl TaskSupervisor {
    pub fn new(handler: Arc<dyn ErrorHandler>) -> Self {
        Self { handler }
    }

    /// Spawn `future` as task `name`.
    ///
    /// The returned handle resolves once the task has ended and any
    /// failure has been reported.
    pub fn spawn_task<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let name = name.to_string();
        let handler = self.handler.clone();
        let task = tokio::spawn(future);

        tokio::spawn(async move {
            match task.await {
                Ok(Ok(())) => tracing::debug!(task = %name, "task finished"),
                Ok(Err(error)) => handler.handle(&name, &error),
                Err(join) if join.is_panic() => {
                    let message = panic_message(join.into_panic().as_ref());
                    handler.handle(&name, &TaskError::Panicked(message));
                }
                Err(_) => tracing::debug!(task = %name, "task cancelled"),
            }
        })
    }
}

/// Text of a panic payload, for reporting.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Resolves once `shutdown` is set, or its sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

impl fmt::Debug for TaskSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSupervisor")
            .field("handler", &self.handler)
            .finish()
    }
}
