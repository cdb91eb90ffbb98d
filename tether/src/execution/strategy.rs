//! Pacing of mass deactivation during shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::ConfigError;

/// How a stopping node fans out the deactivation of its addressables.
///
/// In JSON: `{"kind": "concurrent", "max": 8}`, `{"kind": "rate_limited",
/// "per_second": 100}`, `{"kind": "time_span", "millis": 5000}` or
/// `{"kind": "instant"}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeactivationStrategy {
    /// Everything at once.
    #[default]
    Instant,

    /// At most `max` deactivations in flight.
    Concurrent { max: usize },

    /// At most `per_second` deactivations started per second.
    RateLimited { per_second: u32 },

    /// Start times spread evenly over the window, whatever the count.
    TimeSpan { millis: u64 },
}

impl DeactivationStrategy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            DeactivationStrategy::Concurrent { max: 0 } => Err(ConfigError::Zero("deactivation_strategy.max")),
            DeactivationStrategy::RateLimited { per_second: 0 } => {
                Err(ConfigError::Zero("deactivation_strategy.per_second"))
            }
            _ => Ok(()),
        }
    }

    /// This strategy for a batch that starts `elapsed` into shutdown.
    ///
    /// A `TimeSpan` window covers the whole shutdown, so later batches
    /// only get what is left of it.
    pub(crate) fn after(self, elapsed: Duration) -> Self {
        match self {
            DeactivationStrategy::TimeSpan { millis } => {
                let elapsed = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                DeactivationStrategy::TimeSpan {
                    millis: millis.saturating_sub(elapsed),
                }
            }
            other => other,
        }
    }

    /// Run `deactivate` once per item, paced by this strategy, and wait
    /// for all of them.
    pub(crate) async fn run<T, F, Fut>(self, items: Vec<T>, deactivate: F)
    where
        T: Send + 'static,
        F: Fn(T) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = JoinSet::new();

        match self {
            DeactivationStrategy::Instant => {
                for item in items {
                    tasks.spawn(deactivate(item));
                }
            }
            DeactivationStrategy::Concurrent { max } => {
                let permits = Arc::new(Semaphore::new(max.max(1)));
                for item in items {
                    let permits = permits.clone();
                    let work = deactivate(item);
                    tasks.spawn(async move {
                        let _permit = permits.acquire_owned().await;
                        work.await
                    });
                }
            }
            DeactivationStrategy::RateLimited { per_second } => {
                let spacing = Duration::from_secs(1) / per_second.max(1);
                paced(&mut tasks, items, spacing, &deactivate).await;
            }
            DeactivationStrategy::TimeSpan { millis } => {
                let count = u32::try_from(items.len().max(1)).unwrap_or(u32::MAX);
                let spacing = Duration::from_millis(millis) / count;
                paced(&mut tasks, items, spacing, &deactivate).await;
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("deactivation task failed: {}", e);
            }
        }
    }
}

async fn paced<T, F, Fut>(tasks: &mut JoinSet<()>, items: Vec<T>, spacing: Duration, deactivate: &F)
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    if spacing.is_zero() {
        for item in items {
            tasks.spawn(deactivate(item));
        }
        return;
    }

    let mut interval = tokio::time::interval(spacing);
    for item in items {
        interval.tick().await;
        tasks.spawn(deactivate(item));
    }
}
