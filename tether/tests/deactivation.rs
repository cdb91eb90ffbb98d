//! A stopping node deactivates every activation, whatever the strategy.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::init_tracing;
use serde::{Deserialize, Serialize};
use tether::{
    Addressable, AddressableContext, AddressableError, AddressableReference, AddressableRegistry,
    DeactivationReason, DeactivationStrategy, DispatchTable, MethodHandler, Node, NodeStatus, RuntimeConfig,
};

const ACTIVATIONS: usize = 12;

struct Session {
    deactivated: Arc<AtomicUsize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Touch;

#[async_trait]
impl Addressable for Session {
    const ADDRESSABLE_TYPE: &'static str = "Session";

    fn register_methods(table: &mut DispatchTable<Self>) {
        table.register::<Touch, ()>();
    }

    async fn on_deactivate(
        &mut self,
        _ctx: &AddressableContext,
        reason: DeactivationReason,
    ) -> Result<(), AddressableError> {
        assert_eq!(reason, DeactivationReason::NodeShuttingDown);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.deactivated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl MethodHandler<Touch, ()> for Session {
    async fn handle(&mut self, _req: Touch, _ctx: &AddressableContext) -> Result<(), AddressableError> {
        Ok(())
    }
}

async fn stop_with(strategy: DeactivationStrategy) {
    init_tracing();
    let deactivated = Arc::new(AtomicUsize::new(0));
    let mut registry = AddressableRegistry::new();
    let counter = deactivated.clone();
    registry.register_with::<Session, _>(move |_| Session {
        deactivated: counter.clone(),
    });
    let config = RuntimeConfig::builder()
        .tick_rate(Duration::from_millis(50))
        .deactivation_strategy(strategy)
        .build()
        .expect("valid config");
    let node = Node::builder(config).registry(registry).start().await.expect("start");

    let references: Vec<AddressableReference> = (0..ACTIVATIONS)
        .map(|i| AddressableReference::new("Session", format!("s{i}")))
        .collect();
    for reference in &references {
        node.proxy_for(reference.clone()).invoke::<_, ()>(&Touch).await.expect("touch");
    }
    assert_eq!(node.execution().active_count(), ACTIVATIONS);

    node.stop().await;

    assert_eq!(deactivated.load(Ordering::SeqCst), ACTIVATIONS, "{strategy:?}");
    assert_eq!(node.execution().active_count(), 0);
    assert!(node.execution().leases().is_empty());
    for reference in &references {
        assert_eq!(node.directory().locate(reference).await, None);
    }
    assert_eq!(node.status().await, Some(NodeStatus::Stopped));
}

#[tokio::test]
async fn test_instant_deactivates_everything() {
    stop_with(DeactivationStrategy::Instant).await;
}

#[tokio::test]
async fn test_concurrent_deactivates_everything() {
    stop_with(DeactivationStrategy::Concurrent { max: 3 }).await;
}

#[tokio::test]
async fn test_rate_limited_deactivates_everything() {
    stop_with(DeactivationStrategy::RateLimited { per_second: 100 }).await;
}

#[tokio::test]
async fn test_time_span_deactivates_everything() {
    stop_with(DeactivationStrategy::TimeSpan { millis: 200 }).await;
}
