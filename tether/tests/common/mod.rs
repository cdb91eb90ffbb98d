//! Shared fixtures for integration tests: tracing setup, a small in-process
//! cluster, and a few addressables.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tether::{
    Addressable, AddressableContext, AddressableDirectory, AddressableError, AddressableRegistry, Clock,
    ClusterManager, DispatchTable, InMemoryAddressableDirectory, InMemoryNodeDirectory, LocalNetwork, MethodHandler,
    Node, RandomRouting, RuntimeConfig,
};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_test_writer()
            .try_init();
    });
}

/// Poll `condition` every 10ms, panicking after 5s.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for: {what}");
}

/// Fast ticks, default leases.
pub fn fast_config() -> RuntimeConfig {
    RuntimeConfig::builder()
        .tick_rate(Duration::from_millis(50))
        .message_timeout(Duration::from_secs(2))
        .pipeline_worker_count(4)
        .build()
        .expect("valid config")
}

// ============================================================================
// In-process cluster
// ============================================================================

/// Membership, addressable directory and network shared by every node
/// started through it.
pub struct TestCluster {
    pub clock: Arc<dyn Clock>,
    pub cluster: Arc<ClusterManager>,
    pub directory: Arc<dyn AddressableDirectory>,
    pub network: Arc<LocalNetwork>,
}

impl TestCluster {
    pub fn new(config: &RuntimeConfig, clock: Arc<dyn Clock>) -> Self {
        let cluster = Arc::new(ClusterManager::new(
            Arc::new(InMemoryNodeDirectory::new()),
            clock.clone(),
            config.node_lease_duration(),
        ));
        let directory = Arc::new(InMemoryAddressableDirectory::new(
            Arc::new(RandomRouting::seeded(7)),
            clock.clone(),
            config.addressable_lease_duration(),
        ));
        Self {
            clock,
            cluster,
            directory,
            network: Arc::new(LocalNetwork::new()),
        }
    }

    pub async fn start(&self, config: RuntimeConfig, registry: AddressableRegistry) -> Node {
        Node::builder(config)
            .registry(registry)
            .clock(self.clock.clone())
            .cluster(self.cluster.clone())
            .directory(self.directory.clone())
            .transport(self.network.clone())
            .start()
            .await
            .expect("node starts")
    }
}

// ============================================================================
// Counter
// ============================================================================

#[derive(Debug, Default)]
pub struct Counter {
    count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Increment;

#[derive(Debug, Serialize, Deserialize)]
pub struct Get;

/// Fails with an application error of kind `"Refused"`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Refuse;

/// Sleeps for the given number of milliseconds, then answers the count.
#[derive(Debug, Serialize, Deserialize)]
pub struct Stall(pub u64);

/// Asks to be deactivated on the next tick.
#[derive(Debug, Serialize, Deserialize)]
pub struct Leave;

#[async_trait]
impl Addressable for Counter {
    const ADDRESSABLE_TYPE: &'static str = "Counter";

    fn register_methods(table: &mut DispatchTable<Self>) {
        table
            .register::<Increment, u64>()
            .register::<Get, u64>()
            .register::<Refuse, ()>()
            .register::<Stall, u64>()
            .register::<Leave, ()>();
    }
}

#[async_trait]
impl MethodHandler<Increment, u64> for Counter {
    async fn handle(&mut self, _req: Increment, _ctx: &AddressableContext) -> Result<u64, AddressableError> {
        self.count += 1;
        Ok(self.count)
    }
}

#[async_trait]
impl MethodHandler<Get, u64> for Counter {
    async fn handle(&mut self, _req: Get, _ctx: &AddressableContext) -> Result<u64, AddressableError> {
        Ok(self.count)
    }
}

#[async_trait]
impl MethodHandler<Refuse, ()> for Counter {
    async fn handle(&mut self, _req: Refuse, ctx: &AddressableContext) -> Result<(), AddressableError> {
        Err(AddressableError::new("Refused", format!("{} says no", ctx.reference())))
    }
}

#[async_trait]
impl MethodHandler<Stall, u64> for Counter {
    async fn handle(&mut self, req: Stall, _ctx: &AddressableContext) -> Result<u64, AddressableError> {
        tokio::time::sleep(Duration::from_millis(req.0)).await;
        Ok(self.count)
    }
}

#[async_trait]
impl MethodHandler<Leave, ()> for Counter {
    async fn handle(&mut self, _req: Leave, ctx: &AddressableContext) -> Result<(), AddressableError> {
        ctx.deactivate_on_idle();
        Ok(())
    }
}

pub fn counter_registry() -> AddressableRegistry {
    let mut registry = AddressableRegistry::new();
    registry.register::<Counter>();
    registry
}
