//! A cluster member hosting addressables.
//!
//! [`Node`] owns everything one member needs: its cluster identity and
//! lease, the execution system, the pipeline and its workers, and the
//! periodic loops. Nothing is global; several nodes can share a process,
//! a [`ClusterManager`], an [`AddressableDirectory`] and a [`LocalNetwork`].
//!
//! # Startup
//!
//! ```text
//! validate config + registry
//!   → join cluster (Starting)
//!   → pipeline workers
//!   → connect transport
//!   → Active
//!   → tick loop, node lease loop
//! ```
//!
//! # Shutdown
//!
//! ```text
//! Draining → deactivate all addressables → Stopping
//!   → stop loops and workers → fail pending requests
//!   → disconnect → release leases → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let mut registry = AddressableRegistry::new();
//! registry.register::<Counter>();
//!
//! let node = Node::builder(RuntimeConfig::default())
//!     .registry(registry)
//!     .start()
//!     .await?;
//!
//! let count: u64 = node.proxy("Counter", "x").invoke(&Increment).await?;
//! node.stop().await;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::addressable::{AddressableProxy, AddressableReference, AddressableRegistry, Key};
use crate::cluster::{ClusterManager, InMemoryNodeDirectory, NodeCapabilities, NodeId, NodeInfo, NodeStatus};
use crate::codec::{JsonSerializer, MessageCodec, Serializer};
use crate::config::{ConfigError, RuntimeConfig};
use crate::directory::{
    AddressableDirectory, InMemoryAddressableDirectory, Placement, RandomRouting, RoutingStrategy,
};
use crate::error::{LeaseError, PipelineError, RegistryError};
use crate::execution::{ExecutionLeases, ExecutionSystem};
use crate::pipeline::{
    HostingStep, IdentityStep, Pipeline, PipelineHandle, PipelineStep, ResponseTracking, RoutingStep, TrackingStep,
    TransportStep,
};
use crate::task::{stopped, ErrorHandler, LoggingErrorHandler, TaskError, TaskSupervisor};
use crate::time::{Clock, SystemClock, Timestamp};
use crate::transport::{LocalNetwork, Transport, TransportError};

/// Why a node could not start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid addressable registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("cluster membership failed: {0}")]
    Cluster(#[from] LeaseError),

    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),
}

/// Assembles a [`Node`].
///
/// Anything not supplied gets a single-process default: a wall clock,
/// random routing, in-memory cluster and addressable directories, and a
/// private [`LocalNetwork`].
pub struct NodeBuilder {
    config: RuntimeConfig,
    registry: AddressableRegistry,
    cluster: Option<Arc<ClusterManager>>,
    directory: Option<Arc<dyn AddressableDirectory>>,
    transport: Option<Arc<dyn Transport>>,
    clock: Option<Arc<dyn Clock>>,
    routing: Option<Arc<dyn RoutingStrategy>>,
    codec: Arc<dyn MessageCodec>,
    error_handler: Arc<dyn ErrorHandler>,
}

impl NodeBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            registry: AddressableRegistry::new(),
            cluster: None,
            directory: None,
            transport: None,
            clock: None,
            routing: None,
            codec: Arc::new(JsonSerializer),
            error_handler: Arc::new(LoggingErrorHandler),
        }
    }

    /// Addressable types this node can host.
    pub fn registry(mut self, registry: AddressableRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn cluster(mut self, cluster: Arc<ClusterManager>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn AddressableDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Strategy of the default addressable directory; ignored when a
    /// directory is supplied.
    pub fn routing(mut self, routing: Arc<dyn RoutingStrategy>) -> Self {
        self.routing = Some(routing);
        self
    }

    pub fn serializer<S: Serializer>(mut self, serializer: S) -> Self {
        self.codec = Arc::new(serializer);
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    /// Join the cluster and start serving.
    pub async fn start(self) -> Result<Node, NodeError> {
        let config = self.config;
        config.validate()?;
        self.registry.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let cluster = self.cluster.unwrap_or_else(|| {
            Arc::new(ClusterManager::new(
                Arc::new(InMemoryNodeDirectory::new()),
                clock.clone(),
                config.node_lease_duration(),
            ))
        });
        let directory = match self.directory {
            Some(directory) => directory,
            None => {
                let routing = self.routing.unwrap_or_else(|| Arc::new(RandomRouting::new()));
                Arc::new(InMemoryAddressableDirectory::new(
                    routing,
                    clock.clone(),
                    config.addressable_lease_duration(),
                ))
            }
        };
        let transport = self.transport.unwrap_or_else(|| Arc::new(LocalNetwork::new()));
        let registry = Arc::new(self.registry);
        let capabilities = registry.capabilities();

        let info = cluster.join_cluster(config.namespace(), capabilities.clone()).await?;
        let node_id = info.id.clone();

        let (sender, receiver) = mpsc::channel(config.pipeline_buffer_count());
        let pipeline = PipelineHandle::new(sender);
        let leases = Arc::new(ExecutionLeases::new(node_id.clone(), directory.clone(), clock.clone()));
        let supervisor = TaskSupervisor::new(self.error_handler);
        let execution = ExecutionSystem::new(
            node_id.clone(),
            &config,
            registry.clone(),
            leases,
            pipeline.clone(),
            clock.clone(),
            supervisor.clone(),
        );
        let tracking = Arc::new(ResponseTracking::new(clock.clone(), config.message_timeout()));
        let placement = Arc::new(Placement::new(
            cluster.clone(),
            directory.clone(),
            config.placement_attempts(),
            config.placement_backoff(),
        ));

        let steps: Vec<Arc<dyn PipelineStep>> = vec![
            Arc::new(IdentityStep::new(node_id.clone())),
            Arc::new(RoutingStep::new(
                node_id.clone(),
                placement,
                registry.clone(),
                pipeline.clone(),
                config.max_routing_attempts(),
            )),
            Arc::new(TrackingStep::new(tracking.clone())),
            Arc::new(HostingStep::new(
                node_id.clone(),
                execution.clone(),
                tracking.clone(),
                self.codec.clone(),
                pipeline.clone(),
            )),
            Arc::new(TransportStep::new(transport.clone(), self.codec.clone(), tracking.clone())),
        ];

        let (shutdown, shutdown_signal) = watch::channel(false);
        let mut tasks = Arc::new(Pipeline::new(steps, self.codec)).spawn_workers(
            receiver,
            config.pipeline_worker_count(),
            shutdown_signal.clone(),
            &supervisor,
        );

        if let Err(e) = transport.connect(&node_id, Arc::new(pipeline.clone())).await {
            shutdown.send_replace(true);
            let _ = cluster.set_status(&node_id, NodeStatus::Stopped).await;
            return Err(e.into());
        }
        let info = cluster.set_status(&node_id, NodeStatus::Active).await?;

        tasks.push(supervisor.spawn_task(
            "tick",
            tick_loop(
                config.tick_rate(),
                execution.clone(),
                tracking.clone(),
                cluster.clone(),
                directory.clone(),
                shutdown_signal.clone(),
            ),
        ));
        tasks.push(supervisor.spawn_task(
            "node-lease",
            node_lease_loop(
                config.tick_rate(),
                cluster.clone(),
                info,
                capabilities,
                clock.clone(),
                shutdown_signal,
            ),
        ));

        tracing::info!(node = %node_id, namespace = config.namespace(), "node started");

        Ok(Node {
            id: node_id,
            config,
            clock,
            cluster,
            directory,
            transport,
            execution,
            tracking,
            pipeline,
            shutdown,
            tasks: Mutex::new(tasks),
            stopped: AtomicBool::new(false),
        })
    }
}

impl fmt::Debug for NodeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeBuilder")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

async fn tick_loop(
    tick_rate: Duration,
    execution: ExecutionSystem,
    tracking: Arc<ResponseTracking>,
    cluster: Arc<ClusterManager>,
    directory: Arc<dyn AddressableDirectory>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TaskError> {
    let mut interval = tokio::time::interval(tick_rate);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = stopped(&mut shutdown) => return Ok(()),
            _ = interval.tick() => {}
        }

        execution.tick().await;
        tracking.sweep();
        for purged in cluster.tick().await {
            directory.remove_node_leases(&purged).await;
        }
    }
}

async fn node_lease_loop(
    tick_rate: Duration,
    cluster: Arc<ClusterManager>,
    info: NodeInfo,
    capabilities: NodeCapabilities,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TaskError> {
    let mut interval = tokio::time::interval(tick_rate);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let token = info.lease.challenge_token;
    let mut renew_at: Timestamp = info.lease.renew_at;

    loop {
        tokio::select! {
            () = stopped(&mut shutdown) => return Ok(()),
            _ = interval.tick() => {}
        }
        if clock.now() < renew_at {
            continue;
        }

        match cluster.renew_lease(&info.id, &token, capabilities.clone()).await {
            Ok(renewed) => renew_at = renewed.lease.renew_at,
            Err(
                e @ (LeaseError::InvalidChallenge { .. }
                | LeaseError::LeaseExpired { .. }
                | LeaseError::NodeNotFound { .. }),
            ) => {
                return Err(TaskError::Failed(format!("node {} lost its lease: {}", info.id, e)));
            }
            Err(e) => tracing::warn!(node = %info.id, "node lease renewal failed, will retry: {}", e),
        }
    }
}

/// A running cluster member.
pub struct Node {
    id: NodeId,
    config: RuntimeConfig,
    clock: Arc<dyn Clock>,
    cluster: Arc<ClusterManager>,
    directory: Arc<dyn AddressableDirectory>,
    transport: Arc<dyn Transport>,
    execution: ExecutionSystem,
    tracking: Arc<ResponseTracking>,
    pipeline: PipelineHandle,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Node {
    pub fn builder(config: RuntimeConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn cluster(&self) -> &Arc<ClusterManager> {
        &self.cluster
    }

    pub fn directory(&self) -> &Arc<dyn AddressableDirectory> {
        &self.directory
    }

    pub fn execution(&self) -> &ExecutionSystem {
        &self.execution
    }

    pub fn tracking(&self) -> &Arc<ResponseTracking> {
        &self.tracking
    }

    /// Proxy to the addressable `{addressable_type, key}`, wherever it lives.
    pub fn proxy(&self, addressable_type: impl Into<String>, key: impl Into<Key>) -> AddressableProxy {
        self.proxy_for(AddressableReference::new(addressable_type, key))
    }

    pub fn proxy_for(&self, reference: AddressableReference) -> AddressableProxy {
        AddressableProxy::new(reference, self.pipeline.clone())
    }

    /// Whether `reference` is activated on this node.
    pub fn is_active(&self, reference: &AddressableReference) -> bool {
        self.execution.is_active(reference)
    }

    pub async fn status(&self) -> Option<NodeStatus> {
        self.cluster.node(&self.id).await.map(|info| info.status)
    }

    /// Drain and leave the cluster. Later calls do nothing.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(node = %self.id, "stopping node");

        self.set_status(NodeStatus::Draining).await;
        self.execution.stop().await;
        self.set_status(NodeStatus::Stopping).await;

        self.shutdown.send_replace(true);
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(node = %self.id, "background task did not finish cleanly: {}", e);
            }
        }

        self.tracking.fail_all(PipelineError::ShuttingDown);
        self.transport.disconnect(&self.id).await;
        self.directory.remove_node_leases(&self.id).await;
        self.set_status(NodeStatus::Stopped).await;
        tracing::info!(node = %self.id, "node stopped");
    }

    async fn set_status(&self, status: NodeStatus) {
        if let Err(e) = self.cluster.set_status(&self.id, status).await {
            tracing::warn!(node = %self.id, status = ?status, "could not update node status: {}", e);
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("execution", &self.execution)
            .field("tracking", &self.tracking)
            .field("stopped", &self.stopped.load(Ordering::Acquire))
            .finish()
    }
}
