//! # Tether
//!
//! Lease-based virtual actors for Rust.
//!
//! An *addressable* is a stateful object identified by a type and a key.
//! Callers never create or destroy one: they hold a proxy, and the runtime
//! activates the addressable on some node when it is first invoked, keeps
//! every invocation on it sequential, and deactivates it once idle.
//! Exclusivity across the cluster comes from time-bounded leases in a
//! shared [`AddressableDirectory`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Node                                                        │
//! │   proxy ──► Pipeline: identity → routing → tracking          │
//! │                        → hosting → transport ──► Transport   │
//! │                               │                              │
//! │                               ▼                              │
//! │                      ExecutionSystem                         │
//! │                  (one ExecutionHandle per                    │
//! │                   active addressable)                        │
//! │                               │                              │
//! │                       ExecutionLeases                        │
//! ├───────────────────────────────┼──────────────────────────────┤
//! │  ClusterManager               │   AddressableDirectory       │
//! │  (node leases, status)        │   (addressable leases)       │
//! └───────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use tether::{Addressable, AddressableRegistry, Node, RuntimeConfig};
//!
//! let mut registry = AddressableRegistry::new();
//! registry.register::<Counter>();
//!
//! let node = Node::builder(RuntimeConfig::default())
//!     .registry(registry)
//!     .start()
//!     .await?;
//!
//! let count: u64 = node.proxy("Counter", "alice").invoke(&Increment).await?;
//! ```
//!
//! Nodes sharing one [`ClusterManager`], one [`AddressableDirectory`] and
//! one [`LocalNetwork`] form an in-process cluster; other deployments plug
//! their own [`NodeDirectory`], [`AddressableDirectory`] and [`Transport`].

pub mod addressable;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod directory;
pub mod error;
pub mod execution;
pub mod node;
pub mod pipeline;
pub mod task;
pub mod time;
pub mod transport;

pub use addressable::{
    Addressable, AddressableContext, AddressableInvocation, AddressableProxy, AddressableReference,
    AddressableRegistry, DispatchTable, Key, MethodHandler, PlacementPolicy,
};
pub use cluster::{
    ClusterManager, InMemoryNodeDirectory, NodeCapabilities, NodeDirectory, NodeId, NodeInfo, NodeLease, NodeStatus,
};
pub use codec::{JsonSerializer, Serializer, Value};
pub use config::{ConfigError, RuntimeConfig};
pub use directory::{
    AddressableDirectory, AddressableLease, InMemoryAddressableDirectory, Placement, RandomRouting, RoutingStrategy,
};
pub use error::{
    AddressableError, CodecError, ExecutionError, InvocationError, LeaseError, PipelineError, PlacementError,
    RegistryError,
};
pub use execution::{DeactivationReason, DeactivationStrategy, ExecutionHandle, ExecutionSystem, HandleState};
pub use node::{Node, NodeBuilder, NodeError};
pub use task::{ErrorHandler, LoggingErrorHandler, TaskError};
pub use time::{Clock, ManualClock, SystemClock, Timestamp};
pub use transport::{LocalNetwork, MessageSink, Transport, TransportError};
