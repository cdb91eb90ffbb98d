//! Hosting of activations: handles, leases, the execution system and
//! shutdown pacing.

mod handle;
mod leases;
mod lifecycle;
mod strategy;
mod system;

pub use handle::ExecutionHandle;
pub use leases::ExecutionLeases;
pub use lifecycle::{DeactivationReason, HandleState};
pub use strategy::DeactivationStrategy;
pub use system::ExecutionSystem;

pub(crate) use handle::{spawn_handle, HandleEnv, HandleObserver};
