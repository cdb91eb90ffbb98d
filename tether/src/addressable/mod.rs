//! Addressables: identity, definition, dispatch and proxies.

mod context;
mod dispatch;
mod proxy;
mod reference;
mod registry;
mod traits;

pub use context::AddressableContext;
pub use dispatch::DispatchTable;
pub use proxy::AddressableProxy;
pub use reference::{method_name, AddressableInvocation, AddressableReference, InvocationKind, Key};
pub use registry::AddressableRegistry;
pub use traits::{Addressable, MethodHandler, PlacementPolicy};

pub(crate) use registry::AddressableFactory;
