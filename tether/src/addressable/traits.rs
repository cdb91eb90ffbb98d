//! Traits implemented by application addressables.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::addressable::{AddressableContext, DispatchTable};
use crate::error::AddressableError;
use crate::execution::DeactivationReason;

/// Where a new activation of an addressable type is placed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlacementPolicy {
    /// Placed once through the addressable directory and kept there while
    /// its lease lives.
    #[default]
    Persistent,

    /// Activated on the calling node when that node can host it; an
    /// existing lease elsewhere still wins.
    Local,
}

/// A virtual actor: activated on demand, deactivated when idle.
///
/// Exactly one live instance per [`AddressableReference`](crate::AddressableReference)
/// exists in the cluster at a time, and it processes one invocation at a
/// time in arrival order.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Default)]
/// struct Counter {
///     count: u64,
/// }
///
/// #[derive(Serialize, Deserialize)]
/// struct Increment;
///
/// #[async_trait]
/// impl Addressable for Counter {
///     const ADDRESSABLE_TYPE: &'static str = "Counter";
///
///     fn register_methods(table: &mut DispatchTable<Self>) {
///         table.register::<Increment, u64>();
///     }
/// }
///
/// #[async_trait]
/// impl MethodHandler<Increment, u64> for Counter {
///     async fn handle(&mut self, _req: Increment, _ctx: &AddressableContext) -> Result<u64, AddressableError> {
///         self.count += 1;
///         Ok(self.count)
///     }
/// }
/// ```
#[async_trait]
pub trait Addressable: Send + Sized + 'static {
    /// Type name used in references and for capability matching.
    const ADDRESSABLE_TYPE: &'static str;

    /// Placement of new activations.
    fn placement() -> PlacementPolicy {
        PlacementPolicy::Persistent
    }

    /// Declare the methods this addressable answers.
    fn register_methods(table: &mut DispatchTable<Self>);

    /// Runs once before the first invocation is processed.
    ///
    /// An error fails the activation and every invocation queued behind it.
    async fn on_activate(&mut self, _ctx: &AddressableContext) -> Result<(), AddressableError> {
        Ok(())
    }

    /// Runs once when the addressable is deactivated.
    ///
    /// Errors are logged; deactivation proceeds regardless.
    async fn on_deactivate(
        &mut self,
        _ctx: &AddressableContext,
        _reason: DeactivationReason,
    ) -> Result<(), AddressableError> {
        Ok(())
    }
}

/// One declared method: handle `Req`, answer `Res`.
#[async_trait]
pub trait MethodHandler<Req, Res>: Addressable
where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
{
    async fn handle(&mut self, req: Req, ctx: &AddressableContext) -> Result<Res, AddressableError>;
}
