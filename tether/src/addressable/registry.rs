//! Registry of the addressable implementations a node can host.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::addressable::{Addressable, AddressableReference, DispatchTable, PlacementPolicy};
use crate::cluster::NodeCapabilities;
use crate::error::RegistryError;
use crate::execution::{spawn_handle, ExecutionHandle, HandleEnv};

/// Creates activations of one implementation.
pub(crate) trait AddressableFactory: Send + Sync {
    /// Rust type name of the implementation.
    fn implementation(&self) -> &'static str;

    fn placement(&self) -> PlacementPolicy;

    /// Construct a fresh instance and start its worker.
    fn spawn(&self, reference: AddressableReference, env: HandleEnv) -> ExecutionHandle;
}

type Constructor<A> = Box<dyn Fn(&AddressableReference) -> A + Send + Sync>;

struct TypedFactory<A: Addressable> {
    constructor: Constructor<A>,
    table: Arc<DispatchTable<A>>,
}

impl<A: Addressable> AddressableFactory for TypedFactory<A> {
    fn implementation(&self) -> &'static str {
        std::any::type_name::<A>()
    }

    fn placement(&self) -> PlacementPolicy {
        A::placement()
    }

    fn spawn(&self, reference: AddressableReference, env: HandleEnv) -> ExecutionHandle {
        let addressable = (self.constructor)(&reference);
        spawn_handle(addressable, self.table.clone(), reference, env)
    }
}

/// Maps addressable types to the implementation hosting them.
///
/// A type with no implementation, or with more than one, cannot be
/// hosted; [`AddressableRegistry::validate`] reports the latter so a node
/// refuses to start with an ambiguous registry.
#[derive(Default)]
pub struct AddressableRegistry {
    implementations: BTreeMap<String, Vec<Arc<dyn AddressableFactory>>>,
}

impl AddressableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `A`, constructing instances with `Default`.
    pub fn register<A>(&mut self) -> &mut Self
    where
        A: Addressable + Default,
    {
        self.register_with::<A, _>(|_| A::default())
    }

    /// Register `A` with a constructor receiving the activated reference.
    pub fn register_with<A, F>(&mut self, constructor: F) -> &mut Self
    where
        A: Addressable,
        F: Fn(&AddressableReference) -> A + Send + Sync + 'static,
    {
        let factory = TypedFactory::<A> {
            constructor: Box::new(constructor),
            table: Arc::new(DispatchTable::for_type()),
        };
        let implementations = self
            .implementations
            .entry(A::ADDRESSABLE_TYPE.to_string())
            .or_default();

        if let Some(slot) = implementations
            .iter_mut()
            .find(|existing| existing.implementation() == factory.implementation())
        {
            tracing::warn!(
                addressable_type = A::ADDRESSABLE_TYPE,
                implementation = factory.implementation(),
                "implementation registered twice, keeping the later constructor"
            );
            *slot = Arc::new(factory);
        } else {
            tracing::debug!(
                addressable_type = A::ADDRESSABLE_TYPE,
                implementation = factory.implementation(),
                "registered addressable implementation"
            );
            implementations.push(Arc::new(factory));
        }
        self
    }

    /// Fail if any type has more than one implementation.
    pub fn validate(&self) -> Result<(), RegistryError> {
        for addressable_type in self.implementations.keys() {
            self.resolve(addressable_type)?;
        }
        Ok(())
    }

    /// The single implementation of `addressable_type`.
    pub(crate) fn resolve(&self, addressable_type: &str) -> Result<Arc<dyn AddressableFactory>, RegistryError> {
        match self.implementations.get(addressable_type).map(Vec::as_slice) {
            None | Some([]) => Err(RegistryError::NoImplementation(addressable_type.to_string())),
            Some([factory]) => Ok(factory.clone()),
            Some(many) => Err(RegistryError::MultipleImplementations {
                addressable_type: addressable_type.to_string(),
                implementations: many.iter().map(|f| f.implementation().to_string()).collect(),
            }),
        }
    }

    pub fn can_host(&self, addressable_type: &str) -> bool {
        self.resolve(addressable_type).is_ok()
    }

    /// Placement policy of a hostable type; `Persistent` for anything else.
    pub fn placement(&self, addressable_type: &str) -> PlacementPolicy {
        self.resolve(addressable_type)
            .map(|factory| factory.placement())
            .unwrap_or_default()
    }

    /// Types this node advertises to the cluster.
    pub fn capabilities(&self) -> NodeCapabilities {
        let addressable_types: BTreeSet<String> = self
            .implementations
            .keys()
            .filter(|addressable_type| self.can_host(addressable_type))
            .cloned()
            .collect();
        NodeCapabilities { addressable_types }
    }
}

impl fmt::Debug for AddressableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types: BTreeMap<&str, Vec<&str>> = self
            .implementations
            .iter()
            .map(|(addressable_type, factories)| {
                (
                    addressable_type.as_str(),
                    factories.iter().map(|f| f.implementation()).collect(),
                )
            })
            .collect();
        f.debug_struct("AddressableRegistry").field("types", &types).finish()
    }
}
