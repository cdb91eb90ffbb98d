//! Method dispatch for addressables.
//!
//! Invocations name their method as a string and carry their arguments as a
//! [`Value`]. The [`DispatchTable`] maps each method name to a type-erased
//! function that decodes the arguments, calls the matching
//! [`MethodHandler`] and encodes the result.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::addressable::{method_name, Addressable, AddressableContext, MethodHandler};
use crate::codec::{self, Value};
use crate::error::{ExecutionError, InvocationError};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type MethodFn<A> = Box<
    dyn for<'a> Fn(&'a mut A, Value, &'a AddressableContext) -> BoxFuture<'a, Result<Value, InvocationError>>
        + Send
        + Sync,
>;

/// Method table of one addressable type.
///
/// Built once per type by [`Addressable::register_methods`] and shared by
/// every activation of that type.
pub struct DispatchTable<A: Addressable> {
    methods: HashMap<String, MethodFn<A>>,
}

impl<A: Addressable> DispatchTable<A> {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Build the table for `A`.
    pub(crate) fn for_type() -> Self {
        let mut table = Self::new();
        A::register_methods(&mut table);
        table
    }

    /// Declare that `A` handles `Req` with a `Res` answer.
    ///
    /// The method name is the short type name of `Req`. Registering the same
    /// name twice keeps the later handler.
    pub fn register<Req, Res>(&mut self) -> &mut Self
    where
        A: MethodHandler<Req, Res>,
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
    {
        let method = method_name::<Req>();
        tracing::debug!(
            method = %method,
            addressable_type = A::ADDRESSABLE_TYPE,
            "registering method"
        );

        let handler: MethodFn<A> = Box::new(invoke_handler::<A, Req, Res>);
        if self.methods.insert(method.clone(), handler).is_some() {
            tracing::warn!(
                method = %method,
                addressable_type = A::ADDRESSABLE_TYPE,
                "method registered twice, keeping the later handler"
            );
        }
        self
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Run `method` against `addressable`.
    pub async fn dispatch(
        &self,
        addressable: &mut A,
        method: &str,
        args: Value,
        ctx: &AddressableContext,
    ) -> Result<Value, InvocationError> {
        let handler = self
            .methods
            .get(method)
            .ok_or_else(|| ExecutionError::UnknownMethod {
                addressable_type: A::ADDRESSABLE_TYPE.to_string(),
                method: method.to_string(),
            })?;

        handler(addressable, args, ctx).await
    }
}

impl<A: Addressable> Default for DispatchTable<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Addressable> fmt::Debug for DispatchTable<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<_> = self.methods.keys().collect();
        methods.sort();
        f.debug_struct("DispatchTable")
            .field("addressable_type", &A::ADDRESSABLE_TYPE)
            .field("methods", &methods)
            .finish()
    }
}

fn invoke_handler<'a, A, Req, Res>(
    addressable: &'a mut A,
    args: Value,
    ctx: &'a AddressableContext,
) -> BoxFuture<'a, Result<Value, InvocationError>>
where
    A: MethodHandler<Req, Res>,
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
{
    Box::pin(async move {
        let req: Req = codec::from_value(args)?;
        let res = <A as MethodHandler<Req, Res>>::handle(addressable, req, ctx).await?;
        Ok(codec::to_value(&res)?)
    })
}
