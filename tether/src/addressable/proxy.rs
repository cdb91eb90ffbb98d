//! Client-side handle for invoking an addressable wherever it lives.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};

use crate::addressable::{method_name, AddressableInvocation, AddressableReference};
use crate::codec;
use crate::error::InvocationError;
use crate::pipeline::PipelineHandle;

/// Location-transparent reference used to call an addressable.
///
/// Calls go through the local pipeline: the runtime finds (or places) the
/// hosting node, delivers the invocation and hands back its result.
///
/// Serializes as the bare [`AddressableReference`], so proxies can be passed
/// as method arguments.
#[derive(Clone)]
pub struct AddressableProxy {
    reference: AddressableReference,
    pipeline: PipelineHandle,
}

impl AddressableProxy {
    pub(crate) fn new(reference: AddressableReference, pipeline: PipelineHandle) -> Self {
        Self {
            reference,
            pipeline,
        }
    }

    pub fn reference(&self) -> &AddressableReference {
        &self.reference
    }

    /// Call the method handling `Req` and wait for its `Res`.
    pub async fn invoke<Req, Res>(&self, req: &Req) -> Result<Res, InvocationError>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let args = codec::to_value(req)?;
        let invocation = AddressableInvocation::new(self.reference.clone(), method_name::<Req>(), args);
        let value = self.pipeline.invoke(invocation).await?;
        Ok(codec::from_value(value)?)
    }

    /// Send `Req` without waiting for, or receiving, a result.
    pub fn invoke_one_way<Req>(&self, req: &Req) -> Result<(), InvocationError>
    where
        Req: Serialize,
    {
        let args = codec::to_value(req)?;
        let invocation = AddressableInvocation::one_way(self.reference.clone(), method_name::<Req>(), args);
        self.pipeline.send_one_way(invocation)?;
        Ok(())
    }
}

impl fmt::Debug for AddressableProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AddressableProxy").field(&self.reference).finish()
    }
}

impl Serialize for AddressableProxy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.reference.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressable::Key;
    use crate::error::PipelineError;

    #[test]
    fn test_proxy_serializes_as_reference() {
        let proxy = AddressableProxy::new(
            AddressableReference::new("Counter", "alice"),
            PipelineHandle::closed(),
        );

        let value = codec::to_value(&proxy).expect("proxy encodes");

        assert_eq!(
            value,
            serde_json::json!({ "addressable_type": "Counter", "key": { "StringKey": "alice" } })
        );
        let reference: AddressableReference = codec::from_value(value).expect("decodes as reference");
        assert_eq!(reference.key, Key::StringKey("alice".to_string()));
    }

    #[tokio::test]
    async fn test_invoke_on_closed_pipeline_fails() {
        let proxy = AddressableProxy::new(AddressableReference::new("Counter", "a"), PipelineHandle::closed());

        let result: Result<u64, _> = proxy.invoke(&"Increment").await;

        assert_eq!(
            result,
            Err(InvocationError::Pipeline(PipelineError::ShuttingDown))
        );
    }
}
