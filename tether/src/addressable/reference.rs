//! Identity of addressables and the invocations sent to them.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::Value;

/// Key component of an [`AddressableReference`].
///
/// Two references are equal only when both the type and the key (variant
/// and value) match, so `StringKey("1")` and `Int32Key(1)` are distinct
/// addressables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Key {
    NoKey,
    StringKey(String),
    Int32Key(i32),
    Int64Key(i64),
    GuidKey(Uuid),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::NoKey => write!(f, "-"),
            Key::StringKey(key) => write!(f, "{key}"),
            Key::Int32Key(key) => write!(f, "{key}"),
            Key::Int64Key(key) => write!(f, "{key}"),
            Key::GuidKey(key) => write!(f, "{key}"),
        }
    }
}

impl From<&str> for Key {
    fn from(key: &str) -> Self {
        Key::StringKey(key.to_string())
    }
}

impl From<String> for Key {
    fn from(key: String) -> Self {
        Key::StringKey(key)
    }
}

impl From<i32> for Key {
    fn from(key: i32) -> Self {
        Key::Int32Key(key)
    }
}

impl From<i64> for Key {
    fn from(key: i64) -> Self {
        Key::Int64Key(key)
    }
}

impl From<Uuid> for Key {
    fn from(key: Uuid) -> Self {
        Key::GuidKey(key)
    }
}

/// Cluster-wide identity of one addressable: its type plus its key.
///
/// Location independent; which node hosts it is decided by the
/// addressable directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressableReference {
    pub addressable_type: String,
    pub key: Key,
}

impl AddressableReference {
    pub fn new(addressable_type: impl Into<String>, key: impl Into<Key>) -> Self {
        Self {
            addressable_type: addressable_type.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for AddressableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addressable_type, self.key)
    }
}

/// Whether the caller waits for a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationKind {
    RequestResponse,
    OneWay,
}

/// A method call on an addressable.
///
/// `method` is the short type name of the request; `args` is the request
/// encoded as a value tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressableInvocation {
    pub reference: AddressableReference,
    pub method: String,
    pub args: Value,
    pub kind: InvocationKind,
}

impl AddressableInvocation {
    pub fn new(reference: AddressableReference, method: impl Into<String>, args: Value) -> Self {
        Self {
            reference,
            method: method.into(),
            args,
            kind: InvocationKind::RequestResponse,
        }
    }

    pub fn one_way(reference: AddressableReference, method: impl Into<String>, args: Value) -> Self {
        Self {
            kind: InvocationKind::OneWay,
            ..Self::new(reference, method, args)
        }
    }

    pub fn is_one_way(&self) -> bool {
        self.kind == InvocationKind::OneWay
    }
}

/// Method name for a request type: its unqualified type name.
///
/// `bank::messages::Deposit` becomes `"Deposit"`; generic parameters are
/// kept as written by the compiler.
pub fn method_name<Req>() -> String {
    let full = std::any::type_name::<Req>();
    let base = full.split('<').next().unwrap_or(full);
    let short = base.rsplit("::").next().unwrap_or(base);
    format!("{short}{}", &full[base.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;

    mod messages {
        pub struct Deposit;
    }

    #[test]
    fn test_references_differ_by_key_variant() {
        let by_string = AddressableReference::new("Counter", Key::StringKey("1".to_string()));
        let by_int = AddressableReference::new("Counter", Key::Int32Key(1));

        assert_ne!(by_string, by_int);
        assert_eq!(
            by_int,
            AddressableReference::new("Counter", 1_i32),
            "same type and key variant are equal"
        );
    }

    #[test]
    fn test_reference_display() {
        let reference = AddressableReference::new("Counter", "alice");
        assert_eq!(reference.to_string(), "Counter/alice");
        assert_eq!(AddressableReference::new("Singleton", Key::NoKey).to_string(), "Singleton/-");
    }

    #[test]
    fn test_method_name_strips_module_path() {
        assert_eq!(method_name::<messages::Deposit>(), "Deposit");
        assert_eq!(method_name::<u64>(), "u64");
    }

    #[test]
    fn test_one_way_invocation() {
        let reference = AddressableReference::new("Counter", "a");
        let invocation = AddressableInvocation::one_way(reference, "Increment", Value::Null);
        assert!(invocation.is_one_way());
    }
}
