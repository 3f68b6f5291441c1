//! Konverge core types: object identity, operation outcomes, and the
//! typed/dynamic representation bridge.

#![forbid(unsafe_code)]

use std::fmt;

use kube::core::{DynamicObject, ObjectMeta};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// (name, namespace) pair addressing one object within a resource type.
///
/// Immutable once the object exists in the store; this is the only
/// correlation key between desired and existing state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub name: String,
    pub namespace: Option<String>,
}

impl ObjectKey {
    pub fn new(name: impl Into<String>, namespace: Option<&str>) -> Self {
        Self { name: name.into(), namespace: namespace.map(|s| s.to_string()) }
    }

    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Action taken by a reconciliation call; reads as "Widget ns/a has been ...".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationResult {
    Unchanged,
    Created,
    Updated,
}

impl OperationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationResult::Unchanged => "unchanged",
            OperationResult::Created => "created",
            OperationResult::Updated => "updated",
        }
    }
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conversion failures between the typed and dynamic object forms.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("to dynamic: {0}")]
    ToDynamic(#[source] serde_json::Error),
    #[error("from dynamic: {0}")]
    FromDynamic(#[source] serde_json::Error),
}

/// Capability surface the reconciler needs from a domain object.
///
/// Implemented below for [`DynamicObject`], the schema-less wire form. Typed
/// kinds implement it by delegating to [`to_dynamic`]/[`from_dynamic`] and
/// their `Default`.
pub trait StoreObject {
    /// Identity key, read from metadata.
    fn object_key(&self) -> ObjectKey;

    /// Wire form used for store writes.
    fn to_dynamic(&self) -> Result<DynamicObject, BridgeError>;

    /// Overwrite self from a wire object that round-tripped through the
    /// store. Fields unknown to the concrete schema are dropped, not merged.
    fn absorb_dynamic(&mut self, dynamic: DynamicObject) -> Result<(), BridgeError>;

    /// Fresh zero value of the same concrete shape, used for existing-state
    /// snapshots.
    fn empty_like(&self) -> Self;
}

impl StoreObject for DynamicObject {
    fn object_key(&self) -> ObjectKey {
        ObjectKey::from_meta(&self.metadata)
    }

    fn to_dynamic(&self) -> Result<DynamicObject, BridgeError> {
        Ok(self.clone())
    }

    fn absorb_dynamic(&mut self, dynamic: DynamicObject) -> Result<(), BridgeError> {
        // wholesale replacement, not a merge
        *self = dynamic;
        Ok(())
    }

    fn empty_like(&self) -> Self {
        DynamicObject {
            types: None,
            metadata: ObjectMeta::default(),
            data: Value::Object(Default::default()),
        }
    }
}

/// Structural typed -> dynamic conversion through the JSON data model.
pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject, BridgeError> {
    let value = serde_json::to_value(obj).map_err(BridgeError::ToDynamic)?;
    serde_json::from_value(value).map_err(BridgeError::ToDynamic)
}

/// Structural dynamic -> typed conversion. Every field reachable from the
/// target schema is overwritten; a shape mismatch is an error.
pub fn from_dynamic<K: DeserializeOwned>(dynamic: &DynamicObject) -> Result<K, BridgeError> {
    let value = serde_json::to_value(dynamic).map_err(BridgeError::FromDynamic)?;
    serde_json::from_value(value).map_err(BridgeError::FromDynamic)
}
