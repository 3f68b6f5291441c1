//! Konverge store: the dynamic object-store boundary and its kube-rs
//! implementation.

#![forbid(unsafe_code)]

pub mod fake;

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use thiserror::Error;
use tracing::debug;

use konverge_core::ObjectKey;

/// Store-layer failures. Reconciliation branches only on
/// [`StoreError::is_not_found`]; everything else is surfaced verbatim.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(ObjectKey),
    #[error("already exists: {0}")]
    AlreadyExists(ObjectKey),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error(transparent)]
    Client(#[from] kube::Error),
}

impl StoreError {
    /// True when the failure means "no object at that key" rather than a
    /// real error.
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound(_) => true,
            StoreError::Client(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Declarative object store scoped to a single resource type. The namespace
/// comes from the key (reads) or the object metadata (writes) per call.
///
/// Cancellation belongs to the caller: dropping a call future aborts it.
/// Nothing here retries.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the current wire form at `key`.
    async fn get(&self, key: &ObjectKey) -> StoreResult<DynamicObject>;

    /// Create `obj`; returns the stored form with server-populated fields.
    async fn create(&self, obj: &DynamicObject) -> StoreResult<DynamicObject>;

    /// Whole-object replacement of the object named by `obj`'s metadata.
    async fn update(&self, obj: &DynamicObject) -> StoreResult<DynamicObject>;
}

/// kube-rs dynamic client adapter, one instance per resource type.
pub struct KubeStore {
    client: Client,
    resource: ApiResource,
}

impl KubeStore {
    pub fn new(client: Client, resource: ApiResource) -> Self {
        Self { client, resource }
    }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            None => Api::all_with(self.client.clone(), &self.resource),
        }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<DynamicObject> {
        match self.api(key.namespace.as_deref()).get(&key.name).await {
            Ok(obj) => Ok(obj),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(StoreError::NotFound(key.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        let key = ObjectKey::from_meta(&obj.metadata);
        debug!(%key, "create");
        match self.api(key.namespace.as_deref()).create(&PostParams::default(), obj).await {
            Ok(stored) => Ok(stored),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(StoreError::AlreadyExists(key)),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        let key = ObjectKey::from_meta(&obj.metadata);
        if key.name.is_empty() {
            return Err(StoreError::Invalid("missing metadata.name".into()));
        }
        debug!(%key, "replace");
        Ok(self
            .api(key.namespace.as_deref())
            .replace(&key.name, &PostParams::default(), obj)
            .await?)
    }
}
