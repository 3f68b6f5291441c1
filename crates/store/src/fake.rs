//! In-memory test double for the [`ObjectStore`] boundary.
//!
//! Fixtures may be typed or dynamic. apiVersion/kind are taken from the
//! fixture when set and back-filled from the type registry otherwise, and a
//! matching `<Kind>List` type is synthesized per registered kind so listings
//! work even for schemas seeded purely from dynamic fixtures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use kube::core::{DynamicObject, TypeMeta};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use konverge_core::{to_dynamic, ObjectKey, StoreObject};

use crate::{ObjectStore, StoreError, StoreResult};

/// Known kinds, used to back-fill types on fixtures that carry none.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    kinds: Vec<TypeMeta>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kind; the matching list kind is synthesized when absent.
    pub fn register(&mut self, api_version: &str, kind: &str) -> &mut Self {
        self.insert(TypeMeta { api_version: api_version.to_string(), kind: kind.to_string() });
        if !kind.ends_with("List") {
            self.insert(TypeMeta {
                api_version: api_version.to_string(),
                kind: format!("{}List", kind),
            });
        }
        self
    }

    pub fn recognizes(&self, tm: &TypeMeta) -> bool {
        self.kinds.iter().any(|k| k.api_version == tm.api_version && k.kind == tm.kind)
    }

    pub fn resolve(&self, kind: &str) -> Option<TypeMeta> {
        self.kinds.iter().find(|k| k.kind == kind).cloned()
    }

    fn insert(&mut self, tm: TypeMeta) {
        if !self.recognizes(&tm) {
            self.kinds.push(tm);
        }
    }
}

/// Listing of a fake store's contents under the synthesized list kind.
#[derive(Debug, Clone)]
pub struct ObjectListing {
    pub types: TypeMeta,
    pub items: Vec<DynamicObject>,
}

/// In-memory [`ObjectStore`] serving one resource kind.
///
/// Admission mimics a real store: uid and a monotonically increasing
/// resourceVersion are assigned on write, and key uniqueness is enforced.
pub struct FakeStore {
    types: TypeMeta,
    registry: Mutex<TypeRegistry>,
    objects: Mutex<HashMap<ObjectKey, DynamicObject>>,
    rv: AtomicU64,
}

impl FakeStore {
    /// Store for `kind`, registering it (and its list kind) on the way.
    pub fn new(api_version: &str, kind: &str) -> Self {
        let mut registry = TypeRegistry::new();
        registry.register(api_version, kind);
        Self {
            types: TypeMeta { api_version: api_version.to_string(), kind: kind.to_string() },
            registry: Mutex::new(registry),
            objects: Mutex::new(HashMap::new()),
            rv: AtomicU64::new(0),
        }
    }

    /// Store backed by an existing registry; `kind` must be registered.
    pub fn with_registry(registry: TypeRegistry, kind: &str) -> StoreResult<Self> {
        let types = registry
            .resolve(kind)
            .ok_or_else(|| StoreError::Invalid(format!("kind not registered: {}", kind)))?;
        Ok(Self {
            types,
            registry: Mutex::new(registry),
            objects: Mutex::new(HashMap::new()),
            rv: AtomicU64::new(0),
        })
    }

    /// Seed from a typed fixture.
    pub fn seed<K: Serialize>(&self, fixture: &K) -> StoreResult<()> {
        let dynamic = to_dynamic(fixture).map_err(|e| StoreError::Invalid(e.to_string()))?;
        self.seed_dynamic(dynamic)
    }

    /// Seed from a dynamic fixture.
    pub fn seed_dynamic(&self, fixture: DynamicObject) -> StoreResult<()> {
        let admitted = self.admit(fixture)?;
        let key = admitted.object_key();
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        debug!(%key, "seeded");
        objects.insert(key, admitted);
        Ok(())
    }

    /// Everything currently held, sorted by key, under the list kind.
    pub fn list(&self, namespace: Option<&str>) -> ObjectListing {
        let objects = self.objects.lock().unwrap();
        let mut items: Vec<DynamicObject> = objects
            .iter()
            .filter(|(k, _)| namespace.map_or(true, |ns| k.namespace.as_deref() == Some(ns)))
            .map(|(_, v)| v.clone())
            .collect();
        items.sort_by_key(|o| {
            let k = o.object_key();
            (k.namespace.unwrap_or_default(), k.name)
        });
        ObjectListing { types: self.list_types(), items }
    }

    pub fn registry(&self) -> TypeRegistry {
        self.registry.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn list_types(&self) -> TypeMeta {
        let list_kind = format!("{}List", self.types.kind);
        self.registry.lock().unwrap().resolve(&list_kind).unwrap_or(TypeMeta {
            api_version: self.types.api_version.clone(),
            kind: list_kind,
        })
    }

    /// Back-fill types and server-populated fields the way a real store would.
    fn admit(&self, mut obj: DynamicObject) -> StoreResult<DynamicObject> {
        let tm = match obj.types.take() {
            Some(tm) if !tm.kind.is_empty() => tm,
            _ => self.types.clone(),
        };
        self.registry.lock().unwrap().register(&tm.api_version, &tm.kind);
        obj.types = Some(tm);

        if obj.metadata.name.as_deref().unwrap_or_default().is_empty() {
            return Err(StoreError::Invalid("missing metadata.name".into()));
        }
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(Uuid::new_v4().to_string());
        }
        obj.metadata.resource_version = Some(self.next_rv());
        Ok(obj)
    }

    fn next_rv(&self) -> String {
        format!("{}", self.rv.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<DynamicObject> {
        let objects = self.objects.lock().unwrap();
        objects.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn create(&self, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        let admitted = self.admit(obj.clone())?;
        let key = admitted.object_key();
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        objects.insert(key.clone(), admitted.clone());
        debug!(%key, "created");
        Ok(admitted)
    }

    async fn update(&self, obj: &DynamicObject) -> StoreResult<DynamicObject> {
        let key = obj.object_key();
        if key.name.is_empty() {
            return Err(StoreError::Invalid("missing metadata.name".into()));
        }
        let mut objects = self.objects.lock().unwrap();
        let current = objects.get(&key).ok_or_else(|| StoreError::NotFound(key.clone()))?;

        let mut admitted = obj.clone();
        if admitted.types.as_ref().map_or(true, |tm| tm.kind.is_empty()) {
            admitted.types = current.types.clone();
        }
        // uid survives whole-object replacement
        if admitted.metadata.uid.is_none() {
            admitted.metadata.uid = current.metadata.uid.clone();
        }
        admitted.metadata.resource_version = Some(self.next_rv());
        objects.insert(key.clone(), admitted.clone());
        debug!(%key, "replaced");
        Ok(admitted)
    }
}
