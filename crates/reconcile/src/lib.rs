//! Konverge reconcile: the create-or-update primitive over a dynamic object
//! store. Fetch current state, apply the caller's desired-state transform,
//! and write back only when something observable changed.

#![forbid(unsafe_code)]

use std::fmt;

use kube::core::DynamicObject;
use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub use konverge_core::{ObjectKey, OperationResult, StoreObject};
pub use konverge_store::{ObjectStore, StoreError};

use konverge_core::BridgeError;

/// Dotted path into the object's JSON form, e.g. `status` or
/// `metadata.resourceVersion`. Empty segments are dropped while parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn parse(path: &str) -> Self {
        FieldPath(path.split('.').filter(|s| !s.is_empty()).map(|s| s.to_string()).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        FieldPath::parse(path)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// Options for [`create_or_update`].
#[derive(Debug, Clone, Default)]
pub struct CreateOrUpdateOptions {
    /// Field paths excluded from the change comparison (e.g. `status`).
    pub ignore_fields: Vec<FieldPath>,
    /// Also keep the ignored paths out of the transform's write payload: on
    /// update they are written back exactly as the store currently holds
    /// them, on create they are omitted. The transform can then never
    /// overwrite those subtrees.
    pub strip_ignored_on_write: bool,
}

impl CreateOrUpdateOptions {
    /// Ignore the given dotted paths when deciding whether anything changed.
    pub fn ignoring<'a, I: IntoIterator<Item = &'a str>>(paths: I) -> Self {
        Self {
            ignore_fields: paths.into_iter().map(FieldPath::parse).collect(),
            strip_ignored_on_write: false,
        }
    }
}

/// Failures of a single reconciliation call. Nothing is retried here; an
/// error always means the call wrote at most nothing beyond what it reports.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The initial fetch failed for a reason other than not-found. The
    /// mutation callback was never invoked.
    #[error("fetch {key}: {source}")]
    Fetch { key: ObjectKey, #[source] source: StoreError },

    /// The caller's mutation callback returned an error; no write happened.
    #[error("mutate {key}: {source}")]
    Mutation { key: ObjectKey, #[source] source: anyhow::Error },

    /// The mutation callback changed name or namespace. A contract breach by
    /// the caller, not a store condition; retrying cannot help.
    #[error("mutation callback must not change the object key: {from} -> {to}")]
    IdentityViolation { from: ObjectKey, to: ObjectKey },

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// The store rejected the create or update; surfaced verbatim.
    #[error("{verb} {key}: {source}")]
    Write { verb: &'static str, key: ObjectKey, #[source] source: StoreError },
}

/// Ensure the store holds an object matching `desired`'s identity, creating
/// or replacing it as needed.
///
/// `mutate` is applied to `desired` in memory, exactly once, before any
/// write; it must not change name or namespace. When the mutated state is
/// semantically equal to what the store already holds (under the configured
/// ignore-list) no write is issued. On a successful write the store's
/// returned representation is absorbed back into `desired`, so the caller
/// observes server-populated fields through its own handle.
///
/// At most one write per call, updates are whole-object replacements, and
/// same-key races are not coordinated here; the store's own uniqueness and
/// versioning are the only backstop.
pub async fn create_or_update<K, S, F>(
    store: &S,
    desired: &mut K,
    opts: &CreateOrUpdateOptions,
    mutate: F,
) -> Result<OperationResult, ReconcileError>
where
    K: StoreObject,
    S: ObjectStore + ?Sized,
    F: FnOnce(&mut K) -> anyhow::Result<()>,
{
    counter!("reconcile_attempts", 1u64);
    let key = desired.object_key();

    let fetched = match store.get(&key).await {
        Ok(obj) => Some(obj),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(ReconcileError::Fetch { key, source: e }),
    };

    let fetched = match fetched {
        Some(obj) => obj,
        None => {
            apply_mutation(desired, &key, mutate)?;
            let payload = write_payload(desired, opts, None)?;
            let stored = store
                .create(&payload)
                .await
                .map_err(|e| ReconcileError::Write { verb: "create", key: key.clone(), source: e })?;
            desired.absorb_dynamic(stored)?;
            counter!("reconcile_created", 1u64);
            debug!(%key, "created");
            return Ok(OperationResult::Created);
        }
    };

    // captured before the snapshot consumes `fetched`; only needed when
    // ignored paths must be written back as the store holds them
    let live = if opts.strip_ignored_on_write && !opts.ignore_fields.is_empty() {
        Some(serde_json::to_value(&fetched).map_err(BridgeError::ToDynamic)?)
    } else {
        None
    };
    let mut existing = desired.empty_like();
    existing.absorb_dynamic(fetched)?;

    apply_mutation(desired, &key, mutate)?;

    if semantically_equal(&existing, desired, &opts.ignore_fields)? {
        counter!("reconcile_unchanged", 1u64);
        debug!(%key, "unchanged");
        return Ok(OperationResult::Unchanged);
    }

    let payload = write_payload(desired, opts, live.as_ref())?;
    let stored = store
        .update(&payload)
        .await
        .map_err(|e| ReconcileError::Write { verb: "update", key: key.clone(), source: e })?;
    desired.absorb_dynamic(stored)?;
    counter!("reconcile_updated", 1u64);
    debug!(%key, "updated");
    Ok(OperationResult::Updated)
}

/// Run the callback, then re-check that it left the identity alone.
fn apply_mutation<K, F>(obj: &mut K, key: &ObjectKey, mutate: F) -> Result<(), ReconcileError>
where
    K: StoreObject,
    F: FnOnce(&mut K) -> anyhow::Result<()>,
{
    mutate(obj).map_err(|e| ReconcileError::Mutation { key: key.clone(), source: e })?;
    let moved = obj.object_key();
    if moved != *key {
        return Err(ReconcileError::IdentityViolation { from: key.clone(), to: moved });
    }
    Ok(())
}

/// Deep value equality over the wire form, key-order insensitive, with the
/// ignored paths pruned from both sides.
fn semantically_equal<K: StoreObject>(
    existing: &K,
    desired: &K,
    ignore: &[FieldPath],
) -> Result<bool, BridgeError> {
    Ok(comparable(existing, ignore)? == comparable(desired, ignore)?)
}

fn comparable<K: StoreObject>(obj: &K, ignore: &[FieldPath]) -> Result<Value, BridgeError> {
    let mut value =
        serde_json::to_value(obj.to_dynamic()?).map_err(BridgeError::ToDynamic)?;
    for path in ignore {
        prune(&mut value, path);
    }
    Ok(value)
}

/// Wire form to send. With `strip_ignored_on_write`, ignored paths are
/// replaced by the live store state (`None` on the create path, where they
/// are simply dropped).
fn write_payload<K: StoreObject>(
    obj: &K,
    opts: &CreateOrUpdateOptions,
    live: Option<&Value>,
) -> Result<DynamicObject, ReconcileError> {
    let wire = obj.to_dynamic()?;
    if !opts.strip_ignored_on_write || opts.ignore_fields.is_empty() {
        return Ok(wire);
    }
    let mut value = serde_json::to_value(&wire).map_err(BridgeError::ToDynamic)?;
    for path in &opts.ignore_fields {
        match live.and_then(|l| value_at(l, path)) {
            Some(v) => set_at(&mut value, path, v.clone()),
            None => prune(&mut value, path),
        }
    }
    Ok(serde_json::from_value(value).map_err(BridgeError::FromDynamic)?)
}

fn prune(value: &mut Value, path: &FieldPath) {
    let (last, parents) = match path.segments().split_last() {
        Some(x) => x,
        None => return,
    };
    let mut cur = value;
    for seg in parents {
        cur = match cur.get_mut(seg) {
            Some(next) => next,
            None => return,
        };
    }
    if let Some(map) = cur.as_object_mut() {
        map.remove(last);
    }
}

fn value_at<'a>(value: &'a Value, path: &FieldPath) -> Option<&'a Value> {
    let mut cur = value;
    for seg in path.segments() {
        cur = cur.get(seg)?;
    }
    Some(cur)
}

fn set_at(value: &mut Value, path: &FieldPath, new: Value) {
    let (last, parents) = match path.segments().split_last() {
        Some(x) => x,
        None => return,
    };
    let mut cur = value;
    for seg in parents {
        let map = match cur.as_object_mut() {
            Some(m) => m,
            None => return,
        };
        cur = map.entry(seg.clone()).or_insert_with(|| Value::Object(Default::default()));
    }
    if let Some(map) = cur.as_object_mut() {
        map.insert(last.clone(), new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use kube::core::{DynamicObject, ObjectMeta, TypeMeta};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use konverge_core::{from_dynamic, to_dynamic, BridgeError};
    use konverge_store::fake::FakeStore;
    use konverge_store::StoreResult;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Widget {
        api_version: String,
        kind: String,
        #[serde(default)]
        metadata: ObjectMeta,
        #[serde(default)]
        spec: WidgetSpec,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<WidgetStatus>,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct WidgetSpec {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replicas: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct WidgetStatus {
        #[serde(default)]
        ready: i32,
    }

    impl Widget {
        fn new(name: &str, ns: &str) -> Self {
            Widget {
                api_version: "example.io/v1".into(),
                kind: "Widget".into(),
                metadata: ObjectMeta {
                    name: Some(name.into()),
                    namespace: Some(ns.into()),
                    ..Default::default()
                },
                spec: WidgetSpec::default(),
                status: None,
            }
        }
    }

    impl StoreObject for Widget {
        fn object_key(&self) -> ObjectKey {
            ObjectKey::from_meta(&self.metadata)
        }

        fn to_dynamic(&self) -> Result<DynamicObject, BridgeError> {
            to_dynamic(self)
        }

        fn absorb_dynamic(&mut self, dynamic: DynamicObject) -> Result<(), BridgeError> {
            *self = from_dynamic(&dynamic)?;
            Ok(())
        }

        fn empty_like(&self) -> Self {
            Self::default()
        }
    }

    fn widget_store() -> FakeStore {
        FakeStore::new("example.io/v1", "Widget")
    }

    struct CountingStore<S> {
        inner: S,
        creates: AtomicUsize,
        updates: AtomicUsize,
    }

    impl<S> CountingStore<S> {
        fn new(inner: S) -> Self {
            Self { inner, creates: AtomicUsize::new(0), updates: AtomicUsize::new(0) }
        }

        fn writes(&self) -> usize {
            self.creates.load(Ordering::SeqCst) + self.updates.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<S: ObjectStore> ObjectStore for CountingStore<S> {
        async fn get(&self, key: &ObjectKey) -> StoreResult<DynamicObject> {
            self.inner.get(key).await
        }

        async fn create(&self, obj: &DynamicObject) -> StoreResult<DynamicObject> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.inner.create(obj).await
        }

        async fn update(&self, obj: &DynamicObject) -> StoreResult<DynamicObject> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            self.inner.update(obj).await
        }
    }

    struct FailingGet;

    #[async_trait]
    impl ObjectStore for FailingGet {
        async fn get(&self, _key: &ObjectKey) -> StoreResult<DynamicObject> {
            Err(StoreError::Invalid("backend down".into()))
        }

        async fn create(&self, _obj: &DynamicObject) -> StoreResult<DynamicObject> {
            panic!("create must not be called");
        }

        async fn update(&self, _obj: &DynamicObject) -> StoreResult<DynamicObject> {
            panic!("update must not be called");
        }
    }

    #[tokio::test]
    async fn creates_when_absent() {
        let store = widget_store();
        let mut w = Widget::new("a", "ns");
        let opts = CreateOrUpdateOptions::default();

        let op = create_or_update(&store, &mut w, &opts, |w| {
            w.spec.replicas = Some(1);
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(op, OperationResult::Created);
        // server-populated fields flowed back into the caller's handle
        assert!(w.metadata.uid.is_some());
        assert!(w.metadata.resource_version.is_some());
        assert_eq!(w.spec.replicas, Some(1));

        let fetched = store.get(&ObjectKey::new("a", Some("ns"))).await.unwrap();
        let stored: Widget = from_dynamic(&fetched).unwrap();
        assert_eq!(stored, w);
    }

    #[tokio::test]
    async fn converges_then_settles() {
        let store = CountingStore::new(widget_store());
        let mut w = Widget::new("a", "ns");
        let opts = CreateOrUpdateOptions::default();

        let op = create_or_update(&store, &mut w, &opts, |w| {
            w.spec.replicas = Some(1);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(op, OperationResult::Created);

        let op = create_or_update(&store, &mut w, &opts, |w| {
            w.spec.replicas = Some(1);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(op, OperationResult::Unchanged);
        assert_eq!(store.writes(), 1);

        let op = create_or_update(&store, &mut w, &opts, |w| {
            w.spec.replicas = Some(2);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(op, OperationResult::Updated);
        assert_eq!(store.writes(), 2);

        let fetched: Widget =
            from_dynamic(&store.inner.get(&w.object_key()).await.unwrap()).unwrap();
        assert_eq!(fetched.spec.replicas, Some(2));
    }

    #[tokio::test]
    async fn rejects_rename_on_create() {
        let store = CountingStore::new(widget_store());
        let mut w = Widget::new("a", "ns");
        let opts = CreateOrUpdateOptions::default();

        let err = create_or_update(&store, &mut w, &opts, |w| {
            w.metadata.name = Some("a-1".into());
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ReconcileError::IdentityViolation { .. }));
        assert_eq!(store.writes(), 0);
        assert!(store.inner.is_empty());
    }

    #[tokio::test]
    async fn rejects_namespace_move_on_update() {
        let store = CountingStore::new(widget_store());
        let mut seeded = Widget::new("a", "ns");
        seeded.spec.replicas = Some(1);
        store.inner.seed(&seeded).unwrap();

        let mut w = Widget::new("a", "ns");
        let opts = CreateOrUpdateOptions::default();
        let err = create_or_update(&store, &mut w, &opts, |w| {
            w.metadata.namespace = Some("elsewhere".into());
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ReconcileError::IdentityViolation { .. }));
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn fetch_failure_skips_the_callback() {
        let mut w = Widget::new("a", "ns");
        let opts = CreateOrUpdateOptions::default();
        let mut called = false;

        let err = create_or_update(&FailingGet, &mut w, &opts, |_w| {
            called = true;
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ReconcileError::Fetch { .. }));
        assert!(!called);
    }

    #[tokio::test]
    async fn mutation_failure_aborts_before_any_write() {
        let store = CountingStore::new(widget_store());
        let mut w = Widget::new("a", "ns");
        let opts = CreateOrUpdateOptions::default();

        let err = create_or_update(&store, &mut w, &opts, |_w| Err(anyhow::anyhow!("boom")))
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Mutation { .. }));
        assert_eq!(store.writes(), 0);
        assert!(store.inner.is_empty());
    }

    #[tokio::test]
    async fn ignored_fields_do_not_trigger_updates() {
        let store = CountingStore::new(widget_store());
        let mut w = Widget::new("a", "ns");
        let opts = CreateOrUpdateOptions::ignoring(["status"]);

        create_or_update(&store, &mut w, &opts, |w| {
            w.spec.replicas = Some(1);
            Ok(())
        })
        .await
        .unwrap();

        let op = create_or_update(&store, &mut w, &opts, |w| {
            w.status = Some(WidgetStatus { ready: 3 });
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(op, OperationResult::Unchanged);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn strip_on_write_keeps_the_server_subtree() {
        let store = widget_store();
        let mut seeded = Widget::new("a", "ns");
        seeded.spec.replicas = Some(1);
        seeded.status = Some(WidgetStatus { ready: 1 });
        store.seed(&seeded).unwrap();

        let mut w = Widget::new("a", "ns");
        let opts = CreateOrUpdateOptions {
            ignore_fields: vec![FieldPath::parse("status")],
            strip_ignored_on_write: true,
        };

        let op = create_or_update(&store, &mut w, &opts, |w| {
            w.spec.replicas = Some(2);
            w.status = Some(WidgetStatus { ready: 9 });
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(op, OperationResult::Updated);
        let fetched: Widget =
            from_dynamic(&store.get(&w.object_key()).await.unwrap()).unwrap();
        assert_eq!(fetched.spec.replicas, Some(2));
        // the server's status survived the whole-object replacement
        assert_eq!(fetched.status, Some(WidgetStatus { ready: 1 }));
    }

    #[tokio::test]
    async fn dynamic_objects_reconcile_too() {
        let store = widget_store();
        let opts = CreateOrUpdateOptions::default();
        let mut obj = DynamicObject {
            types: Some(TypeMeta { api_version: "example.io/v1".into(), kind: "Widget".into() }),
            metadata: ObjectMeta {
                name: Some("a".into()),
                namespace: Some("ns".into()),
                ..Default::default()
            },
            data: json!({}),
        };

        let op = create_or_update(&store, &mut obj, &opts, |o| {
            o.data["spec"]["replicas"] = json!(1);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(op, OperationResult::Created);
        assert!(obj.metadata.uid.is_some());

        let op = create_or_update(&store, &mut obj, &opts, |o| {
            o.data["spec"]["replicas"] = json!(1);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(op, OperationResult::Unchanged);

        let op = create_or_update(&store, &mut obj, &opts, |o| {
            o.data["spec"]["replicas"] = json!(2);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(op, OperationResult::Updated);

        let fetched = store.get(&ObjectKey::new("a", Some("ns"))).await.unwrap();
        assert_eq!(fetched.data["spec"]["replicas"], json!(2));
    }

    #[test]
    fn field_path_parses_dotted_paths() {
        assert_eq!(FieldPath::parse("status").segments(), &["status"]);
        assert_eq!(
            FieldPath::parse("metadata.resourceVersion").segments(),
            &["metadata", "resourceVersion"]
        );
        assert_eq!(FieldPath::parse("a..b").segments(), &["a", "b"]);
        assert_eq!(FieldPath::parse("metadata.labels").to_string(), "metadata.labels");
    }

    #[test]
    fn prune_removes_only_the_addressed_subtree() {
        let mut v = json!({
            "metadata": { "name": "a", "resourceVersion": "5" },
            "spec": { "replicas": 1 }
        });
        prune(&mut v, &FieldPath::parse("metadata.resourceVersion"));
        assert_eq!(v["metadata"], json!({ "name": "a" }));
        assert_eq!(v["spec"]["replicas"], json!(1));

        // missing paths are a no-op
        prune(&mut v, &FieldPath::parse("status.ready"));
        assert_eq!(v["spec"]["replicas"], json!(1));
    }

    #[test]
    fn set_at_grafts_nested_values() {
        let mut v = json!({ "spec": {} });
        set_at(&mut v, &FieldPath::parse("status.ready"), json!(4));
        assert_eq!(v["status"]["ready"], json!(4));
        set_at(&mut v, &FieldPath::parse("spec.replicas"), json!(2));
        assert_eq!(v["spec"]["replicas"], json!(2));
    }
}
