//! In-memory `ClusterSource` for tests and offline reconciliation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ferry_core::{ClusterId, GroupKind, ResourceKey};
use futures::StreamExt;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{ClusterConnector, ClusterSource, DiscoveredResource, DiscoveryInfo, SourceError, WatchEvent, WatchStream};

type Subscriber = (GroupKind, mpsc::UnboundedSender<Result<WatchEvent, SourceError>>);

#[derive(Default)]
struct MemoryInner {
    server_version: String,
    resources: Vec<DiscoveredResource>,
    crds: Vec<Value>,
    objects: BTreeMap<ResourceKey, Value>,
    subscribers: Vec<Subscriber>,
    unreachable: bool,
    discovery_error: Option<String>,
    next_rv: u64,
    watches_opened: usize,
}

/// A scripted cluster: objects are pushed in by the test (or loaded from
/// files) and fanned out to every open watch of the matching kind.
#[derive(Clone, Default)]
pub struct MemorySource {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemorySource {
    pub fn new(server_version: &str) -> Self {
        let me = Self::default();
        me.lock().server_version = server_version.to_string();
        me
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn add_resource(&self, resource: DiscoveredResource) {
        let mut inner = self.lock();
        if !inner.resources.iter().any(|r| r.group_kind() == resource.group_kind()) {
            inner.resources.push(resource);
        }
    }

    pub fn add_crd(&self, crd: Value) { self.lock().crds.push(crd); }

    /// Common built-in kinds most tests need.
    pub fn with_builtin_kinds(self) -> Self {
        for r in [
            DiscoveredResource::new("", "v1", "Namespace", "namespaces", false),
            DiscoveredResource::new("", "v1", "ConfigMap", "configmaps", true),
            DiscoveredResource::new("", "v1", "Service", "services", true),
            DiscoveredResource::new("", "v1", "Pod", "pods", true),
            DiscoveredResource::new("apps", "v1", "Deployment", "deployments", true),
            DiscoveredResource::new("apps", "v1", "ReplicaSet", "replicasets", true),
            DiscoveredResource::new("apps", "v1", "StatefulSet", "statefulsets", true),
            DiscoveredResource::new("batch", "v1", "Job", "jobs", true),
        ] {
            self.add_resource(r);
        }
        self
    }

    pub fn set_unreachable(&self, unreachable: bool) { self.lock().unreachable = unreachable; }

    pub fn set_discovery_error(&self, err: Option<&str>) { self.lock().discovery_error = err.map(|s| s.to_string()); }

    pub fn watches_opened(&self) -> usize { self.lock().watches_opened }

    /// Upsert an object. A missing `metadata.resourceVersion` gets the next counter value.
    pub fn apply(&self, mut obj: Value) {
        let mut inner = self.lock();
        if obj.pointer("/metadata/resourceVersion").is_none() {
            inner.next_rv += 1;
            let rv = inner.next_rv.to_string();
            if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.insert("resourceVersion".into(), Value::String(rv));
            }
        }
        let Some(key) = ResourceKey::from_object(&obj) else { return };
        inner.objects.insert(key.clone(), obj.clone());
        Self::fan_out(&mut inner, &key.group_kind(), WatchEvent::Applied(obj));
    }

    pub fn delete(&self, key: &ResourceKey) {
        let mut inner = self.lock();
        if let Some(obj) = inner.objects.remove(key) {
            Self::fan_out(&mut inner, &key.group_kind(), WatchEvent::Deleted(obj));
        }
    }

    /// Deliver an event without touching stored state (replays, reordering).
    pub fn emit(&self, gk: &GroupKind, event: WatchEvent) {
        let mut inner = self.lock();
        Self::fan_out(&mut inner, gk, event);
    }

    /// Terminate every open watch with an error, as a dropped connection would.
    pub fn break_watches(&self, message: &str) {
        let mut inner = self.lock();
        for (_, tx) in inner.subscribers.drain(..) {
            let _ = tx.send(Err(SourceError::Watch(message.to_string())));
        }
    }

    pub fn objects(&self) -> Vec<Value> { self.lock().objects.values().cloned().collect() }

    fn fan_out(inner: &mut MemoryInner, gk: &GroupKind, event: WatchEvent) {
        inner.subscribers.retain(|(sub_gk, tx)| {
            if sub_gk != gk { return !tx.is_closed(); }
            tx.send(Ok(event.clone())).is_ok()
        });
    }
}

#[async_trait::async_trait]
impl ClusterSource for MemorySource {
    async fn server_version(&self) -> Result<String, SourceError> {
        let inner = self.lock();
        if inner.unreachable { return Err(SourceError::Connection("endpoint unreachable".into())); }
        Ok(inner.server_version.clone())
    }

    async fn discover(&self) -> Result<DiscoveryInfo, SourceError> {
        let inner = self.lock();
        if inner.unreachable { return Err(SourceError::Connection("endpoint unreachable".into())); }
        if let Some(e) = &inner.discovery_error { return Err(SourceError::Discovery(e.clone())); }
        Ok(DiscoveryInfo { server_version: inner.server_version.clone(), resources: inner.resources.clone(), crds: inner.crds.clone() })
    }

    fn watch(&self, resource: &DiscoveredResource) -> WatchStream {
        let gk = resource.group_kind();
        let mut inner = self.lock();
        if inner.unreachable {
            return futures::stream::once(async { Err(SourceError::Watch("endpoint unreachable".into())) }).boxed();
        }
        inner.watches_opened += 1;
        // Subscribe and snapshot under one lock so no event falls in between.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let list: Vec<Value> = inner.objects.iter().filter(|(k, _)| k.group_kind() == gk).map(|(_, v)| v.clone()).collect();
        let _ = tx.send(Ok(WatchEvent::Restarted(list)));
        inner.subscribers.push((gk, tx));
        futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()
    }
}

/// Resolves cluster ids to pre-registered `MemorySource`s.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    sources: Arc<Mutex<FxHashMap<ClusterId, MemorySource>>>,
}

impl MemoryConnector {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&self, cluster: ClusterId, source: MemorySource) {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner).insert(cluster, source);
    }
}

#[async_trait::async_trait]
impl ClusterConnector for MemoryConnector {
    async fn connect(&self, cluster: &ClusterId) -> Result<Arc<dyn ClusterSource>, SourceError> {
        let src = self.sources.lock().unwrap_or_else(PoisonError::into_inner).get(cluster).cloned();
        match src {
            Some(s) => Ok(Arc::new(s)),
            None => Err(SourceError::Connection(format!("unknown cluster {}", cluster))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(name: &str, rv: Option<&str>) -> Value {
        let mut v = serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": "default"}});
        if let Some(rv) = rv { v["metadata"]["resourceVersion"] = Value::String(rv.to_string()); }
        v
    }

    #[tokio::test]
    async fn watch_starts_with_full_list_then_streams() {
        let src = MemorySource::new("v1.29.0").with_builtin_kinds();
        src.apply(cm("a", None));
        let res = DiscoveredResource::new("", "v1", "ConfigMap", "configmaps", true);
        let mut stream = src.watch(&res);
        match stream.next().await {
            Some(Ok(WatchEvent::Restarted(list))) => assert_eq!(list.len(), 1),
            other => panic!("expected relist, got {:?}", other),
        }
        src.apply(cm("b", Some("77")));
        match stream.next().await {
            Some(Ok(WatchEvent::Applied(v))) => assert_eq!(v["metadata"]["resourceVersion"], "77"),
            other => panic!("expected applied, got {:?}", other),
        }
        src.break_watches("boom");
        assert!(matches!(stream.next().await, Some(Err(SourceError::Watch(_)))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn unreachable_source_fails_connection() {
        let src = MemorySource::new("v1.29.0");
        src.set_unreachable(true);
        assert!(matches!(src.discover().await, Err(SourceError::Connection(_))));
        src.set_unreachable(false);
        src.set_discovery_error(Some("aggregated api down"));
        assert!(matches!(src.discover().await, Err(SourceError::Discovery(_))));
    }

    #[tokio::test]
    async fn connector_rejects_unknown_cluster() {
        let conn = MemoryConnector::new();
        conn.insert(ClusterId::new("https://a"), MemorySource::new("v1"));
        assert!(conn.connect(&ClusterId::new("https://a")).await.is_ok());
        assert!(conn.connect(&ClusterId::new("https://b")).await.is_err());
    }
}
