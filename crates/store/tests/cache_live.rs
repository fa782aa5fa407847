#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use ferry_core::config::CacheConfig;
use ferry_core::{ClusterId, FerryError, GroupKind, ManagedSelector, ResourceKey, TrackingMethod};
use ferry_health::HealthRegistry;
use ferry_kubehub::{ClusterSource, DiscoveredResource, DiscoveryInfo, MemorySource, SourceError, WatchEvent, WatchStream};
use ferry_schema::KindScope;
use ferry_store::{CacheState, ClusterCache};
use futures::StreamExt;
use serde_json::{json, Value};

fn cfg() -> CacheConfig {
    CacheConfig { queue_cap: 64, flush_ms: 2, backoff_base_ms: 5, backoff_max_secs: 1, stale_secs: 120, idle_secs: 1800 }
}

fn cm(name: &str, rv: Option<&str>, app: &str, data: &str) -> Value {
    let mut v = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name, "namespace": "default", "labels": {"app.kubernetes.io/instance": app}},
        "data": {"v": data}
    });
    if let Some(rv) = rv { v["metadata"]["resourceVersion"] = Value::String(rv.to_string()); }
    v
}

fn selector(app: &str) -> ManagedSelector { ManagedSelector::new(TrackingMethod::default(), app) }

fn key(name: &str) -> ResourceKey { ResourceKey::new("", "ConfigMap", "default", name) }

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() { return; }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached: {}", what);
}

async fn start(src: &MemorySource, cfg: CacheConfig) -> Arc<ClusterCache> {
    let cache = ClusterCache::start(ClusterId::new("https://mem"), Arc::new(src.clone()), Arc::new(HealthRegistry::new()), cfg)
        .await
        .expect("start");
    cache.wait_synced(Duration::from_secs(2)).await.expect("synced");
    cache
}

#[tokio::test]
async fn initial_list_then_live_updates() {
    let src = MemorySource::new("v1.29.0").with_builtin_kinds();
    src.apply(cm("a", None, "guestbook", "1"));
    src.apply(cm("b", None, "other", "1"));
    let cache = start(&src, cfg()).await;
    assert_eq!(cache.state(), CacheState::Synced);

    let managed = cache.get_managed_live_objs(&selector("guestbook")).unwrap();
    assert_eq!(managed.keys().cloned().collect::<Vec<_>>(), vec![key("a")]);

    src.apply(cm("c", None, "guestbook", "1"));
    eventually("c visible", || cache.get_managed_live_objs(&selector("guestbook")).unwrap().len() == 2).await;
    src.delete(&key("a"));
    eventually("a gone", || !cache.get_managed_live_objs(&selector("guestbook")).unwrap().contains_key(&key("a"))).await;
}

#[tokio::test]
async fn out_of_order_and_duplicate_events_are_ignored() {
    let src = MemorySource::new("v1.29.0").with_builtin_kinds();
    src.apply(cm("a", Some("10"), "guestbook", "current"));
    let cache = start(&src, cfg()).await;
    let gk = GroupKind::new("", "ConfigMap");

    src.emit(&gk, WatchEvent::Applied(cm("a", Some("5"), "guestbook", "older")));
    src.emit(&gk, WatchEvent::Applied(cm("a", Some("10"), "guestbook", "duplicate")));
    src.apply(cm("marker", Some("11"), "guestbook", "x"));
    eventually("marker visible", || cache.snapshot().get(&key("marker")).is_some()).await;

    let snap = cache.snapshot();
    assert_eq!(snap.get(&key("a")).unwrap().raw["data"]["v"], "current");
}

#[tokio::test]
async fn reconnect_relists_and_purges_ghosts() {
    let src = MemorySource::new("v1.29.0").with_builtin_kinds();
    src.apply(cm("a", None, "guestbook", "1"));
    src.apply(cm("b", None, "guestbook", "1"));
    let cache = start(&src, cfg()).await;

    src.set_unreachable(true);
    src.break_watches("connection reset by peer");
    eventually("degraded", || cache.state() == CacheState::Degraded).await;

    // Deleted while nobody was watching: only a relist can notice.
    src.delete(&key("b"));
    let during = cache.get_managed_live_objs(&selector("guestbook")).unwrap();
    assert!(during.contains_key(&key("b")), "degraded cache serves its last snapshot");

    src.set_unreachable(false);
    eventually("resynced", || cache.state() == CacheState::Synced).await;
    eventually("ghost purged", || cache.snapshot().get(&key("b")).is_none()).await;
    assert!(cache.snapshot().get(&key("a")).is_some());
}

#[tokio::test]
async fn stale_cache_refuses_reads() {
    let src = MemorySource::new("v1.29.0").with_builtin_kinds();
    let cache = start(&src, CacheConfig { stale_secs: 0, ..cfg() }).await;
    src.set_unreachable(true);
    src.break_watches("gone");
    eventually("stale", || cache.state() == CacheState::Stale).await;
    assert!(matches!(cache.get_managed_live_objs(&selector("x")), Err(FerryError::Connection { .. })));
    assert!(matches!(cache.wait_synced(Duration::from_millis(20)).await, Err(FerryError::Connection { .. })));
}

#[tokio::test]
async fn invalidate_forces_relist() {
    let src = MemorySource::new("v1.29.0").with_builtin_kinds();
    let cache = start(&src, cfg()).await;
    let kinds = cache.types().watchable().count();
    eventually("watches open", || src.watches_opened() == kinds).await;
    cache.invalidate();
    eventually("watches reopened", || src.watches_opened() == kinds * 2).await;
    eventually("synced again", || cache.state() == CacheState::Synced).await;
}

#[tokio::test]
async fn closed_cache_fails_reads() {
    let src = MemorySource::new("v1.29.0").with_builtin_kinds();
    let cache = start(&src, cfg()).await;
    cache.close();
    assert_eq!(cache.state(), CacheState::Closed);
    assert!(matches!(cache.get_managed_live_objs(&selector("x")), Err(FerryError::CacheClosed { .. })));
    assert!(matches!(cache.wait_synced(Duration::from_millis(20)).await, Err(FerryError::CacheClosed { .. })));
}

#[tokio::test]
async fn start_surfaces_connection_and_discovery_errors() {
    let src = MemorySource::new("v1.29.0").with_builtin_kinds();
    src.set_unreachable(true);
    let err = ClusterCache::start(ClusterId::new("c"), Arc::new(src.clone()), Arc::new(HealthRegistry::new()), cfg()).await.unwrap_err();
    assert!(matches!(err, FerryError::Connection { .. }));

    src.set_unreachable(false);
    src.set_discovery_error(Some("metrics.k8s.io/v1beta1: service unavailable"));
    let err = ClusterCache::start(ClusterId::new("c"), Arc::new(src.clone()), Arc::new(HealthRegistry::new()), cfg()).await.unwrap_err();
    assert!(matches!(err, FerryError::Discovery { .. }));
}

#[tokio::test]
async fn scope_and_versions_come_from_discovery() {
    let src = MemorySource::new("v1.29.0").with_builtin_kinds();
    let cache = start(&src, cfg()).await;
    assert_eq!(cache.is_namespaced(&GroupKind::new("", "Namespace")), KindScope::Cluster);
    assert_eq!(cache.is_namespaced(&GroupKind::new("apps", "Deployment")), KindScope::Namespaced);
    assert_eq!(cache.is_namespaced(&GroupKind::new("example.io", "Widget")), KindScope::Unknown);
    let info = cache.versions_info();
    assert_eq!(info.server_version, "v1.29.0");
    assert!(info.api_versions.contains(&"apps/v1".to_string()));
}

#[tokio::test]
async fn resource_tree_follows_owners_and_tolerates_cycles() {
    let src = MemorySource::new("v1.29.0").with_builtin_kinds();
    src.apply(json!({"apiVersion": "apps/v1", "kind": "Deployment",
        "metadata": {"name": "web", "namespace": "default", "labels": {"app.kubernetes.io/instance": "guestbook"}}}));
    src.apply(json!({"apiVersion": "apps/v1", "kind": "ReplicaSet",
        "metadata": {"name": "web-1", "namespace": "default", "labels": {"app.kubernetes.io/instance": "guestbook"},
            "ownerReferences": [{"apiVersion": "apps/v1", "kind": "Deployment", "name": "web", "controller": true}]}}));
    src.apply(json!({"apiVersion": "v1", "kind": "Pod",
        "metadata": {"name": "web-1-x", "namespace": "default",
            "ownerReferences": [{"apiVersion": "apps/v1", "kind": "ReplicaSet", "name": "web-1", "controller": true}]},
        "spec": {}, "status": {"phase": "Running", "containerStatuses": [{"name": "c", "ready": true}]}}));
    src.apply(json!({"apiVersion": "v1", "kind": "ConfigMap",
        "metadata": {"name": "x", "namespace": "default", "ownerReferences": [{"apiVersion": "v1", "kind": "ConfigMap", "name": "y"}]}}));
    src.apply(json!({"apiVersion": "v1", "kind": "ConfigMap",
        "metadata": {"name": "y", "namespace": "default", "ownerReferences": [{"apiVersion": "v1", "kind": "ConfigMap", "name": "x"}]}}));
    let cache = start(&src, cfg()).await;

    let deploy = ResourceKey::new("apps", "Deployment", "default", "web");
    let tree: Vec<ResourceKey> = cache.resource_tree(&deploy).unwrap().iter().map(|o| o.key.clone()).collect();
    assert_eq!(tree, vec![
        ResourceKey::new("apps", "ReplicaSet", "default", "web-1"),
        ResourceKey::new("", "Pod", "default", "web-1-x"),
    ]);
    let cycle = cache.resource_tree(&key("x")).unwrap();
    assert_eq!(cycle.len(), 1);

    let managed = cache.get_managed_live_objs(&selector("guestbook")).unwrap();
    assert_eq!(managed.keys().cloned().collect::<Vec<_>>(), vec![deploy]);
    let pod = cache.snapshot().get(&ResourceKey::new("", "Pod", "default", "web-1-x")).unwrap().health.clone();
    assert_eq!(pod.map(|h| h.status), Some(ferry_core::HealthStatus::Healthy));
}

/// Discovers kinds but never completes a list.
struct NeverListing(MemorySource);

#[async_trait::async_trait]
impl ClusterSource for NeverListing {
    async fn server_version(&self) -> Result<String, SourceError> { self.0.server_version().await }
    async fn discover(&self) -> Result<DiscoveryInfo, SourceError> { self.0.discover().await }
    fn watch(&self, _resource: &DiscoveredResource) -> WatchStream { futures::stream::pending().boxed() }
}

#[tokio::test]
async fn connecting_cache_reports_incomplete_live_data() {
    let src = NeverListing(MemorySource::new("v1.29.0").with_builtin_kinds());
    let cache = ClusterCache::start(ClusterId::new("slow"), Arc::new(src), Arc::new(HealthRegistry::new()), cfg()).await.unwrap();
    assert_eq!(cache.state(), CacheState::Connecting);
    assert!(matches!(cache.get_managed_live_objs(&selector("x")), Err(FerryError::IncompleteLiveData { .. })));
    assert!(matches!(cache.wait_synced(Duration::from_millis(30)).await, Err(FerryError::IncompleteLiveData { .. })));
}
