#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ferry_core::config::CacheConfig;
use ferry_core::{ClusterId, FerryError, ManagedSelector, TrackingMethod};
use ferry_health::HealthRegistry;
use ferry_kubehub::{ClusterConnector, ClusterSource, MemoryConnector, MemorySource, SourceError};
use ferry_store::CacheRegistry;

/// Counts connects and slows them down so concurrent callers overlap.
struct CountingConnector {
    inner: MemoryConnector,
    connects: AtomicUsize,
}

#[async_trait::async_trait]
impl ClusterConnector for CountingConnector {
    async fn connect(&self, cluster: &ClusterId) -> Result<Arc<dyn ClusterSource>, SourceError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inner.connect(cluster).await
    }
}

fn cfg() -> CacheConfig {
    CacheConfig { queue_cap: 64, flush_ms: 2, backoff_base_ms: 5, backoff_max_secs: 1, stale_secs: 120, idle_secs: 1800 }
}

fn setup(cfg: CacheConfig) -> (Arc<CacheRegistry>, Arc<CountingConnector>, MemorySource, ClusterId) {
    let id = ClusterId::new("https://prod.example:6443");
    let src = MemorySource::new("v1.29.0").with_builtin_kinds();
    let inner = MemoryConnector::new();
    inner.insert(id.clone(), src.clone());
    let conn = Arc::new(CountingConnector { inner, connects: AtomicUsize::new(0) });
    let reg = Arc::new(CacheRegistry::new(conn.clone(), Arc::new(HealthRegistry::new()), cfg));
    (reg, conn, src, id)
}

#[tokio::test]
async fn concurrent_first_requests_share_one_cache() {
    let (reg, conn, src, id) = setup(cfg());
    let calls = (0..8).map(|_| {
        let reg = reg.clone();
        let id = id.clone();
        tokio::spawn(async move { reg.get_or_create(&id).await })
    });
    let caches: Vec<_> = futures::future::join_all(calls).await.into_iter().map(|r| r.unwrap().unwrap()).collect();

    assert_eq!(conn.connects.load(Ordering::SeqCst), 1);
    assert!(caches.iter().all(|c| Arc::ptr_eq(c, &caches[0])));
    assert_eq!(reg.len(), 1);
    caches[0].wait_synced(Duration::from_secs(2)).await.unwrap();
    assert_eq!(src.watches_opened(), caches[0].types().watchable().count());
}

#[tokio::test]
async fn remove_closes_cache_for_existing_holders() {
    let (reg, conn, _src, id) = setup(cfg());
    let held = reg.get_or_create(&id).await.unwrap();
    held.wait_synced(Duration::from_secs(2)).await.unwrap();

    assert!(reg.remove(&id));
    assert!(!reg.remove(&id));
    assert!(reg.get(&id).is_none());
    let sel = ManagedSelector::new(TrackingMethod::default(), "guestbook");
    assert!(matches!(held.get_managed_live_objs(&sel), Err(FerryError::CacheClosed { .. })));

    let fresh = reg.get_or_create(&id).await.unwrap();
    assert!(!Arc::ptr_eq(&held, &fresh));
    assert_eq!(conn.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_start_is_not_memoized() {
    let (reg, conn, src, id) = setup(cfg());
    src.set_unreachable(true);
    assert!(matches!(reg.get_or_create(&id).await, Err(FerryError::Connection { .. })));
    assert!(reg.is_empty());

    src.set_unreachable(false);
    src.set_discovery_error(Some("the server could not find the requested resource"));
    assert!(matches!(reg.get_or_create(&id).await, Err(FerryError::Discovery { .. })));
    assert!(reg.is_empty());

    src.set_discovery_error(None);
    assert!(reg.get_or_create(&id).await.is_ok());
    assert_eq!(conn.connects.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn unknown_cluster_is_a_connection_error() {
    let (reg, _conn, _src, _id) = setup(cfg());
    let err = reg.get_or_create(&ClusterId::new("https://nowhere")).await.unwrap_err();
    assert!(matches!(err, FerryError::Connection { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn idle_caches_are_evicted() {
    let (reg, _conn, _src, id) = setup(CacheConfig { idle_secs: 0, ..cfg() });
    let cache = reg.get_or_create(&id).await.unwrap();
    assert_eq!(reg.clusters(), vec![id.clone()]);
    assert_eq!(reg.evict_idle(), vec![id.clone()]);
    assert!(reg.is_empty());
    assert!(cache.is_closed());
}

#[tokio::test]
async fn invalidate_all_relists_every_cache() {
    let (reg, _conn, src, id) = setup(cfg());
    let cache = reg.get_or_create(&id).await.unwrap();
    cache.wait_synced(Duration::from_secs(2)).await.unwrap();
    let kinds = cache.types().watchable().count();
    reg.invalidate_all();
    for _ in 0..400 {
        if src.watches_opened() == kinds * 2 { return; }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("watches were not reopened");
}
