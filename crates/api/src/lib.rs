//! Ferry public API façade (in-process).
//!
//! This crate defines the stable trait and types frontends (CLI, services)
//! depend on. The in-process implementation drives the cache registry and
//! reconciliation engine directly.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ferry_core::{AppReconcileResult, Application, ClusterId, FerryError, LiveObject, ResourceKey};
use ferry_reconcile::{diff_results, ReconcileEngine, ReconcileRecord};
use ferry_schema::VersionsInfo;
use ferry_store::ClusterCache;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A served Kubernetes resource kind (incl. CRDs).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl From<ferry_kubehub::DiscoveredResource> for ResourceKind {
    fn from(v: ferry_kubehub::DiscoveredResource) -> Self {
        Self { group: v.group, version: v.version, kind: v.kind, namespaced: v.namespaced }
    }
}

/// Stats and runtime configuration exposed to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Stats {
    pub clusters: usize,
    pub reconcile_concurrency: usize,
    pub reconcile_timeout_secs: u64,
    pub compare_parallelism: usize,
    pub queue_cap: usize,
    pub stale_secs: u64,
    pub cache_idle_secs: u64,
    pub metrics_addr: Option<String>,
}

/// API errors suitable for transport over RPC later.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApiError {
    /// Cluster or cache not ready; try again.
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("cancelled")]
    Cancelled,
    #[error("internal: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool { matches!(self, ApiError::Unavailable(_)) }
}

impl From<FerryError> for ApiError {
    fn from(e: FerryError) -> Self {
        match e {
            FerryError::Connection { .. }
            | FerryError::Discovery { .. }
            | FerryError::IncompleteLiveData { .. }
            | FerryError::CacheClosed { .. } => ApiError::Unavailable(e.to_string()),
            FerryError::ManifestUnavailable { .. } => ApiError::NotFound(e.to_string()),
            FerryError::Cancelled => ApiError::Cancelled,
            FerryError::Comparison { .. } => ApiError::Internal(e.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Declarative Ferry API surface.
#[async_trait::async_trait]
pub trait FerryApi: Send + Sync {
    /// Kinds served by a cluster.
    async fn discover(&self, cluster: &ClusterId) -> ApiResult<Vec<ResourceKind>>;

    /// Server version and served api versions.
    async fn versions(&self, cluster: &ClusterId) -> ApiResult<VersionsInfo>;

    /// Live top-level objects the application tracks.
    async fn live(&self, app: &Application) -> ApiResult<Vec<LiveObject>>;

    /// Objects transitively owned by `root`.
    async fn resource_tree(&self, cluster: &ClusterId, root: &ResourceKey) -> ApiResult<Vec<LiveObject>>;

    /// Refresh one application's verdict.
    async fn reconcile(&self, app: &Application) -> ApiResult<AppReconcileResult>;

    /// Refresh many applications; one result per input, in order.
    async fn reconcile_all(&self, apps: &[Application]) -> Vec<ApiResult<AppReconcileResult>>;

    /// Normal-format report of how two saved result sets differ.
    fn diff_results(&self, before: &[ReconcileRecord], after: &[ReconcileRecord]) -> String {
        diff_results(before, after)
    }

    /// Force every cache to relist, e.g. after settings changed.
    async fn invalidate(&self) -> ApiResult<()>;

    /// Runtime stats and limits.
    async fn stats(&self) -> ApiResult<Stats>;
}

// ----------------- In-process implementation -----------------

/// In-process implementation that calls internal crates directly.
pub struct InProcApi {
    engine: Arc<ReconcileEngine>,
    sync_wait: Duration,
    cancel: CancellationToken,
}

impl InProcApi {
    pub fn new(engine: Arc<ReconcileEngine>) -> Self {
        Self { engine, sync_wait: Duration::from_secs(30), cancel: CancellationToken::new() }
    }

    /// How long calls wait for a cold cache to finish its first sync.
    pub fn with_sync_wait(mut self, wait: Duration) -> Self {
        self.sync_wait = wait;
        self
    }

    pub fn engine(&self) -> &Arc<ReconcileEngine> { &self.engine }

    /// Cancel in-flight passes and tear every cache down.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.engine.registry().close_all();
        info!("api: shutdown");
    }

    async fn synced(&self, cluster: &ClusterId) -> ApiResult<Arc<ClusterCache>> {
        let cache = self.engine.registry().get_or_create(cluster).await?;
        cache.wait_synced(self.sync_wait).await?;
        Ok(cache)
    }

    fn cluster_of(app: &Application) -> ApiResult<ClusterId> {
        app.cluster_id().ok_or_else(|| ApiError::Validation(format!("application {} has no destination cluster", app.name)))
    }

    /// Warm the destination cache so the engine does not race its first list.
    async fn warm(&self, app: &Application) {
        let Some(cluster) = app.cluster_id() else { return };
        if let Err(e) = self.synced(&cluster).await {
            debug!(app = %app.name, cluster = %cluster, error = %e, "api: cache not ready before reconcile");
        }
    }
}

#[async_trait::async_trait]
impl FerryApi for InProcApi {
    async fn discover(&self, cluster: &ClusterId) -> ApiResult<Vec<ResourceKind>> {
        let t0 = Instant::now();
        info!(cluster = %cluster, "api: discover start");
        let cache = self.engine.registry().get_or_create(cluster).await?;
        let kinds: Vec<ResourceKind> = cache.types().resources().iter().cloned().map(ResourceKind::from).collect();
        info!(count = kinds.len(), took_ms = %t0.elapsed().as_millis(), "api: discover ok");
        Ok(kinds)
    }

    async fn versions(&self, cluster: &ClusterId) -> ApiResult<VersionsInfo> {
        let cache = self.engine.registry().get_or_create(cluster).await?;
        let v = cache.versions_info();
        info!(cluster = %cluster, server = %v.server_version, api_versions = v.api_versions.len(), "api: versions ok");
        Ok(v)
    }

    async fn live(&self, app: &Application) -> ApiResult<Vec<LiveObject>> {
        let t0 = Instant::now();
        let cluster = Self::cluster_of(app)?;
        let cache = self.synced(&cluster).await?;
        let objs: Vec<LiveObject> = cache.get_managed_live_objs(&app.selector())?.into_values().collect();
        info!(app = %app.name, count = objs.len(), took_ms = %t0.elapsed().as_millis(), "api: live ok");
        Ok(objs)
    }

    async fn resource_tree(&self, cluster: &ClusterId, root: &ResourceKey) -> ApiResult<Vec<LiveObject>> {
        let cache = self.synced(cluster).await?;
        let tree = cache.resource_tree(root)?;
        info!(root = %root, count = tree.len(), "api: resource_tree ok");
        Ok(tree.iter().map(|o| o.as_ref().clone()).collect())
    }

    async fn reconcile(&self, app: &Application) -> ApiResult<AppReconcileResult> {
        let t0 = Instant::now();
        info!(app = %app.name, "api: reconcile start");
        self.warm(app).await;
        let res = self.engine.refresh(app, &self.cancel).await?;
        counter!("api_reconcile_calls", 1u64);
        info!(app = %app.name, sync = %res.sync.status, health = %res.health, took_ms = %t0.elapsed().as_millis(), "api: reconcile ok");
        Ok(res)
    }

    async fn reconcile_all(&self, apps: &[Application]) -> Vec<ApiResult<AppReconcileResult>> {
        let t0 = Instant::now();
        for app in apps {
            self.warm(app).await;
        }
        let out: Vec<ApiResult<AppReconcileResult>> =
            self.engine.reconcile_all(apps, &self.cancel).await.into_iter().map(|r| r.map_err(ApiError::from)).collect();
        let failed = out.iter().filter(|r| r.is_err()).count();
        info!(apps = apps.len(), failed, took_ms = %t0.elapsed().as_millis(), "api: reconcile_all done");
        out
    }

    async fn invalidate(&self) -> ApiResult<()> {
        self.engine.registry().invalidate_all();
        info!(clusters = self.engine.registry().len(), "api: caches invalidated");
        Ok(())
    }

    async fn stats(&self) -> ApiResult<Stats> {
        let reg = self.engine.registry();
        let (ec, cc) = (self.engine.config(), reg.config());
        Ok(Stats {
            clusters: reg.len(),
            reconcile_concurrency: ec.concurrency,
            reconcile_timeout_secs: ec.timeout_secs,
            compare_parallelism: ec.compare_parallelism,
            queue_cap: cc.queue_cap,
            stale_secs: cc.stale_secs,
            cache_idle_secs: cc.idle_secs,
            metrics_addr: std::env::var("FERRY_METRICS_ADDR").ok(),
        })
    }
}

// ----------------- Mock implementation -----------------

/// Simple in-memory mock implementation for tests.
#[derive(Default)]
pub struct MockApi {
    pub kinds: Vec<ResourceKind>,
    pub versions: VersionsInfo,
    pub live: HashMap<String, Vec<LiveObject>>,
    pub results: HashMap<String, AppReconcileResult>,
    pub stats: Stats,
}

impl MockApi { pub fn new() -> Self { Self::default() } }

#[async_trait::async_trait]
impl FerryApi for MockApi {
    async fn discover(&self, _cluster: &ClusterId) -> ApiResult<Vec<ResourceKind>> { Ok(self.kinds.clone()) }

    async fn versions(&self, _cluster: &ClusterId) -> ApiResult<VersionsInfo> { Ok(self.versions.clone()) }

    async fn live(&self, app: &Application) -> ApiResult<Vec<LiveObject>> {
        Ok(self.live.get(&app.name).cloned().unwrap_or_default())
    }

    async fn resource_tree(&self, _cluster: &ClusterId, _root: &ResourceKey) -> ApiResult<Vec<LiveObject>> { Ok(Vec::new()) }

    async fn reconcile(&self, app: &Application) -> ApiResult<AppReconcileResult> {
        self.results.get(&app.name).cloned().ok_or_else(|| ApiError::NotFound(format!("no result for {}", app.name)))
    }

    async fn reconcile_all(&self, apps: &[Application]) -> Vec<ApiResult<AppReconcileResult>> {
        let mut out = Vec::with_capacity(apps.len());
        for app in apps {
            out.push(self.reconcile(app).await);
        }
        out
    }

    async fn invalidate(&self) -> ApiResult<()> { Ok(()) }

    async fn stats(&self) -> ApiResult<Stats> { Ok(self.stats.clone()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::config::{CacheConfig, EngineConfig};
    use ferry_core::{AppCondition, ConditionType, Destination, HealthStatus, SyncStatusCode};
    use ferry_health::HealthRegistry;
    use ferry_kubehub::{MemoryConnector, MemorySource};
    use ferry_reconcile::{DirManifestGenerator, IgnoreRules};
    use ferry_store::CacheRegistry;
    use serde_json::json;

    const SERVER: &str = "https://mem.example";

    fn inproc(src: &MemorySource) -> InProcApi {
        let conn = MemoryConnector::new();
        conn.insert(ClusterId::new(SERVER), src.clone());
        let reg = Arc::new(CacheRegistry::new(Arc::new(conn), Arc::new(HealthRegistry::new()), CacheConfig::default()));
        let gen = Arc::new(DirManifestGenerator::new(std::env::temp_dir().join("ferry-api-none")));
        let engine = Arc::new(ReconcileEngine::new(reg, gen, IgnoreRules::default(), EngineConfig::default()));
        InProcApi::new(engine).with_sync_wait(Duration::from_secs(2))
    }

    fn app(name: &str) -> Application {
        Application {
            name: name.into(),
            destination: Destination { server: Some(SERVER.into()), namespace: Some("default".into()), name: None },
            ..Default::default()
        }
    }

    #[test]
    fn ferry_errors_map_to_transportable_kinds() {
        let e: ApiError = FerryError::IncompleteLiveData { cluster: ClusterId::new("c") }.into();
        assert!(e.is_retryable());
        let e: ApiError = FerryError::Cancelled.into();
        assert_eq!(e, ApiError::Cancelled);
        let json = serde_json::to_string(&ApiError::Validation("x".into())).unwrap();
        assert_eq!(serde_json::from_str::<ApiError>(&json).unwrap(), ApiError::Validation("x".into()));
    }

    #[tokio::test]
    async fn inproc_discovers_and_lists_managed_objects() {
        let src = MemorySource::new("v1.29.0").with_builtin_kinds();
        src.apply(json!({"apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "a", "namespace": "default", "labels": {"app.kubernetes.io/instance": "guestbook"}}}));
        let api = inproc(&src);
        let cluster = ClusterId::new(SERVER);

        let kinds = api.discover(&cluster).await.unwrap();
        assert!(kinds.iter().any(|k| k.kind == "Deployment" && k.group == "apps" && k.namespaced));
        assert_eq!(api.versions(&cluster).await.unwrap().server_version, "v1.29.0");

        let live = api.live(&app("guestbook")).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].key.name, "a");

        let mut homeless = app("guestbook");
        homeless.destination.server = None;
        assert!(matches!(api.live(&homeless).await, Err(ApiError::Validation(_))));
        assert_eq!(api.stats().await.unwrap().clusters, 1);
        api.shutdown();
    }

    #[tokio::test]
    async fn inproc_reconcile_without_manifests_is_unknown() {
        let src = MemorySource::new("v1.29.0").with_builtin_kinds();
        let api = inproc(&src);
        let r = api.reconcile(&app("guestbook")).await.unwrap();
        assert_eq!(r.sync.status, SyncStatusCode::Unknown);
        assert!(r.conditions.iter().any(|c| c.kind == ConditionType::ManifestUnavailable));
    }

    #[tokio::test]
    async fn mock_serves_canned_results() {
        let mut mock = MockApi::new();
        let a = app("guestbook");
        let mut r = AppReconcileResult::unknown(&a, AppCondition::new(ConditionType::Cancelled, "x"));
        r.health = HealthStatus::Healthy;
        mock.results.insert("guestbook".into(), r.clone());
        assert_eq!(mock.reconcile(&a).await.unwrap(), r);
        let all = mock.reconcile_all(&[a, app("other")]).await;
        assert!(all[0].is_ok());
        assert!(matches!(all[1], Err(ApiError::NotFound(_))));
        assert_eq!(mock.diff_results(&[], &[]), "");
    }
}
