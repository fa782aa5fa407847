use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use ferry_core::config::EngineConfig;
use ferry_core::prelude::*;
use ferry_health::aggregate_app_health;
use ferry_store::{CacheRegistry, ClusterCache, ClusterSnapshot};
use futures::StreamExt;
use metrics::{counter, histogram};
use rustc_hash::{FxHashMap, FxHasher};
use serde_json::Value;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::compare::{unknown_result, CompareContext};
use crate::ignore::IgnoreRules;
use crate::manifests::ManifestGenerator;
use crate::normalize;

struct Memo {
    cluster: ClusterId,
    generation: Uuid,
    compared_to: ComparedTo,
    epoch: u64,
    fingerprint: u64,
    result: AppReconcileResult,
}

/// What a memoized verdict was computed from.
#[derive(Clone, Copy)]
struct Stamp {
    generation: Uuid,
    epoch: u64,
    fingerprint: u64,
}

/// Computes one [`AppReconcileResult`] per application.
///
/// Passes for different applications run in parallel up to
/// `EngineConfig::concurrency`; further callers queue on a semaphore. Every
/// pass honours a cancellation token and the configured deadline, and either
/// yields a complete verdict or an `Unknown` one, never a partial one.
pub struct ReconcileEngine {
    registry: Arc<CacheRegistry>,
    manifests: Arc<dyn ManifestGenerator>,
    ignore: IgnoreRules,
    cfg: EngineConfig,
    permits: Semaphore,
    memo: Mutex<FxHashMap<String, Memo>>,
}

impl ReconcileEngine {
    /// `ignore` holds the global ignore rules from settings.
    pub fn new(registry: Arc<CacheRegistry>, manifests: Arc<dyn ManifestGenerator>, ignore: IgnoreRules, cfg: EngineConfig) -> Self {
        let permits = Semaphore::new(cfg.concurrency.max(1));
        Self { registry, manifests, ignore, cfg, permits, memo: Mutex::new(FxHashMap::default()) }
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> { &self.registry }

    pub fn config(&self) -> &EngineConfig { &self.cfg }

    /// Generate the application's manifests, then reconcile against them.
    pub async fn refresh(&self, app: &Application, cancel: &CancellationToken) -> FerryResult<AppReconcileResult> {
        let t0 = Instant::now();
        let Some(_permit) = self.admit(cancel).await else { return self.finish(app, t0, Err("cancelled while queued")) };
        let out = self
            .bounded(cancel, async {
                // A cache removed while manifests are generated fails this pass with CacheClosed.
                let pinned = match app.cluster_id() {
                    Some(cluster) => Some(self.live(&cluster).await.map(|(cache, _)| cache)),
                    None => None,
                };
                let manifests = match self.manifests.generate(app).await {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(app = %app.name, error = %e, "reconcile: manifests unavailable");
                        let err = FerryError::ManifestUnavailable { app: app.name.clone(), message: e.to_string() };
                        return Ok(AppReconcileResult::unknown(app, AppCondition::new(ConditionType::ManifestUnavailable, err.to_string())));
                    }
                };
                self.compute(app, manifests, pinned).await
            })
            .await;
        self.finish(app, t0, out)
    }

    /// Reconcile against manifests the caller already has.
    pub async fn reconcile(
        &self,
        app: &Application,
        manifests: Vec<DesiredManifest>,
        cancel: &CancellationToken,
    ) -> FerryResult<AppReconcileResult> {
        let t0 = Instant::now();
        let Some(_permit) = self.admit(cancel).await else { return self.finish(app, t0, Err("cancelled while queued")) };
        let out = self.bounded(cancel, self.compute(app, manifests, None)).await;
        self.finish(app, t0, out)
    }

    /// Refresh every application; results come back in input order.
    pub async fn reconcile_all(&self, apps: &[Application], cancel: &CancellationToken) -> Vec<FerryResult<AppReconcileResult>> {
        futures::future::join_all(apps.iter().map(|app| self.refresh(app, cancel))).await
    }

    /// Drop the memoized verdict for `app`.
    pub fn forget(&self, app: &str) {
        self.memo.lock().unwrap_or_else(PoisonError::into_inner).remove(app);
    }

    async fn admit(&self, cancel: &CancellationToken) -> Option<SemaphorePermit<'_>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            p = self.permits.acquire() => p.ok(),
        }
    }

    async fn bounded<F>(&self, cancel: &CancellationToken, fut: F) -> Result<F::Output, &'static str>
    where
        F: std::future::Future,
    {
        let limit = self.cfg.timeout();
        let run = async {
            if limit.is_zero() { Ok(fut.await) } else { tokio::time::timeout(limit, fut).await.map_err(|_| ()) }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err("cancelled"),
            out = run => out.map_err(|_| "deadline exceeded"),
        }
    }

    fn finish(&self, app: &Application, t0: Instant, out: Result<FerryResult<AppReconcileResult>, &'static str>) -> FerryResult<AppReconcileResult> {
        let res = match out {
            Ok(r) => r,
            Err(reason) => {
                warn!(app = %app.name, reason, "reconcile: stopped before a verdict");
                Ok(AppReconcileResult::unknown(app, AppCondition::new(ConditionType::Cancelled, reason)))
            }
        };
        let took_ms = t0.elapsed().as_secs_f64() * 1000.0;
        histogram!("reconcile_latency_ms", took_ms);
        match &res {
            Ok(r) => {
                counter!("reconcile_total", 1u64);
                info!(app = %r.name, sync = %r.sync.status, health = %r.health, resources = r.resources.len(), took_ms = took_ms as u64, "reconcile: done");
            }
            Err(e) => {
                counter!("reconcile_errors_total", 1u64);
                warn!(app = %app.name, error = %e, "reconcile: retry later");
            }
        }
        res
    }

    /// `pinned` is the cache resolved before manifest generation, if any.
    async fn compute(
        &self,
        app: &Application,
        manifests: Vec<DesiredManifest>,
        pinned: Option<FerryResult<Arc<ClusterCache>>>,
    ) -> FerryResult<AppReconcileResult> {
        let Some(cluster) = app.cluster_id() else {
            return Ok(AppReconcileResult::unknown(app, AppCondition::new(ConditionType::ClusterUnavailable, "application has no destination cluster")));
        };
        let live = match pinned {
            Some(Ok(cache)) => cache.live_snapshot().map(|snap| (cache, snap)),
            Some(Err(e)) => Err(e),
            None => self.live(&cluster).await,
        };
        let (cache, snap) = match live {
            Ok(v) => v,
            Err(e @ (FerryError::Connection { .. } | FerryError::Discovery { .. })) => {
                warn!(app = %app.name, cluster = %cluster, error = %e, "reconcile: cluster unavailable");
                return Ok(AppReconcileResult::unknown(app, AppCondition::new(ConditionType::ClusterUnavailable, e.to_string())));
            }
            Err(e) => return Err(e),
        };

        let fingerprint = fingerprint(app, &manifests);
        let stamp = Stamp { generation: cache.generation(), epoch: snap.epoch, fingerprint };
        if let Some(hit) = self.memo_hit(app, &cluster, &stamp) {
            debug!(app = %app.name, epoch = snap.epoch, "reconcile: memo hit");
            return Ok(hit);
        }

        let types = Arc::clone(cache.types());
        let (app_rules, bad_rules) = IgnoreRules::compile_lenient(&app.ignore_differences);
        let mut conditions: Vec<AppCondition> = bad_rules
            .into_iter()
            .map(|e| AppCondition::new(ConditionType::ComparisonError, format!("ignoreDifferences: {}", e)))
            .collect();

        let dest_ns = app.destination.namespace.as_deref().filter(|s| !s.is_empty());
        let mut desired: BTreeMap<ResourceKey, Value> = BTreeMap::new();
        for (i, m) in manifests.into_iter().enumerate() {
            let mut raw = m.raw;
            let gk = GroupKind::from_api_version(
                raw.get("apiVersion").and_then(Value::as_str).unwrap_or(""),
                raw.get("kind").and_then(Value::as_str).unwrap_or(""),
            );
            normalize::default_namespace(&mut raw, types.scope(&gk), dest_ns);
            match ResourceKey::from_object(&raw) {
                Some(key) => {
                    if desired.insert(key.clone(), raw).is_some() {
                        conditions.push(AppCondition::new(
                            ConditionType::ComparisonError,
                            format!("{} is defined more than once; the last definition is compared", key),
                        ));
                    }
                }
                None => conditions.push(AppCondition::new(
                    ConditionType::ComparisonError,
                    format!("manifest #{} has no kind or metadata.name", i + 1),
                )),
            }
        }

        let mut live = snap.managed(&app.selector());
        let keys: BTreeSet<ResourceKey> = desired.keys().chain(live.keys()).cloned().collect();
        let jobs: Vec<_> = keys
            .into_iter()
            .map(|k| {
                let d = desired.remove(&k);
                let l = live.remove(&k);
                (k, d, l)
            })
            .collect();

        let ctx = Arc::new(CompareContext::new(types, Arc::clone(self.registry.health()), self.ignore.merged(&app_rules)));
        let resources: Vec<ResourceDiffResult> = futures::stream::iter(jobs)
            .map(|(key, d, l)| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let fallback = key.clone();
                    tokio::task::spawn_blocking(move || ctx.compare(key, d, l))
                        .await
                        .unwrap_or_else(|e| unknown_result(fallback, format!("comparison task failed: {}", e), None))
                }
            })
            .buffered(self.cfg.compare_parallelism.max(1))
            .collect()
            .await;

        if cache.is_closed() {
            debug!(app = %app.name, cluster = %cluster, "reconcile: cache removed during comparison");
            return Err(FerryError::CacheClosed { cluster });
        }

        for r in resources.iter().filter(|r| r.kind == DiffKind::Unknown) {
            let message = r.message.clone().unwrap_or_else(|| format!("cannot compare {}", r.key));
            conditions.push(AppCondition::new(ConditionType::ComparisonError, message));
        }

        let result = AppReconcileResult {
            name: app.name.clone(),
            health: app_health(&resources),
            sync: SyncStatus {
                status: aggregate_sync(&resources),
                compared_to: app.compared_to(),
                revision: app.source.target_revision.clone(),
            },
            resources,
            conditions,
            observed_at: Utc::now(),
        };
        self.remember(app, cluster, stamp, &result);
        Ok(result)
    }

    /// Running cache and a readable snapshot. A cache torn down between the
    /// two steps is re-fetched once.
    async fn live(&self, cluster: &ClusterId) -> FerryResult<(Arc<ClusterCache>, Arc<ClusterSnapshot>)> {
        for attempt in 0..2 {
            let res = match self.registry.get_or_create(cluster).await {
                Ok(cache) => cache.live_snapshot().map(|snap| (cache, snap)),
                Err(e) => Err(e),
            };
            match res {
                Err(FerryError::CacheClosed { .. }) if attempt == 0 => {
                    debug!(cluster = %cluster, "reconcile: cache closed mid-use, re-fetching");
                }
                other => return other,
            }
        }
        Err(FerryError::CacheClosed { cluster: cluster.clone() })
    }

    fn memo_hit(&self, app: &Application, cluster: &ClusterId, stamp: &Stamp) -> Option<AppReconcileResult> {
        let memo = self.memo.lock().unwrap_or_else(PoisonError::into_inner);
        let m = memo.get(&app.name)?;
        let fresh = &m.cluster == cluster
            && m.generation == stamp.generation
            && m.epoch == stamp.epoch
            && m.fingerprint == stamp.fingerprint
            && m.compared_to == app.compared_to();
        fresh.then(|| m.result.clone())
    }

    fn remember(&self, app: &Application, cluster: ClusterId, stamp: Stamp, result: &AppReconcileResult) {
        let Stamp { generation, epoch, fingerprint } = stamp;
        let entry = Memo { cluster, generation, compared_to: app.compared_to(), epoch, fingerprint, result: result.clone() };
        self.memo.lock().unwrap_or_else(PoisonError::into_inner).insert(app.name.clone(), entry);
    }
}

/// `OutOfSync` if anything is Modified, Missing or tracked live-only;
/// otherwise `Unknown` if any comparison failed; otherwise `Synced`.
/// Orphans and hooks never count. An empty set is `Synced`.
pub fn aggregate_sync(resources: &[ResourceDiffResult]) -> SyncStatusCode {
    let mut unknown = false;
    for r in resources {
        match r.kind {
            DiffKind::Modified | DiffKind::Missing | DiffKind::Added => return SyncStatusCode::OutOfSync,
            DiffKind::Unknown => unknown = true,
            DiffKind::InSync | DiffKind::OrphanIgnored => {}
        }
    }
    if unknown { SyncStatusCode::Unknown } else { SyncStatusCode::Synced }
}

fn app_health(resources: &[ResourceDiffResult]) -> HealthStatus {
    aggregate_app_health(
        resources
            .iter()
            .filter(|r| r.kind != DiffKind::OrphanIgnored)
            .map(|r| r.health.as_ref().map(|h| h.status).unwrap_or(HealthStatus::Unknown)),
    )
}

/// Whether `previous` can no longer stand for `app`: it was computed
/// against another source or destination, or it carried no verdict.
pub fn needs_refresh(previous: &AppReconcileResult, app: &Application) -> bool {
    previous.sync.compared_to != app.compared_to() || previous.sync.status == SyncStatusCode::Unknown
}

fn fingerprint(app: &Application, manifests: &[DesiredManifest]) -> u64 {
    let mut h = FxHasher::default();
    app.tracking.hash(&mut h);
    app.ignore_differences.hash(&mut h);
    app.destination.hash(&mut h);
    for m in manifests {
        m.raw.to_string().hash(&mut h);
    }
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::AppSource;

    fn res(kind: DiffKind, health: HealthStatus) -> ResourceDiffResult {
        ResourceDiffResult {
            key: ResourceKey::new("", "ConfigMap", "default", "x"),
            kind,
            desired: None,
            live: None,
            diffs: Vec::new(),
            summary: DiffSummary::default(),
            health: Some(ResourceHealth::new(health)),
            message: None,
        }
    }

    #[test]
    fn sync_precedence() {
        use DiffKind::*;
        assert_eq!(aggregate_sync(&[]), SyncStatusCode::Synced);
        assert_eq!(aggregate_sync(&[res(InSync, HealthStatus::Healthy), res(OrphanIgnored, HealthStatus::Healthy)]), SyncStatusCode::Synced);
        assert_eq!(aggregate_sync(&[res(InSync, HealthStatus::Healthy), res(Unknown, HealthStatus::Healthy)]), SyncStatusCode::Unknown);
        assert_eq!(aggregate_sync(&[res(Unknown, HealthStatus::Healthy), res(Missing, HealthStatus::Missing)]), SyncStatusCode::OutOfSync);
        assert_eq!(aggregate_sync(&[res(Added, HealthStatus::Healthy)]), SyncStatusCode::OutOfSync);
    }

    #[test]
    fn orphans_do_not_affect_health() {
        let set = [res(DiffKind::InSync, HealthStatus::Healthy), res(DiffKind::OrphanIgnored, HealthStatus::Degraded)];
        assert_eq!(app_health(&set), HealthStatus::Healthy);
        let set = [res(DiffKind::InSync, HealthStatus::Healthy), res(DiffKind::Modified, HealthStatus::Degraded)];
        assert_eq!(app_health(&set), HealthStatus::Degraded);
        assert_eq!(app_health(&[]), HealthStatus::Healthy);
    }

    #[test]
    fn stale_compared_to_needs_refresh() {
        let mut app = Application { name: "guestbook".into(), ..Default::default() };
        app.source = AppSource { repo_url: "https://git.example/repo".into(), target_revision: Some("v1".into()), ..Default::default() };
        let mut prev = AppReconcileResult::unknown(&app, AppCondition::new(ConditionType::Cancelled, "x"));
        assert!(needs_refresh(&prev, &app));
        prev.sync.status = SyncStatusCode::Synced;
        assert!(!needs_refresh(&prev, &app));
        app.source.target_revision = Some("v2".into());
        assert!(needs_refresh(&prev, &app));
    }

    #[test]
    fn memo_is_scoped_to_cache_generation() {
        let registry = Arc::new(CacheRegistry::new(
            Arc::new(ferry_kubehub::MemoryConnector::new()),
            Arc::new(ferry_health::HealthRegistry::new()),
            ferry_core::config::CacheConfig::default(),
        ));
        let manifests = Arc::new(crate::manifests::DirManifestGenerator::new("."));
        let engine = ReconcileEngine::new(registry, manifests, IgnoreRules::default(), EngineConfig::default());
        let app = Application { name: "guestbook".into(), ..Default::default() };
        let cluster = ClusterId::new("https://kubernetes.default.svc");
        let result = AppReconcileResult::unknown(&app, AppCondition::new(ConditionType::Cancelled, "x"));

        let first = Stamp { generation: Uuid::new_v4(), epoch: 4, fingerprint: 11 };
        engine.remember(&app, cluster.clone(), first, &result);
        assert!(engine.memo_hit(&app, &cluster, &first).is_some());

        let recreated = Stamp { generation: Uuid::new_v4(), ..first };
        assert!(engine.memo_hit(&app, &cluster, &recreated).is_none());
        assert!(engine.memo_hit(&app, &cluster, &Stamp { epoch: 5, ..first }).is_none());
        engine.forget("guestbook");
        assert!(engine.memo_hit(&app, &cluster, &first).is_none());
    }

    #[test]
    fn fingerprint_tracks_manifest_content() {
        let app = Application { name: "a".into(), ..Default::default() };
        let m1 = vec![DesiredManifest::new(serde_json::json!({"kind": "ConfigMap", "data": {"a": "1"}}))];
        let m2 = vec![DesiredManifest::new(serde_json::json!({"kind": "ConfigMap", "data": {"a": "2"}}))];
        assert_eq!(fingerprint(&app, &m1), fingerprint(&app, &m1.clone()));
        assert_ne!(fingerprint(&app, &m1), fingerprint(&app, &m2));
    }
}
