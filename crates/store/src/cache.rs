//! One cluster's live-state cache: discovery, supervised per-kind watches,
//! and a single ingest task that owns the cluster state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use ferry_core::config::CacheConfig;
use ferry_core::{ClusterId, Delta, DeltaKind, FerryError, FerryResult, GroupKind, LiveObject, ManagedSelector, ResourceKey};
use ferry_health::HealthRegistry;
use ferry_kubehub::{ClusterSource, DiscoveredResource, SourceError, WatchEvent};
use ferry_schema::{KindScope, ResourceTypes, VersionsInfo};
use futures::StreamExt;
use metrics::counter;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::coalesce::Coalescer;
use crate::state::{ApplyStats, ClusterSnapshot, ClusterState};

/// Cache lifecycle. `Degraded` serves the last snapshot while some watches
/// reconnect; past the stale window it becomes `Stale` and reads fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheState {
    Connecting,
    Synced,
    Degraded,
    Stale,
    Closed,
}

pub(crate) fn source_error(cluster: &ClusterId, e: SourceError) -> FerryError {
    match e {
        SourceError::Discovery(message) => FerryError::Discovery { cluster: cluster.clone(), message },
        SourceError::Connection(message) | SourceError::Watch(message) => {
            FerryError::Connection { cluster: cluster.clone(), message }
        }
    }
}

enum Ingest {
    Delta(Delta),
    /// Full list of one kind; acts as a barrier for pending deltas.
    Relist { gk: GroupKind, items: Vec<Value> },
    KindDown { gk: GroupKind },
}

pub struct ClusterCache {
    id: ClusterId,
    /// Distinguishes this cache from earlier ones for the same cluster; epochs restart per cache.
    generation: Uuid,
    types: Arc<ResourceTypes>,
    snap: Arc<ArcSwap<ClusterSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
    state_rx: watch::Receiver<CacheState>,
    resync_tx: watch::Sender<u64>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    born: Instant,
    last_access_ms: AtomicU64,
}

impl ClusterCache {
    /// Discover kinds and start one watch per watchable kind. Returns once the
    /// watches are running; population continues in the background
    /// (see [`ClusterCache::wait_synced`]).
    pub async fn start(
        id: ClusterId,
        source: Arc<dyn ClusterSource>,
        health: Arc<HealthRegistry>,
        cfg: CacheConfig,
    ) -> FerryResult<Arc<Self>> {
        let info = source.discover().await.map_err(|e| source_error(&id, e))?;
        let types = Arc::new(ResourceTypes::from_discovery(&info));
        let watched: Vec<DiscoveredResource> = types.watchable().cloned().collect();
        info!(cluster = %id, version = %info.server_version, kinds = watched.len(), "cache: discovery ok");
        counter!("cache_starts", 1u64);

        let (tx, rx) = mpsc::channel::<Ingest>(cfg.queue_cap);
        let snap = Arc::new(ArcSwap::from_pointee(ClusterSnapshot::default()));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let life = Lifecycle::new(watched.iter().map(|r| r.group_kind()), cfg.stale_after());
        let (state_tx, state_rx) = watch::channel(life.state(Instant::now()));
        let (resync_tx, _) = watch::channel(0u64);
        let shutdown = CancellationToken::new();

        let ingest = IngestLoop {
            cluster: id.clone(),
            state: ClusterState::new(Arc::clone(&types), health),
            coalescer: Coalescer::with_capacity(cfg.queue_cap),
            snap: Arc::clone(&snap),
            epoch_tx,
            state_tx,
            life,
        };
        tokio::spawn(ingest.run(rx, cfg.flush_interval(), shutdown.clone()));

        for resource in watched {
            let sup = WatchSupervisor {
                cluster: id.clone(),
                source: Arc::clone(&source),
                resource,
                tx: tx.clone(),
                backoff: Backoff::new(cfg.backoff_base(), cfg.backoff_max()),
            };
            tokio::spawn(sup.run(resync_tx.subscribe(), shutdown.clone()));
        }

        Ok(Arc::new(Self {
            id,
            generation: Uuid::new_v4(),
            types,
            snap,
            epoch_rx,
            state_rx,
            resync_tx,
            shutdown,
            closed: AtomicBool::new(false),
            born: Instant::now(),
            last_access_ms: AtomicU64::new(0),
        }))
    }

    pub fn id(&self) -> &ClusterId { &self.id }

    pub fn generation(&self) -> Uuid { self.generation }

    pub fn state(&self) -> CacheState {
        if self.closed.load(Ordering::Acquire) { CacheState::Closed } else { *self.state_rx.borrow() }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CacheState> { self.state_rx.clone() }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// Latest published snapshot, regardless of lifecycle state.
    pub fn snapshot(&self) -> Arc<ClusterSnapshot> { self.snap.load_full() }

    /// Snapshot for consumers that must not act on incomplete or stale data.
    pub fn live_snapshot(&self) -> FerryResult<Arc<ClusterSnapshot>> {
        self.readable()?;
        Ok(self.snapshot())
    }

    /// Top-level objects the selector claims. Reads only the in-memory mirror.
    pub fn get_managed_live_objs(&self, selector: &ManagedSelector) -> FerryResult<BTreeMap<ResourceKey, LiveObject>> {
        Ok(self.live_snapshot()?.managed(selector))
    }

    /// Descendants of `root` through owner references.
    pub fn resource_tree(&self, root: &ResourceKey) -> FerryResult<Vec<Arc<LiveObject>>> {
        Ok(self.live_snapshot()?.descendants(root))
    }

    pub fn is_namespaced(&self, gk: &GroupKind) -> KindScope { self.types.scope(gk) }

    pub fn types(&self) -> &Arc<ResourceTypes> { &self.types }

    pub fn versions_info(&self) -> VersionsInfo { self.types.versions_info() }

    /// Drop every watch and relist from scratch.
    pub fn invalidate(&self) {
        info!(cluster = %self.id, "cache: invalidated; relisting all kinds");
        self.resync_tx.send_modify(|g| *g = g.wrapping_add(1));
    }

    /// Wait until the first full sync completed (or the cache is serving a
    /// degraded snapshot). Times out with `IncompleteLiveData`.
    pub async fn wait_synced(&self, deadline: Duration) -> FerryResult<()> {
        let mut rx = self.state_rx.clone();
        let wait = async {
            loop {
                if self.closed.load(Ordering::Acquire) {
                    return Err(FerryError::CacheClosed { cluster: self.id.clone() });
                }
                let current = *rx.borrow_and_update();
                match current {
                    CacheState::Synced | CacheState::Degraded => return Ok(()),
                    CacheState::Connecting => {}
                    CacheState::Stale => return Err(self.stale_error()),
                    CacheState::Closed => return Err(FerryError::CacheClosed { cluster: self.id.clone() }),
                }
                if rx.changed().await.is_err() {
                    return Err(FerryError::CacheClosed { cluster: self.id.clone() });
                }
            }
        };
        tokio::time::timeout(deadline, wait)
            .await
            .unwrap_or_else(|_| Err(FerryError::IncompleteLiveData { cluster: self.id.clone() }))
    }

    /// Stop watches and ingest. Reads fail with `CacheClosed` from here on.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.cancel();
            info!(cluster = %self.id, "cache: closed");
        }
    }

    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    /// Time since the last read.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_access_ms.load(Ordering::Relaxed));
        self.born.elapsed().saturating_sub(last)
    }

    pub(crate) fn touch(&self) {
        let now = u64::try_from(self.born.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_access_ms.store(now, Ordering::Relaxed);
    }

    fn stale_error(&self) -> FerryError {
        FerryError::Connection { cluster: self.id.clone(), message: "watches down beyond the stale window".into() }
    }

    fn readable(&self) -> FerryResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FerryError::CacheClosed { cluster: self.id.clone() });
        }
        self.touch();
        let current = *self.state_rx.borrow();
        match current {
            CacheState::Synced | CacheState::Degraded => Ok(()),
            CacheState::Connecting => Err(FerryError::IncompleteLiveData { cluster: self.id.clone() }),
            CacheState::Stale => Err(self.stale_error()),
            CacheState::Closed => Err(FerryError::CacheClosed { cluster: self.id.clone() }),
        }
    }
}

impl Drop for ClusterCache {
    fn drop(&mut self) { self.shutdown.cancel(); }
}

impl std::fmt::Debug for ClusterCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCache").field("id", &self.id).field("state", &self.state()).finish()
    }
}

/// Tracks which watched kinds currently hold a complete list.
struct Lifecycle {
    expected: FxHashSet<GroupKind>,
    live: FxHashSet<GroupKind>,
    synced_once: bool,
    down_since: Option<Instant>,
    stale_after: Duration,
}

impl Lifecycle {
    fn new(expected: impl IntoIterator<Item = GroupKind>, stale_after: Duration) -> Self {
        let expected: FxHashSet<GroupKind> = expected.into_iter().collect();
        let synced_once = expected.is_empty();
        Self { expected, live: FxHashSet::default(), synced_once, down_since: None, stale_after }
    }

    fn up(&mut self, gk: &GroupKind) {
        self.live.insert(gk.clone());
        if self.expected.iter().all(|k| self.live.contains(k)) {
            self.synced_once = true;
            self.down_since = None;
        }
    }

    fn down(&mut self, gk: &GroupKind, now: Instant) {
        self.live.remove(gk);
        if self.synced_once && self.down_since.is_none() {
            self.down_since = Some(now);
        }
    }

    fn state(&self, now: Instant) -> CacheState {
        if !self.synced_once {
            return CacheState::Connecting;
        }
        match self.down_since {
            None => CacheState::Synced,
            Some(t) if now.saturating_duration_since(t) >= self.stale_after => CacheState::Stale,
            Some(_) => CacheState::Degraded,
        }
    }
}

struct IngestLoop {
    cluster: ClusterId,
    state: ClusterState,
    coalescer: Coalescer,
    snap: Arc<ArcSwap<ClusterSnapshot>>,
    epoch_tx: watch::Sender<u64>,
    state_tx: watch::Sender<CacheState>,
    life: Lifecycle,
}

impl IngestLoop {
    async fn run(mut self, mut rx: mpsc::Receiver<Ingest>, flush_every: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(flush_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                maybe = rx.recv() => match maybe {
                    Some(Ingest::Delta(d)) => {
                        self.coalescer.push(d);
                        if self.coalescer.is_full() { self.flush(); }
                    }
                    Some(Ingest::Relist { gk, items }) => {
                        self.flush();
                        let stats = self.state.replace_kind(&gk, items);
                        debug!(cluster = %self.cluster, gk = %gk, objects = stats.applied, purged = stats.deleted, "cache: relist applied");
                        self.record(stats);
                        self.publish();
                        self.life.up(&gk);
                    }
                    Some(Ingest::KindDown { gk }) => self.life.down(&gk, Instant::now()),
                    None => {
                        debug!(cluster = %self.cluster, "ingest channel closed; draining");
                        self.flush();
                        break;
                    }
                },
                _ = ticker.tick() => self.flush(),
            }
            let next = self.life.state(Instant::now());
            let cluster = &self.cluster;
            self.state_tx.send_if_modified(|s| {
                if *s == next { return false; }
                info!(cluster = %cluster, from = ?*s, to = ?next, "cache: state changed");
                *s = next;
                true
            });
        }
        self.state_tx.send_replace(CacheState::Closed);
        info!(cluster = %self.cluster, objects = self.state.len(), "ingest loop stopped");
    }

    fn flush(&mut self) {
        if self.coalescer.is_empty() { return; }
        let batch = self.coalescer.drain_ready();
        let stats = self.state.apply(batch);
        self.record(stats);
        self.publish();
    }

    fn record(&self, stats: ApplyStats) {
        if stats.applied + stats.deleted > 0 { counter!("watch_events_applied", stats.applied + stats.deleted); }
        if stats.stale > 0 { counter!("watch_events_stale_dropped", stats.stale); }
    }

    fn publish(&mut self) {
        let epoch = self.state.epoch();
        if epoch == *self.epoch_tx.borrow() { return; }
        self.snap.store(self.state.freeze());
        let _ = self.epoch_tx.send(epoch);
    }
}

enum WatchExit {
    Failed(String),
    Resync,
    Shutdown,
}

/// Owns the watch for one kind: reconnects with backoff and relists on every
/// reconnect.
struct WatchSupervisor {
    cluster: ClusterId,
    source: Arc<dyn ClusterSource>,
    resource: DiscoveredResource,
    tx: mpsc::Sender<Ingest>,
    backoff: Backoff,
}

impl WatchSupervisor {
    async fn run(mut self, mut resync: watch::Receiver<u64>, shutdown: CancellationToken) {
        let gk = self.resource.group_kind();
        loop {
            match self.pump(&gk, &mut resync, &shutdown).await {
                WatchExit::Shutdown => break,
                WatchExit::Resync => {
                    debug!(cluster = %self.cluster, gk = %gk, "watch: resync requested");
                }
                WatchExit::Failed(error) => {
                    counter!("watch_reconnects", 1u64);
                    if self.tx.send(Ingest::KindDown { gk: gk.clone() }).await.is_err() { break; }
                    let delay = self.backoff.next_delay();
                    warn!(cluster = %self.cluster, gk = %gk, error = %error, retry_in_ms = delay.as_millis() as u64, "watch: stream failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        debug!(cluster = %self.cluster, gk = %gk, "watch: supervisor stopped");
    }

    async fn pump(&mut self, gk: &GroupKind, resync: &mut watch::Receiver<u64>, shutdown: &CancellationToken) -> WatchExit {
        let mut stream = self.source.watch(&self.resource);
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => return WatchExit::Shutdown,
                changed = resync.changed() => {
                    if changed.is_err() { return WatchExit::Shutdown; }
                    return WatchExit::Resync;
                }
                ev = stream.next() => match ev {
                    Some(Ok(WatchEvent::Restarted(items))) => {
                        self.backoff.reset();
                        Ingest::Relist { gk: gk.clone(), items }
                    }
                    Some(Ok(WatchEvent::Applied(raw))) => Ingest::Delta(Delta { kind: DeltaKind::Applied, raw }),
                    Some(Ok(WatchEvent::Deleted(raw))) => Ingest::Delta(Delta { kind: DeltaKind::Deleted, raw }),
                    Some(Err(e)) => return WatchExit::Failed(e.to_string()),
                    None => return WatchExit::Failed("watch stream ended".into()),
                },
            };
            if self.tx.send(msg).await.is_err() {
                return WatchExit::Shutdown;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gk(kind: &str) -> GroupKind { GroupKind::new("", kind) }

    #[test]
    fn lifecycle_transitions() {
        let t0 = Instant::now();
        let mut life = Lifecycle::new([gk("Pod"), gk("ConfigMap")], Duration::from_secs(10));
        assert_eq!(life.state(t0), CacheState::Connecting);
        life.up(&gk("Pod"));
        life.down(&gk("ConfigMap"), t0);
        assert_eq!(life.state(t0), CacheState::Connecting);
        life.up(&gk("ConfigMap"));
        assert_eq!(life.state(t0), CacheState::Synced);
        life.down(&gk("Pod"), t0);
        assert_eq!(life.state(t0 + Duration::from_secs(1)), CacheState::Degraded);
        assert_eq!(life.state(t0 + Duration::from_secs(10)), CacheState::Stale);
        life.up(&gk("Pod"));
        assert_eq!(life.state(t0 + Duration::from_secs(11)), CacheState::Synced);
    }

    #[test]
    fn no_watched_kinds_is_synced() {
        let life = Lifecycle::new(std::iter::empty(), Duration::from_secs(1));
        assert_eq!(life.state(Instant::now()), CacheState::Synced);
    }

    #[test]
    fn source_errors_map_to_taxonomy() {
        let id = ClusterId::new("https://c1");
        assert!(matches!(source_error(&id, SourceError::Discovery("x".into())), FerryError::Discovery { .. }));
        assert!(matches!(source_error(&id, SourceError::Connection("x".into())), FerryError::Connection { .. }));
        assert!(matches!(source_error(&id, SourceError::Watch("x".into())), FerryError::Connection { .. }));
    }
}
