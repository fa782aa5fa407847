//! Owned collection of per-cluster caches.
//!
//! Reads go through an `ArcSwap` of the map and never lock. Inserts and
//! removals copy the map under a short mutex. Concurrent first requests for a
//! cluster share one `OnceCell`, so only one cache is ever started for it.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use ferry_core::config::CacheConfig;
use ferry_core::{ClusterId, FerryError, FerryResult};
use ferry_health::HealthRegistry;
use ferry_kubehub::ClusterConnector;
use rustc_hash::FxHashMap;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{source_error, ClusterCache};

type Slot = Arc<OnceCell<Arc<ClusterCache>>>;

pub struct CacheRegistry {
    connector: Arc<dyn ClusterConnector>,
    health: Arc<HealthRegistry>,
    cfg: CacheConfig,
    entries: ArcSwap<FxHashMap<ClusterId, Slot>>,
    write: Mutex<()>,
}

impl CacheRegistry {
    pub fn new(connector: Arc<dyn ClusterConnector>, health: Arc<HealthRegistry>, cfg: CacheConfig) -> Self {
        Self { connector, health, cfg, entries: ArcSwap::from_pointee(FxHashMap::default()), write: Mutex::new(()) }
    }

    pub fn config(&self) -> &CacheConfig { &self.cfg }

    pub fn health(&self) -> &Arc<HealthRegistry> { &self.health }

    /// Existing cache for `id`, or a freshly started one. Concurrent callers
    /// for the same id wait on the same start; a failed start is not kept.
    pub async fn get_or_create(&self, id: &ClusterId) -> FerryResult<Arc<ClusterCache>> {
        let slot = self.slot(id);
        let started = slot
            .get_or_try_init(|| async {
                let source = self.connector.connect(id).await.map_err(|e| source_error(id, e))?;
                ClusterCache::start(id.clone(), source, Arc::clone(&self.health), self.cfg.clone()).await
            })
            .await;
        let cache = match started {
            Ok(c) => Arc::clone(c),
            Err(e) => {
                warn!(cluster = %id, error = %e, "registry: cache start failed");
                self.drop_slot_if_same(id, &slot);
                return Err(e);
            }
        };
        // Removed while we were starting: never hand out a cache the registry no longer owns.
        if !self.holds(id, &slot) || cache.is_closed() {
            cache.close();
            return Err(FerryError::CacheClosed { cluster: id.clone() });
        }
        cache.touch();
        Ok(cache)
    }

    /// Cache for `id` if it is running; never starts one.
    pub fn get(&self, id: &ClusterId) -> Option<Arc<ClusterCache>> {
        self.entries.load().get(id).and_then(|slot| slot.get().cloned())
    }

    pub fn clusters(&self) -> Vec<ClusterId> {
        let mut ids: Vec<ClusterId> = self.entries.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize { self.entries.load().len() }
    pub fn is_empty(&self) -> bool { self.entries.load().is_empty() }

    /// Tear down the cache for `id`. Holders of the old cache get `CacheClosed`.
    pub fn remove(&self, id: &ClusterId) -> bool {
        let removed = {
            let _guard = self.write.lock().unwrap_or_else(PoisonError::into_inner);
            let current = self.entries.load_full();
            if !current.contains_key(id) { return false; }
            let mut next = FxHashMap::clone(&current);
            let removed = next.remove(id);
            self.entries.store(Arc::new(next));
            removed
        };
        if let Some(cache) = removed.as_ref().and_then(|slot| slot.get()) {
            cache.close();
        }
        info!(cluster = %id, "registry: cache removed");
        true
    }

    /// Remove caches that have not been read within the retention window.
    pub fn evict_idle(&self) -> Vec<ClusterId> {
        let retention = self.cfg.idle_retention();
        let idle: Vec<ClusterId> = self
            .entries
            .load()
            .iter()
            .filter_map(|(id, slot)| slot.get().filter(|c| c.idle_for() >= retention).map(|_| id.clone()))
            .collect();
        for id in idle.iter() {
            debug!(cluster = %id, "registry: evicting idle cache");
            self.remove(id);
        }
        idle
    }

    /// Force every running cache to relist, e.g. after settings changed.
    pub fn invalidate_all(&self) {
        for slot in self.entries.load().values() {
            if let Some(cache) = slot.get() { cache.invalidate(); }
        }
    }

    pub fn close_all(&self) {
        for id in self.clusters() { self.remove(&id); }
    }

    /// Periodically evict idle caches until the registry is dropped.
    pub fn spawn_idle_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(reg) = weak.upgrade() else { break };
                let evicted = reg.evict_idle();
                if !evicted.is_empty() {
                    info!(count = evicted.len(), "registry: idle caches evicted");
                }
            }
        })
    }

    fn slot(&self, id: &ClusterId) -> Slot {
        if let Some(slot) = self.entries.load().get(id) {
            return Arc::clone(slot);
        }
        let _guard = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.entries.load_full();
        if let Some(slot) = current.get(id) {
            return Arc::clone(slot);
        }
        let slot: Slot = Arc::new(OnceCell::new());
        let mut next = FxHashMap::clone(&current);
        next.insert(id.clone(), Arc::clone(&slot));
        self.entries.store(Arc::new(next));
        slot
    }

    fn holds(&self, id: &ClusterId, slot: &Slot) -> bool {
        self.entries.load().get(id).map(|s| Arc::ptr_eq(s, slot)).unwrap_or(false)
    }

    fn drop_slot_if_same(&self, id: &ClusterId, slot: &Slot) {
        let _guard = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.entries.load_full();
        if !current.get(id).map(|s| Arc::ptr_eq(s, slot) && !s.initialized()).unwrap_or(false) { return; }
        let mut next = FxHashMap::clone(&current);
        next.remove(id);
        self.entries.store(Arc::new(next));
    }
}

impl Drop for CacheRegistry {
    fn drop(&mut self) {
        for slot in self.entries.load().values() {
            if let Some(cache) = slot.get() { cache.close(); }
        }
    }
}
