//! Single-writer cluster state and its immutable published snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use ferry_core::{rv_is_older, Delta, DeltaKind, GroupKind, LiveObject, ManagedSelector, ResourceHealth, ResourceKey, Uid};
use ferry_health::HealthRegistry;
use ferry_schema::{KindScope, ResourceTypes};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tracing::{debug, trace};

use crate::graph::OwnershipGraph;

type ObjectMap = BTreeMap<ResourceKey, Arc<LiveObject>>;

/// Point-in-time view of one cluster. Never mutated after publication.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub epoch: u64,
    objects: Arc<ObjectMap>,
    graph: Arc<OwnershipGraph>,
}

impl ClusterSnapshot {
    pub fn len(&self) -> usize { self.objects.len() }
    pub fn is_empty(&self) -> bool { self.objects.is_empty() }

    pub fn get(&self, key: &ResourceKey) -> Option<&LiveObject> { self.objects.get(key).map(|o| o.as_ref()) }

    pub fn iter(&self) -> impl Iterator<Item = &LiveObject> { self.objects.values().map(|o| o.as_ref()) }

    pub fn graph(&self) -> &OwnershipGraph { &self.graph }

    /// Top-level objects claimed by the selector.
    pub fn managed(&self, selector: &ManagedSelector) -> BTreeMap<ResourceKey, LiveObject> {
        self.objects
            .iter()
            .filter(|(_, o)| o.is_top_level() && selector.matches(o))
            .map(|(k, o)| (k.clone(), LiveObject::clone(o)))
            .collect()
    }

    /// Every live descendant of `root`, breadth first.
    pub fn descendants(&self, root: &ResourceKey) -> Vec<Arc<LiveObject>> {
        self.graph.descendants(root).iter().filter_map(|k| self.objects.get(k).cloned()).collect()
    }
}

/// Per-batch ingest counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub applied: u64,
    pub deleted: u64,
    pub stale: u64,
}

const MAX_TOMBSTONES: usize = 4096;

struct Tombstone {
    seq: u64,
    rv: String,
}

/// The writer side. Owned by exactly one ingest task.
pub struct ClusterState {
    epoch: u64,
    objects: Arc<ObjectMap>,
    graph: Arc<OwnershipGraph>,
    by_uid: FxHashMap<Uid, ResourceKey>,
    /// resourceVersion of the last delete per key; older applies are replays.
    tombstones: FxHashMap<ResourceKey, Tombstone>,
    buried: u64,
    types: Arc<ResourceTypes>,
    health: Arc<HealthRegistry>,
}

impl ClusterState {
    pub fn new(types: Arc<ResourceTypes>, health: Arc<HealthRegistry>) -> Self {
        Self {
            epoch: 0,
            objects: Arc::default(),
            graph: Arc::default(),
            by_uid: FxHashMap::default(),
            tombstones: FxHashMap::default(),
            buried: 0,
            types,
            health,
        }
    }

    pub fn epoch(&self) -> u64 { self.epoch }
    pub fn len(&self) -> usize { self.objects.len() }
    pub fn is_empty(&self) -> bool { self.objects.is_empty() }

    /// Apply a batch of deltas, then refresh health for everything the batch touched.
    pub fn apply(&mut self, batch: Vec<Delta>) -> ApplyStats {
        let mut stats = ApplyStats::default();
        let mut dirty: FxHashSet<ResourceKey> = FxHashSet::default();
        for d in batch {
            match d.kind {
                DeltaKind::Applied => match self.upsert(d.raw, false, &mut dirty) {
                    Some(true) => stats.applied += 1,
                    Some(false) => stats.stale += 1,
                    None => {}
                },
                DeltaKind::Deleted => match self.delete(&d.raw, &mut dirty) {
                    Some(true) => stats.deleted += 1,
                    Some(false) => stats.stale += 1,
                    None => {}
                },
            }
        }
        self.finish(dirty);
        stats
    }

    /// Replace every object of one kind with a fresh list. Objects of that
    /// kind missing from the list are deletes the watch never delivered.
    pub fn replace_kind(&mut self, gk: &GroupKind, items: Vec<Value>) -> ApplyStats {
        let mut stats = ApplyStats::default();
        let mut dirty: FxHashSet<ResourceKey> = FxHashSet::default();
        let listed: FxHashSet<ResourceKey> = items.iter().filter_map(ResourceKey::from_object).collect();
        let ghosts: Vec<ResourceKey> =
            self.objects.keys().filter(|k| k.group == gk.group && k.kind == gk.kind && !listed.contains(*k)).cloned().collect();
        for key in ghosts {
            self.remove_key(&key, &mut dirty);
            stats.deleted += 1;
        }
        self.tombstones.retain(|k, _| !(k.group == gk.group && k.kind == gk.kind));
        for raw in items {
            if let Some(true) = self.upsert(raw, true, &mut dirty) { stats.applied += 1; }
        }
        self.finish(dirty);
        stats
    }

    pub fn freeze(&self) -> Arc<ClusterSnapshot> {
        Arc::new(ClusterSnapshot { epoch: self.epoch, objects: Arc::clone(&self.objects), graph: Arc::clone(&self.graph) })
    }

    /// `Some(true)` applied, `Some(false)` discarded as out of order, `None` unusable.
    fn upsert(&mut self, raw: Value, authoritative: bool, dirty: &mut FxHashSet<ResourceKey>) -> Option<bool> {
        let mut lo = LiveObject::from_raw(raw, Utc::now())?;
        let key = lo.key.clone();
        if let Some(cur) = self.objects.get(&key) {
            if lo.resource_version == cur.resource_version && !lo.resource_version.is_empty() {
                return Some(false);
            }
            if !authoritative && rv_is_older(&lo.resource_version, &cur.resource_version) {
                trace!(key = %key, rv = %lo.resource_version, cached = %cur.resource_version, "store: stale apply dropped");
                return Some(false);
            }
        } else if let Some(gone) = self.tombstones.get(&key).filter(|_| !authoritative) {
            if let (Ok(gone), Ok(rv)) = (gone.rv.parse::<u64>(), lo.resource_version.parse::<u64>()) {
                if rv <= gone { return Some(false); }
            }
        }
        self.tombstones.remove(&key);
        if let Some(prev) = self.objects.get(&key) {
            if let Some(uid) = prev.uid {
                if lo.uid != Some(uid) { self.by_uid.remove(&uid); }
            }
        }
        if let Some(uid) = lo.uid { self.by_uid.insert(uid, key.clone()); }

        let owners: Vec<ResourceKey> = lo.owners.iter().map(|o| self.resolve_owner(o, &key.namespace)).collect();
        let former: Vec<ResourceKey> = self.graph.owners_of(&key).to_vec();
        Arc::make_mut(&mut self.graph).set_owners(&key, owners.iter().cloned());
        lo.health = None;
        Arc::make_mut(&mut self.objects).insert(key.clone(), Arc::new(lo));
        dirty.insert(key);
        dirty.extend(former);
        Some(true)
    }

    fn delete(&mut self, raw: &Value, dirty: &mut FxHashSet<ResourceKey>) -> Option<bool> {
        let key = ResourceKey::from_object(raw)?;
        let rv = raw.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()).unwrap_or("");
        let Some(cur) = self.objects.get(&key) else {
            // Never seen (or coalesced away); still fence off older replays.
            let newer = self.tombstones.get(&key).map(|t| rv_is_older(&t.rv, rv)).unwrap_or(true);
            if newer && !rv.is_empty() { self.bury(key, rv.to_string()); }
            return None;
        };
        if rv_is_older(rv, &cur.resource_version) {
            return Some(false);
        }
        let tomb = if rv.is_empty() { cur.resource_version.clone() } else { rv.to_string() };
        self.remove_key(&key, dirty);
        self.bury(key, tomb);
        Some(true)
    }

    /// Record a delete. Past `MAX_TOMBSTONES` the older half is dropped; a
    /// relist of the kind covers anything forgotten.
    fn bury(&mut self, key: ResourceKey, rv: String) {
        self.buried += 1;
        self.tombstones.insert(key, Tombstone { seq: self.buried, rv });
        if self.tombstones.len() > MAX_TOMBSTONES {
            let mut seqs: Vec<u64> = self.tombstones.values().map(|t| t.seq).collect();
            let (_, cut, _) = seqs.select_nth_unstable(MAX_TOMBSTONES / 2);
            let cut = *cut;
            self.tombstones.retain(|_, t| t.seq > cut);
            debug!(kept = self.tombstones.len(), "store: tombstones trimmed");
        }
    }

    #[cfg(test)]
    pub(crate) fn tombstone_count(&self) -> usize { self.tombstones.len() }

    fn remove_key(&mut self, key: &ResourceKey, dirty: &mut FxHashSet<ResourceKey>) {
        if let Some(prev) = Arc::make_mut(&mut self.objects).remove(key) {
            if let Some(uid) = prev.uid { self.by_uid.remove(&uid); }
        }
        // Ancestors are captured before the edges go away.
        dirty.extend(self.graph.ancestors(key));
        Arc::make_mut(&mut self.graph).remove_dependent(key);
    }

    /// Owners share the dependent's namespace unless the uid says otherwise
    /// or the owner kind is cluster-scoped.
    fn resolve_owner(&self, owner: &ferry_core::OwnerRef, namespace: &str) -> ResourceKey {
        if let Some(key) = owner.uid.and_then(|u| self.by_uid.get(&u)) {
            return key.clone();
        }
        let key = owner.key_in(namespace);
        match self.types.scope(&key.group_kind()) {
            KindScope::Cluster => ResourceKey { namespace: String::new(), ..key },
            _ => key,
        }
    }

    /// Re-evaluate health for dirty keys and their transitive owners,
    /// children before parents, then bump the epoch.
    fn finish(&mut self, dirty: FxHashSet<ResourceKey>) {
        if dirty.is_empty() { return; }
        let mut pending: FxHashSet<ResourceKey> = FxHashSet::default();
        for key in dirty.iter() {
            pending.extend(self.graph.ancestors(key));
        }
        pending.extend(dirty);
        pending.retain(|k| self.objects.contains_key(k));

        let mut order: Vec<ResourceKey> = pending.iter().cloned().collect();
        order.sort();
        let mut visited: FxHashSet<ResourceKey> = FxHashSet::default();
        for key in order {
            self.evaluate_post_order(&key, &pending, &mut visited);
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    fn evaluate_post_order(&mut self, key: &ResourceKey, pending: &FxHashSet<ResourceKey>, visited: &mut FxHashSet<ResourceKey>) {
        // Iterative post-order so deep chains cannot overflow the stack.
        let mut stack: Vec<(ResourceKey, bool)> = vec![(key.clone(), false)];
        while let Some((k, expanded)) = stack.pop() {
            if expanded {
                self.evaluate_one(&k);
                continue;
            }
            if !visited.insert(k.clone()) { continue; }
            stack.push((k.clone(), true));
            for child in self.graph.dependents_of(&k) {
                if pending.contains(child) && !visited.contains(child) {
                    stack.push((child.clone(), false));
                }
            }
        }
    }

    fn evaluate_one(&mut self, key: &ResourceKey) {
        let children: Vec<ResourceHealth> = self
            .graph
            .dependents_of(key)
            .iter()
            .filter_map(|c| self.objects.get(c).and_then(|o| o.health.clone()))
            .collect();
        let Some(cur) = self.objects.get(key) else { return };
        let health = self.health.evaluate_live(cur, &children);
        if cur.health.as_ref() == Some(&health) { return; }
        let objects = Arc::make_mut(&mut self.objects);
        if let Some(slot) = objects.get_mut(key) {
            Arc::make_mut(slot).health = Some(health);
        }
    }
}
