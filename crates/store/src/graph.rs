//! Ownership edges as an explicit edge index. Traversals carry a visited set,
//! so owner-reference cycles terminate.

use std::collections::VecDeque;

use ferry_core::{OwnershipEdge, ResourceKey};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

#[derive(Debug, Clone, Default)]
pub struct OwnershipGraph {
    /// owner -> dependents
    dependents: FxHashMap<ResourceKey, SmallVec<[ResourceKey; 4]>>,
    /// dependent -> owners
    owners: FxHashMap<ResourceKey, SmallVec<[ResourceKey; 2]>>,
}

impl OwnershipGraph {
    pub fn new() -> Self { Self::default() }

    /// Replace every outgoing owner edge of `dependent`.
    pub fn set_owners<I>(&mut self, dependent: &ResourceKey, owners: I)
    where
        I: IntoIterator<Item = ResourceKey>,
    {
        self.remove_dependent(dependent);
        let mut list: SmallVec<[ResourceKey; 2]> = SmallVec::new();
        for owner in owners {
            if list.contains(&owner) { continue; }
            let deps = self.dependents.entry(owner.clone()).or_default();
            if !deps.contains(dependent) { deps.push(dependent.clone()); }
            list.push(owner);
        }
        if !list.is_empty() { self.owners.insert(dependent.clone(), list); }
    }

    /// Drop edges where `dependent` is the dependent. Returns its former owners.
    pub fn remove_dependent(&mut self, dependent: &ResourceKey) -> SmallVec<[ResourceKey; 2]> {
        let Some(former) = self.owners.remove(dependent) else { return SmallVec::new() };
        for owner in former.iter() {
            if let Some(deps) = self.dependents.get_mut(owner) {
                deps.retain(|d| d != dependent);
                if deps.is_empty() { self.dependents.remove(owner); }
            }
        }
        former
    }

    pub fn owners_of(&self, key: &ResourceKey) -> &[ResourceKey] {
        self.owners.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn dependents_of(&self, key: &ResourceKey) -> &[ResourceKey] {
        self.dependents.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Transitive owners of `key`, nearest first. `key` itself is never included.
    pub fn ancestors(&self, key: &ResourceKey) -> Vec<ResourceKey> { self.walk(key, |k| self.owners_of(k)) }

    /// Transitive dependents of `key`, breadth first. `key` itself is never included.
    pub fn descendants(&self, key: &ResourceKey) -> Vec<ResourceKey> { self.walk(key, |k| self.dependents_of(k)) }

    fn walk<'a, F>(&'a self, start: &ResourceKey, next: F) -> Vec<ResourceKey>
    where
        F: Fn(&ResourceKey) -> &'a [ResourceKey],
    {
        let mut seen: FxHashSet<&ResourceKey> = FxHashSet::default();
        let mut out = Vec::new();
        let mut queue: VecDeque<&ResourceKey> = VecDeque::new();
        seen.insert(start);
        queue.push_back(start);
        while let Some(k) = queue.pop_front() {
            for n in next(k) {
                if seen.insert(n) {
                    out.push(n.clone());
                    queue.push_back(n);
                }
            }
        }
        out
    }

    pub fn edges(&self) -> Vec<OwnershipEdge> {
        let mut out: Vec<OwnershipEdge> = self
            .owners
            .iter()
            .flat_map(|(dep, owners)| owners.iter().map(move |o| OwnershipEdge { owner: o.clone(), dependent: dep.clone() }))
            .collect();
        out.sort();
        out
    }

    pub fn edge_count(&self) -> usize { self.owners.values().map(|v| v.len()).sum() }
}
