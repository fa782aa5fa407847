use std::collections::VecDeque;

use ferry_core::{rv_is_older, Delta, ResourceKey};
use rustc_hash::FxHashMap;

/// Coalescing queue keyed by object identity with FIFO order. Holds at most
/// one pending delta per key, the one with the newest resourceVersion.
/// A full queue is flushed by the caller rather than shedding deltas.
pub struct Coalescer {
    map: FxHashMap<ResourceKey, Delta>,
    order: VecDeque<ResourceKey>,
    cap: usize,
    superseded: u64,
}

fn rv_of(d: &Delta) -> &str {
    d.raw.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()).unwrap_or("")
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), superseded: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn is_full(&self) -> bool { self.map.len() >= self.cap }

    /// Deltas replaced by a newer one for the same key, or discarded as older.
    pub fn superseded(&self) -> u64 { self.superseded }

    /// Queue a delta. Deltas whose document carries no identity are ignored.
    pub fn push(&mut self, d: Delta) {
        let Some(key) = ResourceKey::from_object(&d.raw) else { return };
        match self.map.get(&key) {
            Some(pending) if rv_is_older(rv_of(&d), rv_of(pending)) => {
                self.superseded += 1;
            }
            Some(_) => {
                self.superseded += 1;
                self.map.insert(key, d);
            }
            None => {
                self.order.push_back(key.clone());
                self.map.insert(key, d);
            }
        }
    }

    /// Drain all pending deltas in first-seen order.
    pub fn drain_ready(&mut self) -> Vec<Delta> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&key) {
                out.push(d);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::DeltaKind;

    fn cm(name: &str, rv: &str, data: &str) -> Delta {
        Delta {
            kind: DeltaKind::Applied,
            raw: serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap",
                "metadata": {"name": name, "namespace": "default", "resourceVersion": rv}, "data": {"v": data}}),
        }
    }

    #[test]
    fn keeps_newest_version_per_key() {
        let mut c = Coalescer::with_capacity(8);
        c.push(cm("a", "5", "five"));
        c.push(cm("b", "6", "six"));
        c.push(cm("a", "7", "seven"));
        c.push(cm("a", "6", "late"));
        let out = c.drain_ready();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].raw["data"]["v"], "seven");
        assert_eq!(out[1].raw["metadata"]["name"], "b");
        assert_eq!(c.superseded(), 2);
        assert!(c.is_empty());
    }

    #[test]
    fn reports_full_instead_of_dropping() {
        let mut c = Coalescer::with_capacity(2);
        c.push(cm("a", "1", "x"));
        assert!(!c.is_full());
        c.push(cm("b", "2", "x"));
        assert!(c.is_full());
        c.push(cm("c", "3", "x"));
        assert_eq!(c.drain_ready().len(), 3);
    }

    #[test]
    fn ignores_documents_without_identity() {
        let mut c = Coalescer::with_capacity(2);
        c.push(Delta { kind: DeltaKind::Deleted, raw: serde_json::json!({}) });
        assert!(c.is_empty());
    }
}
