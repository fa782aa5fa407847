#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use ferry_core::{Delta, DeltaKind, ManagedSelector, ResourceKey, TrackingMethod};
use ferry_health::HealthRegistry;
use ferry_kubehub::{DiscoveredResource, DiscoveryInfo};
use ferry_schema::ResourceTypes;
use ferry_store::{ClusterState, Coalescer};

fn types() -> Arc<ResourceTypes> {
    Arc::new(ResourceTypes::from_discovery(&DiscoveryInfo {
        server_version: "v1.29.0".into(),
        resources: vec![DiscoveredResource::new("", "v1", "ConfigMap", "configmaps", true)],
        crds: vec![],
    }))
}

fn cm(name: &str, rv: u64, data: u64) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": name,
            "namespace": "default",
            "resourceVersion": rv.to_string(),
            "labels": {"app.kubernetes.io/instance": "replay"}
        },
        "data": {"v": data.to_string()}
    })
}

/// Small deterministic generator so sequences are reproducible without extra deps.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

/// Events in resourceVersion order plus the state they imply.
fn script(seed: u64, len: usize) -> (Vec<Delta>, BTreeMap<String, u64>) {
    let names = ["a", "b", "c", "d", "e", "f"];
    let mut rng = Lcg(seed);
    let mut model: BTreeMap<String, u64> = BTreeMap::new();
    let mut out = Vec::with_capacity(len);
    for rv in 1..=len as u64 {
        let name = names[(rng.next() % names.len() as u64) as usize];
        if model.contains_key(name) && rng.next() % 4 == 0 {
            model.remove(name);
            out.push(Delta { kind: DeltaKind::Deleted, raw: cm(name, rv, 0) });
        } else {
            let data = rng.next() % 1000;
            model.insert(name.to_string(), data);
            out.push(Delta { kind: DeltaKind::Applied, raw: cm(name, rv, data) });
        }
    }
    (out, model)
}

/// Interleave duplicates and stale replays of earlier events.
fn with_noise(seq: &[Delta], seed: u64) -> Vec<Delta> {
    let mut rng = Lcg(seed);
    let mut out = Vec::with_capacity(seq.len() * 2);
    for (i, d) in seq.iter().enumerate() {
        out.push(d.clone());
        match rng.next() % 3 {
            0 => out.push(d.clone()),
            1 if i > 0 => out.push(seq[(rng.next() as usize) % i].clone()),
            _ => {}
        }
    }
    out
}

fn run(seq: Vec<Delta>, batch: usize) -> BTreeMap<String, u64> {
    let mut state = ClusterState::new(types(), Arc::new(HealthRegistry::new()));
    let mut coalescer = Coalescer::with_capacity(batch);
    for d in seq {
        coalescer.push(d);
        if coalescer.is_full() {
            state.apply(coalescer.drain_ready());
        }
    }
    state.apply(coalescer.drain_ready());
    let selector = ManagedSelector::new(TrackingMethod::default(), "replay");
    state
        .freeze()
        .managed(&selector)
        .into_iter()
        .map(|(k, o)| (k.name, o.raw["data"]["v"].as_str().unwrap().parse().unwrap()))
        .collect()
}

#[test]
fn replay_matches_model_for_any_batching() {
    for seed in [1u64, 7, 42, 1234] {
        let (seq, model) = script(seed, 200);
        for batch in [1usize, 3, 16, 1024] {
            assert_eq!(run(seq.clone(), batch), model, "seed {} batch {}", seed, batch);
        }
    }
}

#[test]
fn duplicates_and_stale_replays_are_noops() {
    for seed in [3u64, 99] {
        let (seq, model) = script(seed, 150);
        let noisy = with_noise(&seq, seed ^ 0xfeed);
        assert!(noisy.len() > seq.len());
        for batch in [1usize, 5, 64] {
            assert_eq!(run(noisy.clone(), batch), model, "seed {} batch {}", seed, batch);
        }
    }
}

#[test]
fn deterministic_across_runs() {
    let (seq, _) = script(5, 120);
    let noisy = with_noise(&seq, 11);
    assert_eq!(run(noisy.clone(), 4), run(noisy, 4));
}

#[test]
fn snapshot_epoch_only_moves_on_change() {
    let mut state = ClusterState::new(types(), Arc::new(HealthRegistry::new()));
    state.apply(vec![Delta { kind: DeltaKind::Applied, raw: cm("a", 1, 1) }]);
    let e1 = state.freeze().epoch;
    state.apply(vec![Delta { kind: DeltaKind::Applied, raw: cm("a", 1, 1) }]);
    assert_eq!(state.freeze().epoch, e1);
    state.apply(vec![Delta { kind: DeltaKind::Deleted, raw: cm("a", 2, 1) }]);
    assert!(state.freeze().epoch > e1);
    assert!(state.freeze().get(&ResourceKey::new("", "ConfigMap", "default", "a")).is_none());
}
