//! Structural comparison of one desired/live pair.

use std::collections::BTreeSet;
use std::sync::Arc;

use ferry_core::{
    DiffKind, DiffSummary, FerryError, FieldChange, FieldDiff, LiveObject, ResourceDiffResult, ResourceHealth,
    ResourceKey,
};
use ferry_health::HealthRegistry;
use ferry_schema::{ResourceTypes, ShapeNode};
use serde_json::Value;

use crate::ignore::IgnoreRules;
use crate::normalize::{find_by_keys, key_field, last_applied, prune_server_defaults, strip_server_fields, values_equal};

pub const HOOK_ANNOTATION: &str = "argocd.argoproj.io/hook";
pub const COMPARE_OPTIONS_ANNOTATION: &str = "argocd.argoproj.io/compare-options";

/// Everything a comparison needs; shared read-only across the per-resource fan-out.
pub struct CompareContext {
    pub types: Arc<ResourceTypes>,
    pub health: Arc<HealthRegistry>,
    pub ignore: IgnoreRules,
}

impl CompareContext {
    pub fn new(types: Arc<ResourceTypes>, health: Arc<HealthRegistry>, ignore: IgnoreRules) -> Self {
        Self { types, health, ignore }
    }

    /// Build the diff result for one key. Never fails: a comparison error
    /// yields a result of kind `Unknown` carrying the message.
    pub fn compare(&self, key: ResourceKey, desired: Option<Value>, live: Option<LiveObject>) -> ResourceDiffResult {
        match self.try_compare(&key, desired, live.as_ref()) {
            Ok(r) => r,
            Err(e) => unknown_result(key, e.to_string(), live.as_ref().map(|l| self.health.evaluate_desired(Some(l)))),
        }
    }

    fn try_compare(&self, key: &ResourceKey, desired: Option<Value>, live: Option<&LiveObject>) -> Result<ResourceDiffResult, FerryError> {
        let result = |kind, desired, live, diffs: Vec<FieldDiff>, health| ResourceDiffResult {
            key: key.clone(),
            kind,
            desired,
            live,
            summary: summarize(&diffs),
            diffs,
            health,
            message: None,
        };
        match (desired, live) {
            (None, None) => Err(FerryError::Comparison { key: key.clone(), message: "neither desired nor live".into() }),
            (None, Some(l)) => {
                let kind = if is_hook(&l.raw) || ignores_extraneous(&l.raw) { DiffKind::OrphanIgnored } else { DiffKind::Added };
                let live_doc = self.normalized(key, l.raw.clone());
                Ok(result(kind, None, Some(live_doc), Vec::new(), Some(self.health.evaluate_desired(Some(l)))))
            }
            (Some(d), None) => {
                validate(key, &d)?;
                let desired_doc = self.normalized(key, d);
                if is_hook(&desired_doc) {
                    return Ok(result(DiffKind::OrphanIgnored, Some(desired_doc), None, Vec::new(), None));
                }
                Ok(result(DiffKind::Missing, Some(desired_doc), None, Vec::new(), Some(self.health.evaluate_desired(None))))
            }
            (Some(d), Some(l)) => {
                validate(key, &d)?;
                let health = Some(self.health.evaluate_desired(Some(l)));
                if is_hook(&d) {
                    return Ok(result(DiffKind::OrphanIgnored, Some(self.normalized(key, d)), None, Vec::new(), health));
                }
                let applied = last_applied(&l.raw).map(|a| self.normalized(key, a));
                let desired_doc = self.normalized(key, d);
                let mut live_doc = self.normalized(key, l.raw.clone());
                let shape = self.types.shape(&key.group_kind());
                prune_server_defaults(&mut live_doc, &desired_doc, applied.as_ref(), shape);
                let diffs = diff_documents(&desired_doc, &live_doc, shape);
                let kind = if diffs.is_empty() { DiffKind::InSync } else { DiffKind::Modified };
                Ok(result(kind, Some(desired_doc), Some(live_doc), diffs, health))
            }
        }
    }

    fn normalized(&self, key: &ResourceKey, mut doc: Value) -> Value {
        strip_server_fields(&mut doc);
        self.ignore.apply(key, &mut doc);
        doc
    }
}

/// Result for a resource whose comparison could not be completed.
pub fn unknown_result(key: ResourceKey, message: String, health: Option<ResourceHealth>) -> ResourceDiffResult {
    ResourceDiffResult {
        key,
        kind: DiffKind::Unknown,
        desired: None,
        live: None,
        diffs: Vec::new(),
        summary: DiffSummary::default(),
        health,
        message: Some(message),
    }
}

fn validate(key: &ResourceKey, doc: &Value) -> Result<(), FerryError> {
    let bad = |message: &str| Err(FerryError::Comparison { key: key.clone(), message: message.to_string() });
    let Some(meta) = doc.get("metadata").and_then(|m| m.as_object()) else { return bad("metadata is not an object") };
    for field in ["labels", "annotations"] {
        match meta.get(field) {
            None | Some(Value::Null) => {}
            Some(Value::Object(m)) if m.values().all(Value::is_string) => {}
            Some(_) => return bad(&format!("metadata.{} must be a map of strings", field)),
        }
    }
    Ok(())
}

fn annotation<'a>(doc: &'a Value, name: &str) -> Option<&'a str> {
    doc.pointer("/metadata/annotations")?.get(name)?.as_str()
}

pub fn is_hook(doc: &Value) -> bool { annotation(doc, HOOK_ANNOTATION).is_some() }

pub fn ignores_extraneous(doc: &Value) -> bool {
    annotation(doc, COMPARE_OPTIONS_ANNOTATION)
        .map(|v| v.split(',').any(|o| o.trim() == "IgnoreExtraneous"))
        .unwrap_or(false)
}

fn summarize(diffs: &[FieldDiff]) -> DiffSummary {
    diffs.iter().fold(DiffSummary::default(), |mut s, d| {
        match d.change {
            FieldChange::Added => s.adds += 1,
            FieldChange::Changed => s.updates += 1,
            FieldChange::Removed => s.removes += 1,
        }
        s
    })
}

/// Field-level differences from live to desired. `Added` means desired has a
/// value live lacks. Lists with merge keys are matched by key, others by index.
pub fn diff_documents(desired: &Value, live: &Value, shape: Option<&ShapeNode>) -> Vec<FieldDiff> {
    let mut out = Vec::new();
    walk(String::new(), desired, live, shape, &mut out);
    out
}

fn walk(path: String, desired: &Value, live: &Value, shape: Option<&ShapeNode>, out: &mut Vec<FieldDiff>) {
    match (desired, live) {
        (Value::Object(dm), Value::Object(lm)) => {
            let keys: BTreeSet<&String> = dm.keys().chain(lm.keys()).collect();
            for k in keys {
                let child = join(&path, k);
                match (dm.get(k.as_str()), lm.get(k.as_str())) {
                    (Some(d), Some(l)) => walk(child, d, l, shape.and_then(|s| s.property(k)), out),
                    // An explicit null asks for absence.
                    (Some(Value::Null), None) => {}
                    (Some(d), None) => out.push(added(child, d)),
                    (None, Some(l)) => out.push(removed(child, l)),
                    (None, None) => {}
                }
            }
        }
        (Value::Array(da), Value::Array(la)) => {
            let item_shape = shape.and_then(|s| s.items());
            let keys = shape.map(|s| s.list_map_keys()).unwrap_or(&[]);
            if keys.is_empty() {
                for i in 0..da.len().max(la.len()) {
                    let child = format!("{}[{}]", path, i);
                    match (da.get(i), la.get(i)) {
                        (Some(d), Some(l)) => walk(child, d, l, item_shape, out),
                        (Some(d), None) => out.push(added(child, d)),
                        (None, Some(l)) => out.push(removed(child, l)),
                        (None, None) => {}
                    }
                }
                return;
            }
            for d in da.iter() {
                let child = format!("{}[{}]", path, key_label(d, keys, item_shape));
                match find_by_keys(la, d, keys, item_shape) {
                    Some(l) => walk(child, d, l, item_shape, out),
                    None => out.push(added(child, d)),
                }
            }
            for l in la.iter().filter(|l| find_by_keys(da, l, keys, item_shape).is_none()) {
                out.push(removed(format!("{}[{}]", path, key_label(l, keys, item_shape)), l));
            }
        }
        (d, l) => {
            if !values_equal(d, l) {
                out.push(FieldDiff { path, change: FieldChange::Changed, desired: Some(d.clone()), live: Some(l.clone()) });
            }
        }
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() { key.to_string() } else { format!("{}.{}", path, key) }
}

fn key_label(item: &Value, keys: &[String], item_shape: Option<&ShapeNode>) -> String {
    keys.iter()
        .map(|k| match key_field(item, k, item_shape) {
            Some(Value::String(s)) => format!("{}={}", k, s),
            Some(v) => format!("{}={}", k, v),
            None => format!("{}=", k),
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn added(path: String, v: &Value) -> FieldDiff {
    FieldDiff { path, change: FieldChange::Added, desired: Some(v.clone()), live: None }
}

fn removed(path: String, v: &Value) -> FieldDiff {
    FieldDiff { path, change: FieldChange::Removed, desired: None, live: Some(v.clone()) }
}
