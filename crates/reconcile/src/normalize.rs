//! Pre-comparison normalization of desired and live documents.
//!
//! Both sides lose server-managed noise first. The live side then loses every
//! field the desired side never mentions (server defaults, admission
//! mutations), unless the field is recorded in the live object's last-applied
//! configuration: those were set by a previous apply and are real removals.

use ferry_schema::{KindScope, ShapeNode};
use serde_json::{Map, Value};

pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

const NOISY_ANNOTATIONS: &[&str] = &[LAST_APPLIED_ANNOTATION, "deployment.kubernetes.io/revision"];

const SERVER_METADATA: &[&str] =
    &["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"];

/// Remove status and server-populated metadata in place.
pub fn strip_server_fields(doc: &mut Value) {
    let Some(obj) = doc.as_object_mut() else { return };
    obj.remove("status");
    let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) else { return };
    for f in SERVER_METADATA {
        meta.remove(*f);
    }
    let empty = match meta.get_mut("annotations").and_then(|a| a.as_object_mut()) {
        Some(annos) => {
            for a in NOISY_ANNOTATIONS {
                annos.remove(*a);
            }
            annos.is_empty()
        }
        None => false,
    };
    if empty { meta.remove("annotations"); }
}

/// The configuration recorded by the last client-side apply, if any.
pub fn last_applied(live: &Value) -> Option<Value> {
    let text = live.pointer("/metadata/annotations")?.get(LAST_APPLIED_ANNOTATION)?.as_str()?;
    serde_json::from_str(text).ok()
}

/// Give namespaced kinds the destination namespace when the manifest has none;
/// clear it for cluster-scoped kinds. Undiscovered kinds are treated as namespaced.
pub fn default_namespace(doc: &mut Value, scope: KindScope, destination: Option<&str>) {
    let Some(meta) = doc.get_mut("metadata").and_then(|m| m.as_object_mut()) else { return };
    match scope {
        KindScope::Cluster => {
            meta.remove("namespace");
        }
        KindScope::Namespaced | KindScope::Unknown => {
            let missing = meta.get("namespace").and_then(|v| v.as_str()).map(str::is_empty).unwrap_or(true);
            if let (true, Some(ns)) = (missing, destination) {
                meta.insert("namespace".into(), Value::String(ns.to_string()));
            }
        }
    }
}

/// Drop live-only fields that neither desired nor last-applied mention.
pub fn prune_server_defaults(live: &mut Value, desired: &Value, applied: Option<&Value>, shape: Option<&ShapeNode>) {
    match (live, desired) {
        (Value::Object(lm), Value::Object(dm)) => prune_object(lm, dm, applied, shape),
        (Value::Array(la), Value::Array(da)) => {
            let item_shape = shape.and_then(|s| s.items());
            let keys = shape.map(|s| s.list_map_keys()).unwrap_or(&[]);
            let applied_items = applied.and_then(|a| a.as_array()).map(Vec::as_slice);
            if keys.is_empty() {
                for (i, item) in la.iter_mut().enumerate() {
                    if let Some(d) = da.get(i) {
                        prune_server_defaults(item, d, applied_items.and_then(|a| a.get(i)), item_shape);
                    }
                }
                return;
            }
            la.retain(|item| {
                find_by_keys(da, item, keys, item_shape).is_some()
                    || applied_items.map(|a| find_by_keys(a, item, keys, item_shape).is_some()).unwrap_or(false)
            });
            for item in la.iter_mut() {
                if let Some(d) = find_by_keys(da, item, keys, item_shape) {
                    let a = applied_items.and_then(|a| find_by_keys(a, item, keys, item_shape));
                    prune_server_defaults(item, d, a, item_shape);
                }
            }
        }
        _ => {}
    }
}

fn prune_object(lm: &mut Map<String, Value>, dm: &Map<String, Value>, applied: Option<&Value>, shape: Option<&ShapeNode>) {
    lm.retain(|k, _| dm.contains_key(k) || applied.and_then(|a| a.get(k)).is_some());
    for (k, lv) in lm.iter_mut() {
        if let Some(dv) = dm.get(k) {
            prune_server_defaults(lv, dv, applied.and_then(|a| a.get(k)), shape.and_then(|s| s.property(k)));
        }
    }
}

/// Element of `list` whose merge-key fields equal those of `item`. An
/// omitted key field takes the schema default, so `protocol` absent in a
/// manifest matches the `TCP` the server fills in.
pub(crate) fn find_by_keys<'a>(list: &'a [Value], item: &Value, keys: &[String], item_shape: Option<&ShapeNode>) -> Option<&'a Value> {
    list.iter().find(|cand| keys.iter().all(|k| match (key_field(cand, k, item_shape), key_field(item, k, item_shape)) {
        (Some(a), Some(b)) => values_equal(a, b),
        (None, None) => true,
        _ => false,
    }))
}

pub(crate) fn key_field<'v>(item: &'v Value, key: &str, item_shape: Option<&'v ShapeNode>) -> Option<&'v Value> {
    item.get(key).or_else(|| item_shape.and_then(|s| s.default_of(key)))
}

/// Deep equality where numbers compare by value (`1` equals `1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b)),
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).map(|w| values_equal(v, w)).unwrap_or(false))
        }
        _ => a == b,
    }
}
