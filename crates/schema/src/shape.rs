//! Structural shape of resource documents, parsed from OpenAPI v3 schemas.

use std::collections::BTreeMap;

use ferry_core::GroupKind;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SchemaError;

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Object,
    Array,
    String,
    Integer,
    Number,
    Boolean,
    /// Untyped, int-or-string, or preserve-unknown.
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeNode {
    pub ty: FieldType,
    pub properties: BTreeMap<String, ShapeNode>,
    pub additional: Option<Box<ShapeNode>>,
    pub items: Option<Box<ShapeNode>>,
    /// Keys identifying list elements (`x-kubernetes-list-map-keys` or patch merge key).
    pub list_map_keys: Vec<String>,
    pub preserve_unknown: bool,
    /// Value the API server fills in when the field is omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl Default for ShapeNode {
    fn default() -> Self {
        Self {
            ty: FieldType::Any,
            properties: BTreeMap::new(),
            additional: None,
            items: None,
            list_map_keys: Vec::new(),
            preserve_unknown: false,
            default: None,
        }
    }
}

impl ShapeNode {
    /// Parse an OpenAPI v3 schema object.
    pub fn from_openapi(schema: &Value) -> Result<Self, SchemaError> { parse_node(schema, "", 0) }

    /// Child shape for an object property (or `additionalProperties`).
    pub fn property(&self, name: &str) -> Option<&ShapeNode> {
        self.properties.get(name).or(self.additional.as_deref())
    }

    pub fn items(&self) -> Option<&ShapeNode> { self.items.as_deref() }

    pub fn list_map_keys(&self) -> &[String] { &self.list_map_keys }

    /// Server default of the named property, if the schema declares one.
    pub fn default_of(&self, name: &str) -> Option<&Value> { self.property(name)?.default.as_ref() }

    /// Walk property names from this node.
    pub fn lookup<'a, I: IntoIterator<Item = &'a str>>(&self, path: I) -> Option<&ShapeNode> {
        let mut cur = self;
        for seg in path {
            cur = if seg == "[]" { cur.items()? } else { cur.property(seg)? };
        }
        Some(cur)
    }
}

fn parse_node(v: &Value, at: &str, depth: usize) -> Result<ShapeNode, SchemaError> {
    let bad = |msg: &str| SchemaError::Malformed { at: if at.is_empty() { "<root>".into() } else { at.to_string() }, message: msg.to_string() };
    if depth > MAX_DEPTH { return Err(bad("schema nesting too deep")); }
    let obj = v.as_object().ok_or_else(|| bad("schema node is not an object"))?;

    let int_or_string = obj.get("x-kubernetes-int-or-string").and_then(|b| b.as_bool()).unwrap_or(false);
    let preserve_unknown = obj.get("x-kubernetes-preserve-unknown-fields").and_then(|b| b.as_bool()).unwrap_or(false);
    let ty = match obj.get("type") {
        _ if int_or_string => FieldType::Any,
        None => if obj.contains_key("properties") { FieldType::Object } else { FieldType::Any },
        Some(Value::String(t)) => match t.as_str() {
            "object" => FieldType::Object,
            "array" => FieldType::Array,
            "string" => FieldType::String,
            "integer" => FieldType::Integer,
            "number" => FieldType::Number,
            "boolean" => FieldType::Boolean,
            other => return Err(bad(&format!("unknown type {}", other))),
        },
        Some(_) => return Err(bad("type must be a string")),
    };

    let default = obj.get("default").cloned();
    let mut node = ShapeNode { ty, preserve_unknown, default, ..Default::default() };

    if let Some(props) = obj.get("properties") {
        let props = props.as_object().ok_or_else(|| bad("properties must be an object"))?;
        for (k, pv) in props.iter() {
            let child_at = if at.is_empty() { k.clone() } else { format!("{}.{}", at, k) };
            node.properties.insert(k.clone(), parse_node(pv, &child_at, depth + 1)?);
        }
    }
    match obj.get("additionalProperties") {
        Some(ap @ Value::Object(_)) => {
            node.additional = Some(Box::new(parse_node(ap, &format!("{}.*", at), depth + 1)?));
        }
        Some(Value::Bool(_)) | None => {}
        Some(_) => return Err(bad("additionalProperties must be an object or bool")),
    }
    if let Some(items) = obj.get("items") {
        node.items = Some(Box::new(parse_node(items, &format!("{}[]", at), depth + 1)?));
    } else if ty == FieldType::Array {
        node.items = Some(Box::new(ShapeNode::default()));
    }
    match obj.get("x-kubernetes-list-map-keys") {
        Some(Value::Array(keys)) => {
            for k in keys {
                let k = k.as_str().ok_or_else(|| bad("list-map keys must be strings"))?;
                node.list_map_keys.push(k.to_string());
            }
        }
        Some(_) => return Err(bad("x-kubernetes-list-map-keys must be an array")),
        None => {
            if let Some(k) = obj.get("x-kubernetes-patch-merge-key").and_then(|k| k.as_str()) {
                node.list_map_keys.push(k.to_string());
            }
        }
    }
    Ok(node)
}

/// Pick the schema of the storage version (else the first served one) from a CRD document.
pub fn crd_shape(crd: &Value) -> Result<Option<(GroupKind, ShapeNode)>, SchemaError> {
    let Some(spec) = crd.get("spec") else { return Ok(None) };
    let group = spec.get("group").and_then(|s| s.as_str()).unwrap_or("");
    let Some(kind) = spec.get("names").and_then(|n| n.get("kind")).and_then(|s| s.as_str()) else { return Ok(None) };
    let versions = spec.get("versions").and_then(|vv| vv.as_array()).cloned().unwrap_or_default();
    let chosen = versions
        .iter()
        .find(|ver| ver.get("storage").and_then(|b| b.as_bool()).unwrap_or(false))
        .or_else(|| versions.iter().find(|ver| ver.get("served").and_then(|b| b.as_bool()).unwrap_or(false)));
    let schema = chosen
        .and_then(|ver| ver.get("schema"))
        .and_then(|s| s.get("openAPIV3Schema"))
        // legacy v1beta1 location
        .or_else(|| spec.get("validation").and_then(|s| s.get("openAPIV3Schema")));
    match schema {
        Some(s) => Ok(Some((GroupKind::new(group, kind), ShapeNode::from_openapi(s)?))),
        None => Ok(None),
    }
}

fn pod_spec_schema() -> Value {
    let container = serde_json::json!({
        "type": "object",
        "properties": {
            "ports": {"type": "array", "x-kubernetes-list-map-keys": ["containerPort", "protocol"],
                      "items": {"type": "object", "properties": {"containerPort": {"type": "integer"}, "protocol": {"type": "string", "default": "TCP"}}}},
            "env": {"type": "array", "x-kubernetes-patch-merge-key": "name",
                    "items": {"type": "object", "properties": {"name": {"type": "string"}}}},
            "volumeMounts": {"type": "array", "x-kubernetes-patch-merge-key": "mountPath",
                             "items": {"type": "object", "properties": {"mountPath": {"type": "string"}}}}
        }
    });
    let named = |extra: Value| {
        serde_json::json!({"type": "array", "x-kubernetes-patch-merge-key": "name", "items": extra})
    };
    serde_json::json!({
        "type": "object",
        "properties": {
            "containers": named(container.clone()),
            "initContainers": named(container.clone()),
            "ephemeralContainers": named(container),
            "volumes": named(serde_json::json!({"type": "object"})),
            "imagePullSecrets": named(serde_json::json!({"type": "object"}))
        }
    })
}

fn builtin_schemas() -> Vec<(GroupKind, Value)> {
    let pod_spec = pod_spec_schema();
    let template = serde_json::json!({"type": "object", "properties": {"spec": pod_spec.clone()}});
    let workload = serde_json::json!({
        "type": "object",
        "properties": {"spec": {"type": "object", "properties": {"template": template.clone()}}}
    });
    vec![
        (GroupKind::new("", "Pod"), serde_json::json!({"type": "object", "properties": {"spec": pod_spec}})),
        (GroupKind::new("apps", "Deployment"), workload.clone()),
        (GroupKind::new("apps", "StatefulSet"), workload.clone()),
        (GroupKind::new("apps", "DaemonSet"), workload.clone()),
        (GroupKind::new("apps", "ReplicaSet"), workload.clone()),
        (GroupKind::new("batch", "Job"), workload),
        (
            GroupKind::new("batch", "CronJob"),
            serde_json::json!({"type": "object", "properties": {"spec": {"type": "object", "properties": {
                "jobTemplate": {"type": "object", "properties": {"spec": {"type": "object", "properties": {"template": template}}}}
            }}}}),
        ),
        (
            GroupKind::new("", "Service"),
            serde_json::json!({"type": "object", "properties": {"spec": {"type": "object", "properties": {
                "ports": {"type": "array", "x-kubernetes-list-map-keys": ["port", "protocol"],
                          "items": {"type": "object", "properties": {"port": {"type": "integer"}, "protocol": {"type": "string", "default": "TCP"}}}}
            }}}}),
        ),
    ]
}

/// Shapes by group/kind: built-ins first, CRD schemas layered on top.
#[derive(Debug, Clone, Default)]
pub struct ShapeRegistry {
    shapes: FxHashMap<GroupKind, ShapeNode>,
}

impl ShapeRegistry {
    pub fn builtin() -> Self {
        let mut shapes = FxHashMap::default();
        for (gk, schema) in builtin_schemas() {
            // Built-in schemas are static literals; a parse failure is a programming error caught by tests.
            if let Ok(node) = ShapeNode::from_openapi(&schema) { shapes.insert(gk, node); }
        }
        Self { shapes }
    }

    pub fn insert(&mut self, gk: GroupKind, shape: ShapeNode) { self.shapes.insert(gk, shape); }

    pub fn get(&self, gk: &GroupKind) -> Option<&ShapeNode> { self.shapes.get(gk) }

    pub fn len(&self) -> usize { self.shapes.len() }

    pub fn is_empty(&self) -> bool { self.shapes.is_empty() }
}
