//! Declarative health rules bound to a kind from the settings store.
//!
//! ```yaml
//! resourceOverrides:
//!   - group: cert-manager.io
//!     kind: Certificate
//!     health:
//!       rules:
//!         - path: /status/conditions/0/status
//!           equals: "False"
//!           status: Degraded
//!           messageFrom: /status/conditions/0/message
//!       statusFrom: /metadata/annotations/health
//!       default: Progressing
//! ```
//!
//! Evaluation order: `rules` (first match wins), then `statusFrom`, then
//! `aggregateChildren`, then `default`.

use ferry_core::{GroupKind, HealthStatus, ResourceHealth};
use ferry_schema::{FieldPath, SchemaError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ChildrenAggregate, HealthCheck, HealthContext};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum HealthOverrideError {
    #[error("health override path {path:?}: {source}")]
    Path { path: String, source: SchemaError },
    #[error("health override rule has neither `equals` nor `exists`: {0}")]
    EmptyRule(String),
}

/// One `resourceOverrides` entry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOverride {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthRuleSet>,
}

impl ResourceOverride {
    pub fn group_kind(&self) -> GroupKind { GroupKind::new(self.group.clone(), self.kind.clone()) }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRuleSet {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<HealthRule>,
    /// Path to a string holding a health status name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_from: Option<String>,
    #[serde(default)]
    pub aggregate_children: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<HealthStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRule {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_from: Option<String>,
}

#[derive(Debug, Clone)]
enum Matcher {
    Equals(Value),
    Exists(bool),
}

#[derive(Debug, Clone)]
struct CompiledRule {
    path: FieldPath,
    matcher: Matcher,
    status: HealthStatus,
    message: Option<String>,
    message_from: Option<FieldPath>,
}

impl CompiledRule {
    fn matches(&self, obj: &Value) -> bool {
        let found = self.path.get(obj);
        match &self.matcher {
            Matcher::Equals(want) => found.map(|v| loosely_equal(v, want)).unwrap_or(false),
            Matcher::Exists(want) => found.map(|v| !v.is_null()).unwrap_or(false) == *want,
        }
    }

    fn verdict(&self, obj: &Value) -> ResourceHealth {
        let from = self.message_from.as_ref().and_then(|p| p.get(obj)).and_then(|v| v.as_str()).map(|s| s.to_string());
        ResourceHealth { status: self.status, message: from.or_else(|| self.message.clone()) }
    }
}

/// Scalars written in YAML ("3", "true") match their typed counterparts.
fn loosely_equal(found: &Value, want: &Value) -> bool {
    if found == want { return true; }
    match (found, want) {
        (Value::String(s), other) | (other, Value::String(s)) if !other.is_string() => match other {
            Value::Number(n) => s.parse::<f64>().ok() == n.as_f64(),
            Value::Bool(b) => s.parse::<bool>().ok() == Some(*b),
            _ => false,
        },
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => false,
    }
}

/// Compiled `HealthRuleSet`.
#[derive(Debug, Clone)]
pub struct RuleCheck {
    rules: Vec<CompiledRule>,
    status_from: Option<FieldPath>,
    aggregate_children: bool,
    default: HealthStatus,
}

impl RuleCheck {
    pub fn compile(set: &HealthRuleSet) -> Result<Self, HealthOverrideError> {
        let path = |raw: &str| FieldPath::parse(raw).map_err(|source| HealthOverrideError::Path { path: raw.to_string(), source });
        let mut rules = Vec::with_capacity(set.rules.len());
        for r in set.rules.iter() {
            let matcher = match (&r.equals, r.exists) {
                (Some(v), _) => Matcher::Equals(v.clone()),
                (None, Some(b)) => Matcher::Exists(b),
                (None, None) => return Err(HealthOverrideError::EmptyRule(r.path.clone())),
            };
            rules.push(CompiledRule {
                path: path(&r.path)?,
                matcher,
                status: r.status,
                message: r.message.clone(),
                message_from: r.message_from.as_deref().map(path).transpose()?,
            });
        }
        Ok(Self {
            rules,
            status_from: set.status_from.as_deref().map(path).transpose()?,
            aggregate_children: set.aggregate_children,
            default: set.default.unwrap_or(HealthStatus::Healthy),
        })
    }
}

impl HealthCheck for RuleCheck {
    fn evaluate(&self, obj: &Value, ctx: &HealthContext<'_>) -> ResourceHealth {
        if let Some(rule) = self.rules.iter().find(|r| r.matches(obj)) {
            return rule.verdict(obj);
        }
        if let Some(path) = &self.status_from {
            if let Some(raw) = path.get(obj).and_then(|v| v.as_str()) {
                return match raw.parse::<HealthStatus>() {
                    Ok(status) => ResourceHealth::new(status),
                    Err(e) => ResourceHealth::with_message(HealthStatus::Unknown, e),
                };
            }
        }
        if self.aggregate_children && !ctx.children.is_empty() {
            return ChildrenAggregate.evaluate(obj, ctx);
        }
        ResourceHealth::new(self.default)
    }
}
