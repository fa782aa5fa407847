//! Ferry health: per-kind health strategies, user overrides, and app-level aggregation.

#![forbid(unsafe_code)]

use std::sync::Arc;

use ferry_core::{GroupKind, HealthStatus, LiveObject, ResourceHealth};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::debug;

mod builtin;
mod overrides;

pub use overrides::{HealthOverrideError, HealthRule, HealthRuleSet, ResourceOverride, RuleCheck};

/// Inputs beyond the object itself. `children` are the evaluated health of
/// direct dependents, available when the caller has an ownership graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthContext<'a> {
    pub children: &'a [ResourceHealth],
}

/// A health strategy for one group/kind.
pub trait HealthCheck: Send + Sync {
    fn evaluate(&self, obj: &Value, ctx: &HealthContext<'_>) -> ResourceHealth;
}

impl<F> HealthCheck for F
where
    F: Fn(&Value, &HealthContext<'_>) -> ResourceHealth + Send + Sync,
{
    fn evaluate(&self, obj: &Value, ctx: &HealthContext<'_>) -> ResourceHealth { self(obj, ctx) }
}

/// Health is the worst of the direct children; no children is Healthy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChildrenAggregate;

impl HealthCheck for ChildrenAggregate {
    fn evaluate(&self, _obj: &Value, ctx: &HealthContext<'_>) -> ResourceHealth {
        let worst = ctx.children.iter().max_by_key(|h| h.status.severity());
        match worst {
            Some(h) if h.status != HealthStatus::Healthy => h.clone(),
            _ => ResourceHealth::new(HealthStatus::Healthy),
        }
    }
}

/// Capability lookup keyed by group/kind. Overrides shadow built-ins; kinds
/// with neither are Healthy when present.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    builtin: FxHashMap<GroupKind, Arc<dyn HealthCheck>>,
    overrides: FxHashMap<GroupKind, Arc<dyn HealthCheck>>,
}

impl HealthRegistry {
    /// Registry with the built-in workload, storage and networking rules.
    pub fn new() -> Self {
        let mut me = Self::default();
        builtin::register_all(&mut me);
        me
    }

    /// Registry with no rules at all; every present object is Healthy.
    pub fn empty() -> Self { Self::default() }

    pub fn register(&mut self, gk: GroupKind, check: impl HealthCheck + 'static) {
        self.builtin.insert(gk, Arc::new(check));
    }

    pub fn register_override(&mut self, gk: GroupKind, check: impl HealthCheck + 'static) {
        self.overrides.insert(gk, Arc::new(check));
    }

    /// Built-ins plus the declarative overrides from the settings store.
    pub fn with_overrides(overrides: &[ResourceOverride]) -> Result<Self, HealthOverrideError> {
        let mut me = Self::new();
        for o in overrides {
            let Some(rules) = &o.health else { continue };
            let check = RuleCheck::compile(rules)?;
            debug!(gk = %o.group_kind(), "health: override registered");
            me.register_override(o.group_kind(), check);
        }
        Ok(me)
    }

    pub fn has_rule(&self, gk: &GroupKind) -> bool { self.overrides.contains_key(gk) || self.builtin.contains_key(gk) }

    /// Evaluate one present object. Never fails.
    pub fn evaluate(&self, gk: &GroupKind, obj: &Value, ctx: &HealthContext<'_>) -> ResourceHealth {
        if is_being_deleted(obj) {
            return ResourceHealth::with_message(HealthStatus::Progressing, "Pending deletion");
        }
        match self.overrides.get(gk).or_else(|| self.builtin.get(gk)) {
            Some(check) => check.evaluate(obj, ctx),
            None => ResourceHealth::new(HealthStatus::Healthy),
        }
    }

    pub fn evaluate_live(&self, live: &LiveObject, children: &[ResourceHealth]) -> ResourceHealth {
        self.evaluate(&live.key.group_kind(), &live.raw, &HealthContext { children })
    }

    /// Health of a desired resource: Missing when nothing is live, otherwise
    /// the health computed at ingest (or computed now if the cache had none).
    pub fn evaluate_desired(&self, live: Option<&LiveObject>) -> ResourceHealth {
        match live {
            None => ResourceHealth::new(HealthStatus::Missing),
            Some(lo) => lo.health.clone().unwrap_or_else(|| self.evaluate_live(lo, &[])),
        }
    }
}

impl std::fmt::Debug for HealthRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthRegistry")
            .field("builtin", &self.builtin.len())
            .field("overrides", &self.overrides.len())
            .finish()
    }
}

fn is_being_deleted(obj: &Value) -> bool {
    obj.pointer("/metadata/deletionTimestamp").map(|v| !v.is_null()).unwrap_or(false)
}

/// Worst verdict wins: Degraded > Progressing > Suspended > Missing > Unknown > Healthy.
/// An empty set is Healthy.
pub fn aggregate_app_health<I>(statuses: I) -> HealthStatus
where
    I: IntoIterator<Item = HealthStatus>,
{
    statuses.into_iter().fold(HealthStatus::Healthy, |acc, s| if s.severity() > acc.severity() { s } else { acc })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(raw: Value) -> LiveObject { LiveObject::from_raw(raw, chrono::Utc::now()).unwrap() }

    #[test]
    fn aggregation_precedence() {
        use HealthStatus::*;
        assert_eq!(aggregate_app_health([Degraded, Healthy]), Degraded);
        assert_eq!(aggregate_app_health([Healthy, Healthy]), Healthy);
        assert_eq!(aggregate_app_health(std::iter::empty()), Healthy);
        assert_eq!(aggregate_app_health([Unknown, Missing]), Missing);
        assert_eq!(aggregate_app_health([Missing, Suspended, Unknown]), Suspended);
        assert_eq!(aggregate_app_health([Suspended, Progressing]), Progressing);
    }

    #[test]
    fn unknown_kinds_are_healthy_when_present() {
        let reg = HealthRegistry::new();
        let obj = serde_json::json!({"apiVersion": "x.io/v1", "kind": "Widget", "metadata": {"name": "w"}});
        let h = reg.evaluate(&GroupKind::new("x.io", "Widget"), &obj, &HealthContext::default());
        assert_eq!(h.status, HealthStatus::Healthy);
        assert_eq!(reg.evaluate_desired(None).status, HealthStatus::Missing);
    }

    #[test]
    fn overrides_shadow_builtins() {
        let mut reg = HealthRegistry::new();
        let gk = GroupKind::new("apps", "Deployment");
        reg.register_override(gk.clone(), |_: &Value, _: &HealthContext<'_>| ResourceHealth::new(HealthStatus::Suspended));
        let obj = serde_json::json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "d"}});
        assert_eq!(reg.evaluate(&gk, &obj, &HealthContext::default()).status, HealthStatus::Suspended);
    }

    #[test]
    fn pending_deletion_is_progressing() {
        let reg = HealthRegistry::new();
        let lo = live(serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "c", "namespace": "d", "deletionTimestamp": "2024-01-01T00:00:00Z"}}));
        assert_eq!(reg.evaluate_live(&lo, &[]).status, HealthStatus::Progressing);
    }

    #[test]
    fn children_aggregate_reports_worst_child() {
        let children = [
            ResourceHealth::new(HealthStatus::Healthy),
            ResourceHealth::with_message(HealthStatus::Degraded, "CrashLoopBackOff"),
        ];
        let h = ChildrenAggregate.evaluate(&Value::Null, &HealthContext { children: &children });
        assert_eq!(h, children[1]);
        assert_eq!(ChildrenAggregate.evaluate(&Value::Null, &HealthContext::default()).status, HealthStatus::Healthy);
    }
}
