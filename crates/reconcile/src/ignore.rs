//! Field-path exclusions applied to both sides before comparison.

use std::sync::Arc;

use ferry_core::{IgnoreDifference, ResourceKey};
use ferry_schema::{FieldPath, SchemaError};
use serde_json::Value;

#[derive(Debug, Clone)]
struct Compiled {
    scope: IgnoreDifference,
    paths: Vec<FieldPath>,
}

/// Compiled ignore rules. Global rules come from settings; per-app rules are layered on top.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    rules: Vec<Arc<Compiled>>,
}

impl IgnoreRules {
    /// Strict compilation; any bad path is an error.
    pub fn compile<'a, I>(rules: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = &'a IgnoreDifference>,
    {
        let (me, mut errors) = Self::compile_lenient(rules);
        match errors.is_empty() {
            true => Ok(me),
            false => Err(errors.swap_remove(0)),
        }
    }

    /// Keep every path that parses and report the rest.
    pub fn compile_lenient<'a, I>(rules: I) -> (Self, Vec<SchemaError>)
    where
        I: IntoIterator<Item = &'a IgnoreDifference>,
    {
        let mut errors = Vec::new();
        let mut out = Vec::new();
        for rule in rules {
            let mut paths = Vec::new();
            for raw in rule.json_pointers.iter().chain(rule.field_paths.iter()) {
                match FieldPath::parse(raw) {
                    Ok(p) => paths.push(p),
                    Err(e) => errors.push(e),
                }
            }
            if !paths.is_empty() {
                out.push(Arc::new(Compiled { scope: rule.clone(), paths }));
            }
        }
        (Self { rules: out }, errors)
    }

    /// These rules followed by `other`'s.
    pub fn merged(&self, other: &IgnoreRules) -> Self {
        Self { rules: self.rules.iter().chain(other.rules.iter()).cloned().collect() }
    }

    pub fn len(&self) -> usize { self.rules.len() }
    pub fn is_empty(&self) -> bool { self.rules.is_empty() }

    /// Remove every ignored field of `doc`. Returns how many values were removed.
    pub fn apply(&self, key: &ResourceKey, doc: &mut Value) -> usize {
        self.rules
            .iter()
            .filter(|r| r.scope.applies_to(key))
            .flat_map(|r| r.paths.iter())
            .map(|p| p.remove_from(doc))
            .sum()
    }
}
