//! Ferry schema: resource kinds a cluster serves, their scope, and their structural shape.

#![forbid(unsafe_code)]

use ferry_core::GroupKind;
use ferry_kubehub::{DiscoveredResource, DiscoveryInfo};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

mod path;
mod shape;

pub use path::{FieldPath, Segment};
pub use shape::{crd_shape, FieldType, ShapeNode, ShapeRegistry};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("invalid field path: {0}")]
    InvalidPath(String),
    #[error("malformed schema at {at}: {message}")]
    Malformed { at: String, message: String },
}

/// Namespace scoping of a kind. `Unknown` when the kind was never discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KindScope {
    Namespaced,
    Cluster,
    Unknown,
}

/// Cluster metadata exposed to reporting layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionsInfo {
    pub server_version: String,
    pub api_versions: Vec<String>,
}

/// Discovery result for one cluster, indexed for lookups.
#[derive(Debug, Clone, Default)]
pub struct ResourceTypes {
    server_version: String,
    resources: Vec<DiscoveredResource>,
    by_gk: FxHashMap<GroupKind, usize>,
    shapes: ShapeRegistry,
}

impl ResourceTypes {
    pub fn from_discovery(info: &DiscoveryInfo) -> Self {
        let mut resources = Vec::with_capacity(info.resources.len());
        let mut by_gk = FxHashMap::default();
        for r in info.resources.iter() {
            // First served version wins; discovery already lists the preferred one first.
            if by_gk.contains_key(&r.group_kind()) { continue; }
            by_gk.insert(r.group_kind(), resources.len());
            resources.push(r.clone());
        }
        let mut shapes = ShapeRegistry::builtin();
        for crd in info.crds.iter() {
            match crd_shape(crd) {
                Ok(Some((gk, shape))) => shapes.insert(gk, shape),
                Ok(None) => {}
                Err(e) => {
                    let name = crd.pointer("/metadata/name").and_then(|v| v.as_str()).unwrap_or("?");
                    warn!(crd = %name, error = %e, "skipping CRD with malformed schema");
                }
            }
        }
        debug!(kinds = resources.len(), shapes = shapes.len(), "resource types indexed");
        Self { server_version: info.server_version.clone(), resources, by_gk, shapes }
    }

    pub fn scope(&self, gk: &GroupKind) -> KindScope {
        match self.by_gk.get(gk) {
            Some(&i) if self.resources[i].namespaced => KindScope::Namespaced,
            Some(_) => KindScope::Cluster,
            None => KindScope::Unknown,
        }
    }

    pub fn resource(&self, gk: &GroupKind) -> Option<&DiscoveredResource> {
        self.by_gk.get(gk).map(|&i| &self.resources[i])
    }

    pub fn resources(&self) -> &[DiscoveredResource] { &self.resources }

    /// Kinds a cache should open watches for.
    pub fn watchable(&self) -> impl Iterator<Item = &DiscoveredResource> {
        self.resources.iter().filter(|r| r.watchable)
    }

    pub fn shape(&self, gk: &GroupKind) -> Option<&ShapeNode> { self.shapes.get(gk) }

    pub fn versions_info(&self) -> VersionsInfo {
        let mut api_versions: Vec<String> = self.resources.iter().map(|r| r.api_version()).collect();
        api_versions.sort();
        api_versions.dedup();
        VersionsInfo { server_version: self.server_version.clone(), api_versions }
    }
}
