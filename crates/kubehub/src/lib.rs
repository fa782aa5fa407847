//! Ferry kubehub: discovery and watch wiring behind the `ClusterSource` seam.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Result};
use ferry_core::{ClusterId, GroupKind};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

mod kube_source;
mod memory;

pub use kube_source::{ClusterParams, KubeConnector, KubeSource};
pub use memory::{MemoryConnector, MemorySource};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
    pub watchable: bool,
}

impl DiscoveredResource {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            namespaced,
            watchable: true,
        }
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn group_kind(&self) -> GroupKind { GroupKind::new(self.group.clone(), self.kind.clone()) }
}

/// Everything learned about a cluster before watches start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryInfo {
    pub server_version: String,
    pub resources: Vec<DiscoveredResource>,
    /// Raw CustomResourceDefinition documents, used for shape metadata.
    pub crds: Vec<serde_json::Value>,
}

/// Watch stream item. `Restarted` carries a full relist of one kind.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(serde_json::Value),
    Deleted(serde_json::Value),
    Restarted(Vec<serde_json::Value>),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SourceError {
    /// Endpoint unreachable or credentials rejected.
    #[error("connection: {0}")]
    Connection(String),
    #[error("discovery: {0}")]
    Discovery(String),
    /// A running watch stream failed; the caller reconnects.
    #[error("watch: {0}")]
    Watch(String),
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, SourceError>>;

/// A remote cluster API as seen by the cache.
#[async_trait::async_trait]
pub trait ClusterSource: Send + Sync {
    async fn server_version(&self) -> Result<String, SourceError>;

    /// Enumerate served kinds (incl. CRDs).
    async fn discover(&self) -> Result<DiscoveryInfo, SourceError>;

    /// Open a list+watch stream for one kind across all namespaces.
    /// The first item of a healthy stream is `Restarted` with the full list.
    fn watch(&self, resource: &DiscoveredResource) -> WatchStream;
}

/// Builds a `ClusterSource` for a cluster identity, using connection parameters
/// from the settings store.
#[async_trait::async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, cluster: &ClusterId) -> Result<Arc<dyn ClusterSource>, SourceError>;
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<(String, String, String)> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok((String::new(), (*version).to_string(), (*kind).to_string())),
        [group, version, kind] => Ok(((*group).to_string(), (*version).to_string(), (*kind).to_string())),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Remove fields the cache never needs to hold.
pub fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_keys_round_trip_through_parser() {
        let core = DiscoveredResource::new("", "v1", "ConfigMap", "configmaps", true);
        assert_eq!(core.gvk_key(), "v1/ConfigMap");
        assert_eq!(core.api_version(), "v1");
        let apps = DiscoveredResource::new("apps", "v1", "Deployment", "deployments", true);
        assert_eq!(parse_gvk_key(&apps.gvk_key()).unwrap(), ("apps".into(), "v1".into(), "Deployment".into()));
        assert!(parse_gvk_key("a/b/c/d").is_err());
    }
}
