//! Settings store and input files.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ferry_core::{Application, IgnoreDifference};
use ferry_health::ResourceOverride;
use ferry_kubehub::{ClusterParams, DiscoveredResource, MemorySource};
use ferry_reconcile::parse_manifests;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

/// ```yaml
/// clusters:
///   - server: https://prod.example:6443
///     name: prod
///     kubeconfig: /etc/ferry/prod.kubeconfig
///     context: admin@prod
/// ignoreDifferences:
///   - group: apps
///     kind: Deployment
///     jsonPointers: [/spec/replicas]
/// resourceOverrides: []
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub clusters: Vec<ClusterParams>,
    #[serde(default)]
    pub ignore_differences: Vec<IgnoreDifference>,
    #[serde(default)]
    pub resource_overrides: Vec<ResourceOverride>,
}

impl Settings {
    /// Missing path means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else { return Ok(Self::default()) };
        let text = std::fs::read_to_string(path).with_context(|| format!("reading settings {}", path.display()))?;
        let s: Settings = serde_yaml::from_str(&text).with_context(|| format!("parsing settings {}", path.display()))?;
        info!(clusters = s.clusters.len(), ignore_rules = s.ignore_differences.len(), overrides = s.resource_overrides.len(), "settings: loaded");
        Ok(s)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AppsFile {
    Wrapped { applications: Vec<Application> },
    Bare(Vec<Application>),
}

/// Accepts `applications: [...]` or a bare sequence.
pub fn load_apps(path: &Path) -> Result<Vec<Application>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading applications {}", path.display()))?;
    let file: AppsFile = serde_yaml::from_str(&text).with_context(|| format!("parsing applications {}", path.display()))?;
    Ok(match file {
        AppsFile::Wrapped { applications } => applications,
        AppsFile::Bare(apps) => apps,
    })
}

/// A scripted cluster populated from every YAML/JSON file in `dir`.
/// Kinds not built in are registered from the objects themselves.
pub fn load_live_dir(dir: &Path) -> Result<MemorySource> {
    let src = MemorySource::new("offline").with_builtin_kinds();
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading live dir {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml" | "json")))
        .collect();
    files.sort();
    let mut count = 0usize;
    for path in files {
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let docs = parse_manifests(&text).map_err(|e| anyhow!("parsing {}: {}", path.display(), e))?;
        for d in docs {
            register_kind(&src, &d.raw);
            src.apply(d.raw);
            count += 1;
        }
        debug!(file = %path.display(), "offline: file loaded");
    }
    info!(dir = %dir.display(), objects = count, "offline: live state loaded");
    Ok(src)
}

fn register_kind(src: &MemorySource, raw: &Value) {
    let text = |p: &str| raw.pointer(p).and_then(Value::as_str).unwrap_or("");
    if text("/kind") == "CustomResourceDefinition" {
        let version = raw.pointer("/spec/versions/0/name").and_then(Value::as_str).unwrap_or("v1");
        src.add_resource(DiscoveredResource::new(
            text("/spec/group"),
            version,
            text("/spec/names/kind"),
            text("/spec/names/plural"),
            text("/spec/scope") != "Cluster",
        ));
        src.add_crd(raw.clone());
    }
    let (kind, api_version) = (text("/kind"), text("/apiVersion"));
    if kind.is_empty() || api_version.is_empty() { return }
    let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
    let namespaced = !text("/metadata/namespace").is_empty();
    src.add_resource(DiscoveredResource::new(group, version, kind, &format!("{}s", kind.to_ascii_lowercase()), namespaced));
}
