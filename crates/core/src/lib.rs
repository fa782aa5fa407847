//! Ferry core types: resource identity, live objects, diff and verdict records.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

pub mod config;
pub mod error;

pub use error::{FerryError, FerryResult};

pub type Uid = [u8; 16];

/// Parse a `metadata.uid` string into its binary form.
pub fn parse_uid(uid_str: &str) -> Option<Uid> {
    uuid::Uuid::parse_str(uid_str).ok().map(|u| *u.as_bytes())
}

/// API group plus kind; the version is deliberately not part of identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct GroupKind {
    #[serde(default)]
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), kind: kind.into() }
    }

    /// Split `apps/v1` style apiVersion into its group; core (`v1`) maps to "".
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let group = api_version.split_once('/').map(|(g, _)| g).unwrap_or("");
        Self::new(group, kind)
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() { write!(f, "{}", self.kind) } else { write!(f, "{}.{}", self.kind, self.group) }
    }
}

/// Identity of one object within a cluster. Cluster-scoped objects carry an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(group: impl Into<String>, kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { group: group.into(), kind: kind.into(), namespace: namespace.into(), name: name.into() }
    }

    /// Build a key from a raw document (`apiVersion`, `kind`, `metadata.name/namespace`).
    pub fn from_object(raw: &Value) -> Option<Self> {
        let api_version = raw.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
        let kind = raw.get("kind").and_then(|v| v.as_str())?;
        let meta = raw.get("metadata")?;
        let name = meta.get("name").and_then(|v| v.as_str())?;
        if kind.is_empty() || name.is_empty() { return None; }
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).unwrap_or("");
        let gk = GroupKind::from_api_version(api_version, kind);
        Some(Self::new(gk.group, gk.kind, namespace, name))
    }

    pub fn group_kind(&self) -> GroupKind { GroupKind::new(self.group.clone(), self.kind.clone()) }

    pub fn is_cluster_scoped(&self) -> bool { self.namespace.is_empty() }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.group, self.kind, self.namespace, self.name)
    }
}

/// Parsed `metadata.ownerReferences` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: Option<Uid>,
    pub controller: bool,
}

impl OwnerRef {
    /// Owners live in the dependent's namespace, or are cluster-scoped.
    pub fn key_in(&self, namespace: &str) -> ResourceKey {
        let gk = GroupKind::from_api_version(&self.api_version, &self.kind);
        ResourceKey::new(gk.group, gk.kind, namespace, self.name.clone())
    }
}

/// Directed owner → dependent relation derived from owner references.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnershipEdge {
    pub owner: ResourceKey,
    pub dependent: ResourceKey,
}

/// Last observed state of one object on a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveObject {
    pub key: ResourceKey,
    pub uid: Option<Uid>,
    pub resource_version: String,
    pub owners: SmallVec<[OwnerRef; 2]>,
    pub observed_at: DateTime<Utc>,
    /// Health computed at ingest time; `None` until evaluated.
    pub health: Option<ResourceHealth>,
    pub raw: Value,
}

impl LiveObject {
    pub fn from_raw(mut raw: Value, observed_at: DateTime<Utc>) -> Option<Self> {
        #[cfg(feature = "strip-managed-fields")]
        if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.remove("managedFields");
        }
        let key = ResourceKey::from_object(&raw)?;
        let meta = raw.get("metadata")?;
        let uid = meta.get("uid").and_then(|v| v.as_str()).and_then(parse_uid);
        let resource_version = meta.get("resourceVersion").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let mut owners: SmallVec<[OwnerRef; 2]> = SmallVec::new();
        if let Some(refs) = meta.get("ownerReferences").and_then(|v| v.as_array()) {
            for r in refs {
                let (Some(api_version), Some(kind), Some(name)) = (
                    r.get("apiVersion").and_then(|v| v.as_str()),
                    r.get("kind").and_then(|v| v.as_str()),
                    r.get("name").and_then(|v| v.as_str()),
                ) else { continue };
                owners.push(OwnerRef {
                    api_version: api_version.to_string(),
                    kind: kind.to_string(),
                    name: name.to_string(),
                    uid: r.get("uid").and_then(|v| v.as_str()).and_then(parse_uid),
                    controller: r.get("controller").and_then(|v| v.as_bool()).unwrap_or(false),
                });
            }
        }
        Some(Self { key, uid, resource_version, owners, observed_at, health: None, raw })
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.raw.get("metadata")?.get("labels")?.get(key)?.as_str()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.raw.get("metadata")?.get("annotations")?.get(key)?.as_str()
    }

    pub fn is_top_level(&self) -> bool { self.owners.is_empty() }
}

/// Compare two resourceVersions. Versions are opaque strings, but every
/// etcd-backed server hands out integers; anything else is treated as unordered.
pub fn rv_is_older(candidate: &str, current: &str) -> bool {
    match (candidate.parse::<u64>(), current.parse::<u64>()) {
        (Ok(a), Ok(b)) => a < b,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// One watch-derived change for a single object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub kind: DeltaKind,
    pub raw: Value,
}

// ---- health ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Progressing,
    Degraded,
    Suspended,
    Missing,
    Unknown,
}

impl HealthStatus {
    /// Higher is worse: Degraded > Progressing > Suspended > Missing > Unknown > Healthy.
    pub fn severity(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Unknown => 1,
            HealthStatus::Missing => 2,
            HealthStatus::Suspended => 3,
            HealthStatus::Progressing => 4,
            HealthStatus::Degraded => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "Healthy",
            HealthStatus::Progressing => "Progressing",
            HealthStatus::Degraded => "Degraded",
            HealthStatus::Suspended => "Suspended",
            HealthStatus::Missing => "Missing",
            HealthStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "healthy" => Ok(HealthStatus::Healthy),
            "progressing" => Ok(HealthStatus::Progressing),
            "degraded" => Ok(HealthStatus::Degraded),
            "suspended" => Ok(HealthStatus::Suspended),
            "missing" => Ok(HealthStatus::Missing),
            "unknown" => Ok(HealthStatus::Unknown),
            other => Err(format!("unknown health status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHealth {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResourceHealth {
    pub fn new(status: HealthStatus) -> Self { Self { status, message: None } }

    pub fn with_message(status: HealthStatus, message: impl Into<String>) -> Self {
        Self { status, message: Some(message.into()) }
    }
}

// ---- application model ----

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSource {
    #[serde(rename = "repoURL", default)]
    pub repo_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Destination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// How an application claims ownership of live objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "method", content = "key", rename_all = "camelCase")]
pub enum TrackingMethod {
    Label(String),
    /// Annotation value is `<app>` or `<app>:<anything>`.
    Annotation(String),
}

impl Default for TrackingMethod {
    fn default() -> Self { TrackingMethod::Label(DEFAULT_TRACKING_LABEL.to_string()) }
}

pub const DEFAULT_TRACKING_LABEL: &str = "app.kubernetes.io/instance";

/// Live-object selector derived from an application's tracking method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedSelector {
    pub tracking: TrackingMethod,
    pub app: String,
}

impl ManagedSelector {
    pub fn new(tracking: TrackingMethod, app: impl Into<String>) -> Self {
        Self { tracking, app: app.into() }
    }

    pub fn matches(&self, obj: &LiveObject) -> bool {
        match &self.tracking {
            TrackingMethod::Label(k) => obj.label(k) == Some(self.app.as_str()),
            TrackingMethod::Annotation(k) => obj
                .annotation(k)
                .map(|v| v.split(':').next() == Some(self.app.as_str()))
                .unwrap_or(false),
        }
    }
}

/// Field-path exclusion scoped to a group/kind and optionally a name/namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IgnoreDifference {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub json_pointers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_paths: Vec<String>,
}

impl IgnoreDifference {
    pub fn applies_to(&self, key: &ResourceKey) -> bool {
        (self.kind == "*" || self.kind == key.kind)
            && (self.group == "*" || self.group == key.group)
            && self.name.as_deref().map(|n| n == key.name).unwrap_or(true)
            && self.namespace.as_deref().map(|n| n == key.namespace).unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub name: String,
    #[serde(default)]
    pub source: AppSource,
    #[serde(default)]
    pub destination: Destination,
    #[serde(default)]
    pub tracking: TrackingMethod,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_differences: Vec<IgnoreDifference>,
}

impl Application {
    pub fn selector(&self) -> ManagedSelector { ManagedSelector::new(self.tracking.clone(), self.name.clone()) }

    pub fn compared_to(&self) -> ComparedTo {
        ComparedTo { source: self.source.clone(), destination: self.destination.clone() }
    }

    /// Cluster identity: server URL, else the destination name.
    pub fn cluster_id(&self) -> Option<ClusterId> {
        self.destination
            .server
            .clone()
            .or_else(|| self.destination.name.clone())
            .filter(|s| !s.is_empty())
            .map(ClusterId)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub String);

impl ClusterId {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// One rendered manifest for an application. Immutable for the duration of a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredManifest {
    pub raw: Value,
}

impl DesiredManifest {
    pub fn new(raw: Value) -> Self { Self { raw } }
    pub fn key(&self) -> Option<ResourceKey> { ResourceKey::from_object(&self.raw) }
}

// ---- sync ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatusCode {
    Synced,
    OutOfSync,
    Unknown,
}

impl fmt::Display for SyncStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncStatusCode::Synced => "Synced",
            SyncStatusCode::OutOfSync => "OutOfSync",
            SyncStatusCode::Unknown => "Unknown",
        })
    }
}

/// Which desired source/destination produced a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ComparedTo {
    pub source: AppSource,
    pub destination: Destination,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub status: SyncStatusCode,
    pub compared_to: ComparedTo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

// ---- diff results ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiffKind {
    InSync,
    Modified,
    /// Live only.
    Added,
    /// Desired only, not yet applied.
    Missing,
    OrphanIgnored,
    /// Comparison failed for this resource.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldChange {
    Added,
    Removed,
    Changed,
}

/// One differing field. `Added` means present in desired but not live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub path: String,
    pub change: FieldChange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDiffResult {
    pub key: ResourceKey,
    pub kind: DiffKind,
    /// Normalized desired document.
    pub desired: Option<Value>,
    /// Normalized live document.
    pub live: Option<Value>,
    pub diffs: Vec<FieldDiff>,
    pub summary: DiffSummary,
    pub health: Option<ResourceHealth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    ComparisonError,
    ManifestUnavailable,
    ClusterUnavailable,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppCondition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    pub message: String,
}

impl AppCondition {
    pub fn new(kind: ConditionType, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

/// Verdict for one application from one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppReconcileResult {
    pub name: String,
    pub health: HealthStatus,
    pub sync: SyncStatus,
    pub resources: Vec<ResourceDiffResult>,
    pub conditions: Vec<AppCondition>,
    pub observed_at: DateTime<Utc>,
}

impl AppReconcileResult {
    /// A degraded verdict carrying no resource information.
    pub fn unknown(app: &Application, condition: AppCondition) -> Self {
        Self {
            name: app.name.clone(),
            health: HealthStatus::Unknown,
            sync: SyncStatus { status: SyncStatusCode::Unknown, compared_to: app.compared_to(), revision: app.source.target_revision.clone() },
            resources: Vec::new(),
            conditions: vec![condition],
            observed_at: Utc::now(),
        }
    }

    /// Equality ignoring observation timestamps.
    pub fn same_verdict(&self, other: &Self) -> bool {
        self.name == other.name
            && self.health == other.health
            && self.sync == other.sync
            && self.resources == other.resources
            && self.conditions == other.conditions
    }
}

pub mod prelude {
    pub use super::{
        AppCondition, AppReconcileResult, Application, ClusterId, ComparedTo, ConditionType, Delta, DeltaKind,
        DesiredManifest, DiffKind, DiffSummary, FieldChange, FieldDiff, FerryError, FerryResult, GroupKind,
        HealthStatus, LiveObject, ManagedSelector, ResourceDiffResult, ResourceHealth, ResourceKey, SyncStatus,
        SyncStatusCode, Uid,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(labels: serde_json::Value, owners: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "namespace": "default",
                "uid": "00000000-0000-0000-0000-000000000001",
                "resourceVersion": "42",
                "labels": labels,
                "ownerReferences": owners,
                "managedFields": [{"manager": "kubectl"}]
            }
        })
    }

    #[test]
    fn key_from_object_splits_group() {
        let raw = obj(serde_json::json!({}), serde_json::json!([]));
        let key = ResourceKey::from_object(&raw).unwrap();
        assert_eq!(key, ResourceKey::new("apps", "Deployment", "default", "web"));
        assert_eq!(key.to_string(), "apps/Deployment/default/web");
        let core = serde_json::json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "ns"}});
        let key = ResourceKey::from_object(&core).unwrap();
        assert!(key.group.is_empty());
        assert!(key.is_cluster_scoped());
    }

    #[test]
    fn live_object_parses_owners_and_strips_managed_fields() {
        let raw = obj(
            serde_json::json!({"app.kubernetes.io/instance": "guestbook"}),
            serde_json::json!([{"apiVersion": "apps/v1", "kind": "ReplicaSet", "name": "rs", "controller": true,
                                 "uid": "00000000-0000-0000-0000-000000000002"}]),
        );
        let lo = LiveObject::from_raw(raw, Utc::now()).unwrap();
        assert_eq!(lo.resource_version, "42");
        assert_eq!(lo.owners.len(), 1);
        assert!(lo.owners[0].controller);
        assert_eq!(lo.owners[0].key_in("default"), ResourceKey::new("apps", "ReplicaSet", "default", "rs"));
        assert!(lo.raw["metadata"].get("managedFields").is_none());
        assert!(!lo.is_top_level());
    }

    #[test]
    fn selector_matches_label_and_annotation() {
        let raw = obj(serde_json::json!({"app.kubernetes.io/instance": "guestbook"}), serde_json::json!([]));
        let lo = LiveObject::from_raw(raw, Utc::now()).unwrap();
        assert!(ManagedSelector::new(TrackingMethod::default(), "guestbook").matches(&lo));
        assert!(!ManagedSelector::new(TrackingMethod::default(), "other").matches(&lo));

        let mut raw = obj(serde_json::json!({}), serde_json::json!([]));
        raw["metadata"]["annotations"] = serde_json::json!({"ferry.io/tracking-id": "guestbook:apps/Deployment:default/web"});
        let lo = LiveObject::from_raw(raw, Utc::now()).unwrap();
        assert!(ManagedSelector::new(TrackingMethod::Annotation("ferry.io/tracking-id".into()), "guestbook").matches(&lo));
    }

    #[test]
    fn resource_versions_compare_numerically() {
        assert!(rv_is_older("9", "10"));
        assert!(!rv_is_older("10", "10"));
        assert!(!rv_is_older("abc", "10"));
    }

    #[test]
    fn health_severity_order() {
        let order = [
            HealthStatus::Healthy,
            HealthStatus::Unknown,
            HealthStatus::Missing,
            HealthStatus::Suspended,
            HealthStatus::Progressing,
            HealthStatus::Degraded,
        ];
        for w in order.windows(2) { assert!(w[0].severity() < w[1].severity()); }
        assert_eq!("degraded".parse::<HealthStatus>(), Ok(HealthStatus::Degraded));
    }

    #[test]
    fn ignore_difference_scoping() {
        let rule = IgnoreDifference { group: "apps".into(), kind: "Deployment".into(), name: Some("web".into()), ..Default::default() };
        assert!(rule.applies_to(&ResourceKey::new("apps", "Deployment", "default", "web")));
        assert!(!rule.applies_to(&ResourceKey::new("apps", "Deployment", "default", "api")));
        assert!(!rule.applies_to(&ResourceKey::new("", "Service", "default", "web")));
    }
}
