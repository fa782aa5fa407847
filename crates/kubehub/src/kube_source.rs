use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use ferry_core::ClusterId;
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiextv1;
use kube::{
    api::{Api, ListParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject},
    discovery::{verbs, Discovery, Scope},
    runtime::watcher::{self, Event},
    Client, Config,
};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{strip_managed_fields, ClusterConnector, ClusterSource, DiscoveredResource, DiscoveryInfo, SourceError, WatchEvent, WatchStream};

/// Connection parameters for one cluster, as held by the settings store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterParams {
    /// Cluster identity (the API server URL applications point at).
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// `ClusterSource` backed by a kube-rs client.
pub struct KubeSource {
    client: Client,
}

impl KubeSource {
    pub fn from_client(client: Client) -> Self { Self { client } }

    pub async fn connect(params: &ClusterParams) -> Result<Self, SourceError> {
        let config = match &params.kubeconfig {
            Some(path) => {
                let kc = Kubeconfig::read_from(path)
                    .map_err(|e| SourceError::Connection(format!("reading kubeconfig {}: {}", path.display(), e)))?;
                let opts = KubeConfigOptions { context: params.context.clone(), ..Default::default() };
                Config::from_custom_kubeconfig(kc, &opts)
                    .await
                    .map_err(|e| SourceError::Connection(format!("loading kubeconfig: {}", e)))?
            }
            None => Config::infer().await.map_err(|e| SourceError::Connection(format!("inferring config: {}", e)))?,
        };
        let client = Client::try_from(config).map_err(|e| SourceError::Connection(e.to_string()))?;
        Ok(Self { client })
    }
}

fn classify_discovery(e: kube::Error) -> SourceError {
    match &e {
        kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => {
            SourceError::Connection(format!("credentials rejected: {}", ae.message))
        }
        kube::Error::Api(_) => SourceError::Discovery(e.to_string()),
        _ => SourceError::Connection(e.to_string()),
    }
}

/// List items come back without TypeMeta; fill it in so keys can be derived.
fn object_value(obj: &DynamicObject, api_version: &str, kind: &str) -> Result<serde_json::Value, SourceError> {
    let mut raw = serde_json::to_value(obj).map_err(|e| SourceError::Watch(format!("serializing DynamicObject: {}", e)))?;
    if let Some(map) = raw.as_object_mut() {
        map.entry("apiVersion").or_insert_with(|| serde_json::Value::String(api_version.to_string()));
        map.entry("kind").or_insert_with(|| serde_json::Value::String(kind.to_string()));
    }
    strip_managed_fields(&mut raw);
    Ok(raw)
}

#[async_trait::async_trait]
impl ClusterSource for KubeSource {
    async fn server_version(&self) -> Result<String, SourceError> {
        let info = self.client.apiserver_version().await.map_err(|e| match &e {
            kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => {
                SourceError::Connection(format!("credentials rejected: {}", ae.message))
            }
            _ => SourceError::Connection(e.to_string()),
        })?;
        Ok(info.git_version)
    }

    async fn discover(&self) -> Result<DiscoveryInfo, SourceError> {
        let t0 = Instant::now();
        let server_version = self.server_version().await?;
        let discovery = Discovery::new(self.client.clone()).run().await.map_err(classify_discovery)?;
        let mut resources = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                resources.push(DiscoveredResource {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    kind: ar.kind.clone(),
                    plural: ar.plural.clone(),
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                    watchable: caps.supports_operation(verbs::WATCH) && caps.supports_operation(verbs::LIST),
                });
            }
        }
        resources.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));

        // CRD schemas are optional shape metadata; RBAC may forbid listing them.
        let api: Api<apiextv1::CustomResourceDefinition> = Api::all(self.client.clone());
        let crds = match api.list(&ListParams::default()).await {
            Ok(list) => list.items.iter().filter_map(|crd| serde_json::to_value(crd).ok()).collect(),
            Err(e) => {
                warn!(error = %e, "listing CustomResourceDefinitions failed; continuing without CRD shapes");
                Vec::new()
            }
        };
        histogram!("kubehub_discovery_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(version = %server_version, kinds = resources.len(), crds = crds.len(), took_ms = %t0.elapsed().as_millis(), "kubehub: discovery ok");
        Ok(DiscoveryInfo { server_version, resources, crds })
    }

    fn watch(&self, resource: &DiscoveredResource) -> WatchStream {
        let api_version = resource.api_version();
        let kind = resource.kind.clone();
        let ar = ApiResource {
            group: resource.group.clone(),
            version: resource.version.clone(),
            api_version: api_version.clone(),
            kind: kind.clone(),
            plural: resource.plural.clone(),
        };
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        debug!(gvk = %resource.gvk_key(), "kubehub: opening watch");
        counter!("kubehub_watches_opened", 1u64);
        watcher::watcher(api, watcher::Config::default())
            .map(move |ev| match ev {
                Ok(Event::Applied(o)) => object_value(&o, &api_version, &kind).map(WatchEvent::Applied),
                Ok(Event::Deleted(o)) => object_value(&o, &api_version, &kind).map(WatchEvent::Deleted),
                Ok(Event::Restarted(list)) => {
                    counter!("kubehub_watch_relists", 1u64);
                    list.iter()
                        .map(|o| object_value(o, &api_version, &kind))
                        .collect::<Result<Vec<_>, _>>()
                        .map(WatchEvent::Restarted)
                }
                Err(e) => {
                    counter!("kubehub_watch_errors", 1u64);
                    Err(SourceError::Watch(e.to_string()))
                }
            })
            .boxed()
    }
}

/// Connects clusters using parameters from the settings store.
#[derive(Default)]
pub struct KubeConnector {
    clusters: FxHashMap<ClusterId, ClusterParams>,
}

impl KubeConnector {
    pub fn new(params: impl IntoIterator<Item = ClusterParams>) -> Self {
        let mut clusters = FxHashMap::default();
        for p in params {
            let id = ClusterId::new(p.server.clone());
            if let Some(name) = p.name.clone() { clusters.insert(ClusterId::new(name), p.clone()); }
            clusters.insert(id, p);
        }
        Self { clusters }
    }
}

#[async_trait::async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, cluster: &ClusterId) -> Result<Arc<dyn ClusterSource>, SourceError> {
        let params = self
            .clusters
            .get(cluster)
            .ok_or_else(|| SourceError::Connection(format!("no connection parameters for {}", cluster)))?;
        let source = KubeSource::connect(params).await.map_err(|e| {
            counter!("kubehub_connect_errors", 1u64);
            e
        })?;
        Ok(Arc::new(source))
    }
}
