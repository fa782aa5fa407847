use serde::{Deserialize, Serialize};

use crate::{ClusterId, ResourceKey};

/// Error taxonomy shared by the cache, registry, and reconciliation engine.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum FerryError {
    /// Cluster unreachable or credentials rejected.
    #[error("connection to cluster {cluster}: {message}")]
    Connection { cluster: ClusterId, message: String },
    /// Resource kinds could not be enumerated.
    #[error("discovery on cluster {cluster}: {message}")]
    Discovery { cluster: ClusterId, message: String },
    /// Cache is still populating; retry shortly.
    #[error("live data for cluster {cluster} is still syncing")]
    IncompleteLiveData { cluster: ClusterId },
    #[error("manifests unavailable for {app}: {message}")]
    ManifestUnavailable { app: String, message: String },
    /// The registry tore the cache down; re-fetch it.
    #[error("cache for cluster {cluster} is closed")]
    CacheClosed { cluster: ClusterId },
    /// Scoped to one resource.
    #[error("cannot compare {key}: {message}")]
    Comparison { key: ResourceKey, message: String },
    #[error("operation cancelled")]
    Cancelled,
}

impl FerryError {
    /// Whether the caller should simply try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FerryError::Connection { .. } | FerryError::IncompleteLiveData { .. } | FerryError::CacheClosed { .. })
    }
}

pub type FerryResult<T> = Result<T, FerryError>;
