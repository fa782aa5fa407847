//! Ferry store: watch-backed per-cluster caches and the registry that owns them.
//!
//! Each cache has exactly one writer (its ingest task). Watches feed deltas
//! through a bounded channel into a coalescer; batches are applied on a short
//! tick and published as immutable [`ClusterSnapshot`]s through `ArcSwap`.

#![forbid(unsafe_code)]

mod backoff;
mod cache;
mod coalesce;
mod graph;
mod registry;
mod state;

pub use backoff::Backoff;
pub use cache::{CacheState, ClusterCache};
pub use coalesce::Coalescer;
pub use graph::OwnershipGraph;
pub use registry::CacheRegistry;
pub use state::{ApplyStats, ClusterSnapshot, ClusterState};
