//! Ferry reconcile: per-application comparison of desired manifests against
//! the live cache, and the offline differ for whole result sets.

#![forbid(unsafe_code)]

pub mod compare;
pub mod differ;
mod engine;
pub mod ignore;
pub mod manifests;
pub mod normalize;

pub use compare::{diff_documents, CompareContext};
pub use differ::{diff_results, normal_diff, render_record, ReconcileRecord, ReconcileResults};
pub use engine::{aggregate_sync, needs_refresh, ReconcileEngine};
pub use ignore::IgnoreRules;
pub use manifests::{parse_manifests, DirManifestGenerator, ManifestError, ManifestGenerator};
