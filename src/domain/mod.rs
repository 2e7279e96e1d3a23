//! Domain types for gitops-up.
//!
//! This module contains the core data structures:
//! - Status: step status, run results and summaries
//! - Target: the desired state loaded from the manifest
//! - AppState: observed application state from Argo CD

pub mod app_state;
pub mod status;
pub mod target;

// Re-export commonly used types
pub use app_state::{AppState, HealthStatus, SyncStatus};
pub use status::{RunResults, RunSummary, StepState, StepStatus};
pub use target::{
    resolve_secret_data, AppSource, AppSpec, ClusterSpec, HelmSpec, RepoCredSpec, RepoType,
    SecretRef, SecretSpec, SourceSpec, SyncPolicy, TargetError, TargetState, ValueSource,
};
