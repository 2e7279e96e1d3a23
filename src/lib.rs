//! gitops-up - Idempotent bring-up of a local GitOps control plane
//!
//! Brings a deployment to its desired state through a fixed sequence of
//! steps: cluster, Argo CD, ingress, secrets, repository credentials and
//! applications. Work that is already done is detected and skipped.
//!
//! # Architecture
//!
//! Every step is a check/execute pair:
//! - Checks are read-only and never fail; a failed probe means "pending"
//! - Executes are create-or-update and may fail; a failure stops the run
//! - Argo CD is reached through an authenticated client that discovers
//!   existing sessions, logs in when needed and retries once on failure
//!
//! # Modules
//!
//! - `adapters`: External tools (command runner, kubectl, cluster providers)
//! - `argocd`: Authenticated Argo CD client
//! - `core`: Steps, checkers, executors and the execution engine
//! - `domain`: Data structures (TargetState, StepStatus, AppState)
//! - `config`: Layered configuration
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Bring everything up, skipping what is already done
//! gitops-up up --manifest gitops-up.yaml
//!
//! # Re-run every step regardless of state
//! gitops-up up --force
//!
//! # Show what would run and the current state of each step
//! gitops-up validate --status
//! ```

pub mod adapters;
pub mod argocd;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use argocd::{ArgoClient, ArgoError, ArgoSettings};
pub use crate::core::{EngineError, ExecutionEngine, ExecutionStep, StepAction};
pub use domain::{RunResults, RunSummary, StepState, StepStatus, TargetState};
