//! Adapters for external systems.
//!
//! Everything outside the process (kubectl, kind, k3d, argocd) is reached
//! through a `CommandRunner`. On top of it sit the Kubernetes helpers
//! and the cluster providers.

pub mod cluster;
pub mod kubectl;
pub mod process;

pub use cluster::{
    AddonManifests, ClusterProvider, ClusterStatus, K3sProvider, KindProvider, ProviderError,
    ProviderRegistry,
};
pub use kubectl::{KubeOps, Kubectl};
pub use process::{
    run_json, CommandLine, CommandOutput, CommandRunner, ProcessError, ProcessRunner,
};
