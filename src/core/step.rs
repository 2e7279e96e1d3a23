//! Step descriptors and the standard bring-up pipeline.
//!
//! A step pairs a read-only check with an idempotent execute. The standard
//! pipeline is a fixed list whose order encodes hard dependencies:
//! cluster, control plane, ingress, secrets, repository credentials, apps.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::adapters::{KubeOps, ProviderRegistry};
use crate::argocd::ArgoClient;
use crate::domain::{StepStatus, TargetState};

use super::{checkers, executors};

/// Check and execute halves of a step
///
/// `check` never fails: probe errors come back as a pending status.
/// `execute` must be safe to call whether or not `check` ran.
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn check(&self, target: &TargetState, client: Option<&mut ArgoClient>) -> StepStatus;

    async fn execute(&self, target: &TargetState, client: Option<&mut ArgoClient>) -> Result<()>;
}

/// One entry of the pipeline
pub struct ExecutionStep {
    /// Unique key in run results
    pub name: String,

    pub description: String,

    /// Needs an authenticated Argo CD client
    pub requires_client: bool,

    action: Box<dyn StepAction>,
}

impl ExecutionStep {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        requires_client: bool,
        action: impl StepAction + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            requires_client,
            action: Box::new(action),
        }
    }

    pub async fn check(&self, target: &TargetState, client: Option<&mut ArgoClient>) -> StepStatus {
        self.action.check(target, client).await
    }

    pub async fn execute(&self, target: &TargetState, client: Option<&mut ArgoClient>) -> Result<()> {
        self.action.execute(target, client).await
    }
}

impl fmt::Debug for ExecutionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionStep")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("requires_client", &self.requires_client)
            .finish_non_exhaustive()
    }
}

/// The subsystems of a bring-up, in dependency order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Cluster,
    ControlPlane,
    Ingress,
    Secrets,
    RepoCreds,
    Apps,
}

impl StepKind {
    pub const ORDER: [StepKind; 6] = [
        Self::Cluster,
        Self::ControlPlane,
        Self::Ingress,
        Self::Secrets,
        Self::RepoCreds,
        Self::Apps,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::ControlPlane => "argocd",
            Self::Ingress => "nginx",
            Self::Secrets => "secrets",
            Self::RepoCreds => "repo-creds",
            Self::Apps => "apps",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Cluster => "Create Kubernetes cluster",
            Self::ControlPlane => "Install Argo CD",
            Self::Ingress => "Install nginx ingress controller",
            Self::Secrets => "Create Kubernetes secrets",
            Self::RepoCreds => "Configure Argo CD repository credentials",
            Self::Apps => "Deploy and sync Argo CD applications",
        }
    }

    pub fn requires_client(self) -> bool {
        matches!(self, Self::RepoCreds | Self::Apps)
    }
}

/// Collaborators the standard steps talk to
#[derive(Clone)]
pub struct Collaborators {
    pub providers: Arc<ProviderRegistry>,
    pub kube: Arc<dyn KubeOps>,
}

/// The standard pipeline
pub fn standard_steps(collab: &Collaborators) -> Vec<ExecutionStep> {
    StepKind::ORDER
        .iter()
        .map(|&kind| {
            let action = StandardAction {
                kind,
                collab: collab.clone(),
            };
            ExecutionStep::new(kind.name(), kind.description(), kind.requires_client(), action)
        })
        .collect()
}

/// Dispatches a `StepKind` to its checker and executor
struct StandardAction {
    kind: StepKind,
    collab: Collaborators,
}

/// Deployments whose readiness marks the control plane and ingress as installed
const ARGOCD_SERVER: (&str, &str) = ("argocd", "argocd-server");
const INGRESS_CONTROLLER: (&str, &str) = ("ingress-nginx", "ingress-nginx-controller");

#[async_trait]
impl StepAction for StandardAction {
    async fn check(&self, target: &TargetState, client: Option<&mut ArgoClient>) -> StepStatus {
        let kube = self.collab.kube.as_ref();
        match self.kind {
            StepKind::Cluster => checkers::check_cluster(&self.collab.providers, target).await,
            StepKind::ControlPlane => {
                checkers::check_deployment(kube, ARGOCD_SERVER.0, ARGOCD_SERVER.1, "Argo CD").await
            }
            StepKind::Ingress => {
                checkers::check_deployment(
                    kube,
                    INGRESS_CONTROLLER.0,
                    INGRESS_CONTROLLER.1,
                    "Nginx ingress controller",
                )
                .await
            }
            StepKind::Secrets => checkers::check_secrets(kube, target).await,
            StepKind::RepoCreds => checkers::check_repo_creds(target, client).await,
            StepKind::Apps => checkers::check_apps(target, client).await,
        }
    }

    async fn execute(&self, target: &TargetState, client: Option<&mut ArgoClient>) -> Result<()> {
        let kube = self.collab.kube.as_ref();
        match self.kind {
            StepKind::Cluster => executors::create_cluster(&self.collab.providers, target).await,
            StepKind::ControlPlane => executors::install_control_plane(),
            StepKind::Ingress => executors::install_ingress(),
            StepKind::Secrets => {
                executors::upsert_secrets(kube, target, |var| std::env::var(var).ok()).await
            }
            StepKind::RepoCreds => executors::add_repo_creds(target, client).await,
            StepKind::Apps => executors::deploy_apps(kube, target, client).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::kubectl::MockKubeOps;

    #[test]
    fn test_standard_steps_order_and_client_requirements() {
        let collab = Collaborators {
            providers: Arc::new(ProviderRegistry::new()),
            kube: Arc::new(MockKubeOps::new()),
        };
        let steps = standard_steps(&collab);

        let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["cluster", "argocd", "nginx", "secrets", "repo-creds", "apps"]);

        let needs_client: Vec<&str> = steps
            .iter()
            .filter(|s| s.requires_client)
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(needs_client, ["repo-creds", "apps"]);
    }
}
