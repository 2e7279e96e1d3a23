//! Read-only probes, one per subsystem.
//!
//! A checker answers "is this subsystem already in the desired state?".
//! Checkers never fail: any probe error becomes a pending status with the
//! error folded into the reason, so a flaky read only means "not done yet".

use serde_json::json;
use tracing::warn;

use crate::adapters::{KubeOps, ProviderRegistry};
use crate::argocd::ArgoClient;
use crate::domain::{StepStatus, TargetState};

pub async fn check_cluster(providers: &ProviderRegistry, target: &TargetState) -> StepStatus {
    let cluster = &target.cluster;

    let status = match providers.get(&cluster.provider) {
        Ok(provider) => provider.status(&cluster.name).await,
        Err(e) => Err(e),
    };

    match status {
        Ok(status) if status.exists && status.ready => {
            StepStatus::completed(format!("Cluster '{}' exists and is ready", cluster.name))
                .with_detail("cluster", &status)
        }
        Ok(status) if status.exists => {
            StepStatus::pending(format!("Cluster '{}' exists but is not ready", cluster.name))
                .with_detail("cluster", &status)
        }
        Ok(status) => StepStatus::pending(format!("Cluster '{}' does not exist", cluster.name))
            .with_detail("cluster", &status),
        Err(e) => {
            warn!(cluster = %cluster.name, error = %e, "Failed to check cluster status");
            StepStatus::pending(format!("Unable to determine cluster status: {}", e))
        }
    }
}

/// A deployment counts as installed once it has a ready replica
pub async fn check_deployment(
    kube: &dyn KubeOps,
    namespace: &str,
    name: &str,
    label: &str,
) -> StepStatus {
    match kube.deployment_ready_replicas(namespace, name).await {
        Ok(Some(ready)) if ready > 0 => StepStatus::completed(format!("{} is installed and ready", label))
            .with_detail("ready_replicas", ready),
        Ok(Some(_)) => StepStatus::pending(format!("{} deployment exists but is not ready", label)),
        Ok(None) => StepStatus::pending(format!("{} deployment not found", label)),
        Err(e) => {
            warn!(deployment = %format!("{}/{}", namespace, name), error = %e, "Failed to check deployment");
            StepStatus::pending(format!("Unable to determine {} status: {:#}", label, e))
        }
    }
}

/// One existence probe per distinct (namespace, name)
pub async fn check_secrets(kube: &dyn KubeOps, target: &TargetState) -> StepStatus {
    let groups = target.secret_groups();
    if groups.is_empty() {
        return StepStatus::completed("No secrets to check");
    }

    let mut missing = Vec::new();
    let mut existing = Vec::new();

    for secret in groups.keys() {
        match kube.secret_exists(&secret.namespace, &secret.name).await {
            Ok(true) => existing.push(secret.to_string()),
            Ok(false) => missing.push(secret.to_string()),
            Err(e) => {
                warn!(secret = %secret, error = %e, "Failed to check secret");
                return StepStatus::pending(format!("Unable to check secret '{}': {:#}", secret, e));
            }
        }
    }

    if missing.is_empty() {
        StepStatus::completed(format!("All {} secrets exist", existing.len()))
            .with_detail("existing_secrets", &existing)
    } else {
        StepStatus::pending(format!("{} of {} secrets missing", missing.len(), groups.len()))
            .with_detail("missing_secrets", &missing)
            .with_detail("existing_secrets", &existing)
    }
}

pub async fn check_repo_creds(target: &TargetState, client: Option<&mut ArgoClient>) -> StepStatus {
    if target.repo_creds.is_empty() {
        return StepStatus::completed("No repo credentials to check");
    }
    let Some(client) = client else {
        return StepStatus::pending("Argo CD client required for repo credential checking");
    };

    let configured = match client.list_repositories().await {
        Ok(repos) => repos,
        Err(e) => {
            warn!(error = %e, "Failed to list repositories");
            return StepStatus::pending(format!("Unable to list Argo CD repositories: {}", e));
        }
    };

    let (existing, missing): (Vec<&str>, Vec<&str>) = target
        .repo_creds
        .iter()
        .map(|cred| cred.repo_url.as_str())
        .partition(|url| configured.iter().any(|repo| repo == url));

    if missing.is_empty() {
        StepStatus::completed(format!("All {} repo credentials configured", existing.len()))
            .with_detail("configured_repos", &existing)
    } else {
        StepStatus::pending(format!(
            "{} of {} repo credentials missing",
            missing.len(),
            target.repo_creds.len()
        ))
        .with_detail("missing_creds", &missing)
        .with_detail("existing_creds", &existing)
    }
}

/// An app is satisfied only when Synced and Healthy at once
pub async fn check_apps(target: &TargetState, client: Option<&mut ArgoClient>) -> StepStatus {
    if target.apps.is_empty() {
        return StepStatus::completed("No applications to check");
    }
    let Some(client) = client else {
        return StepStatus::pending("Argo CD client required for application checking");
    };

    let observed = match client.list_apps().await {
        Ok(apps) => apps,
        Err(e) => {
            warn!(error = %e, "Failed to list applications");
            return StepStatus::pending(format!("Unable to get Argo CD applications: {}", e));
        }
    };

    let mut synced = Vec::new();
    let mut missing = Vec::new();
    let mut unsynced = Vec::new();

    for app in &target.apps {
        match observed.iter().find(|state| state.name == app.name) {
            None => missing.push(app.name.clone()),
            Some(state) if state.is_synced_and_healthy() => synced.push(app.name.clone()),
            Some(state) => unsynced.push(json!({
                "name": app.name,
                "sync_status": state.sync.as_str(),
                "health_status": state.health.as_str(),
            })),
        }
    }

    let total = target.apps.len();
    if missing.is_empty() && unsynced.is_empty() {
        return StepStatus::completed(format!("All {} applications are synced and healthy", synced.len()))
            .with_detail("synced_apps", &synced);
    }

    let reason = match (missing.len(), unsynced.len()) {
        (m, 0) => format!("{} of {} applications not deployed", m, total),
        (0, u) => format!("{} of {} applications need sync", u, total),
        (m, u) => format!("{} of {} applications need attention", m + u, total),
    };

    StepStatus::pending(reason)
        .with_detail("synced_apps", &synced)
        .with_detail("missing_apps", &missing)
        .with_detail("unsynced_apps", &unsynced)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mockall::predicate::eq;

    use super::*;
    use crate::adapters::cluster::{ClusterStatus, MockClusterProvider};
    use crate::adapters::kubectl::MockKubeOps;
    use crate::adapters::process::scripted::{fail, ScriptedRunner};
    use crate::argocd::ArgoSettings;
    use crate::domain::StepState;

    const TARGET: &str = r#"
cluster: { name: dev, provider: kind }
secrets:
  - { namespace: default, secret_name: db-creds, secret_key: username }
  - { namespace: default, secret_name: db-creds, secret_key: password }
  - { namespace: web, secret_name: api-token, secret_key: token }
repo_creds:
  - { repo_url: "https://github.com/acme/deploy.git", username: bot, password: pw }
apps:
  - { name: web, repo_url: "https://github.com/acme/deploy.git", path: web }
  - { name: api, repo_url: "https://github.com/acme/deploy.git", path: api }
"#;

    fn target() -> TargetState {
        TargetState::from_yaml(TARGET).unwrap()
    }

    fn registry_with(status: Result<ClusterStatus, &'static str>) -> ProviderRegistry {
        let mut provider = MockClusterProvider::new();
        provider.expect_id().return_const("kind");
        provider.expect_status().returning(move |_| {
            status
                .clone()
                .map_err(|msg| crate::adapters::ProviderError::NotAvailable(msg.to_string()))
        });
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(provider));
        registry
    }

    fn cluster_status(exists: bool, ready: bool) -> ClusterStatus {
        ClusterStatus {
            provider: "kind".into(),
            name: "dev".into(),
            exists,
            ready,
            context: "kind-dev".into(),
        }
    }

    fn client_answering(
        respond: impl Fn(&crate::adapters::CommandLine) -> Result<String, crate::adapters::ProcessError>
            + Send
            + Sync
            + 'static,
    ) -> ArgoClient {
        ArgoClient::new(Arc::new(ScriptedRunner::new(respond)), ArgoSettings::default())
    }

    #[tokio::test]
    async fn test_cluster_ready_is_completed() {
        let status = check_cluster(&registry_with(Ok(cluster_status(true, true))), &target()).await;
        assert_eq!(status.state, StepState::Completed);
        assert_eq!(status.details["cluster"]["context"], "kind-dev");
    }

    #[tokio::test]
    async fn test_cluster_pending_reasons_differ() {
        let not_ready = check_cluster(&registry_with(Ok(cluster_status(true, false))), &target()).await;
        let absent = check_cluster(&registry_with(Ok(cluster_status(false, false))), &target()).await;

        assert_eq!(not_ready.state, StepState::Pending);
        assert_eq!(absent.state, StepState::Pending);
        assert!(not_ready.reason.contains("exists but is not ready"));
        assert!(absent.reason.contains("does not exist"));
    }

    #[tokio::test]
    async fn test_cluster_probe_error_becomes_pending() {
        let status = check_cluster(&registry_with(Err("kind")), &target()).await;
        assert_eq!(status.state, StepState::Pending);
        assert!(status.reason.starts_with("Unable to determine cluster status"));

        let status = check_cluster(&ProviderRegistry::new(), &target()).await;
        assert_eq!(status.state, StepState::Pending);
        assert!(status.reason.contains("Unknown cluster provider"));
    }

    #[tokio::test]
    async fn test_deployment_classification() {
        let mut kube = MockKubeOps::new();
        kube.expect_deployment_ready_replicas()
            .withf(|_, name| name == "ready")
            .returning(|_, _| Ok(Some(1)));
        kube.expect_deployment_ready_replicas()
            .withf(|_, name| name == "starting")
            .returning(|_, _| Ok(Some(0)));
        kube.expect_deployment_ready_replicas()
            .withf(|_, name| name == "absent")
            .returning(|_, _| Ok(None));
        kube.expect_deployment_ready_replicas()
            .withf(|_, name| name == "broken")
            .returning(|_, _| Err(anyhow::anyhow!("connection refused")));

        let ready = check_deployment(&kube, "argocd", "ready", "Argo CD").await;
        assert_eq!(ready.state, StepState::Completed);
        assert_eq!(ready.details["ready_replicas"], 1);

        let starting = check_deployment(&kube, "argocd", "starting", "Argo CD").await;
        assert!(starting.reason.contains("exists but is not ready"));

        let absent = check_deployment(&kube, "argocd", "absent", "Argo CD").await;
        assert_eq!(absent.reason, "Argo CD deployment not found");

        let broken = check_deployment(&kube, "argocd", "broken", "Argo CD").await;
        assert_eq!(broken.state, StepState::Pending);
        assert!(broken.reason.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_secrets_sharing_a_name_are_probed_once() {
        let mut kube = MockKubeOps::new();
        kube.expect_secret_exists()
            .with(eq("default"), eq("db-creds"))
            .times(1)
            .returning(|_, _| Ok(true));
        kube.expect_secret_exists()
            .with(eq("web"), eq("api-token"))
            .times(1)
            .returning(|_, _| Ok(false));

        let status = check_secrets(&kube, &target()).await;

        assert_eq!(status.state, StepState::Pending);
        assert_eq!(status.reason, "1 of 2 secrets missing");
        assert_eq!(status.details["missing_secrets"], json!(["web/api-token"]));
        assert_eq!(status.details["existing_secrets"], json!(["default/db-creds"]));
    }

    #[tokio::test]
    async fn test_secret_lookup_error_stops_at_first_group() {
        // No expectation for web/api-token: a second probe would panic
        let mut kube = MockKubeOps::new();
        kube.expect_secret_exists()
            .with(eq("default"), eq("db-creds"))
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("the server has asked for the client to provide credentials")));

        let status = check_secrets(&kube, &target()).await;

        assert_eq!(status.state, StepState::Pending);
        assert!(status.reason.starts_with("Unable to check secret 'default/db-creds'"));
        assert!(status.reason.contains("provide credentials"));
    }

    #[tokio::test]
    async fn test_secrets_none_declared() {
        let kube = MockKubeOps::new();
        let target = TargetState::from_yaml("cluster: { name: dev, provider: kind }").unwrap();
        assert!(check_secrets(&kube, &target).await.is_completed());
    }

    #[tokio::test]
    async fn test_repo_creds_need_client() {
        let status = check_repo_creds(&target(), None).await;
        assert_eq!(status.state, StepState::Pending);
        assert!(status.reason.contains("client required"));
    }

    #[tokio::test]
    async fn test_repo_creds_compares_registered_urls() {
        let mut client = client_answering(|_| {
            Ok(r#"[{"repo": "https://github.com/acme/deploy.git", "type": "git"}]"#.to_string())
        });
        let status = check_repo_creds(&target(), Some(&mut client)).await;
        assert_eq!(status.state, StepState::Completed);

        let mut client = client_answering(|_| Ok("[]".to_string()));
        let status = check_repo_creds(&target(), Some(&mut client)).await;
        assert_eq!(status.reason, "1 of 1 repo credentials missing");
    }

    #[tokio::test]
    async fn test_repo_list_failure_is_pending() {
        let mut client = client_answering(|cmd| {
            if cmd.starts_with(&["argocd", "repo", "list"]) {
                Err(fail("rpc error: code = Unavailable desc = connection closed"))
            } else if cmd.starts_with(&["argocd", "--server"]) {
                Ok(r#"{"loggedIn": true}"#.to_string())
            } else {
                Ok(String::new())
            }
        });
        let status = check_repo_creds(&target(), Some(&mut client)).await;

        assert_eq!(status.state, StepState::Pending);
        assert!(status.reason.starts_with("Unable to list Argo CD repositories"));
        assert!(status.reason.contains("connection closed"));
    }

    #[tokio::test]
    async fn test_apps_missing_vs_unsynced() {
        let mut client = client_answering(|_| {
            Ok(r#"[{
                "metadata": {"name": "web"},
                "status": {"health": {"status": "Healthy"}, "sync": {"status": "OutOfSync"}}
            }]"#
            .to_string())
        });
        let status = check_apps(&target(), Some(&mut client)).await;

        assert_eq!(status.state, StepState::Pending);
        assert_eq!(status.reason, "2 of 2 applications need attention");
        assert_eq!(status.details["missing_apps"], json!(["api"]));
        assert_eq!(status.details["unsynced_apps"][0]["sync_status"], "OutOfSync");
    }

    #[tokio::test]
    async fn test_apps_all_good() {
        let mut client = client_answering(|_| {
            Ok(r#"[
                {"metadata": {"name": "web"}, "status": {"health": {"status": "Healthy"}, "sync": {"status": "Synced"}}},
                {"metadata": {"name": "api"}, "status": {"health": {"status": "Healthy"}, "sync": {"status": "Synced"}}}
            ]"#
            .to_string())
        });
        let status = check_apps(&target(), Some(&mut client)).await;
        assert_eq!(status.state, StepState::Completed);
        assert_eq!(status.reason, "All 2 applications are synced and healthy");
    }

    #[tokio::test]
    async fn test_apps_list_failure_is_pending() {
        // Both the call and its post-login retry fail
        let mut client = client_answering(|cmd| {
            if cmd.starts_with(&["argocd", "app", "list"]) {
                Err(fail("rpc error: code = Unavailable"))
            } else if cmd.starts_with(&["argocd", "--server"]) {
                Ok(r#"{"loggedIn": true}"#.to_string())
            } else {
                Ok(String::new())
            }
        });
        let status = check_apps(&target(), Some(&mut client)).await;
        assert_eq!(status.state, StepState::Pending);
        assert!(status.reason.starts_with("Unable to get Argo CD applications"));
    }
}
