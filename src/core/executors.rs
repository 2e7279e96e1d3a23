//! Mutating actions, one per subsystem.
//!
//! Every executor is create-or-update, so the engine may call it in force
//! mode without a prior check. Errors propagate unchanged to the engine.

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::adapters::{KubeOps, ProviderRegistry};
use crate::argocd::ArgoClient;
use crate::domain::{resolve_secret_data, TargetState};

pub async fn create_cluster(providers: &ProviderRegistry, target: &TargetState) -> Result<()> {
    let cluster = &target.cluster;
    let provider = providers.get(&cluster.provider)?;

    info!(cluster = %cluster.name, provider = %cluster.provider, "Creating cluster");
    provider
        .create(cluster)
        .await
        .with_context(|| format!("Failed to create cluster '{}' with provider '{}'", cluster.name, cluster.provider))
}

/// Argo CD is installed by the cluster provider as part of cluster creation
pub fn install_control_plane() -> Result<()> {
    info!("Argo CD installation is handled by the cluster provider");
    Ok(())
}

/// The ingress controller is installed by the cluster provider as part of cluster creation
pub fn install_ingress() -> Result<()> {
    info!("Ingress controller installation is handled by the cluster provider");
    Ok(())
}

/// Upsert every declared secret with all of its keys
///
/// `lookup` resolves environment variable names.
pub async fn upsert_secrets<F>(kube: &dyn KubeOps, target: &TargetState, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    for (secret, specs) in target.secret_groups() {
        let data = resolve_secret_data(&specs, &lookup);

        kube.ensure_namespace(&secret.namespace).await?;
        kube.upsert_secret(&secret.namespace, &secret.name, &data).await?;

        info!(secret = %secret, keys = data.len(), "Created/updated secret");
    }
    Ok(())
}

pub async fn add_repo_creds(target: &TargetState, client: Option<&mut ArgoClient>) -> Result<()> {
    if target.repo_creds.is_empty() {
        return Ok(());
    }
    let Some(client) = client else {
        bail!("Argo CD client required for repo credentials setup");
    };

    for cred in &target.repo_creds {
        info!(repo = %cred.repo_url, "Adding repo credentials");
        client.add_repo_cred(cred).await?;
    }
    Ok(())
}

/// Create or update each app, then sync it and wait for Healthy
///
/// Apps with raw manifest files are applied with kubectl instead and left
/// to their own sync policy.
pub async fn deploy_apps(
    kube: &dyn KubeOps,
    target: &TargetState,
    client: Option<&mut ArgoClient>,
) -> Result<()> {
    if target.apps.is_empty() {
        return Ok(());
    }
    let Some(client) = client else {
        bail!("Argo CD client required for application deployment");
    };

    for app in &target.apps {
        kube.ensure_namespace(&app.namespace).await?;

        if app.uses_raw_manifests() {
            kube.apply_manifests(&app.manifest_files)
                .await
                .with_context(|| format!("Failed to apply manifests for application '{}'", app.name))?;
            info!(app = %app.name, "Applied application manifest");
            continue;
        }

        client.create_or_update_app(app).await?;
        client
            .sync_app(&app.name, true, app.health_timeout(), false)
            .await?;
        info!(app = %app.name, "Created/updated and synced application");
    }
    Ok(())
}
