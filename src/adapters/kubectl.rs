//! Kubernetes helpers backed by kubectl.
//!
//! Namespace and secret upserts are create-or-update, so callers may
//! invoke them unconditionally.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::process::{run_json, CommandLine, CommandRunner, DEFAULT_TIMEOUT};

/// Read and write access to cluster objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeOps: Send + Sync {
    /// Create the namespace unless it already exists
    async fn ensure_namespace(&self, namespace: &str) -> Result<()>;

    /// Create or replace an Opaque secret with exactly these keys
    async fn upsert_secret(
        &self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// `kubectl apply` the given manifest files
    async fn apply_manifests(&self, files: &[PathBuf]) -> Result<()>;

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Ready replicas of a deployment, or None if the deployment does not exist
    async fn deployment_ready_replicas(&self, namespace: &str, name: &str) -> Result<Option<u32>>;
}

/// `KubeOps` over the kubectl CLI
pub struct Kubectl {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl Kubectl {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn kubectl<I, S>(&self, args: I) -> CommandLine
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv = std::iter::once("kubectl".to_string()).chain(args.into_iter().map(Into::into));
        CommandLine::new(argv).with_timeout(self.timeout)
    }
}

/// Secret manifest with `stringData`, ready for `kubectl apply -f -`
fn secret_manifest(namespace: &str, name: &str, data: &BTreeMap<String, String>) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "Opaque",
        "metadata": {"name": name, "namespace": namespace},
        "stringData": data,
    })
}

#[async_trait]
impl KubeOps for Kubectl {
    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let found = self
            .runner
            .run(&self.kubectl(["get", "namespace", namespace, "--ignore-not-found", "-o", "name"]))
            .await
            .with_context(|| format!("Failed to look up namespace '{}'", namespace))?;

        if !found.stdout.trim().is_empty() {
            debug!(namespace, "Namespace already exists");
            return Ok(());
        }

        match self.runner.run(&self.kubectl(["create", "namespace", namespace])).await {
            Ok(_) => {
                info!(namespace, "Created namespace");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to create namespace '{}'", namespace)),
        }
    }

    async fn upsert_secret(
        &self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<()> {
        let manifest = secret_manifest(namespace, name, data);
        let cmd = self.kubectl(["apply", "-f", "-"]).with_stdin(manifest.to_string());

        self.runner
            .run(&cmd)
            .await
            .with_context(|| format!("Failed to upsert secret '{}/{}'", namespace, name))?;
        Ok(())
    }

    async fn apply_manifests(&self, files: &[PathBuf]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }

        let mut args = vec!["apply".to_string()];
        for file in files {
            args.push("-f".to_string());
            args.push(file.display().to_string());
        }

        self.runner
            .run(&self.kubectl(args))
            .await
            .context("Failed to apply manifests")?;
        Ok(())
    }

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let output = self
            .runner
            .run(&self.kubectl(["get", "secret", name, "-n", namespace, "--ignore-not-found", "-o", "name"]))
            .await
            .with_context(|| format!("Failed to look up secret '{}/{}'", namespace, name))?;

        Ok(!output.stdout.trim().is_empty())
    }

    async fn deployment_ready_replicas(&self, namespace: &str, name: &str) -> Result<Option<u32>> {
        let cmd = self.kubectl(["get", "deployment", name, "-n", namespace, "--ignore-not-found", "-o", "json"]);
        let output = self
            .runner
            .run(&cmd)
            .await
            .with_context(|| format!("Failed to look up deployment '{}/{}'", namespace, name))?;

        if output.stdout.trim().is_empty() {
            return Ok(None);
        }

        let deployment: Value = serde_json::from_str(&output.stdout)
            .with_context(|| format!("Invalid deployment JSON for '{}/{}'", namespace, name))?;
        let ready = deployment
            .pointer("/status/readyReplicas")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Ok(Some(u32::try_from(ready).unwrap_or(u32::MAX)))
    }
}

/// Read one key of a secret and return its raw (still base64-encoded) value
pub async fn read_secret_field(
    runner: &dyn CommandRunner,
    namespace: &str,
    name: &str,
    key: &str,
    timeout: Duration,
) -> Result<String, super::process::ProcessError> {
    let cmd = CommandLine::new([
        "kubectl".to_string(),
        "-n".to_string(),
        namespace.to_string(),
        "get".to_string(),
        "secret".to_string(),
        name.to_string(),
        "-o".to_string(),
        "json".to_string(),
    ])
    .with_timeout(timeout);

    let secret: Value = run_json(runner, &cmd).await?;
    Ok(secret
        .pointer(&format!("/data/{}", key))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string())
}
