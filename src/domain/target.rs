//! Desired-state description of a deployment.
//!
//! A `TargetState` is loaded and validated once, then handed read-only to
//! every checker and executor. Workload sources are a tagged enum, so the
//! rest of the crate never probes for optional fields.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while validating a target state
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("application '{name}': {reason}")]
    InvalidApp { name: String, reason: String },

    #[error("{0}")]
    Invalid(String),
}

/// The full desired state
#[derive(Debug, Clone, Deserialize)]
pub struct TargetState {
    /// Cluster to create
    pub cluster: ClusterSpec,

    /// Secret keys to upsert
    #[serde(default)]
    pub secrets: Vec<SecretSpec>,

    /// Repository credentials to register with Argo CD
    #[serde(default)]
    pub repo_creds: Vec<RepoCredSpec>,

    /// Workloads to deploy
    #[serde(default)]
    pub apps: Vec<AppSpec>,
}

impl TargetState {
    /// Load and validate a target state from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Invalid manifest file: {}", path.display()))
    }

    /// Parse and validate a target state from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        let state: Self = serde_yaml::from_str(content).context("Failed to parse manifest YAML")?;
        state.validate()?;
        Ok(state)
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> Result<(), TargetError> {
        if self.cluster.name.trim().is_empty() {
            return Err(TargetError::Invalid("cluster name cannot be empty".into()));
        }
        if self.cluster.provider.trim().is_empty() {
            return Err(TargetError::Invalid(format!(
                "cluster '{}' has no provider",
                self.cluster.name
            )));
        }

        for (i, secret) in self.secrets.iter().enumerate() {
            if secret.namespace.is_empty() || secret.secret_name.is_empty() {
                return Err(TargetError::Invalid(format!(
                    "secret {} needs both a namespace and a secret_name",
                    i
                )));
            }
            if secret.secret_key.is_empty() {
                return Err(TargetError::Invalid(format!(
                    "secret '{}/{}' has an empty secret_key",
                    secret.namespace, secret.secret_name
                )));
            }
        }

        for cred in &self.repo_creds {
            if cred.repo_url.is_empty() {
                return Err(TargetError::Invalid(
                    "repository credential with empty repo_url".into(),
                ));
            }
        }

        let mut seen = HashSet::new();
        for app in &self.apps {
            if !seen.insert(app.name.as_str()) {
                return Err(TargetError::InvalidApp {
                    name: app.name.clone(),
                    reason: "declared more than once".into(),
                });
            }
            if app.health_timeout == 0 {
                return Err(TargetError::InvalidApp {
                    name: app.name.clone(),
                    reason: "health_timeout must be at least 1 second".into(),
                });
            }
        }

        Ok(())
    }

    /// Group secret specs by the secret they contribute to, in first-seen order
    pub fn secret_groups(&self) -> IndexMap<SecretRef, Vec<&SecretSpec>> {
        let mut groups: IndexMap<SecretRef, Vec<&SecretSpec>> = IndexMap::new();
        for spec in &self.secrets {
            groups.entry(spec.secret_ref()).or_default().push(spec);
        }
        groups
    }
}

/// Cluster to bring up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: String,

    /// Provider id (e.g. "kind")
    pub provider: String,

    /// Provider-specific options (everything except name and provider)
    #[serde(flatten)]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl ClusterSpec {
    /// Look up a string option
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }
}

/// One key of a Kubernetes secret
#[derive(Debug, Clone, Deserialize)]
pub struct SecretSpec {
    pub namespace: String,
    pub secret_name: String,
    pub secret_key: String,

    /// Where the value comes from; first source that resolves wins
    #[serde(default)]
    pub secret_value: Vec<ValueSource>,
}

impl SecretSpec {
    pub fn secret_ref(&self) -> SecretRef {
        SecretRef {
            namespace: self.namespace.clone(),
            name: self.secret_name.clone(),
        }
    }
}

/// Source of a secret value
#[derive(Debug, Clone, Deserialize)]
pub struct ValueSource {
    /// Environment variable to read
    pub from_env: String,
}

/// Identity of a secret: (namespace, name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Merge the keys of every spec contributing to one secret
///
/// `lookup` resolves environment variable names; unresolved keys map to "".
pub fn resolve_secret_data<F>(specs: &[&SecretSpec], lookup: F) -> BTreeMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut data = BTreeMap::new();
    for spec in specs {
        let value = spec
            .secret_value
            .iter()
            .find_map(|source| lookup(&source.from_env))
            .unwrap_or_default();
        data.insert(spec.secret_key.clone(), value);
    }
    data
}

/// Repository credentials to register with Argo CD
#[derive(Clone, Deserialize)]
pub struct RepoCredSpec {
    pub repo_url: String,
    pub username: String,
    pub password: String,

    #[serde(default, rename = "type")]
    pub repo_type: RepoType,

    #[serde(default)]
    pub enable_oci: bool,

    /// Repository name (required by Argo CD for helm repos; derived if absent)
    #[serde(default)]
    pub name: Option<String>,
}

impl fmt::Debug for RepoCredSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoCredSpec")
            .field("repo_url", &self.repo_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("repo_type", &self.repo_type)
            .field("enable_oci", &self.enable_oci)
            .field("name", &self.name)
            .finish()
    }
}

/// Repository kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoType {
    Git,
    Helm,
}

impl Default for RepoType {
    fn default() -> Self {
        Self::Git
    }
}

impl RepoType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Git => "git",
            Self::Helm => "helm",
        }
    }
}

/// Helm options for a source
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HelmSpec {
    #[serde(default)]
    pub release_name: Option<String>,

    #[serde(default)]
    pub value_files: Vec<String>,
}

/// One source of a workload
#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
    pub repo_url: String,

    #[serde(default)]
    pub path: Option<String>,

    /// Helm chart name (chart repositories)
    #[serde(default)]
    pub chart: Option<String>,

    #[serde(default)]
    pub target_revision: Option<String>,

    #[serde(default)]
    pub helm: Option<HelmSpec>,
}

/// Where a workload's manifests come from
#[derive(Debug, Clone)]
pub enum AppSource {
    Single(SourceSpec),
    Multi(Vec<SourceSpec>),
}

/// Sync policy applied after create-or-update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    Manual,
    Auto,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self::Manual
    }
}

/// A workload (Argo CD application)
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawAppSpec")]
pub struct AppSpec {
    pub name: String,
    pub namespace: String,
    pub project: String,
    pub source: AppSource,
    pub target_revision: String,
    pub sync_policy: SyncPolicy,

    /// Seconds to wait for the app to report healthy after a sync
    pub health_timeout: u64,

    /// Raw Application manifests applied directly instead of via the Argo CD CLI
    pub manifest_files: Vec<PathBuf>,
}

impl AppSpec {
    /// Source used for CLI create/update (the CLI only takes one)
    pub fn primary_source(&self) -> Option<&SourceSpec> {
        match &self.source {
            AppSource::Single(source) => Some(source),
            AppSource::Multi(sources) => sources.first(),
        }
    }

    /// Revision to deploy; a source-level revision wins over the app-level one
    pub fn effective_revision(&self) -> &str {
        self.primary_source()
            .and_then(|s| s.target_revision.as_deref())
            .unwrap_or(&self.target_revision)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout)
    }

    pub fn uses_raw_manifests(&self) -> bool {
        !self.manifest_files.is_empty()
    }
}

/// Wire shape of an app; converted into `AppSpec` once at load time
#[derive(Debug, Deserialize)]
struct RawAppSpec {
    name: String,
    #[serde(default = "default_namespace")]
    namespace: String,
    #[serde(default = "default_project")]
    project: String,
    #[serde(default, alias = "repo")]
    repo_url: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    chart: Option<String>,
    #[serde(default)]
    helm: Option<HelmSpec>,
    #[serde(default)]
    sources: Option<Vec<SourceSpec>>,
    #[serde(default = "default_revision")]
    target_revision: String,
    #[serde(default)]
    sync_policy: SyncPolicy,
    #[serde(default = "default_health_timeout")]
    health_timeout: u64,
    #[serde(default)]
    manifest_files: Vec<PathBuf>,
    #[serde(default)]
    app_file: Option<PathBuf>,
}

fn default_namespace() -> String {
    "default".to_string()
}
fn default_project() -> String {
    "default".to_string()
}
fn default_revision() -> String {
    "HEAD".to_string()
}
fn default_health_timeout() -> u64 {
    300
}

impl TryFrom<RawAppSpec> for AppSpec {
    type Error = TargetError;

    fn try_from(raw: RawAppSpec) -> Result<Self, Self::Error> {
        let invalid = |reason: &str| TargetError::InvalidApp {
            name: raw.name.clone(),
            reason: reason.to_string(),
        };

        if raw.name.trim().is_empty() {
            return Err(TargetError::Invalid("application name cannot be empty".into()));
        }

        let source = match (&raw.repo_url, &raw.sources) {
            (Some(_), Some(_)) => {
                return Err(invalid("set either repo_url or sources, not both"));
            }
            (None, Some(sources)) if sources.is_empty() => {
                return Err(invalid("sources cannot be empty"));
            }
            (None, Some(sources)) => AppSource::Multi(sources.clone()),
            (Some(repo_url), None) => AppSource::Single(SourceSpec {
                repo_url: repo_url.clone(),
                path: raw.path.clone(),
                chart: raw.chart.clone(),
                target_revision: None,
                helm: raw.helm.clone(),
            }),
            (None, None) => return Err(invalid("needs a repo_url or sources")),
        };

        let mut manifest_files = raw.manifest_files;
        if let Some(app_file) = raw.app_file {
            manifest_files.push(app_file);
        }

        Ok(Self {
            name: raw.name,
            namespace: raw.namespace,
            project: raw.project,
            source,
            target_revision: raw.target_revision,
            sync_policy: raw.sync_policy,
            health_timeout: raw.health_timeout,
            manifest_files,
        })
    }
}
