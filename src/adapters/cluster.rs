//! Cluster lifecycle providers.
//!
//! A provider creates, deletes and reports on a local Kubernetes cluster.
//! Providers are looked up by id through a `ProviderRegistry` built at
//! startup and passed to whoever needs it.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use super::process::{run_json, CommandLine, CommandRunner, ProcessError, DEFAULT_TIMEOUT};
use crate::domain::ClusterSpec;

/// Upstream Argo CD install manifest
pub const DEFAULT_ARGOCD_MANIFEST: &str =
    "https://raw.githubusercontent.com/argoproj/argo-cd/stable/manifests/install.yaml";

/// ingress-nginx manifest tuned for kind (also used on k3d, whose server node
/// carries the same `ingress-ready` label)
pub const DEFAULT_INGRESS_MANIFEST: &str =
    "https://raw.githubusercontent.com/kubernetes/ingress-nginx/main/deploy/static/provider/kind/deploy.yaml";

/// Errors raised by cluster providers
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Unknown cluster provider '{name}' (available: {available})")]
    Unknown { name: String, available: String },

    #[error("Provider '{0}' is not installed or not on PATH")]
    NotAvailable(String),

    #[error("Cluster '{name}' did not become ready within {seconds} seconds")]
    NotReady { name: String, seconds: u64 },

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Failed to write provider config: {0}")]
    Config(#[from] std::io::Error),
}

/// Observed cluster state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    pub provider: String,
    pub name: String,
    pub exists: bool,
    pub ready: bool,

    /// kubectl context for the cluster
    pub context: String,
}

/// A cluster backend
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    /// Provider id as used in the manifest (e.g. "kind", "k3s")
    fn id(&self) -> &'static str;

    /// Create the cluster and install its add-ons
    async fn create(&self, spec: &ClusterSpec) -> Result<(), ProviderError>;

    async fn delete(&self, name: &str) -> Result<(), ProviderError>;

    async fn status(&self, name: &str) -> Result<ClusterStatus, ProviderError>;
}

/// Providers keyed by id
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn ClusterProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in providers
    pub fn with_defaults(runner: Arc<dyn CommandRunner>, addons: AddonManifests) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(KindProvider::new(runner.clone(), addons.clone())));
        registry.register(Arc::new(K3sProvider::new(runner, addons)));
        registry
    }

    /// Add a provider, replacing any with the same id
    pub fn register(&mut self, provider: Arc<dyn ClusterProvider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn ClusterProvider>, ProviderError> {
        self.providers.get(id).cloned().ok_or_else(|| ProviderError::Unknown {
            name: id.to_string(),
            available: self.ids().join(", "),
        })
    }

    pub fn ids(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// Add-on manifests installed right after cluster creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonManifests {
    /// Argo CD install manifest (URL or path)
    pub argocd: String,

    /// Namespace Argo CD is installed into
    pub argocd_namespace: String,

    /// Ingress controller manifest (URL or path)
    pub ingress: String,
}

impl Default for AddonManifests {
    fn default() -> Self {
        Self {
            argocd: DEFAULT_ARGOCD_MANIFEST.to_string(),
            argocd_namespace: "argocd".to_string(),
            ingress: DEFAULT_INGRESS_MANIFEST.to_string(),
        }
    }
}

/// How long to wait for the API server after creation, and how often to look
#[derive(Debug, Clone, Copy)]
struct ReadyWait {
    timeout: Duration,
    interval: Duration,
}

impl Default for ReadyWait {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            interval: Duration::from_secs(2),
        }
    }
}

async fn run<I, S>(runner: &dyn CommandRunner, argv: I) -> Result<String, ProcessError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let cmd = CommandLine::new(argv).with_timeout(DEFAULT_TIMEOUT);
    runner.run(&cmd).await.map(|out| out.stdout)
}

async fn api_reachable(runner: &dyn CommandRunner, context: &str) -> bool {
    run(runner, ["kubectl", "cluster-info", "--context", context]).await.is_ok()
}

async fn wait_ready(
    runner: &dyn CommandRunner,
    name: &str,
    context: &str,
    wait: ReadyWait,
) -> Result<(), ProviderError> {
    let deadline = tokio::time::Instant::now() + wait.timeout;

    loop {
        if api_reachable(runner, context).await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ProviderError::NotReady {
                name: name.to_string(),
                seconds: wait.timeout.as_secs(),
            });
        }
        tokio::time::sleep(wait.interval).await;
    }
}

/// Install Argo CD (exposed on node ports 30080/30443) and the ingress controller
async fn install_addons(
    runner: &dyn CommandRunner,
    addons: &AddonManifests,
    name: &str,
    context: &str,
) -> Result<(), ProviderError> {
    let ns = addons.argocd_namespace.as_str();

    match run(runner, ["kubectl", "--context", context, "create", "namespace", ns]).await {
        Ok(_) => {}
        Err(e) if e.is_already_exists() => {}
        Err(e) => return Err(e.into()),
    }

    info!(cluster = name, "Installing Argo CD");
    run(runner, ["kubectl", "--context", context, "-n", ns, "apply", "-f", addons.argocd.as_str()]).await?;

    let patch = json!({
        "spec": {
            "type": "NodePort",
            "ports": [
                {"name": "http", "port": 80, "targetPort": 8080, "nodePort": 30080},
                {"name": "https", "port": 443, "targetPort": 8080, "nodePort": 30443}
            ]
        }
    })
    .to_string();
    run(
        runner,
        [
            "kubectl",
            "--context",
            context,
            "-n",
            ns,
            "patch",
            "svc",
            "argocd-server",
            "-p",
            patch.as_str(),
        ],
    )
    .await?;

    info!(cluster = name, "Installing ingress controller");
    run(runner, ["kubectl", "--context", context, "apply", "-f", addons.ingress.as_str()]).await?;

    Ok(())
}

/// Kubernetes-in-Docker provider
pub struct KindProvider {
    runner: Arc<dyn CommandRunner>,
    addons: AddonManifests,
    ready: ReadyWait,
}

impl KindProvider {
    pub fn new(runner: Arc<dyn CommandRunner>, addons: AddonManifests) -> Self {
        Self {
            runner,
            addons,
            ready: ReadyWait::default(),
        }
    }

    pub fn with_ready_wait(mut self, timeout: Duration, interval: Duration) -> Self {
        self.ready = ReadyWait { timeout, interval };
        self
    }

    pub fn context_name(name: &str) -> String {
        format!("kind-{}", name)
    }

    async fn ensure_available(&self) -> Result<(), ProviderError> {
        match run(self.runner.as_ref(), ["kind", "version"]).await {
            Ok(out) if out.to_lowercase().contains("kind") => Ok(()),
            _ => Err(ProviderError::NotAvailable("kind".to_string())),
        }
    }
}

/// kind cluster config mapping the Argo CD node ports to the host
fn kind_config(spec: &ClusterSpec) -> String {
    let mut config = format!(
        "kind: Cluster\n\
         apiVersion: kind.x-k8s.io/v1alpha4\n\
         name: {}\n\
         nodes:\n\
         - role: control-plane\n\
         \x20 kubeadmConfigPatches:\n\
         \x20 - |\n\
         \x20   kind: InitConfiguration\n\
         \x20   nodeRegistration:\n\
         \x20     kubeletExtraArgs:\n\
         \x20       node-labels: \"ingress-ready=true\"\n\
         \x20 extraPortMappings:\n\
         \x20 - containerPort: 30080\n\
         \x20   hostPort: 8080\n\
         \x20   protocol: TCP\n\
         \x20 - containerPort: 30443\n\
         \x20   hostPort: 8443\n\
         \x20   protocol: TCP\n\
         \x20 - containerPort: 80\n\
         \x20   hostPort: 80\n\
         \x20   protocol: TCP\n",
        spec.name
    );
    if let Some(image) = spec.option_str("image") {
        config.push_str(&format!("  image: {}\n", image));
    }
    config
}

#[async_trait]
impl ClusterProvider for KindProvider {
    fn id(&self) -> &'static str {
        "kind"
    }

    async fn create(&self, spec: &ClusterSpec) -> Result<(), ProviderError> {
        self.ensure_available().await?;

        // Removed when dropped, after kind has read it
        let mut config_file = tempfile::Builder::new()
            .prefix("kind-")
            .suffix(".yaml")
            .tempfile()?;
        config_file.write_all(kind_config(spec).as_bytes())?;
        config_file.flush()?;

        let config_path = config_file.path().display().to_string();
        debug!(config = %config_path, "Wrote kind config");

        info!(cluster = %spec.name, "Creating kind cluster");
        run(
            self.runner.as_ref(),
            [
                "kind",
                "create",
                "cluster",
                "--config",
                config_path.as_str(),
                "--name",
                spec.name.as_str(),
            ],
        )
        .await?;

        let context = Self::context_name(&spec.name);
        wait_ready(self.runner.as_ref(), &spec.name, &context, self.ready).await?;
        install_addons(self.runner.as_ref(), &self.addons, &spec.name, &context).await
    }

    async fn delete(&self, name: &str) -> Result<(), ProviderError> {
        info!(cluster = name, "Deleting kind cluster");
        run(self.runner.as_ref(), ["kind", "delete", "cluster", "--name", name]).await?;
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<ClusterStatus, ProviderError> {
        let context = Self::context_name(name);
        let clusters = run(self.runner.as_ref(), ["kind", "get", "clusters"]).await?;
        let exists = clusters.lines().any(|line| line.trim() == name);
        let ready = exists && api_reachable(self.runner.as_ref(), &context).await;

        Ok(ClusterStatus {
            provider: self.id().to_string(),
            name: name.to_string(),
            exists,
            ready,
            context,
        })
    }
}

/// k3s provider, running k3s nodes in Docker through k3d
///
/// The bundled Traefik is disabled so the same ingress controller and
/// host port layout as kind apply: 8080/8443 reach Argo CD on the server
/// node, 80 goes through the k3d load balancer.
pub struct K3sProvider {
    runner: Arc<dyn CommandRunner>,
    addons: AddonManifests,
    ready: ReadyWait,
}

/// Entry of `k3d cluster list -o json`
#[derive(Debug, Deserialize)]
struct K3dCluster {
    name: String,
}

impl K3sProvider {
    pub fn new(runner: Arc<dyn CommandRunner>, addons: AddonManifests) -> Self {
        Self {
            runner,
            addons,
            ready: ReadyWait::default(),
        }
    }

    pub fn with_ready_wait(mut self, timeout: Duration, interval: Duration) -> Self {
        self.ready = ReadyWait { timeout, interval };
        self
    }

    pub fn context_name(name: &str) -> String {
        format!("k3d-{}", name)
    }

    async fn ensure_available(&self) -> Result<(), ProviderError> {
        match run(self.runner.as_ref(), ["k3d", "version"]).await {
            Ok(out) if out.to_lowercase().contains("k3d") => Ok(()),
            _ => Err(ProviderError::NotAvailable("k3d".to_string())),
        }
    }
}

/// `k3d cluster create` arguments for `spec`
fn k3d_create_args(spec: &ClusterSpec) -> Vec<String> {
    let mut argv: Vec<String> = [
        "k3d",
        "cluster",
        "create",
        spec.name.as_str(),
        "--k3s-arg",
        "--disable=traefik@server:0",
        "--k3s-arg",
        "--node-label=ingress-ready=true@server:0",
        "-p",
        "8080:30080@server:0",
        "-p",
        "8443:30443@server:0",
        "-p",
        "80:80@loadbalancer",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if let Some(image) = spec.option_str("image") {
        argv.push("--image".to_string());
        argv.push(image.to_string());
    }
    argv
}

#[async_trait]
impl ClusterProvider for K3sProvider {
    fn id(&self) -> &'static str {
        "k3s"
    }

    async fn create(&self, spec: &ClusterSpec) -> Result<(), ProviderError> {
        self.ensure_available().await?;

        info!(cluster = %spec.name, "Creating k3s cluster");
        run(self.runner.as_ref(), k3d_create_args(spec)).await?;

        let context = Self::context_name(&spec.name);
        wait_ready(self.runner.as_ref(), &spec.name, &context, self.ready).await?;
        install_addons(self.runner.as_ref(), &self.addons, &spec.name, &context).await
    }

    async fn delete(&self, name: &str) -> Result<(), ProviderError> {
        info!(cluster = name, "Deleting k3s cluster");
        run(self.runner.as_ref(), ["k3d", "cluster", "delete", name]).await?;
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<ClusterStatus, ProviderError> {
        let context = Self::context_name(name);
        let list = CommandLine::new(["k3d", "cluster", "list", "-o", "json"]).with_timeout(DEFAULT_TIMEOUT);
        let clusters: Vec<K3dCluster> = run_json(self.runner.as_ref(), &list).await?;
        let exists = clusters.iter().any(|c| c.name == name);
        let ready = exists && api_reachable(self.runner.as_ref(), &context).await;

        Ok(ClusterStatus {
            provider: self.id().to_string(),
            name: name.to_string(),
            exists,
            ready,
            context,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::process::scripted::{fail, ScriptedRunner};

    fn spec(name: &str) -> ClusterSpec {
        ClusterSpec {
            name: name.to_string(),
            provider: "kind".to_string(),
            options: BTreeMap::new(),
        }
    }

    fn fast(runner: Arc<ScriptedRunner>) -> KindProvider {
        KindProvider::new(runner, AddonManifests::default())
            .with_ready_wait(Duration::from_millis(50), Duration::from_millis(10))
    }

    #[test]
    fn test_registry_unknown_provider_lists_available() {
        let runner = Arc::new(ScriptedRunner::new(|_| Ok(String::new())));
        let registry = ProviderRegistry::with_defaults(runner, AddonManifests::default());

        assert!(registry.get("kind").is_ok());
        assert_eq!(registry.get("k3s").unwrap().id(), "k3s");
        let err = registry.get("minikube").err().unwrap();
        assert!(err.to_string().contains("available: k3s, kind"));
    }

    #[test]
    fn test_kind_config_maps_argocd_ports() {
        let mut spec = spec("dev");
        spec.options
            .insert("image".to_string(), json!("kindest/node:v1.29.2"));

        let config = kind_config(&spec);
        assert!(config.contains("name: dev"));
        assert!(config.contains("containerPort: 30080"));
        assert!(config.contains("hostPort: 8443"));
        assert!(config.contains("image: kindest/node:v1.29.2"));

        let parsed: serde_yaml::Value = serde_yaml::from_str(&config).unwrap();
        assert_eq!(parsed["nodes"][0]["role"], "control-plane");
    }

    #[tokio::test]
    async fn test_status_exists_and_ready() {
        let runner = Arc::new(ScriptedRunner::new(|cmd| {
            if cmd.starts_with(&["kind", "get", "clusters"]) {
                Ok("other\ndev\n".to_string())
            } else {
                Ok("Kubernetes control plane is running".to_string())
            }
        }));
        let status = fast(runner).status("dev").await.unwrap();

        assert!(status.exists);
        assert!(status.ready);
        assert_eq!(status.context, "kind-dev");
    }

    #[tokio::test]
    async fn test_status_missing_cluster_skips_api_check() {
        let runner = Arc::new(ScriptedRunner::new(|_| Ok("other\n".to_string())));
        let status = fast(runner.clone()).status("dev").await.unwrap();

        assert!(!status.exists);
        assert!(!status.ready);
        assert_eq!(runner.count(&["kubectl"]), 0);
    }

    #[tokio::test]
    async fn test_create_installs_addons_after_ready() {
        let runner = Arc::new(ScriptedRunner::new(|cmd| {
            if cmd.starts_with(&["kind", "version"]) {
                Ok("kind v0.22.0 go1.21.7 linux/amd64".to_string())
            } else {
                Ok(String::new())
            }
        }));
        fast(runner.clone()).create(&spec("dev")).await.unwrap();

        let calls: Vec<String> = runner.calls().iter().map(|c| c.display()).collect();
        let create = calls.iter().position(|c| c.starts_with("kind create cluster")).unwrap();
        let ready = calls.iter().position(|c| c.contains("cluster-info")).unwrap();
        let argocd = calls
            .iter()
            .position(|c| c.contains(DEFAULT_ARGOCD_MANIFEST))
            .unwrap();
        let ingress = calls
            .iter()
            .position(|c| c.contains(DEFAULT_INGRESS_MANIFEST))
            .unwrap();

        assert!(create < ready && ready < argocd && argocd < ingress);
        assert_eq!(runner.count(&["kubectl", "--context", "kind-dev", "-n", "argocd", "patch"]), 1);
    }

    #[tokio::test]
    async fn test_create_without_kind_binary() {
        let runner = Arc::new(ScriptedRunner::new(|_| Err(fail("No such file or directory"))));
        let err = fast(runner).create(&spec("dev")).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotAvailable(_)));
    }

    #[tokio::test]
    async fn test_create_times_out_when_api_never_answers() {
        let runner = Arc::new(ScriptedRunner::new(|cmd| {
            if cmd.starts_with(&["kubectl", "cluster-info"]) {
                Err(fail("connection refused"))
            } else {
                Ok("kind v0.22.0".to_string())
            }
        }));
        let err = fast(runner.clone()).create(&spec("dev")).await.unwrap_err();

        assert!(matches!(err, ProviderError::NotReady { .. }));
        assert!(runner.count(&["kubectl", "cluster-info"]) >= 2);
    }

    // ---------- k3s ----------

    fn fast_k3s(runner: Arc<ScriptedRunner>) -> K3sProvider {
        K3sProvider::new(runner, AddonManifests::default())
            .with_ready_wait(Duration::from_millis(50), Duration::from_millis(10))
    }

    #[test]
    fn test_k3d_args_map_argocd_ports_and_image() {
        let mut spec = spec("dev");
        spec.options
            .insert("image".to_string(), json!("rancher/k3s:v1.29.2-k3s1"));

        let argv = k3d_create_args(&spec);
        assert_eq!(&argv[..4], ["k3d", "cluster", "create", "dev"]);
        assert!(argv.iter().any(|a| a == "--disable=traefik@server:0"));
        assert!(argv.iter().any(|a| a == "8080:30080@server:0"));
        assert!(argv.iter().any(|a| a == "8443:30443@server:0"));
        assert_eq!(&argv[argv.len() - 2..], ["--image", "rancher/k3s:v1.29.2-k3s1"]);
    }

    #[tokio::test]
    async fn test_k3s_create_waits_then_installs_addons() {
        let runner = Arc::new(ScriptedRunner::new(|cmd| {
            if cmd.starts_with(&["k3d", "version"]) {
                Ok("k3d version v5.6.0\nk3s version v1.27.4-k3s1 (default)".to_string())
            } else {
                Ok(String::new())
            }
        }));
        fast_k3s(runner.clone()).create(&spec("dev")).await.unwrap();

        let calls: Vec<String> = runner.calls().iter().map(|c| c.display()).collect();
        let create = calls.iter().position(|c| c.starts_with("k3d cluster create dev")).unwrap();
        let ready = calls
            .iter()
            .position(|c| c.contains("cluster-info --context k3d-dev"))
            .unwrap();
        let argocd = calls
            .iter()
            .position(|c| c.contains(DEFAULT_ARGOCD_MANIFEST))
            .unwrap();

        assert!(create < ready && ready < argocd);
        assert_eq!(runner.count(&["kubectl", "--context", "k3d-dev", "-n", "argocd", "patch"]), 1);
        assert_eq!(runner.count(&["kind"]), 0);
    }

    #[tokio::test]
    async fn test_k3s_create_without_k3d_binary() {
        let runner = Arc::new(ScriptedRunner::new(|_| Err(fail("No such file or directory"))));
        let err = fast_k3s(runner.clone()).create(&spec("dev")).await.unwrap_err();

        assert!(matches!(err, ProviderError::NotAvailable(ref tool) if tool == "k3d"));
        assert_eq!(runner.count(&["k3d", "cluster"]), 0);
    }

    #[tokio::test]
    async fn test_k3s_create_times_out_when_api_never_answers() {
        let runner = Arc::new(ScriptedRunner::new(|cmd| {
            if cmd.starts_with(&["kubectl", "cluster-info"]) {
                Err(fail("connection refused"))
            } else {
                Ok("k3d version v5.6.0".to_string())
            }
        }));
        let err = fast_k3s(runner.clone()).create(&spec("dev")).await.unwrap_err();

        assert!(matches!(err, ProviderError::NotReady { .. }));
        assert_eq!(runner.count(&["kubectl", "--context"]), 0);
    }

    #[tokio::test]
    async fn test_k3s_status_reads_cluster_list() {
        let runner = Arc::new(ScriptedRunner::new(|cmd| {
            if cmd.starts_with(&["k3d", "cluster", "list"]) {
                Ok(r#"[{"name": "other", "servers": 1}, {"name": "dev", "servers": 1}]"#.to_string())
            } else {
                Ok("Kubernetes control plane is running".to_string())
            }
        }));
        let status = fast_k3s(runner).status("dev").await.unwrap();

        assert_eq!(status.provider, "k3s");
        assert!(status.exists);
        assert!(status.ready);
        assert_eq!(status.context, "k3d-dev");
    }

    #[tokio::test]
    async fn test_k3s_status_missing_cluster_skips_api_check() {
        let runner = Arc::new(ScriptedRunner::new(|_| Ok("[]".to_string())));
        let status = fast_k3s(runner.clone()).status("dev").await.unwrap();

        assert!(!status.exists);
        assert!(!status.ready);
        assert_eq!(runner.count(&["kubectl"]), 0);
    }

    #[tokio::test]
    async fn test_k3s_delete() {
        let runner = Arc::new(ScriptedRunner::new(|_| Ok(String::new())));
        fast_k3s(runner.clone()).delete("dev").await.unwrap();

        assert_eq!(runner.count(&["k3d", "cluster", "delete", "dev"]), 1);
    }
}
