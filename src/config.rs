//! Configuration for gitops-up.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (ARGOCD_SERVER, GITOPS_UP_MANIFEST)
//! 2. Config file (.gitops-up/config.yaml)
//! 3. Defaults
//!
//! Config file discovery:
//! - Searches current directory and parents for .gitops-up/config.yaml
//! - Falls back to <user config dir>/gitops-up/config.yaml
//! - A relative manifest path is resolved against the project root
//!   (the directory holding .gitops-up/)

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::AddonManifests;
use crate::argocd::ArgoSettings;

/// Default manifest file name
pub const DEFAULT_MANIFEST: &str = "gitops-up.yaml";

const CONFIG_DIR: &str = ".gitops-up";
const CONFIG_FILE: &str = "config.yaml";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    /// Path to the target-state manifest
    pub manifest: Option<String>,
    #[serde(default)]
    pub argocd: ArgoConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub addons: AddonsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArgoConfig {
    pub namespace: Option<String>,
    pub server: Option<String>,
    pub insecure: Option<bool>,
    pub fallback_servers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeoutsConfig {
    pub command_seconds: Option<u64>,
    pub probe_seconds: Option<u64>,
    pub login_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddonsConfig {
    /// Argo CD install manifest (URL or path)
    pub argocd_manifest: Option<String>,
    /// Ingress controller manifest (URL or path)
    pub ingress_manifest: Option<String>,
}

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Target-state manifest
    pub manifest: PathBuf,
    /// Argo CD connection settings
    pub argocd: ArgoSettings,
    /// Add-ons installed by the cluster provider
    pub addons: AddonManifests,
}

/// Per-user config directory (`<user config dir>/gitops-up`)
pub fn user_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("gitops-up"))
}

/// Find config file by searching `start` and its parents, then `user_dir`
///
/// Returns the file and the directory relative paths in it resolve against:
/// the project root for a project file, `start` for the per-user file.
fn find_config_file(start: &Path, user_dir: Option<&Path>) -> Option<(PathBuf, PathBuf)> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some((config_path, current));
        }

        if !current.pop() {
            break;
        }
    }

    let user = user_dir?.join(CONFIG_FILE);
    user.exists().then(|| (user, start.to_path_buf()))
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Load configuration starting the search at `cwd`
///
/// `user_dir` is the per-user config directory searched last and `env`
/// looks up environment variables, so tests can inject both.
pub fn load_config_from<F>(cwd: &Path, user_dir: Option<&Path>, env: F) -> Result<ResolvedConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let found = find_config_file(cwd, user_dir);

    let (file, base_dir) = match &found {
        Some((path, base)) => (load_config_file(path)?, base.clone()),
        None => (ConfigFile::default(), cwd.to_path_buf()),
    };
    let config_file = found.map(|(path, _)| path);

    let manifest = match env("GITOPS_UP_MANIFEST") {
        Some(path) => resolve_path(cwd, &path),
        None => resolve_path(
            &base_dir,
            file.manifest.as_deref().unwrap_or(DEFAULT_MANIFEST),
        ),
    };

    let defaults = ArgoSettings::default();
    let argocd = ArgoSettings {
        namespace: file.argocd.namespace.unwrap_or(defaults.namespace),
        server: env("ARGOCD_SERVER")
            .or(file.argocd.server)
            .unwrap_or_else(|| "localhost:8080".to_string()),
        insecure: file.argocd.insecure.unwrap_or(defaults.insecure),
        fallback_servers: file
            .argocd
            .fallback_servers
            .unwrap_or(defaults.fallback_servers),
        command_timeout: file
            .timeouts
            .command_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.command_timeout),
        probe_timeout: file
            .timeouts
            .probe_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.probe_timeout),
        login_timeout: file
            .timeouts
            .login_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.login_timeout),
        logout_timeout: defaults.logout_timeout,
    };

    let default_addons = AddonManifests::default();
    let addons = AddonManifests {
        argocd: file.addons.argocd_manifest.unwrap_or(default_addons.argocd),
        argocd_namespace: argocd.namespace.clone(),
        ingress: file.addons.ingress_manifest.unwrap_or(default_addons.ingress),
    };

    Ok(ResolvedConfig {
        config_file,
        manifest,
        argocd,
        addons,
    })
}

/// Load configuration for the current directory and process environment
pub fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    load_config_from(&cwd, user_config_dir().as_deref(), |key| std::env::var(key).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_config(root: &Path, content: &str) -> PathBuf {
        let dir = root.join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{}", content).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_file() {
        let temp = TempDir::new().unwrap();
        let user = TempDir::new().unwrap();
        let config = load_config_from(temp.path(), Some(user.path()), no_env).unwrap();

        assert!(config.config_file.is_none());
        assert_eq!(config.manifest, temp.path().join(DEFAULT_MANIFEST));
        assert_eq!(config.argocd.server, "localhost:8080");
        assert_eq!(config.argocd.namespace, "argocd");
        assert!(config.argocd.insecure);
        assert_eq!(config.argocd.command_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_user_config_is_the_fallback() {
        let temp = TempDir::new().unwrap();
        let user = TempDir::new().unwrap();
        let user_file = user.path().join(CONFIG_FILE);
        std::fs::write(&user_file, "manifest: up.yaml\nargocd:\n  server: user:8080\n").unwrap();

        let config = load_config_from(temp.path(), Some(user.path()), no_env).unwrap();

        assert_eq!(config.config_file, Some(user_file));
        assert_eq!(config.argocd.server, "user:8080");
        assert_eq!(config.manifest, temp.path().join("up.yaml"));
    }

    #[test]
    fn test_project_config_wins_over_user_config() {
        let temp = TempDir::new().unwrap();
        let user = TempDir::new().unwrap();
        std::fs::write(user.path().join(CONFIG_FILE), "argocd:\n  server: user:8080\n").unwrap();
        let project = write_config(temp.path(), "argocd:\n  server: project:8080\n");

        let config = load_config_from(temp.path(), Some(user.path()), no_env).unwrap();

        assert_eq!(config.config_file, Some(project));
        assert_eq!(config.argocd.server, "project:8080");
    }

    #[test]
    fn test_config_file_found_from_subdirectory() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            temp.path(),
            r#"
manifest: deploy/up.yaml
argocd:
  server: "argocd.example.test:443"
  insecure: false
  fallback_servers: ["127.0.0.1:8080"]
timeouts:
  login_seconds: 45
addons:
  ingress_manifest: ./ingress.yaml
"#,
        );
        let nested = temp.path().join("apps").join("web");
        std::fs::create_dir_all(&nested).unwrap();

        let config = load_config_from(&nested, None, no_env).unwrap();

        assert_eq!(config.config_file, Some(config_path));
        assert_eq!(config.manifest, temp.path().join("deploy/up.yaml"));
        assert_eq!(config.argocd.server, "argocd.example.test:443");
        assert!(!config.argocd.insecure);
        assert_eq!(config.argocd.fallback_servers, vec!["127.0.0.1:8080".to_string()]);
        assert_eq!(config.argocd.login_timeout, Duration::from_secs(45));
        assert_eq!(config.argocd.probe_timeout, Duration::from_secs(10));
        assert_eq!(config.addons.ingress, "./ingress.yaml");
        assert_eq!(config.addons.argocd, crate::adapters::cluster::DEFAULT_ARGOCD_MANIFEST);
    }

    #[test]
    fn test_env_overrides_file() {
        let temp = TempDir::new().unwrap();
        write_config(temp.path(), "argocd:\n  server: from-file:8080\n");

        let env = |key: &str| match key {
            "ARGOCD_SERVER" => Some("from-env:8080".to_string()),
            "GITOPS_UP_MANIFEST" => Some("/abs/target.yaml".to_string()),
            _ => None,
        };
        let config = load_config_from(temp.path(), None, env).unwrap();

        assert_eq!(config.argocd.server, "from-env:8080");
        assert_eq!(config.manifest, PathBuf::from("/abs/target.yaml"));
    }

    #[test]
    fn test_invalid_config_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        write_config(temp.path(), "argocd: [not, a, mapping]");

        let err = load_config_from(temp.path(), None, no_env).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "gitops-up.yaml"),
            PathBuf::from("/home/user/project/gitops-up.yaml")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path.yaml"),
            PathBuf::from("/absolute/path.yaml")
        );
    }
}
