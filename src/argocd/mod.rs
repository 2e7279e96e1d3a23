//! Authenticated Argo CD client.
//!
//! `ArgoClient` wraps the argocd CLI with session discovery, admin login
//! (with a `--grpc-web` fallback) and a single re-login retry per call.
//! One client is owned by one run; its session is never shared.

pub mod args;
pub mod health;

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::kubectl::read_secret_field;
use crate::adapters::process::{redact, CommandLine, CommandRunner, ProcessError};
use crate::domain::{AppSpec, AppState, HealthStatus, RepoCredSpec};

pub use health::UnhealthyResource;

/// Secret holding the bootstrap admin password
const ADMIN_SECRET: &str = "argocd-initial-admin-secret";

/// Extra process budget on top of an `app wait --timeout`
const WAIT_GRACE: Duration = Duration::from_secs(30);

/// Errors from the Argo CD client
#[derive(Debug, Error)]
pub enum ArgoError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Invalid JSON from '{command}': {message}")]
    Decode { command: String, message: String },

    #[error("Failed to read Argo CD admin credential: {0}")]
    Bootstrap(String),

    #[error("Failed to authenticate with Argo CD on any known server (tried: {})", .candidates.join(", "))]
    AuthenticationFailed { candidates: Vec<String> },

    #[error("{app} not healthy after {timeout_secs}s{}", health::diagnosis_suffix(.unhealthy))]
    NotHealthy {
        app: String,
        timeout_secs: u64,
        unhealthy: Option<UnhealthyResource>,
    },

    #[error("Failed to create or update application '{app}'\n  create: {create}\n  update: {update}\n  error: {error}")]
    CreateOrUpdate {
        app: String,
        create: String,
        update: String,
        error: Box<ArgoError>,
    },
}

impl ArgoError {
    fn process(&self) -> Option<&ProcessError> {
        match self {
            Self::Process(e) => Some(e),
            _ => None,
        }
    }
}

/// Connection settings
#[derive(Debug, Clone)]
pub struct ArgoSettings {
    /// Namespace Argo CD runs in (holds the admin secret)
    pub namespace: String,

    /// Preferred server address
    pub server: String,

    /// Pass `--insecure` (self-signed local certificates)
    pub insecure: bool,

    /// Addresses tried after the preferred one
    pub fallback_servers: Vec<String>,

    pub command_timeout: Duration,
    pub probe_timeout: Duration,
    pub login_timeout: Duration,
    pub logout_timeout: Duration,
}

impl Default for ArgoSettings {
    fn default() -> Self {
        Self {
            namespace: "argocd".to_string(),
            server: std::env::var("ARGOCD_SERVER").unwrap_or_else(|_| "localhost:8080".to_string()),
            insecure: true,
            fallback_servers: vec![
                "argocd.localtest.me".to_string(),
                "localhost:8080".to_string(),
                "127.0.0.1:8080".to_string(),
            ],
            command_timeout: Duration::from_secs(120),
            probe_timeout: Duration::from_secs(10),
            login_timeout: Duration::from_secs(20),
            logout_timeout: Duration::from_secs(5),
        }
    }
}

/// Session state of one client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Server commands are tagged with
    pub active_server: String,
    pub logged_in: bool,
}

/// Argo CD CLI façade
pub struct ArgoClient {
    runner: Arc<dyn CommandRunner>,
    settings: ArgoSettings,
    session: Session,
}

impl ArgoClient {
    /// Build a client without authenticating
    pub fn new(runner: Arc<dyn CommandRunner>, settings: ArgoSettings) -> Self {
        let session = Session {
            active_server: settings.server.clone(),
            logged_in: false,
        };
        Self {
            runner,
            settings,
            session,
        }
    }

    /// Build a client and authenticate it
    pub async fn connect(
        runner: Arc<dyn CommandRunner>,
        settings: ArgoSettings,
    ) -> Result<Self, ArgoError> {
        let mut client = Self::new(runner, settings);
        client.login().await?;
        Ok(client)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn settings(&self) -> &ArgoSettings {
        &self.settings
    }

    // ---------- Authentication ----------

    /// Ensure a session: adopt an existing one, else log in as admin
    pub async fn login(&mut self) -> Result<(), ArgoError> {
        if self.session.logged_in {
            return Ok(());
        }

        let candidates = args::candidate_servers(&self.session.active_server, &self.settings.fallback_servers);

        if let Some(server) = self.find_existing_session(&candidates).await {
            info!(server = %server, "Using existing Argo CD session");
            self.adopt(server);
            return Ok(());
        }

        self.logout_stale().await;
        let password = self.admin_password().await?;

        for server in &candidates {
            if self.try_login(server, &password).await {
                info!(server = %server, "Authenticated to Argo CD");
                self.adopt(server.clone());
                return Ok(());
            }
        }

        error!(candidates = ?candidates, "Argo CD login failed on every candidate server");
        Err(ArgoError::AuthenticationFailed { candidates })
    }

    fn adopt(&mut self, server: String) {
        self.session.active_server = server;
        self.session.logged_in = true;
    }

    /// First candidate answering an identity call with a live session
    async fn find_existing_session(&self, candidates: &[String]) -> Option<String> {
        for server in candidates {
            let cmd = self.command(args::session_probe(server), self.settings.probe_timeout);
            match self.runner.run(&cmd).await {
                Ok(out) if session_is_live(&out.stdout) => return Some(server.clone()),
                Ok(_) => debug!(server = %server, "No active session"),
                Err(e) => debug!(server = %server, error = %e, "Session probe failed"),
            }
        }
        None
    }

    async fn logout_stale(&self) {
        let cmd = self.command(
            args::logout(&self.session.active_server),
            self.settings.logout_timeout,
        );
        if let Err(e) = self.runner.run(&cmd).await {
            debug!(error = %e, "Ignoring logout failure");
        }
    }

    async fn admin_password(&self) -> Result<String, ArgoError> {
        let encoded = read_secret_field(
            self.runner.as_ref(),
            &self.settings.namespace,
            ADMIN_SECRET,
            "password",
            self.settings.command_timeout,
        )
        .await
        .map_err(|e| ArgoError::Bootstrap(e.to_string()))?;

        if encoded.trim().is_empty() {
            return Err(ArgoError::Bootstrap(format!(
                "secret {}/{} has no password",
                self.settings.namespace, ADMIN_SECRET
            )));
        }

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| ArgoError::Bootstrap(format!("invalid base64: {}", e)))?;
        String::from_utf8(bytes).map_err(|e| ArgoError::Bootstrap(format!("invalid UTF-8: {}", e)))
    }

    /// Plain login, then once more with `--grpc-web`
    async fn try_login(&self, server: &str, password: &str) -> bool {
        info!(server = %server, "Attempting Argo CD login");
        for grpc_web in [false, true] {
            if grpc_web {
                info!(server = %server, "Retrying login with --grpc-web");
            }
            let cmd = self.command(args::login(server, password, grpc_web), self.settings.login_timeout);
            match self.runner.run(&cmd).await {
                Ok(_) => return true,
                Err(e) => debug!(server = %server, grpc_web, error = %e, "Login attempt failed"),
            }
        }
        info!(server = %server, "Login failed");
        false
    }

    // ---------- Command execution ----------

    fn command(&self, argv: Vec<String>, timeout: Duration) -> CommandLine {
        CommandLine::new(args::with_server(argv, &self.session.active_server, self.settings.insecure))
            .with_timeout(timeout)
    }

    /// Run once; on a failure accepted by `retry_when`, re-authenticate and run exactly once more
    async fn run_with_auth(
        &mut self,
        argv: Vec<String>,
        timeout: Duration,
        retry_when: fn(&ProcessError) -> bool,
    ) -> Result<String, ArgoError> {
        let first = self.runner.run(&self.command(argv.clone(), timeout)).await;
        match first {
            Ok(out) => Ok(out.stdout),
            Err(e) if !retry_when(&e) => Err(e.into()),
            Err(e) => {
                info!(error = %e, "Argo CD command failed; re-authenticating and retrying");
                self.session.logged_in = false;
                self.login().await?;
                let out = self.runner.run(&self.command(argv, timeout)).await?;
                Ok(out.stdout)
            }
        }
    }

    /// Run an argocd command and return stdout
    pub async fn run(&mut self, argv: Vec<String>) -> Result<String, ArgoError> {
        let timeout = self.settings.command_timeout;
        self.run_with_auth(argv, timeout, |_| true).await
    }

    /// Run an argocd command and decode its JSON output
    pub async fn run_json<T: DeserializeOwned>(&mut self, argv: Vec<String>) -> Result<T, ArgoError> {
        let command = redact(&argv);
        let stdout = self.run(argv).await?;
        serde_json::from_str(&stdout).map_err(|e| ArgoError::Decode {
            command,
            message: e.to_string(),
        })
    }

    // ---------- Applications ----------

    /// Create the app, or update it if it already exists; then apply its sync policy
    #[instrument(skip(self, spec), fields(app = %spec.name))]
    pub async fn create_or_update_app(&mut self, spec: &AppSpec) -> Result<(), ArgoError> {
        let create = args::app_create(spec);
        match self.run(create.clone()).await {
            Ok(_) => info!("Created application"),
            Err(e) if e.process().is_some_and(ProcessError::is_already_exists) => {
                info!("Application exists; updating");
                let update = args::app_update(spec);
                if let Err(err) = self.run(update.clone()).await {
                    return Err(ArgoError::CreateOrUpdate {
                        app: spec.name.clone(),
                        create: redact(&create),
                        update: redact(&update),
                        error: Box::new(err),
                    });
                }
            }
            Err(e) => return Err(e),
        }

        if let Some(policy) = args::sync_policy(spec) {
            self.run(policy).await?;
            debug!("Enabled automated sync");
        }
        Ok(())
    }

    pub async fn update_app(&mut self, spec: &AppSpec) -> Result<(), ArgoError> {
        self.run(args::app_update(spec)).await?;
        Ok(())
    }

    /// Trigger a sync; with `wait`, block until Healthy or `timeout`
    #[instrument(skip(self))]
    pub async fn sync_app(
        &mut self,
        name: &str,
        wait: bool,
        timeout: Duration,
        force: bool,
    ) -> Result<HealthStatus, ArgoError> {
        self.run(args::app_sync(name, force)).await?;
        info!("Sync triggered");

        if wait {
            self.wait_healthy(name, timeout).await
        } else {
            Ok(HealthStatus::Unknown)
        }
    }

    /// Wait for Healthy; on timeout report the first unhealthy resource
    pub async fn wait_healthy(&mut self, name: &str, timeout: Duration) -> Result<HealthStatus, ArgoError> {
        let secs = timeout.as_secs();
        match self
            .run_with_auth(args::app_wait_healthy(name, secs), timeout + WAIT_GRACE, session_expired)
            .await
        {
            Ok(_) => Ok(HealthStatus::Healthy),
            Err(e @ ArgoError::AuthenticationFailed { .. }) => Err(e),
            Err(e) => {
                debug!(app = name, error = %e, "Wait did not reach Healthy");
                let unhealthy = self.diagnose(name).await;
                warn!(app = name, diagnosis = ?unhealthy, "Application not healthy");
                Err(ArgoError::NotHealthy {
                    app: name.to_string(),
                    timeout_secs: secs,
                    unhealthy,
                })
            }
        }
    }

    async fn diagnose(&mut self, name: &str) -> Option<UnhealthyResource> {
        match self.run_json::<Value>(args::app_get(name)).await {
            Ok(app) => health::first_unhealthy(&app),
            Err(e) => {
                debug!(app = name, error = %e, "Could not fetch app status for diagnosis");
                None
            }
        }
    }

    pub async fn get_app(&mut self, name: &str) -> Result<AppState, ArgoError> {
        let raw: Value = self.run_json(args::app_get(name)).await?;
        Ok(AppState::from_json(&raw))
    }

    pub async fn list_apps(&mut self) -> Result<Vec<AppState>, ArgoError> {
        let raw: Value = self.run_json(args::app_list()).await?;
        Ok(raw
            .as_array()
            .map(|apps| apps.iter().map(AppState::from_json).collect())
            .unwrap_or_default())
    }

    pub async fn delete_app(&mut self, name: &str) -> Result<(), ArgoError> {
        self.run(args::app_delete(name)).await?;
        info!(app = name, "Deleted application");
        Ok(())
    }

    // ---------- Repositories ----------

    /// URLs of the repositories Argo CD knows about
    pub async fn list_repositories(&mut self) -> Result<Vec<String>, ArgoError> {
        let raw: Value = self.run_json(args::repo_list()).await?;
        Ok(raw
            .as_array()
            .map(|repos| {
                repos
                    .iter()
                    .filter_map(|r| r.get("repo").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Register repository credentials; already-registered counts as success
    pub async fn add_repo_cred(&mut self, cred: &RepoCredSpec) -> Result<(), ArgoError> {
        match self.run(args::repo_add(cred)).await {
            Ok(_) => {
                info!(repo = %cred.repo_url, "Added repository credentials");
                Ok(())
            }
            Err(e) if e.process().is_some_and(repo_already_configured) => {
                info!(repo = %cred.repo_url, "Repository credentials already exist");
                Ok(())
            }
            Err(e) => {
                error!(repo = %cred.repo_url, error = %e, "Failed to add repository credentials");
                Err(e)
            }
        }
    }
}

/// `get-user-info` answered with JSON not saying `{"loggedIn": false}`
///
/// Output that is not JSON (an error page, a login prompt) is no session.
fn session_is_live(stdout: &str) -> bool {
    match serde_json::from_str::<Value>(stdout) {
        Ok(info) => info.get("loggedIn").and_then(Value::as_bool).unwrap_or(true),
        Err(_) => false,
    }
}

/// A failure a fresh login could fix
///
/// Health waits retry only on these, so a timeout is not waited out twice.
fn session_expired(e: &ProcessError) -> bool {
    const MARKERS: &[&str] = &[
        "Unauthenticated",
        "invalid session",
        "token is expired",
        "no session information",
    ];
    MARKERS
        .iter()
        .any(|m| e.stderr_contains(m) || e.stdout.contains(m))
}

fn repo_already_configured(e: &ProcessError) -> bool {
    e.stderr_contains("AlreadyExists")
        || e.stderr_contains("already associated")
        || e.stderr_contains("repository is already configured")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_is_live() {
        assert!(session_is_live(r#"{"loggedIn": true, "username": "admin"}"#));
        assert!(!session_is_live(r#"{"loggedIn": false}"#));
        assert!(session_is_live(r#"{"username": "admin"}"#));
        assert!(!session_is_live("admin"));
        assert!(!session_is_live(""));
    }

    #[test]
    fn test_session_expired_markers() {
        let expired = ProcessError::new(
            "Command failed with exit code 20",
            Some(20),
            "",
            "rpc error: code = Unauthenticated desc = invalid session: token is expired",
        );
        let timed_out = ProcessError::new(
            "Command failed with exit code 20",
            Some(20),
            "",
            "timed out (300s) waiting for app \"web\" match desired state",
        );
        assert!(session_expired(&expired));
        assert!(!session_expired(&timed_out));
    }

    #[test]
    fn test_not_healthy_message_includes_diagnosis() {
        let err = ArgoError::NotHealthy {
            app: "web".into(),
            timeout_secs: 300,
            unhealthy: Some(UnhealthyResource {
                kind: "Deployment".into(),
                name: "web".into(),
                status: "Degraded".into(),
                message: "CrashLoopBackOff".into(),
            }),
        };
        assert_eq!(
            err.to_string(),
            "web not healthy after 300s: Deployment/web: Degraded - CrashLoopBackOff"
        );
    }

    #[test]
    fn test_authentication_failed_lists_candidates() {
        let err = ArgoError::AuthenticationFailed {
            candidates: vec!["localhost:8080".into(), "127.0.0.1:8080".into()],
        };
        assert!(err.to_string().contains("localhost:8080, 127.0.0.1:8080"));
    }

    #[test]
    fn test_repo_already_configured() {
        let e = ProcessError::new("failed", Some(20), "", "existing repository spec is different; already associated");
        assert!(repo_already_configured(&e));
        assert!(!repo_already_configured(&ProcessError::new("failed", Some(1), "", "permission denied")));
    }
}
