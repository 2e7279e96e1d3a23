//! Shared test fixtures: argv helpers, admin secret and settings.

#![allow(dead_code)]

use std::time::Duration;

use gitops_up::adapters::CommandLine;
use gitops_up::ArgoSettings;

pub use gitops_up::adapters::process::scripted::{fail, ScriptedRunner};

/// Value of `flag` in `cmd`, if present
pub fn flag_value<'a>(cmd: &'a CommandLine, flag: &str) -> Option<&'a str> {
    let argv = cmd.argv();
    argv.iter()
        .position(|a| a == flag)
        .and_then(|i| argv.get(i + 1))
        .map(String::as_str)
}

/// `base64("s3cret")`
pub const ADMIN_PASSWORD_B64: &str = "czNjcmV0";

/// Output of `kubectl get secret argocd-initial-admin-secret -o json`
pub fn admin_secret_json() -> String {
    format!(r#"{{"data": {{"password": "{}"}}}}"#, ADMIN_PASSWORD_B64)
}

/// Settings with two candidate servers and short timeouts
pub fn settings() -> ArgoSettings {
    ArgoSettings {
        namespace: "argocd".to_string(),
        server: "primary:8080".to_string(),
        insecure: true,
        fallback_servers: vec!["primary:8080".to_string(), "secondary:8080".to_string()],
        command_timeout: Duration::from_secs(5),
        probe_timeout: Duration::from_secs(1),
        login_timeout: Duration::from_secs(1),
        logout_timeout: Duration::from_secs(1),
    }
}
