//! argv builders for the argocd CLI.
//!
//! Pure functions: no I/O, so every flag decision is unit-testable.

use crate::domain::{AppSpec, RepoCredSpec, RepoType, SyncPolicy};

/// In-cluster API server, the destination of every application
pub const DEST_SERVER: &str = "https://kubernetes.default.svc";

fn argv(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

/// Preferred server followed by fallbacks, de-duplicated, order kept
pub fn candidate_servers(preferred: &str, fallbacks: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for server in std::iter::once(preferred).chain(fallbacks.iter().map(String::as_str)) {
        if !server.is_empty() && !out.iter().any(|s| s == server) {
            out.push(server.to_string());
        }
    }
    out
}

fn is_login(argv: &[String]) -> bool {
    argv.get(1).map(String::as_str) == Some("login")
}

/// Tag an argocd command with the active server and `--insecure`
///
/// `login` takes its server positionally, so it only gets `--insecure`.
/// Non-argocd commands pass through untouched.
pub fn with_server(mut argv: Vec<String>, server: &str, insecure: bool) -> Vec<String> {
    if argv.first().map(String::as_str) != Some("argocd") {
        return argv;
    }

    let has = |argv: &[String], flag: &str| argv.iter().any(|a| a == flag);

    if !is_login(&argv) && !has(&argv, "--server") && !has(&argv, "-s") {
        argv.push("--server".to_string());
        argv.push(server.to_string());
    }
    if insecure && !has(&argv, "--insecure") {
        argv.push("--insecure".to_string());
    }
    argv
}

/// Cheap authenticated identity call used to detect an existing session
pub fn session_probe(server: &str) -> Vec<String> {
    argv(&["argocd", "--server", server, "account", "get-user-info", "-o", "json"])
}

pub fn login(server: &str, password: &str, grpc_web: bool) -> Vec<String> {
    let mut args = argv(&["argocd", "login", server, "--username", "admin", "--password", password]);
    if grpc_web {
        args.push("--grpc-web".to_string());
    }
    args
}

pub fn logout(server: &str) -> Vec<String> {
    argv(&["argocd", "logout", server])
}

pub fn app_create(spec: &AppSpec) -> Vec<String> {
    app_source_args("create", spec)
}

pub fn app_update(spec: &AppSpec) -> Vec<String> {
    app_source_args("set", spec)
}

/// Shared tail of `app create` and `app set`
///
/// Only the first source of a multi-source app is expressible on the CLI.
fn app_source_args(verb: &str, spec: &AppSpec) -> Vec<String> {
    let mut args = argv(&["argocd", "app", verb, &spec.name]);

    if let Some(source) = spec.primary_source() {
        args.extend(["--repo".to_string(), source.repo_url.clone()]);

        match &source.chart {
            Some(chart) => args.extend(["--helm-chart".to_string(), chart.clone()]),
            None => args.extend([
                "--path".to_string(),
                source.path.clone().unwrap_or_else(|| ".".to_string()),
            ]),
        }

        if let Some(helm) = &source.helm {
            if let Some(release) = &helm.release_name {
                args.extend(["--release-name".to_string(), release.clone()]);
            }
            // Chart sources can only reference files packaged inside the chart
            let is_chart = source.chart.is_some();
            for file in &helm.value_files {
                if is_chart && (file.contains('/') || file.starts_with('$')) {
                    continue;
                }
                args.extend(["--values".to_string(), file.clone()]);
            }
        }
    }

    args.extend([
        "--dest-server".to_string(),
        DEST_SERVER.to_string(),
        "--dest-namespace".to_string(),
        spec.namespace.clone(),
        "--project".to_string(),
        spec.project.clone(),
        "--revision".to_string(),
        spec.effective_revision().to_string(),
    ]);
    args
}

/// Follow-up command enabling automated sync, if the app asks for it
pub fn sync_policy(spec: &AppSpec) -> Option<Vec<String>> {
    match spec.sync_policy {
        SyncPolicy::Auto => Some(argv(&["argocd", "app", "set", &spec.name, "--sync-policy", "automated"])),
        SyncPolicy::Manual => None,
    }
}

pub fn app_sync(name: &str, force: bool) -> Vec<String> {
    let mut args = argv(&["argocd", "app", "sync", name]);
    if force {
        args.push("--force".to_string());
    }
    args
}

pub fn app_wait_healthy(name: &str, timeout_secs: u64) -> Vec<String> {
    argv(&["argocd", "app", "wait", name, "--health", "--timeout", &timeout_secs.to_string()])
}

pub fn app_get(name: &str) -> Vec<String> {
    argv(&["argocd", "app", "get", name, "-o", "json"])
}

pub fn app_list() -> Vec<String> {
    argv(&["argocd", "app", "list", "-o", "json"])
}

pub fn app_delete(name: &str) -> Vec<String> {
    argv(&["argocd", "app", "delete", name, "--yes"])
}

pub fn repo_list() -> Vec<String> {
    argv(&["argocd", "repo", "list", "-o", "json"])
}

pub fn repo_add(cred: &RepoCredSpec) -> Vec<String> {
    let mut args = argv(&[
        "argocd",
        "repo",
        "add",
        &cred.repo_url,
        "--username",
        &cred.username,
        "--password",
        &cred.password,
        "--type",
        cred.repo_type.as_str(),
    ]);
    if cred.enable_oci {
        args.push("--enable-oci".to_string());
    }
    // argocd refuses helm repos without a name
    if cred.repo_type == RepoType::Helm {
        let name = cred
            .name
            .clone()
            .unwrap_or_else(|| derive_repo_name(&cred.repo_url));
        if !name.is_empty() {
            args.extend(["--name".to_string(), name]);
        }
    }
    args
}

/// Last path segment of a repository URL
pub fn derive_repo_name(repo_url: &str) -> String {
    repo_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(repo_url)
        .to_string()
}
