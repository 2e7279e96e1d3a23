//! Command-line interface for gitops-up.
//!
//! Provides commands for bringing a deployment up, validating a manifest,
//! inspecting or tearing down the cluster, operating on applications
//! directly and showing the resolved configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use crate::adapters::{ClusterStatus, CommandRunner, Kubectl, ProcessRunner, ProviderRegistry};
use crate::argocd::ArgoClient;
use crate::config::{self, ResolvedConfig};
use crate::core::{standard_steps, ArgoClientFactory, Collaborators, ExecutionEngine};
use crate::domain::{AppState, ClusterSpec, RunResults, RunSummary, TargetState};

/// gitops-up - Idempotent bring-up of a local GitOps control plane
#[derive(Parser, Debug)]
#[command(name = "gitops-up")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bring the cluster, Argo CD, secrets and applications to the desired state
    Up {
        /// Target-state manifest (defaults to the configured manifest)
        #[arg(short, long)]
        manifest: Option<PathBuf>,

        /// Execute every step without checking current state first
        #[arg(long)]
        force: bool,
    },

    /// Validate a manifest and show the planned steps
    Validate {
        /// Target-state manifest (defaults to the configured manifest)
        #[arg(short, long)]
        manifest: Option<PathBuf>,

        /// Also report the current state of each step
        #[arg(long)]
        status: bool,
    },

    /// Delete the cluster declared in the manifest
    Down {
        /// Target-state manifest (defaults to the configured manifest)
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },

    /// Inspect the cluster declared in the manifest
    Cluster {
        #[command(subcommand)]
        command: ClusterCommands,
    },

    /// Operate on Argo CD applications
    App {
        #[command(subcommand)]
        command: AppCommands,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum ClusterCommands {
    /// Show whether the cluster exists and its API answers
    Status {
        /// Target-state manifest (defaults to the configured manifest)
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum AppCommands {
    /// List applications
    List,

    /// Show one application
    Get {
        /// Application name
        name: String,
    },

    /// Trigger a sync
    Sync {
        /// Application name
        name: String,

        /// Wait until the application is healthy
        #[arg(long)]
        wait: bool,

        /// Seconds to wait for health
        #[arg(long, default_value = "300")]
        timeout: u64,

        /// Force the sync (replace resources)
        #[arg(long)]
        force: bool,
    },

    /// Delete an application
    Delete {
        /// Application name
        name: String,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = config::load_config()?;
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());

        match self.command {
            Commands::Up { manifest, force } => up(&config, runner, manifest, force).await,
            Commands::Validate { manifest, status } => {
                validate(&config, runner, manifest, status).await
            }
            Commands::Down { manifest } => down(&config, runner, manifest).await,
            Commands::Cluster {
                command: ClusterCommands::Status { manifest },
            } => {
                let target = load_target(&config, manifest)?;
                let status = cluster_status(&providers(&config, runner), &target.cluster).await?;
                print_cluster_status(&status);
                Ok(())
            }
            Commands::App { command } => app(&config, runner, command).await,
            Commands::Config => {
                show_config(&config);
                Ok(())
            }
        }
    }
}

fn load_target(config: &ResolvedConfig, manifest: Option<PathBuf>) -> Result<TargetState> {
    let path = manifest.unwrap_or_else(|| config.manifest.clone());
    TargetState::from_file(&path)
}

fn providers(config: &ResolvedConfig, runner: Arc<dyn CommandRunner>) -> ProviderRegistry {
    ProviderRegistry::with_defaults(runner, config.addons.clone())
}

fn build_engine(config: &ResolvedConfig, runner: Arc<dyn CommandRunner>) -> ExecutionEngine {
    let collab = Collaborators {
        providers: Arc::new(providers(config, runner.clone())),
        kube: Arc::new(Kubectl::new(runner.clone()).with_timeout(config.argocd.command_timeout)),
    };
    let factory = ArgoClientFactory::new(runner, config.argocd.clone());
    ExecutionEngine::new(standard_steps(&collab), Arc::new(factory))
}

/// Bring everything up
async fn up(
    config: &ResolvedConfig,
    runner: Arc<dyn CommandRunner>,
    manifest: Option<PathBuf>,
    force: bool,
) -> Result<()> {
    let target = load_target(config, manifest)?;
    let mut engine = build_engine(config, runner);

    // Ctrl-C only abandons the local wait; syncs already triggered keep running server-side
    let outcome = tokio::select! {
        result = engine.execute(&target, None, force) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    print_results(engine.results());

    match outcome {
        None => {
            warn!("Interrupted; remote synchronization continues server-side");
            bail!("Interrupted");
        }
        Some(Err(e)) => Err(e.into()),
        Some(Ok(_)) => {
            let summary = engine.summary();
            if !summary.is_success() {
                bail!("{} step(s) failed", summary.failed);
            }
            Ok(())
        }
    }
}

/// Validate the manifest and show the plan
async fn validate(
    config: &ResolvedConfig,
    runner: Arc<dyn CommandRunner>,
    manifest: Option<PathBuf>,
    status: bool,
) -> Result<()> {
    let target = load_target(config, manifest)?;
    let mut engine = build_engine(config, runner);

    println!("Manifest is valid");
    println!(
        "  Cluster: {} (provider: {})",
        target.cluster.name, target.cluster.provider
    );
    println!("  Secrets: {}", target.secret_groups().len());
    println!("  Repo credentials: {}", target.repo_creds.len());
    println!("  Applications: {}", target.apps.len());
    println!();
    println!("Planned steps:");
    for (i, step) in engine.steps().iter().enumerate() {
        let client = if step.requires_client { " (requires Argo CD client)" } else { "" };
        println!("  {}. {:<12} {}{}", i + 1, step.name, step.description, client);
    }

    if status {
        println!();
        let results = engine.check_all(&target, None).await;
        print_results(&results);
    }

    Ok(())
}

/// Delete the declared cluster
async fn down(
    config: &ResolvedConfig,
    runner: Arc<dyn CommandRunner>,
    manifest: Option<PathBuf>,
) -> Result<()> {
    let target = load_target(config, manifest)?;
    let provider = providers(config, runner).get(&target.cluster.provider)?;

    provider
        .delete(&target.cluster.name)
        .await
        .with_context(|| format!("Failed to delete cluster '{}'", target.cluster.name))?;

    println!("Deleted cluster '{}'", target.cluster.name);
    Ok(())
}

/// Status of the declared cluster from its provider
async fn cluster_status(providers: &ProviderRegistry, cluster: &ClusterSpec) -> Result<ClusterStatus> {
    let provider = providers.get(&cluster.provider)?;
    provider
        .status(&cluster.name)
        .await
        .with_context(|| format!("Failed to get status of cluster '{}'", cluster.name))
}

async fn app(config: &ResolvedConfig, runner: Arc<dyn CommandRunner>, command: AppCommands) -> Result<()> {
    let mut client = ArgoClient::connect(runner, config.argocd.clone()).await?;

    match command {
        AppCommands::List => {
            let apps = client.list_apps().await?;
            if apps.is_empty() {
                println!("No applications found");
                return Ok(());
            }
            print_app_header();
            for state in &apps {
                print_app_row(state);
            }
        }
        AppCommands::Get { name } => {
            let state = client.get_app(&name).await?;
            print_app_header();
            print_app_row(&state);
        }
        AppCommands::Sync {
            name,
            wait,
            timeout,
            force,
        } => {
            let outcome = tokio::select! {
                result = client.sync_app(&name, wait, Duration::from_secs(timeout), force) => Some(result),
                _ = tokio::signal::ctrl_c() => None,
            };
            match outcome {
                Some(result) => println!("{}: {}", name, result?.as_str()),
                None => {
                    warn!(app = %name, "Interrupted; sync continues server-side");
                    bail!("Interrupted");
                }
            }
        }
        AppCommands::Delete { name } => {
            client.delete_app(&name).await?;
            println!("Deleted application '{}'", name);
        }
    }

    Ok(())
}

fn print_results(results: &RunResults) {
    if results.is_empty() {
        println!("No steps were attempted");
        return;
    }

    println!("{:<12} {:<10} {}", "STEP", "STATE", "REASON");
    println!("{}", "-".repeat(75));
    for (name, status) in results {
        println!("{:<12} {:<10} {}", name, status.state, status.reason);
    }

    let summary = RunSummary::from_results(results);
    println!();
    println!(
        "Summary: {} completed, {} skipped, {} failed, {} pending",
        summary.completed, summary.skipped, summary.failed, summary.pending
    );
}

fn print_cluster_status(status: &ClusterStatus) {
    let yes_no = |b: bool| if b { "yes" } else { "no" };
    println!("Cluster:  {}", status.name);
    println!("Provider: {}", status.provider);
    println!("Exists:   {}", yes_no(status.exists));
    println!("Ready:    {}", yes_no(status.ready));
    println!("Context:  {}", status.context);
}

fn print_app_header() {
    println!(
        "{:<24} {:<16} {:<10} {:<12} {}",
        "NAME", "NAMESPACE", "SYNC", "HEALTH", "REVISION"
    );
    println!("{}", "-".repeat(80));
}

fn print_app_row(state: &AppState) {
    println!(
        "{:<24} {:<16} {:<10} {:<12} {}",
        state.name,
        state.namespace,
        state.sync.as_str(),
        state.health.as_str(),
        state.revision.as_deref().unwrap_or("-")
    );
}

fn show_config(cfg: &ResolvedConfig) {
    println!("gitops-up configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!("Manifest:    {}", cfg.manifest.display());
    println!();
    println!("Argo CD:");
    println!("  Namespace:        {}", cfg.argocd.namespace);
    println!("  Server:           {}", cfg.argocd.server);
    println!("  Insecure:         {}", cfg.argocd.insecure);
    println!("  Fallback servers: {}", cfg.argocd.fallback_servers.join(", "));
    println!();
    println!("Timeouts:");
    println!("  Command: {}s", cfg.argocd.command_timeout.as_secs());
    println!("  Probe:   {}s", cfg.argocd.probe_timeout.as_secs());
    println!("  Login:   {}s", cfg.argocd.login_timeout.as_secs());
    println!();
    println!("Add-ons:");
    println!("  Argo CD: {}", cfg.addons.argocd);
    println!("  Ingress: {}", cfg.addons.ingress);
}
