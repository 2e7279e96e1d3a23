//! Execution engine.
//!
//! Walks the fixed step list in order. In idempotent mode each step is
//! checked first and only executed when not already complete; in force
//! mode every step is executed. The first executor failure stops the run,
//! and results gathered so far stay available through `results()`.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::CommandRunner;
use crate::argocd::{ArgoClient, ArgoError, ArgoSettings};
use crate::domain::{RunResults, RunSummary, StepStatus, TargetState};

use super::step::ExecutionStep;

/// Errors that abort a run
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Step '{step}' failed: {error:#}")]
    StepFailed { step: String, error: anyhow::Error },
}

/// Builds authenticated clients on demand
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self) -> Result<ArgoClient, ArgoError>;
}

/// Logs in with `ArgoClient::connect`
pub struct ArgoClientFactory {
    runner: Arc<dyn CommandRunner>,
    settings: ArgoSettings,
}

impl ArgoClientFactory {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: ArgoSettings) -> Self {
        Self { runner, settings }
    }
}

#[async_trait]
impl ClientFactory for ArgoClientFactory {
    async fn connect(&self) -> Result<ArgoClient, ArgoError> {
        ArgoClient::connect(self.runner.clone(), self.settings.clone()).await
    }
}

/// Orchestrates one bring-up
pub struct ExecutionEngine {
    steps: Vec<ExecutionStep>,
    factory: Arc<dyn ClientFactory>,
    results: RunResults,
}

/// Lazily held client; construction is attempted at most once per run
struct LazyClient {
    client: Option<ArgoClient>,
    attempted: bool,
}

impl LazyClient {
    fn new(client: Option<ArgoClient>) -> Self {
        let attempted = client.is_some();
        Self { client, attempted }
    }

    /// Connect if `step` needs a client and none exists yet; failures leave it absent
    async fn prepare(&mut self, step: &ExecutionStep, factory: &dyn ClientFactory) {
        if !step.requires_client || self.client.is_some() || self.attempted {
            return;
        }
        self.attempted = true;

        match factory.connect().await {
            Ok(client) => {
                info!(server = %client.session().active_server, "Argo CD client ready");
                self.client = Some(client);
            }
            Err(e) => warn!(error = %e, "Failed to create Argo CD client; continuing without it"),
        }
    }

    /// The client as seen by `step`: only client-requiring steps get one
    fn for_step(&mut self, step: &ExecutionStep) -> Option<&mut ArgoClient> {
        if step.requires_client {
            self.client.as_mut()
        } else {
            None
        }
    }
}

impl ExecutionEngine {
    pub fn new(steps: Vec<ExecutionStep>, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            steps,
            factory,
            results: RunResults::new(),
        }
    }

    pub fn steps(&self) -> &[ExecutionStep] {
        &self.steps
    }

    /// Results of the last run (partial if it aborted)
    pub fn results(&self) -> &RunResults {
        &self.results
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::from_results(&self.results)
    }

    /// Run every step
    ///
    /// With `force`, checks are skipped. Either way the first executor
    /// failure is recorded as failed and returned; later steps are not
    /// attempted.
    #[instrument(skip(self, target, client), fields(run_id = %Uuid::new_v4()))]
    pub async fn execute(
        &mut self,
        target: &TargetState,
        client: Option<ArgoClient>,
        force: bool,
    ) -> Result<RunResults, EngineError> {
        self.results.clear();
        let mut lazy = LazyClient::new(client);

        for step in &self.steps {
            lazy.prepare(step, self.factory.as_ref()).await;

            if force {
                info!(step = %step.name, "Force executing: {}", step.description);
            } else {
                info!(step = %step.name, "Checking: {}", step.description);
                let status = step.check(target, lazy.for_step(step)).await;
                if status.is_completed() {
                    info!(step = %step.name, reason = %status.reason, "Skipped: {}", step.description);
                    self.results.insert(step.name.clone(), status);
                    continue;
                }
                info!(step = %step.name, "Executing: {}", step.description);
            }

            match step.execute(target, lazy.for_step(step)).await {
                Ok(()) => {
                    let reason = if force { "Force executed" } else { "Executed successfully" };
                    info!(step = %step.name, "Completed: {}", step.description);
                    self.results.insert(step.name.clone(), StepStatus::completed(reason));
                }
                Err(e) => {
                    error!(step = %step.name, error = %format!("{:#}", e), "Failed: {}", step.description);
                    self.results
                        .insert(step.name.clone(), StepStatus::failed(format!("{:#}", e)));
                    return Err(EngineError::StepFailed {
                        step: step.name.clone(),
                        error: e,
                    });
                }
            }
        }

        let summary = self.summary();
        info!(
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            "Run finished"
        );
        Ok(self.results.clone())
    }

    /// Run every check without executing anything
    #[instrument(skip(self, target, client))]
    pub async fn check_all(&mut self, target: &TargetState, client: Option<ArgoClient>) -> RunResults {
        self.results.clear();
        let mut lazy = LazyClient::new(client);

        for step in &self.steps {
            lazy.prepare(step, self.factory.as_ref()).await;
            let status = step.check(target, lazy.for_step(step)).await;
            self.results.insert(step.name.clone(), status);
        }
        self.results.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::bail;

    use super::*;
    use crate::core::step::StepAction;
    use crate::domain::StepState;

    struct NoClient;

    #[async_trait]
    impl ClientFactory for NoClient {
        async fn connect(&self) -> Result<ArgoClient, ArgoError> {
            Err(ArgoError::AuthenticationFailed { candidates: vec![] })
        }
    }

    /// Counts connection attempts, always failing
    struct CountingFactory(Arc<AtomicUsize>);

    #[async_trait]
    impl ClientFactory for CountingFactory {
        async fn connect(&self) -> Result<ArgoClient, ArgoError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(ArgoError::Bootstrap("secret not found".into()))
        }
    }

    /// Reports whether it received a client
    struct SeesClient;

    #[async_trait]
    impl StepAction for SeesClient {
        async fn check(&self, _: &TargetState, client: Option<&mut ArgoClient>) -> StepStatus {
            StepStatus::pending(if client.is_some() { "client" } else { "no client" })
        }

        async fn execute(&self, _: &TargetState, client: Option<&mut ArgoClient>) -> anyhow::Result<()> {
            if client.is_none() {
                bail!("Argo CD client required");
            }
            Ok(())
        }
    }

    fn target() -> TargetState {
        TargetState::from_yaml("cluster: { name: dev, provider: kind }").unwrap()
    }

    #[tokio::test]
    async fn test_client_construction_failure_is_not_fatal_until_execute() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let steps = vec![
            ExecutionStep::new("repo-creds", "Configure repos", true, SeesClient),
            ExecutionStep::new("apps", "Deploy apps", true, SeesClient),
        ];
        let mut engine = ExecutionEngine::new(steps, Arc::new(CountingFactory(attempts.clone())));

        let results = engine.check_all(&target(), None).await;
        assert_eq!(results["repo-creds"].reason, "no client");
        assert_eq!(results["apps"].reason, "no client");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        let err = engine.execute(&target(), None, false).await.unwrap_err();
        let EngineError::StepFailed { step, .. } = err;
        assert_eq!(step, "repo-creds");
        assert_eq!(engine.results()["repo-creds"].state, StepState::Failed);
        assert!(!engine.results().contains_key("apps"));
    }

    #[tokio::test]
    async fn test_steps_without_client_requirement_never_connect() {
        let steps = vec![ExecutionStep::new("secrets", "Create secrets", false, SeesClient)];
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut engine = ExecutionEngine::new(steps, Arc::new(CountingFactory(attempts.clone())));

        let results = engine.check_all(&target(), None).await;
        assert_eq!(results["secrets"].reason, "no client");
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_summary_counts_partial_results() {
        let steps = vec![ExecutionStep::new("apps", "Deploy apps", true, SeesClient)];
        let mut engine = ExecutionEngine::new(steps, Arc::new(NoClient));

        assert!(engine.execute(&target(), None, true).await.is_err());
        let summary = engine.summary();
        assert_eq!(summary.failed, 1);
        assert!(!summary.is_success());
    }
}
