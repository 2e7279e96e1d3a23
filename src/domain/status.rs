//! Step status and run results.
//!
//! A `StepStatus` is produced fresh by every check or execute call and is
//! never persisted. The engine collects them into `RunResults`, keyed by
//! step name in the order the steps were attempted.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Final status of every attempted step in one engine run
pub type RunResults = IndexMap<String, StepStatus>;

/// Observed state of a single step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStatus {
    /// Where the step stands
    pub state: StepState,

    /// Human-readable explanation
    #[serde(default)]
    pub reason: String,

    /// Diagnostic payload (missing items, replica counts, ...)
    #[serde(default)]
    pub details: IndexMap<String, serde_json::Value>,

    /// When this status was produced
    pub timestamp: DateTime<Utc>,
}

impl StepStatus {
    /// Create a status with the given state and reason
    pub fn new(state: StepState, reason: impl Into<String>) -> Self {
        Self {
            state,
            reason: reason.into(),
            details: IndexMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn pending(reason: impl Into<String>) -> Self {
        Self::new(StepState::Pending, reason)
    }

    pub fn completed(reason: impl Into<String>) -> Self {
        Self::new(StepState::Completed, reason)
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::new(StepState::Failed, reason)
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::new(StepState::Skipped, reason)
    }

    /// Attach a diagnostic detail
    ///
    /// Values that fail to serialize are recorded as `null`.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or_default();
        self.details.insert(key.into(), value);
        self
    }

    /// True when the step needs no further work (completed or skipped)
    pub fn is_completed(&self) -> bool {
        self.state.is_completed()
    }
}

/// State of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Not yet in the desired state
    Pending,

    /// In the desired state (already, or after execution)
    Completed,

    /// Execution failed
    Failed,

    /// Nothing to do
    Skipped,
}

impl StepState {
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl Default for StepState {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tally of step states across one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub pending: usize,
}

impl RunSummary {
    /// Count the states in a results map
    pub fn from_results(results: &RunResults) -> Self {
        let mut summary = Self::default();
        for status in results.values() {
            match status.state {
                StepState::Completed => summary.completed += 1,
                StepState::Skipped => summary.skipped += 1,
                StepState::Failed => summary.failed += 1,
                StepState::Pending => summary.pending += 1,
            }
        }
        summary
    }

    /// A run succeeds only when nothing failed
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn total(&self) -> usize {
        self.completed + self.skipped + self.failed + self.pending
    }
}
