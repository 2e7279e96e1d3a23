//! Observed state of Argo CD applications.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An application as the control plane reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppState {
    pub name: String,
    pub namespace: String,
    pub health: HealthStatus,
    pub sync: SyncStatus,
    pub revision: Option<String>,
}

impl AppState {
    /// Build from an `argocd app get/list -o json` object
    ///
    /// Missing fields fall back to defaults instead of failing.
    pub fn from_json(obj: &Value) -> Self {
        let name = dig_str(obj, &["metadata", "name"])
            .or_else(|| dig_str(obj, &["name"]))
            .unwrap_or_default();
        let namespace = dig_str(obj, &["spec", "destination", "namespace"])
            .or_else(|| dig_str(obj, &["namespace"]))
            .unwrap_or_else(|| "default".to_string());
        let health = dig_str(obj, &["status", "health", "status"])
            .map(|s| HealthStatus::parse(&s))
            .unwrap_or_default();
        let sync = dig_str(obj, &["status", "sync", "status"])
            .map(|s| SyncStatus::parse(&s))
            .unwrap_or_default();
        let revision = dig_str(obj, &["status", "sync", "revision"]).filter(|r| !r.is_empty());

        Self {
            name,
            namespace,
            health,
            sync,
            revision,
        }
    }

    /// Synced and Healthy at the same time
    pub fn is_synced_and_healthy(&self) -> bool {
        self.sync == SyncStatus::Synced && self.health == HealthStatus::Healthy
    }
}

fn dig_str(obj: &Value, path: &[&str]) -> Option<String> {
    let mut cur = obj;
    for key in path {
        cur = cur.get(key)?;
    }
    cur.as_str().map(str::to_string)
}

/// Application health as reported by Argo CD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Progressing,
    Degraded,
    Suspended,
    Missing,
    Unknown,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

impl HealthStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "Healthy" => Self::Healthy,
            "Progressing" => Self::Progressing,
            "Degraded" => Self::Degraded,
            "Suspended" => Self::Suspended,
            "Missing" => Self::Missing,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "Healthy",
            Self::Progressing => "Progressing",
            Self::Degraded => "Degraded",
            Self::Suspended => "Suspended",
            Self::Missing => "Missing",
            Self::Unknown => "Unknown",
        }
    }
}

/// Application sync state as reported by Argo CD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Synced,
    OutOfSync,
    Unknown,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

impl SyncStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "Synced" => Self::Synced,
            "OutOfSync" => Self::OutOfSync,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "Synced",
            Self::OutOfSync => "OutOfSync",
            Self::Unknown => "Unknown",
        }
    }
}
