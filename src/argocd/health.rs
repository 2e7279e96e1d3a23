//! Diagnosis of applications that never turned healthy.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

/// First resource of an application that is not Healthy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnhealthyResource {
    pub kind: String,
    pub name: String,
    pub status: String,
    pub message: String,
}

impl fmt::Display for UnhealthyResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.kind, self.name, self.status)?;
        if !self.message.is_empty() {
            write!(f, " - {}", self.message)?;
        }
        Ok(())
    }
}

/// Scan `status.resources` of an `argocd app get -o json` object
///
/// Resources without a health entry (e.g. ConfigMaps) are ignored.
pub fn first_unhealthy(app: &Value) -> Option<UnhealthyResource> {
    let resources = app.pointer("/status/resources")?.as_array()?;

    resources.iter().find_map(|res| {
        let health = res.get("health")?;
        let status = health.get("status")?.as_str()?;
        if status.is_empty() || status == "Healthy" {
            return None;
        }

        let text = |v: Option<&Value>| v.and_then(Value::as_str).unwrap_or_default().to_string();
        Some(UnhealthyResource {
            kind: text(res.get("kind")),
            name: text(res.get("name")),
            status: status.to_string(),
            message: text(health.get("message")),
        })
    })
}

/// ": <diagnosis>" or empty, for appending to a timeout message
pub(crate) fn diagnosis_suffix(unhealthy: &Option<UnhealthyResource>) -> String {
    unhealthy
        .as_ref()
        .map(|u| format!(": {}", u))
        .unwrap_or_default()
}
