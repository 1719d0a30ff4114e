use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::ProcessHandle;
use crate::error::{KernelError, Result};
use crate::scheduler::HostAffinity;

/// One entry of the declarative service catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    /// Defaults to the service name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_affinity: Option<HostAffinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_by_default: Option<bool>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executable: None,
            args: Vec::new(),
            host_affinity: None,
            enabled_by_default: None,
        }
    }

    pub fn with_affinity(mut self, affinity: HostAffinity) -> Self {
        self.host_affinity = Some(affinity);
        self
    }

    pub fn disabled_by_default(mut self) -> Self {
        self.enabled_by_default = Some(false);
        self
    }

    pub fn executable(&self) -> &str {
        self.executable.as_deref().unwrap_or(&self.name)
    }

    pub fn enabled_by_default(&self) -> bool {
        self.enabled_by_default.unwrap_or(true)
    }

    pub fn launch_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend(["--service".to_string(), self.name.clone()]);
        args
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ServiceStatus {
    New,
    Running {
        process: ProcessHandle,
        started_at: DateTime<Utc>,
    },
    Stopped {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        process: Option<ProcessHandle>,
        stopped_at: DateTime<Utc>,
    },
    Crashed {
        process: ProcessHandle,
        crashed_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceState {
    pub spec: ServiceSpec,
    pub enabled: bool,
    pub status: ServiceStatus,
}

impl ServiceState {
    pub fn discovered(spec: ServiceSpec) -> Self {
        Self {
            enabled: spec.enabled_by_default(),
            spec,
            status: ServiceStatus::New,
        }
    }

    pub fn process(&self) -> Option<&ProcessHandle> {
        match &self.status {
            ServiceStatus::Running { process, .. } => Some(process),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, ServiceStatus::Running { .. })
    }

    /// Enabled but not running for a reason other than an explicit stop.
    pub fn wants_restart(&self) -> bool {
        self.enabled && matches!(self.status, ServiceStatus::New | ServiceStatus::Crashed { .. })
    }

    pub fn mark_running(&mut self, process: ProcessHandle) {
        self.status = ServiceStatus::Running {
            process,
            started_at: Utc::now(),
        };
    }

    pub fn mark_stopped(&mut self) {
        let process = self.process().cloned();
        self.status = ServiceStatus::Stopped {
            process,
            stopped_at: Utc::now(),
        };
    }

    pub fn mark_crashed(&mut self) {
        if let Some(process) = self.process().cloned() {
            self.status = ServiceStatus::Crashed {
                process,
                crashed_at: Utc::now(),
            };
        }
    }
}

/// Result codes of the client-facing service operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceOutcome {
    Ok,
    NotFound,
    AlreadyRunning,
    AlreadyEnabled,
    AlreadyDisabled,
    NotRunning,
    KillFailed,
    FailedToStart,
}

/// Read the catalog: a JSON array of [`ServiceSpec`]. Names must be unique.
pub fn load_catalog(path: &Path) -> Result<Vec<ServiceSpec>> {
    let raw = std::fs::read_to_string(path)?;
    let catalog: Vec<ServiceSpec> = serde_json::from_str(&raw)?;
    validate_catalog(&catalog)?;
    Ok(catalog)
}

pub fn validate_catalog(catalog: &[ServiceSpec]) -> Result<()> {
    let mut names = HashSet::new();
    for spec in catalog {
        if spec.name.is_empty() {
            return Err(KernelError::Misconfigured("service with empty name".into()));
        }
        if !names.insert(spec.name.as_str()) {
            return Err(KernelError::Misconfigured(format!(
                "service {} listed twice",
                spec.name
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogChange {
    Added(ServiceSpec),
    Removed(String),
    Changed(ServiceSpec),
}

/// What reload has to do to bring `current` in line with `catalog`.
pub fn diff_catalog(
    catalog: &[ServiceSpec],
    current: &BTreeMap<String, ServiceState>,
) -> Vec<CatalogChange> {
    let mut changes = Vec::new();
    for spec in catalog {
        match current.get(&spec.name) {
            None => changes.push(CatalogChange::Added(spec.clone())),
            Some(state) if state.spec != *spec => changes.push(CatalogChange::Changed(spec.clone())),
            Some(_) => {}
        }
    }
    let listed: HashSet<&str> = catalog.iter().map(|s| s.name.as_str()).collect();
    for name in current.keys() {
        if !listed.contains(name.as_str()) {
            changes.push(CatalogChange::Removed(name.clone()));
        }
    }
    changes
}
