use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::JobLimits;
use crate::error::{FleetError, Result};

fn default_true() -> bool {
    true
}

fn default_procs() -> u32 {
    1
}

/// Job description as submitted by users, usually loaded from a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default = "default_true")]
    pub recovery: bool,
    pub apps: Vec<AppSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSpec {
    pub name: String,
    pub argv: Vec<String>,
    #[serde(default = "default_procs")]
    pub num_procs: u32,
    #[serde(default)]
    pub max_restarts: i32,
    #[serde(default)]
    pub max_local_restarts: u32,
}

impl AppSpec {
    pub fn new(name: impl Into<String>, argv: Vec<String>, num_procs: u32) -> Self {
        Self {
            name: name.into(),
            argv,
            num_procs,
            max_restarts: 0,
            max_local_restarts: 0,
        }
    }

    pub fn with_restarts(mut self, max_restarts: i32, max_local_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self.max_local_restarts = max_local_restarts;
        self
    }
}

impl JobSpec {
    pub fn new(name: impl Into<String>, apps: Vec<AppSpec>) -> Self {
        Self {
            name: name.into(),
            recovery: true,
            apps,
        }
    }

    pub fn with_recovery(mut self, enabled: bool) -> Self {
        self.recovery = enabled;
        self
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let spec: JobSpec = serde_json::from_str(&raw)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        if self.apps.is_empty() {
            return Err(FleetError::InvalidJob(format!("job '{}' has no apps", self.name)));
        }
        for app in &self.apps {
            if app.argv.first().map_or(true, |program| program.is_empty()) {
                return Err(FleetError::InvalidJob(format!("app '{}' has no program", app.name)));
            }
            if app.num_procs == 0 {
                return Err(FleetError::InvalidJob(format!("app '{}' has no processes", app.name)));
            }
        }
        self.total_procs()?;
        Ok(())
    }

    /// [`validate`](Self::validate), and refuse jobs larger than `limits` allow.
    pub fn validate_within(&self, limits: &JobLimits) -> Result<()> {
        self.validate()?;
        let total = self.total_procs()?;
        if total > limits.max_procs_per_job {
            return Err(FleetError::InvalidJob(format!(
                "job '{}' asks for {} processes, the limit is {}",
                self.name, total, limits.max_procs_per_job
            )));
        }
        Ok(())
    }

    pub fn total_procs(&self) -> Result<u32> {
        self.apps.iter().try_fold(0u32, |total, app| {
            total.checked_add(app.num_procs).ok_or_else(|| {
                FleetError::InvalidJob(format!("job '{}' has more processes than ranks", self.name))
            })
        })
    }
}
