use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use skiff_condenser::CondenserConfig;
use skiff_controller::ControllerConfig;
use skiff_policy::RiskPolicy;
use skiff_protocol::redact::redact;
use skiff_runtime::RuntimeConfig;
use skiff_sandbox::SandboxLimits;

pub const ENV_MAX_ITERATIONS: &str = "SKIFF_MAX_ITERATIONS";
pub const ENV_MAX_BUDGET_PER_TASK: &str = "SKIFF_MAX_BUDGET_PER_TASK";
pub const ENV_CONFIRMATION_MODE: &str = "SKIFF_CONFIRMATION_MODE";
pub const ENV_WORKSPACE_BASE: &str = "SKIFF_WORKSPACE_BASE";

/// Application settings. The top-level limits override the matching fields
/// of `controller`, and `workspace_base` overrides `runtime.workspace_base`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub max_iterations: u64,
    pub max_budget_per_task: Option<f64>,
    pub confirmation_mode: bool,
    pub workspace_base: PathBuf,
    /// How long `close` waits for a controller before aborting it.
    pub close_grace_secs: u64,
    pub controller: ControllerConfig,
    pub runtime: RuntimeConfig,
    pub sandbox: SandboxLimits,
    pub condenser: CondenserConfig,
    pub security: RiskPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            max_budget_per_task: None,
            confirmation_mode: false,
            workspace_base: PathBuf::from("workspace"),
            close_grace_secs: 5,
            controller: ControllerConfig::default(),
            runtime: RuntimeConfig::default(),
            sandbox: SandboxLimits::default(),
            condenser: CondenserConfig::default(),
            security: RiskPolicy::default(),
        }
    }
}

impl AppConfig {
    /// Reads a JSON config file; missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))
    }

    /// Applies `SKIFF_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(std::env::vars())
    }

    pub fn with_overrides_from(
        mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self> {
        for (key, value) in vars {
            match key.as_str() {
                ENV_MAX_ITERATIONS => {
                    self.max_iterations = value
                        .trim()
                        .parse()
                        .with_context(|| format!("{key} must be a whole number, got `{value}`"))?;
                }
                ENV_MAX_BUDGET_PER_TASK => {
                    let budget: f64 = value
                        .trim()
                        .parse()
                        .with_context(|| format!("{key} must be a number, got `{value}`"))?;
                    self.max_budget_per_task = (budget > 0.0).then_some(budget);
                }
                ENV_CONFIRMATION_MODE => {
                    self.confirmation_mode = parse_flag(&value)
                        .with_context(|| format!("{key} must be true or false, got `{value}`"))?;
                }
                ENV_WORKSPACE_BASE => self.workspace_base = PathBuf::from(value),
                _ => {}
            }
        }
        Ok(self)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            max_iterations: self.max_iterations,
            max_budget_per_task: self.max_budget_per_task,
            confirmation_mode: self.confirmation_mode,
            ..self.controller.clone()
        }
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            workspace_base: self.workspace_base.clone(),
            ..self.runtime.clone()
        }
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_secs(self.close_grace_secs)
    }

    /// JSON rendering with secrets masked, for logs.
    pub fn redacted(&self) -> String {
        redact(&serde_json::to_string(self).unwrap_or_default())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
