//! # skiff-runtime: one Action in, one Observation out
//!
//! [`Runtime`] executes runnable actions. Expected failures (non-zero exits,
//! missing files, decode errors, timeouts) come back as Observations; only a
//! lost sandbox is an `Err`. [`SandboxRuntime`] is the implementation over a
//! [`skiff_sandbox::Sandbox`] and an optional browser, and [`RuntimeBridge`]
//! wires a runtime into an event stream.

mod bridge;
mod browser;
mod files;
mod ipython;
mod sandboxed;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skiff_protocol::{
    Action, BrowseInteractiveAction, BrowseUrlAction, CmdKillAction, CmdRunAction, ErrorId,
    FileReadAction, FileWriteAction, IPythonRunCellAction, Observation, PluginRequirement,
};
use thiserror::Error;

pub use bridge::RuntimeBridge;
pub use files::{FileError, WorkspacePaths, read_range, write_range};
pub use ipython::{PipOutcome, classify_pip_output};
pub use sandboxed::SandboxRuntime;

/// Extra time the outer bound grants so the sandbox can report its own
/// timeout first.
const TIMEOUT_SLACK: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub timeout_secs: u64,
    /// Workspace directory on the host.
    pub workspace_base: PathBuf,
    /// Where the workspace appears inside the sandbox. Defaults to
    /// `workspace_base` for sandboxes that share the host filesystem.
    pub workspace_mount_path_in_sandbox: Option<PathBuf>,
    /// Exported into the sandbox shell on start.
    pub env: BTreeMap<String, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new("workspace")
    }
}

impl RuntimeConfig {
    pub fn new(workspace_base: impl Into<PathBuf>) -> Self {
        Self {
            timeout_secs: 120,
            workspace_base: workspace_base.into(),
            workspace_mount_path_in_sandbox: None,
            env: BTreeMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn paths(&self) -> WorkspacePaths {
        let mount = self
            .workspace_mount_path_in_sandbox
            .clone()
            .unwrap_or_else(|| self.workspace_base.clone());
        WorkspacePaths::new(mount, self.workspace_base.clone())
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The sandbox cannot run anything anymore. Ends the session.
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),
    #[error("copy into sandbox failed: {0}")]
    Copy(String),
}

impl RuntimeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SandboxUnavailable(_))
    }
}

#[async_trait]
pub trait Runtime: Send + Sync {
    async fn run(&self, action: &CmdRunAction) -> Result<Observation, RuntimeError>;

    async fn kill(&self, action: &CmdKillAction) -> Result<Observation, RuntimeError>;

    async fn run_ipython(&self, action: &IPythonRunCellAction)
    -> Result<Observation, RuntimeError>;

    async fn read(&self, action: &FileReadAction) -> Result<Observation, RuntimeError>;

    async fn write(&self, action: &FileWriteAction) -> Result<Observation, RuntimeError>;

    async fn browse(&self, action: &BrowseUrlAction) -> Result<Observation, RuntimeError>;

    async fn browse_interactive(
        &self,
        action: &BrowseInteractiveAction,
    ) -> Result<Observation, RuntimeError>;

    /// Idempotent.
    async fn init_plugins(&self, requirements: &[PluginRequirement]) -> Result<(), RuntimeError>;

    async fn copy_to(
        &self,
        host_src: &Path,
        sandbox_dest: &str,
        recursive: bool,
    ) -> Result<(), RuntimeError>;

    /// Idempotent. A sandbox the runtime did not create is left running.
    async fn close(&self);

    fn timeout(&self) -> Duration;

    /// Executes a runnable action within [`Runtime::timeout`].
    async fn run_action(&self, action: &Action) -> Result<Observation, RuntimeError> {
        let limit = self.timeout();
        let call = async {
            match action {
                Action::CmdRun(a) => self.run(a).await,
                Action::CmdKill(a) => self.kill(a).await,
                Action::IPythonRunCell(a) => self.run_ipython(a).await,
                Action::FileRead(a) => self.read(a).await,
                Action::FileWrite(a) => self.write(a).await,
                Action::BrowseUrl(a) => self.browse(a).await,
                Action::BrowseInteractive(a) => self.browse_interactive(a).await,
                other => Ok(Observation::error(
                    ErrorId::MalformedAction,
                    format!("Action `{}` is not executable by the runtime", other.tag()),
                )),
            }
        };
        match tokio::time::timeout(limit + TIMEOUT_SLACK, call).await {
            Ok(result) => result,
            Err(_) => Ok(Observation::error(
                ErrorId::Timeout,
                format!(
                    "Action `{}` timed out after {} seconds",
                    action.tag(),
                    limit.as_secs()
                ),
            )),
        }
    }
}
