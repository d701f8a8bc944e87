//! # skiff-sandbox: where agent commands actually run
//!
//! [`Sandbox`] is the contract the runtime talks to: a persistent shell, a
//! persistent Python interpreter, background commands and file staging.
//! [`LocalSandbox`] implements it with host processes. [`split_bash_commands`]
//! turns a multi-line script into the logical commands the shell runs one at
//! a time.

mod local;
mod plugins;
mod process;
mod split;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use skiff_protocol::{CommandId, PluginRequirement, SandboxId, SandboxKey};
use thiserror::Error;

pub use local::{LocalSandbox, LocalSandboxConfig, SANDBOX_ENV_PREFIX, sandbox_env_from_host};
pub use plugins::{AGENT_SKILLS_INIT_CODE, KERNEL_RESTART_NOTE, rewrite_cell_magics};
pub use split::split_bash_commands;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub max_runtime_secs: u64,
    pub max_output_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_runtime_secs: 120,
            max_output_bytes: 256 * 1024,
        }
    }
}

impl SandboxLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.max_runtime_secs.max(1))
    }
}

/// Result of one command or cell. `output` interleaves stdout and stderr in
/// the order the process wrote them, without trailing newlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxExecution {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub exit_code: i32,
    pub output: String,
    pub timed_out: bool,
}

impl SandboxExecution {
    pub(crate) fn finished(
        started_at: DateTime<Utc>,
        exit_code: i32,
        output: String,
        timed_out: bool,
    ) -> Self {
        let ended_at = Utc::now();
        Self {
            started_at,
            ended_at,
            duration_ms: (ended_at - started_at).num_milliseconds(),
            exit_code,
            output: output.trim_end_matches(['\n', '\r']).to_owned(),
            timed_out,
        }
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),
    #[error("sandbox is closed")]
    Closed,
    #[error("command output could not be decoded as utf-8")]
    Decode,
    #[error("plugin `{0}` is not initialized in this sandbox")]
    PluginMissing(&'static str),
    #[error("no background command with id {0}")]
    UnknownCommand(CommandId),
    #[error("invalid environment variable name: {0}")]
    InvalidEnvName(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Errors after which the sandbox cannot serve further commands.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Closed)
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &SandboxId;

    /// Runs one logical command in the persistent shell. Working directory
    /// and exported variables carry over to the next call.
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<SandboxExecution, SandboxError>;

    /// Starts `command` detached from the shell and returns its id.
    async fn execute_background(&self, command: &str) -> Result<CommandId, SandboxError>;

    /// Terminates a background command and returns what it wrote so far.
    async fn kill_background(
        &self,
        command_id: CommandId,
    ) -> Result<SandboxExecution, SandboxError>;

    /// Runs a cell in the persistent interpreter. Requires the jupyter plugin.
    async fn run_cell(&self, code: &str, timeout: Duration)
    -> Result<SandboxExecution, SandboxError>;

    /// Drops interpreter state and starts a fresh interpreter.
    async fn restart_interpreter(&self) -> Result<(), SandboxError>;

    async fn working_directory(&self) -> Result<String, SandboxError>;

    async fn add_env(&self, key: &str, value: &str) -> Result<(), SandboxError>;

    /// Copies a host file (or directory when `recursive`) into `sandbox_dest`.
    async fn copy_to(
        &self,
        host_src: &Path,
        sandbox_dest: &str,
        recursive: bool,
    ) -> Result<(), SandboxError>;

    /// Installs plugins not yet present. Calling it twice with the same
    /// requirements is a no-op.
    async fn init_plugins(&self, requirements: &[PluginRequirement]) -> Result<(), SandboxError>;

    fn has_plugin(&self, plugin: PluginRequirement) -> bool;

    /// Terminates all processes. Idempotent.
    async fn close(&self) -> Result<(), SandboxError>;
}

/// Everything that determines what a sandbox looks like before any command
/// runs. Two equal specs produce the same [`SandboxKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub base_image: String,
    pub plugins: BTreeSet<PluginRequirement>,
    pub env: BTreeMap<String, String>,
}

impl SandboxSpec {
    pub fn new(base_image: impl Into<String>) -> Self {
        Self {
            base_image: base_image.into(),
            plugins: BTreeSet::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_plugins(mut self, plugins: impl IntoIterator<Item = PluginRequirement>) -> Self {
        self.plugins.extend(plugins);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> SandboxKey {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        SandboxKey::from_hex(hex::encode(Sha256::digest(&bytes)))
    }
}
