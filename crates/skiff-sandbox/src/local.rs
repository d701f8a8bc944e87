use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use skiff_protocol::redact::{MASK, is_sensitive_key};
use skiff_protocol::{CommandId, PluginRequirement, SandboxId};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{debug, info, instrument, warn};

use crate::plugins::{AGENT_SKILLS_FILE, AGENT_SKILLS_SOURCE, DRIVER_FILE, DRIVER_SOURCE};
use crate::process::{OutputBuffer, ProcessSession, signal_group};
use crate::{Sandbox, SandboxError, SandboxExecution, SandboxLimits};

/// Host variables with this prefix are exported into the sandbox shell with
/// the prefix stripped.
pub const SANDBOX_ENV_PREFIX: &str = "SANDBOX_ENV_";

pub fn sandbox_env_from_host() -> BTreeMap<String, String> {
    std::env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(SANDBOX_ENV_PREFIX)
                .filter(|name| !name.is_empty())
                .map(|name| (name.to_owned(), value))
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct LocalSandboxConfig {
    /// Initial working directory of the shell.
    pub workspace_dir: PathBuf,
    /// Plugin files, which sandboxes started from the same spec share, and
    /// one background log directory per sandbox.
    pub state_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub limits: SandboxLimits,
    pub kill_grace: Duration,
    pub startup_timeout: Duration,
}

impl LocalSandboxConfig {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        let state_dir =
            std::env::temp_dir().join(format!("skiff-sandbox-{}", uuid::Uuid::new_v4().simple()));
        Self {
            workspace_dir: workspace_dir.into(),
            state_dir,
            env: BTreeMap::new(),
            limits: SandboxLimits::default(),
            kill_grace: Duration::from_secs(2),
            startup_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = state_dir.into();
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    fn plugin_dir(&self) -> PathBuf {
        self.state_dir.join("plugins")
    }

    fn background_dir(&self, id: &SandboxId) -> PathBuf {
        self.state_dir.join("background").join(id.as_str())
    }
}

#[derive(Debug, Clone)]
struct BackgroundCommand {
    pid: u32,
    log: PathBuf,
}

enum Outcome<T> {
    Done(Result<T, SandboxError>),
    TimedOut,
    Closing,
}

/// Sandbox backed by host processes: one bash session and, once the jupyter
/// plugin is initialized, one Python driver.
///
/// At most one shell command and one cell run at a time; callers queue on the
/// session locks. A shell that times out or dies is replaced by a fresh one
/// started in the last known working directory with the exported variables
/// re-applied.
pub struct LocalSandbox {
    id: SandboxId,
    config: LocalSandboxConfig,
    shell: AsyncMutex<Option<ProcessSession>>,
    interpreter: AsyncMutex<Option<ProcessSession>>,
    plugins: Mutex<BTreeSet<PluginRequirement>>,
    exported: Mutex<BTreeMap<String, String>>,
    cwd: Mutex<PathBuf>,
    background: Mutex<HashMap<CommandId, BackgroundCommand>>,
    next_command_id: AtomicI64,
    closed: AtomicBool,
    closing: watch::Sender<bool>,
}

impl LocalSandbox {
    #[instrument(skip(config), fields(workspace = %config.workspace_dir.display()))]
    pub async fn start(config: LocalSandboxConfig) -> Result<Self, SandboxError> {
        tokio::fs::create_dir_all(&config.workspace_dir).await?;
        tokio::fs::create_dir_all(config.plugin_dir()).await?;
        let id = SandboxId::new_uuid();
        tokio::fs::create_dir_all(config.background_dir(&id)).await?;

        let cwd = config.workspace_dir.clone();
        let sandbox = Self {
            id,
            shell: AsyncMutex::new(None),
            interpreter: AsyncMutex::new(None),
            plugins: Mutex::new(BTreeSet::new()),
            exported: Mutex::new(config.env.clone()),
            cwd: Mutex::new(cwd),
            background: Mutex::new(HashMap::new()),
            next_command_id: AtomicI64::new(1),
            closed: AtomicBool::new(false),
            closing: watch::channel(false).0,
            config,
        };
        let shell = sandbox.spawn_shell().await?;
        *sandbox.shell.lock().await = Some(shell);

        let env_names: Vec<String> = sandbox
            .config
            .env
            .iter()
            .map(|(key, value)| {
                if is_sensitive_key(key) {
                    format!("{key}={MASK}")
                } else {
                    format!("{key}={value}")
                }
            })
            .collect();
        info!(sandbox_id = %sandbox.id, env = ?env_names, "local sandbox started");
        Ok(sandbox)
    }

    fn process_env(&self) -> BTreeMap<String, String> {
        let mut env = self.exported.lock().clone();
        let plugin_dir = self.config.plugin_dir().display().to_string();
        let python_path = match std::env::var("PYTHONPATH") {
            Ok(existing) if !existing.is_empty() => format!("{plugin_dir}:{existing}"),
            _ => plugin_dir,
        };
        env.insert("PYTHONPATH".to_owned(), python_path);
        env
    }

    async fn spawn_shell(&self) -> Result<ProcessSession, SandboxError> {
        let cwd = self.cwd.lock().clone();
        let cwd = if cwd.is_dir() {
            cwd
        } else {
            self.config.workspace_dir.clone()
        };
        ProcessSession::spawn_shell(&cwd, &self.process_env(), self.config.startup_timeout).await
    }

    async fn spawn_interpreter(&self) -> Result<ProcessSession, SandboxError> {
        let driver = self.config.plugin_dir().join(DRIVER_FILE);
        let cwd = self.cwd.lock().clone();
        ProcessSession::spawn_python(
            &driver,
            &cwd,
            &self.process_env(),
            self.config.startup_timeout,
        )
        .await
    }

    /// `requested`, bounded by `limits.max_runtime_secs`.
    fn capped(&self, requested: Duration) -> Duration {
        requested.min(self.config.limits.timeout())
    }

    /// Writes a plugin file other sandboxes may be reading.
    async fn write_plugin_file(&self, name: &str, contents: &str) -> Result<(), SandboxError> {
        let path = self.config.plugin_dir().join(name);
        let staging = path.with_extension(format!("{}.tmp", self.id));
        tokio::fs::write(&staging, contents).await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), SandboxError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SandboxError::Closed)
        } else {
            Ok(())
        }
    }

    fn resolve(&self, sandbox_path: &str) -> PathBuf {
        let path = Path::new(sandbox_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.lock().join(path)
        }
    }

    /// Sends one request to `session` and waits for its marker, the timeout,
    /// or sandbox shutdown, whichever comes first.
    async fn round_trip(
        &self,
        session: &mut ProcessSession,
        payload: &str,
        limit: Duration,
        buffer: &mut OutputBuffer,
    ) -> Outcome<crate::process::MarkerLine> {
        if let Err(err) = session.send(payload).await {
            return Outcome::Done(Err(err));
        }
        let mut closing = self.closing.subscribe();
        let max_bytes = self.config.limits.max_output_bytes;
        tokio::select! {
            result = tokio::time::timeout(limit, session.read_until_marker(buffer, max_bytes)) => {
                match result {
                    Ok(done) => Outcome::Done(done),
                    Err(_) => Outcome::TimedOut,
                }
            }
            _ = closing.wait_for(|closed| *closed) => Outcome::Closing,
        }
    }

    async fn replace_shell(&self, guard: &mut Option<ProcessSession>) -> Result<(), SandboxError> {
        if let Some(old) = guard.take() {
            old.terminate(self.config.kill_grace).await;
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(SandboxError::Closed);
        }
        *guard = Some(self.spawn_shell().await?);
        Ok(())
    }

    async fn replace_interpreter(
        &self,
        guard: &mut Option<ProcessSession>,
    ) -> Result<(), SandboxError> {
        if let Some(old) = guard.take() {
            old.terminate(self.config.kill_grace).await;
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(SandboxError::Closed);
        }
        *guard = Some(self.spawn_interpreter().await?);
        Ok(())
    }

    async fn read_log(path: &Path) -> Result<String, SandboxError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => String::from_utf8(bytes).map_err(|_| SandboxError::Decode),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &SandboxId {
        &self.id
    }

    #[instrument(skip(self, command), fields(sandbox_id = %self.id))]
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<SandboxExecution, SandboxError> {
        self.ensure_open()?;
        let timeout = self.capped(timeout);
        let mut guard = self.shell.lock().await;
        if guard.is_none() {
            self.replace_shell(&mut guard).await?;
        }
        let Some(session) = guard.as_mut() else {
            return Err(SandboxError::Unavailable("shell not running".into()));
        };

        let started_at = Utc::now();
        let payload = session.shell_request(command);
        let mut buffer = OutputBuffer::default();
        match self.round_trip(session, &payload, timeout, &mut buffer).await {
            Outcome::Done(Ok(marker)) => {
                if let Some(dir) = marker.tail {
                    *self.cwd.lock() = PathBuf::from(dir);
                }
                let output = buffer.into_text()?;
                debug!(exit_code = marker.status, "shell command finished");
                Ok(SandboxExecution::finished(
                    started_at,
                    marker.status,
                    output,
                    false,
                ))
            }
            Outcome::Done(Err(err)) => {
                warn!(error = %err, "shell exited, starting a new one");
                self.replace_shell(&mut guard).await?;
                let mut output = String::from_utf8_lossy(&buffer.bytes).into_owned();
                output.push_str("\n[shell exited; a new shell was started]");
                Ok(SandboxExecution::finished(started_at, -1, output, false))
            }
            Outcome::TimedOut => {
                warn!(
                    timeout_secs = timeout.as_secs_f64(),
                    "shell command timed out, restarting shell"
                );
                self.replace_shell(&mut guard).await?;
                let mut output = String::from_utf8_lossy(&buffer.bytes).into_owned();
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(&format!(
                    "[Command timed out after {} seconds]",
                    timeout.as_secs()
                ));
                Ok(SandboxExecution::finished(started_at, -1, output, true))
            }
            Outcome::Closing => {
                if let Some(session) = guard.take() {
                    session.terminate(self.config.kill_grace).await;
                }
                Err(SandboxError::Closed)
            }
        }
    }

    #[instrument(skip(self, command), fields(sandbox_id = %self.id))]
    async fn execute_background(&self, command: &str) -> Result<CommandId, SandboxError> {
        self.ensure_open()?;
        let command_id = self.next_command_id.fetch_add(1, Ordering::SeqCst);
        let log = self
            .config
            .background_dir(&self.id)
            .join(format!("{command_id}.log"));
        let launch = format!(
            "setsid nohup bash -c {} > {} 2>&1 < /dev/null & echo $!",
            shell_quote(command),
            shell_quote(&log.display().to_string())
        );
        let execution = self.execute(&launch, self.config.startup_timeout).await?;
        let pid = execution
            .output
            .lines()
            .rev()
            .find_map(|line| line.trim().parse::<u32>().ok())
            .ok_or_else(|| {
                SandboxError::Unavailable(format!(
                    "background command did not report a pid: {}",
                    execution.output
                ))
            })?;
        self.background
            .lock()
            .insert(command_id, BackgroundCommand { pid, log });
        info!(command_id, pid, "background command started");
        Ok(command_id)
    }

    #[instrument(skip(self), fields(sandbox_id = %self.id))]
    async fn kill_background(
        &self,
        command_id: CommandId,
    ) -> Result<SandboxExecution, SandboxError> {
        let started_at = Utc::now();
        let entry = self
            .background
            .lock()
            .remove(&command_id)
            .ok_or(SandboxError::UnknownCommand(command_id))?;
        signal_group(entry.pid, "TERM").await;
        let output = Self::read_log(&entry.log).await?;
        info!(command_id, pid = entry.pid, "background command killed");
        Ok(SandboxExecution::finished(started_at, -1, output, false))
    }

    #[instrument(skip(self, code), fields(sandbox_id = %self.id))]
    async fn run_cell(
        &self,
        code: &str,
        timeout: Duration,
    ) -> Result<SandboxExecution, SandboxError> {
        self.ensure_open()?;
        if !self.has_plugin(PluginRequirement::Jupyter) {
            return Err(SandboxError::PluginMissing(
                PluginRequirement::Jupyter.name(),
            ));
        }
        let timeout = self.capped(timeout);
        let mut guard = self.interpreter.lock().await;
        if guard.is_none() {
            self.replace_interpreter(&mut guard).await?;
        }
        let Some(session) = guard.as_mut() else {
            return Err(SandboxError::Unavailable("interpreter not running".into()));
        };

        let started_at = Utc::now();
        let payload = session.cell_request(code);
        let mut buffer = OutputBuffer::default();
        match self.round_trip(session, &payload, timeout, &mut buffer).await {
            Outcome::Done(Ok(marker)) => {
                let output = buffer.into_text()?;
                Ok(SandboxExecution::finished(
                    started_at,
                    marker.status,
                    output,
                    false,
                ))
            }
            Outcome::Done(Err(err)) => {
                warn!(error = %err, "interpreter exited, starting a new one");
                self.replace_interpreter(&mut guard).await?;
                let mut output = String::from_utf8_lossy(&buffer.bytes).into_owned();
                output.push_str("\n[interpreter exited; a new interpreter was started]");
                Ok(SandboxExecution::finished(started_at, -1, output, false))
            }
            Outcome::TimedOut => {
                warn!(
                    timeout_secs = timeout.as_secs_f64(),
                    "cell timed out, restarting interpreter"
                );
                self.replace_interpreter(&mut guard).await?;
                let mut output = String::from_utf8_lossy(&buffer.bytes).into_owned();
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(&format!(
                    "[Code execution timed out after {} seconds]",
                    timeout.as_secs()
                ));
                Ok(SandboxExecution::finished(started_at, -1, output, true))
            }
            Outcome::Closing => {
                if let Some(session) = guard.take() {
                    session.terminate(self.config.kill_grace).await;
                }
                Err(SandboxError::Closed)
            }
        }
    }

    async fn restart_interpreter(&self) -> Result<(), SandboxError> {
        self.ensure_open()?;
        if !self.has_plugin(PluginRequirement::Jupyter) {
            return Err(SandboxError::PluginMissing(
                PluginRequirement::Jupyter.name(),
            ));
        }
        let mut guard = self.interpreter.lock().await;
        self.replace_interpreter(&mut guard).await?;
        info!(sandbox_id = %self.id, "interpreter restarted");
        Ok(())
    }

    async fn working_directory(&self) -> Result<String, SandboxError> {
        self.ensure_open()?;
        Ok(self.cwd.lock().display().to_string())
    }

    async fn add_env(&self, key: &str, value: &str) -> Result<(), SandboxError> {
        let valid = key
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(SandboxError::InvalidEnvName(key.to_owned()));
        }
        let command = format!("export {key}={}", shell_quote(value));
        let execution = self.execute(&command, self.config.startup_timeout).await?;
        if execution.exit_code != 0 {
            return Err(SandboxError::Unavailable(format!(
                "failed to export {key}: {}",
                execution.output
            )));
        }
        self.exported
            .lock()
            .insert(key.to_owned(), value.to_owned());
        let shown = if is_sensitive_key(key) { MASK } else { value };
        debug!(sandbox_id = %self.id, key, value = shown, "environment variable exported");
        Ok(())
    }

    #[instrument(skip(self), fields(sandbox_id = %self.id))]
    async fn copy_to(
        &self,
        host_src: &Path,
        sandbox_dest: &str,
        recursive: bool,
    ) -> Result<(), SandboxError> {
        self.ensure_open()?;
        let dest_dir = self.resolve(sandbox_dest);
        let metadata = tokio::fs::metadata(host_src).await?;
        tokio::fs::create_dir_all(&dest_dir).await?;
        let name = host_src.file_name().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("source has no file name: {}", host_src.display()),
            )
        })?;

        if metadata.is_dir() {
            if !recursive {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!(
                        "{} is a directory; pass recursive to copy it",
                        host_src.display()
                    ),
                )
                .into());
            }
            copy_dir(host_src, &dest_dir.join(name)).await?;
        } else {
            tokio::fs::copy(host_src, dest_dir.join(name)).await?;
        }
        debug!(dest = %dest_dir.display(), "copied into sandbox");
        Ok(())
    }

    #[instrument(skip(self), fields(sandbox_id = %self.id))]
    async fn init_plugins(&self, requirements: &[PluginRequirement]) -> Result<(), SandboxError> {
        self.ensure_open()?;
        for &plugin in requirements {
            if self.has_plugin(plugin) {
                debug!(plugin = plugin.name(), "plugin already initialized");
                continue;
            }
            match plugin {
                PluginRequirement::Jupyter => {
                    self.write_plugin_file(DRIVER_FILE, DRIVER_SOURCE).await?;
                    let mut guard = self.interpreter.lock().await;
                    self.replace_interpreter(&mut guard).await?;
                }
                PluginRequirement::AgentSkills => {
                    self.write_plugin_file(AGENT_SKILLS_FILE, AGENT_SKILLS_SOURCE)
                        .await?;
                }
            }
            self.plugins.lock().insert(plugin);
            info!(plugin = plugin.name(), "plugin initialized");
        }
        Ok(())
    }

    fn has_plugin(&self, plugin: PluginRequirement) -> bool {
        self.plugins.lock().contains(&plugin)
    }

    #[instrument(skip(self), fields(sandbox_id = %self.id))]
    async fn close(&self) -> Result<(), SandboxError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closing.send_replace(true);

        let background: Vec<BackgroundCommand> =
            self.background.lock().drain().map(|(_, cmd)| cmd).collect();
        for command in background {
            signal_group(command.pid, "KILL").await;
        }
        if let Some(session) = self.shell.lock().await.take() {
            session.terminate(self.config.kill_grace).await;
        }
        if let Some(session) = self.interpreter.lock().await.take() {
            session.terminate(self.config.kill_grace).await;
        }
        // Plugin files stay for the next sandbox with the same spec.
        if let Err(err) = tokio::fs::remove_dir_all(self.config.background_dir(&self.id)).await {
            debug!(error = %err, "background log dir not removed");
        }
        info!("local sandbox closed");
        Ok(())
    }
}

pub(crate) fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "'\\''"))
}

async fn copy_dir(src: &Path, dest: &Path) -> std::io::Result<()> {
    let mut pending = vec![(src.to_path_buf(), dest.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                tokio::fs::copy(entry.path(), target).await?;
            }
        }
    }
    Ok(())
}
