use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use skiff_protocol::{
    BrowseInteractiveAction, BrowseUrlAction, BrowserObservation, BrowserPort, CmdKillAction,
    CmdOutputObservation, CmdRunAction, CommandId, ErrorId, FileReadAction, FileReadObservation,
    FileWriteAction, FileWriteObservation, IPythonRunCellAction, IPythonRunCellObservation,
    Observation, PluginRequirement,
};
use skiff_sandbox::{
    AGENT_SKILLS_INIT_CODE, Sandbox, SandboxError, rewrite_cell_magics, split_bash_commands,
};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::browser::{goto_command, page_observation};
use crate::files::{FileError, read_range, write_range};
use crate::ipython::{
    ALREADY_INSTALLED_MESSAGE, INSTALLED_MESSAGE, PipOutcome, RESTART_FAILED_MESSAGE,
    RESTARTED_MESSAGE, classify_pip_output,
};
use crate::{Runtime, RuntimeConfig, RuntimeError};

/// Runtime over a [`Sandbox`] and an optional browser.
pub struct SandboxRuntime {
    sandbox: Arc<dyn Sandbox>,
    browser: Option<Arc<dyn BrowserPort>>,
    config: RuntimeConfig,
    owns_sandbox: bool,
    background: Mutex<HashMap<CommandId, String>>,
    closed: AtomicBool,
}

impl SandboxRuntime {
    /// Runtime that closes `sandbox` when it is closed itself.
    pub fn owned(sandbox: Arc<dyn Sandbox>, config: RuntimeConfig) -> Self {
        Self::new(sandbox, config, true)
    }

    /// Runtime over a sandbox supplied by the caller, which stays open.
    pub fn borrowed(sandbox: Arc<dyn Sandbox>, config: RuntimeConfig) -> Self {
        Self::new(sandbox, config, false)
    }

    fn new(sandbox: Arc<dyn Sandbox>, config: RuntimeConfig, owns_sandbox: bool) -> Self {
        Self {
            sandbox,
            browser: None,
            config,
            owns_sandbox,
            background: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_browser(mut self, browser: Arc<dyn BrowserPort>) -> Self {
        self.browser = Some(browser);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn sandbox(&self) -> &Arc<dyn Sandbox> {
        &self.sandbox
    }

    /// Exports the configured environment into the sandbox shell.
    pub async fn apply_env(&self) -> Result<(), RuntimeError> {
        for (key, value) in &self.config.env {
            match self.sandbox.add_env(key, value).await {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(fatal(err)),
                Err(err) => warn!(key, error = %err, "environment variable not exported"),
            }
        }
        Ok(())
    }

    async fn working_directory(&self) -> Result<String, RuntimeError> {
        self.sandbox.working_directory().await.map_err(fatal)
    }

    fn init_code(&self, action: &IPythonRunCellAction) -> String {
        if action.kernel_init_code.is_empty() {
            self.default_init_code()
        } else {
            action.kernel_init_code.clone()
        }
    }

    /// Restarts the interpreter and re-runs `init_code`. Returns the note
    /// appended to the cell output.
    async fn restart_kernel(&self, init_code: &str) -> &'static str {
        if let Err(err) = self.sandbox.restart_interpreter().await {
            warn!(error = %err, "interpreter restart failed");
            return RESTART_FAILED_MESSAGE;
        }
        if !init_code.is_empty() {
            match self.sandbox.run_cell(init_code, self.config.timeout()).await {
                Ok(execution) if execution.exit_code == 0 => {}
                Ok(execution) => {
                    warn!(output = %execution.output, "kernel init code failed after restart");
                    return RESTART_FAILED_MESSAGE;
                }
                Err(err) => {
                    warn!(error = %err, "kernel init code failed after restart");
                    return RESTART_FAILED_MESSAGE;
                }
            }
        }
        info!("interpreter restarted to load new packages");
        RESTARTED_MESSAGE
    }

    async fn normalize_pip(&self, code: &str, output: String, init_code: &str) -> String {
        let jupyter = self.sandbox.has_plugin(PluginRequirement::Jupyter);
        match classify_pip_output(code, &output) {
            PipOutcome::Unchanged => output,
            PipOutcome::AlreadyInstalled => ALREADY_INSTALLED_MESSAGE.to_owned(),
            PipOutcome::Installed { restart_noted } => {
                let mut content = INSTALLED_MESSAGE.to_owned();
                if jupyter {
                    let note = self.restart_kernel(init_code).await;
                    if restart_noted {
                        content.push_str(note);
                    }
                }
                content
            }
        }
    }

    async fn run_foreground(&self, action: &CmdRunAction) -> Result<Observation, RuntimeError> {
        let commands = split_bash_commands(&action.command);
        let deadline = Instant::now() + self.config.timeout();
        let mut outputs = Vec::new();
        let mut exit_code = 0;

        for command in &commands {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Observation::error(
                    ErrorId::Timeout,
                    format!(
                        "Command timed out after {} seconds: {command}",
                        self.config.timeout_secs
                    ),
                ));
            }
            let execution = match self.sandbox.execute(command, remaining).await {
                Ok(execution) => execution,
                Err(err) => return sandbox_failure(err),
            };
            if execution.timed_out {
                let mut content = format!(
                    "Command timed out after {} seconds: {command}",
                    remaining.as_secs()
                );
                outputs.push(execution.output);
                let partial = outputs.join("\n");
                if !partial.trim().is_empty() {
                    content.push('\n');
                    content.push_str(&partial);
                }
                return Ok(Observation::error(ErrorId::Timeout, content));
            }
            debug!(exit_code = execution.exit_code, "command finished");
            exit_code = execution.exit_code;
            if !execution.output.is_empty() {
                outputs.push(execution.output);
            }
            if exit_code != 0 {
                break;
            }
        }

        let mut content = outputs.join("\n");
        if action.command.trim_start().starts_with("pip install") {
            content = self
                .normalize_pip(&action.command, content, &self.default_init_code())
                .await;
        }
        Ok(CmdOutputObservation::new(content, action.command.clone(), exit_code).into())
    }

    fn default_init_code(&self) -> String {
        if self.sandbox.has_plugin(PluginRequirement::AgentSkills) {
            AGENT_SKILLS_INIT_CODE.to_owned()
        } else {
            String::new()
        }
    }

    async fn step_browser(
        &self,
        command: &str,
        failure_url: &str,
    ) -> Result<Observation, RuntimeError> {
        let Some(browser) = &self.browser else {
            return Ok(Observation::error(
                ErrorId::BrowserUnavailable,
                "Browser is not available in this session; web browsing is disabled.",
            ));
        };
        match browser.step(command).await {
            Ok(page) => Ok(page_observation(page, command).into()),
            Err(err) => {
                warn!(error = %err, "browser action failed");
                Ok(BrowserObservation::failed(failure_url, err.to_string()).into())
            }
        }
    }
}

fn fatal(err: SandboxError) -> RuntimeError {
    RuntimeError::SandboxUnavailable(err.to_string())
}

/// Fatal sandbox errors end the session; everything else is reported to
/// the agent.
fn sandbox_failure(err: SandboxError) -> Result<Observation, RuntimeError> {
    match err {
        err if err.is_fatal() => {
            error!(error = %err, "sandbox lost");
            Err(fatal(err))
        }
        SandboxError::Decode => Ok(Observation::error(
            ErrorId::DecodeError,
            "Command output could not be decoded as utf-8",
        )),
        SandboxError::PluginMissing(name) => Ok(Observation::error(
            ErrorId::PluginUnavailable,
            format!("Plugin `{name}` is not available in this sandbox"),
        )),
        other => Ok(Observation::error(ErrorId::Generic, other.to_string())),
    }
}

fn file_failure(err: FileError) -> Observation {
    Observation::error(err.error_id, err.message)
}

#[async_trait]
impl Runtime for SandboxRuntime {
    #[instrument(skip(self, action), fields(sandbox_id = %self.sandbox.id(), background = action.background))]
    async fn run(&self, action: &CmdRunAction) -> Result<Observation, RuntimeError> {
        if !action.background {
            return self.run_foreground(action).await;
        }
        match self.sandbox.execute_background(&action.command).await {
            Ok(command_id) => {
                self.background
                    .lock()
                    .insert(command_id, action.command.clone());
                let mut observation = CmdOutputObservation::new(
                    format!("[Background command started with id {command_id}]"),
                    action.command.clone(),
                    0,
                );
                observation.command_id = command_id;
                Ok(observation.into())
            }
            Err(err) => sandbox_failure(err),
        }
    }

    #[instrument(skip(self, action), fields(sandbox_id = %self.sandbox.id(), command_id = action.command_id))]
    async fn kill(&self, action: &CmdKillAction) -> Result<Observation, RuntimeError> {
        let command = self
            .background
            .lock()
            .remove(&action.command_id)
            .unwrap_or_default();
        match self.sandbox.kill_background(action.command_id).await {
            Ok(execution) => {
                let mut observation =
                    CmdOutputObservation::new(execution.output, command, execution.exit_code);
                observation.command_id = action.command_id;
                Ok(observation.into())
            }
            Err(err) => sandbox_failure(err),
        }
    }

    #[instrument(skip(self, action), fields(sandbox_id = %self.sandbox.id()))]
    async fn run_ipython(
        &self,
        action: &IPythonRunCellAction,
    ) -> Result<Observation, RuntimeError> {
        if !self.sandbox.has_plugin(PluginRequirement::Jupyter) {
            return Ok(Observation::error(
                ErrorId::PluginUnavailable,
                "The jupyter plugin is not initialized; IPython cells cannot run in this session.",
            ));
        }
        let code = rewrite_cell_magics(&action.code);
        let execution = match self.sandbox.run_cell(&code, self.config.timeout()).await {
            Ok(execution) => execution,
            Err(err) => return sandbox_failure(err),
        };
        if execution.timed_out {
            return Ok(Observation::error(
                ErrorId::Timeout,
                format!(
                    "Code execution timed out after {} seconds\n{}",
                    self.config.timeout_secs, execution.output
                ),
            ));
        }
        let mut content = execution.output;
        if action.code.contains("pip install") {
            content = self
                .normalize_pip(&action.code, content, &self.init_code(action))
                .await;
        }
        Ok(IPythonRunCellObservation {
            content,
            code: action.code.clone(),
        }
        .into())
    }

    #[instrument(skip(self, action), fields(path = %action.path))]
    async fn read(&self, action: &FileReadAction) -> Result<Observation, RuntimeError> {
        let working_dir = self.working_directory().await?;
        let host = match self.config.paths().resolve(&action.path, &working_dir) {
            Ok(host) => host,
            Err(err) => return Ok(file_failure(err)),
        };
        match read_range(&host, &action.path, action.start, action.end).await {
            Ok(content) => Ok(FileReadObservation {
                content,
                path: action.path.clone(),
            }
            .into()),
            Err(err) => Ok(file_failure(err)),
        }
    }

    #[instrument(skip(self, action), fields(path = %action.path))]
    async fn write(&self, action: &FileWriteAction) -> Result<Observation, RuntimeError> {
        let working_dir = self.working_directory().await?;
        let host = match self.config.paths().resolve(&action.path, &working_dir) {
            Ok(host) => host,
            Err(err) => return Ok(file_failure(err)),
        };
        match write_range(&host, &action.path, &action.content, action.start, action.end).await {
            Ok(()) => Ok(FileWriteObservation {
                content: String::new(),
                path: action.path.clone(),
            }
            .into()),
            Err(err) => Ok(file_failure(err)),
        }
    }

    #[instrument(skip(self, action), fields(url = %action.url))]
    async fn browse(&self, action: &BrowseUrlAction) -> Result<Observation, RuntimeError> {
        let working_dir = self.working_directory().await?;
        let (command, target) = goto_command(&action.url, &working_dir);
        self.step_browser(&command, &target).await
    }

    #[instrument(skip(self, action))]
    async fn browse_interactive(
        &self,
        action: &BrowseInteractiveAction,
    ) -> Result<Observation, RuntimeError> {
        self.step_browser(&action.browser_actions, "").await
    }

    #[instrument(skip(self), fields(sandbox_id = %self.sandbox.id()))]
    async fn init_plugins(&self, requirements: &[PluginRequirement]) -> Result<(), RuntimeError> {
        let fresh_jupyter = requirements.contains(&PluginRequirement::Jupyter)
            && !self.sandbox.has_plugin(PluginRequirement::Jupyter);
        match self.sandbox.init_plugins(requirements).await {
            Ok(()) => {}
            Err(err) if err.is_fatal() => return Err(fatal(err)),
            Err(err) => {
                warn!(error = %err, "plugins unavailable, continuing without them");
                return Ok(());
            }
        }
        if fresh_jupyter {
            let working_dir = self.working_directory().await?;
            let literal = serde_json::Value::String(working_dir).to_string();
            let chdir = format!("import os; os.chdir({literal})");
            if let Err(err) = self.sandbox.run_cell(&chdir, self.config.timeout()).await {
                warn!(error = %err, "interpreter did not switch to the working directory");
            }
        }
        Ok(())
    }

    async fn copy_to(
        &self,
        host_src: &Path,
        sandbox_dest: &str,
        recursive: bool,
    ) -> Result<(), RuntimeError> {
        match self.sandbox.copy_to(host_src, sandbox_dest, recursive).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() => Err(fatal(err)),
            Err(err) => Err(RuntimeError::Copy(err.to_string())),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.owns_sandbox {
            if let Err(err) = self.sandbox.close().await {
                warn!(error = %err, "sandbox close failed");
            }
        } else {
            debug!(sandbox_id = %self.sandbox.id(), "leaving borrowed sandbox open");
        }
        if let Some(browser) = &self.browser {
            browser.close().await;
        }
        info!("runtime closed");
    }

    fn timeout(&self) -> Duration {
        self.config.timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use skiff_protocol::{Action, BrowserPage, KernelError, KernelResult, SandboxId};
    use skiff_sandbox::{LocalSandbox, LocalSandboxConfig, SandboxExecution};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("skiff-runtime-{name}-{nanos}"))
    }

    async fn local_runtime(name: &str) -> Result<(SandboxRuntime, PathBuf)> {
        let root = unique_test_root(name);
        let workspace = root.join("workspace");
        let sandbox = LocalSandbox::start(
            LocalSandboxConfig::new(&workspace).with_state_dir(root.join("state")),
        )
        .await?;
        let mut config = RuntimeConfig::new(&workspace);
        config.timeout_secs = 10;
        Ok((SandboxRuntime::owned(Arc::new(sandbox), config), root))
    }

    fn cmd_output(observation: &Observation) -> Option<&CmdOutputObservation> {
        match observation {
            Observation::CmdOutput(output) => Some(output),
            _ => None,
        }
    }

    fn error_id(observation: &Observation) -> Option<ErrorId> {
        match observation {
            Observation::Error(error) => Some(error.error_id),
            _ => None,
        }
    }

    #[tokio::test]
    async fn multi_line_script_runs_in_order_and_stops_on_failure() -> Result<()> {
        let (runtime, root) = local_runtime("script").await?;
        let action = CmdRunAction::new("echo one\ncd /nonexistent-dir-for-test\necho never");
        let observation = runtime.run(&action).await?;
        let output = cmd_output(&observation).ok_or_else(|| anyhow::anyhow!("not cmd output"))?;
        assert_eq!(output.exit_code, 1);
        assert!(output.content.starts_with("one\n"));
        assert!(!output.content.contains("never"));
        assert_eq!(output.command_id, -1);

        let ok = runtime.run(&CmdRunAction::new("echo a\necho b")).await?;
        assert_eq!(ok.content(), "a\nb");
        runtime.close().await;
        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[tokio::test]
    async fn background_command_can_be_killed() -> Result<()> {
        let (runtime, root) = local_runtime("bg").await?;
        let mut action = CmdRunAction::new("echo warming; sleep 30");
        action.background = true;
        let started = runtime.run(&action).await?;
        let command_id = cmd_output(&started)
            .map(|o| o.command_id)
            .ok_or_else(|| anyhow::anyhow!("not cmd output"))?;
        assert!(command_id > 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let killed = runtime
            .kill(&CmdKillAction {
                command_id,
                thought: String::new(),
            })
            .await?;
        let output = cmd_output(&killed).ok_or_else(|| anyhow::anyhow!("not cmd output"))?;
        assert_eq!(output.command, "echo warming; sleep 30");
        assert!(output.content.contains("warming"));

        let unknown = runtime
            .kill(&CmdKillAction {
                command_id: 999,
                thought: String::new(),
            })
            .await?;
        assert_eq!(error_id(&unknown), Some(ErrorId::Generic));
        runtime.close().await;
        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[tokio::test]
    async fn file_roundtrip_follows_shell_working_directory() -> Result<()> {
        let (runtime, root) = local_runtime("files").await?;
        runtime.run(&CmdRunAction::new("mkdir -p pkg && cd pkg")).await?;
        let written = runtime
            .write(&FileWriteAction::new("mod.py", "x = 1\ny = 2\n"))
            .await?;
        assert_eq!(written.tag(), "write");
        assert!(root.join("workspace/pkg/mod.py").exists());

        let mut read = FileReadAction::new("mod.py");
        read.start = 1;
        let observation = runtime.read(&read).await?;
        assert_eq!(observation.content(), "y = 2\n");

        let escaped = runtime.read(&FileReadAction::new("../../outside.txt")).await?;
        assert_eq!(error_id(&escaped), Some(ErrorId::PermissionDenied));
        let missing = runtime.read(&FileReadAction::new("missing.py")).await?;
        assert_eq!(error_id(&missing), Some(ErrorId::FileNotFound));
        runtime.close().await;
        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[tokio::test]
    async fn ipython_without_jupyter_is_degraded() -> Result<()> {
        let (runtime, root) = local_runtime("nojupyter").await?;
        let observation = runtime
            .run_ipython(&IPythonRunCellAction::new("print(1)"))
            .await?;
        assert_eq!(error_id(&observation), Some(ErrorId::PluginUnavailable));
        runtime.close().await;
        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[tokio::test]
    async fn ipython_cells_share_state_and_support_shell_escapes() -> Result<()> {
        let (runtime, root) = local_runtime("ipython").await?;
        runtime
            .init_plugins(&[PluginRequirement::Jupyter, PluginRequirement::AgentSkills])
            .await?;
        runtime
            .run_ipython(&IPythonRunCellAction::new("import os\ncounter = 2"))
            .await?;
        let value = runtime
            .run_ipython(&IPythonRunCellAction::new("counter * 21"))
            .await?;
        assert_eq!(value.content(), "42");

        let cwd = runtime
            .run_ipython(&IPythonRunCellAction::new("print(os.getcwd())"))
            .await?;
        assert!(cwd.content().ends_with("workspace"));

        let shell = runtime
            .run_ipython(&IPythonRunCellAction::new("!echo from-shell"))
            .await?;
        assert_eq!(shell.content(), "from-shell");
        runtime.close().await;
        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[tokio::test]
    async fn run_action_rejects_non_runnable_actions() -> Result<()> {
        let (runtime, root) = local_runtime("dispatch").await?;
        let observation = runtime
            .run_action(&Action::from(skiff_protocol::MessageAction::new("hi")))
            .await?;
        assert_eq!(error_id(&observation), Some(ErrorId::MalformedAction));
        let ran = runtime.run_action(&CmdRunAction::new("echo hi").into()).await?;
        assert_eq!(ran.content(), "hi");
        runtime.close().await;
        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    /// Sandbox double whose behavior is chosen per test.
    struct ScriptedSandbox {
        id: SandboxId,
        mode: &'static str,
        closes: AtomicUsize,
    }

    impl ScriptedSandbox {
        fn new(mode: &'static str) -> Arc<Self> {
            Arc::new(Self {
                id: SandboxId::from_string("scripted"),
                mode,
                closes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Sandbox for ScriptedSandbox {
        fn id(&self) -> &SandboxId {
            &self.id
        }

        async fn execute(
            &self,
            command: &str,
            timeout: Duration,
        ) -> Result<SandboxExecution, SandboxError> {
            match self.mode {
                "gone" => Err(SandboxError::Unavailable("container stopped".into())),
                "binary" => Err(SandboxError::Decode),
                "slow" => {
                    tokio::time::sleep(timeout).await;
                    Ok(SandboxExecution {
                        started_at: chrono::Utc::now(),
                        ended_at: chrono::Utc::now(),
                        duration_ms: 0,
                        exit_code: -1,
                        output: "partial".into(),
                        timed_out: true,
                    })
                }
                _ => Ok(SandboxExecution {
                    started_at: chrono::Utc::now(),
                    ended_at: chrono::Utc::now(),
                    duration_ms: 0,
                    exit_code: 0,
                    output: format!("ran {command}"),
                    timed_out: false,
                }),
            }
        }

        async fn execute_background(&self, _command: &str) -> Result<CommandId, SandboxError> {
            Ok(1)
        }

        async fn kill_background(
            &self,
            command_id: CommandId,
        ) -> Result<SandboxExecution, SandboxError> {
            Err(SandboxError::UnknownCommand(command_id))
        }

        async fn run_cell(
            &self,
            _code: &str,
            _timeout: Duration,
        ) -> Result<SandboxExecution, SandboxError> {
            Err(SandboxError::PluginMissing("jupyter"))
        }

        async fn restart_interpreter(&self) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn working_directory(&self) -> Result<String, SandboxError> {
            Ok("/workspace".into())
        }

        async fn add_env(&self, _key: &str, _value: &str) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn copy_to(
            &self,
            _host_src: &Path,
            _sandbox_dest: &str,
            _recursive: bool,
        ) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn init_plugins(
            &self,
            _requirements: &[PluginRequirement],
        ) -> Result<(), SandboxError> {
            Ok(())
        }

        fn has_plugin(&self, _plugin: PluginRequirement) -> bool {
            false
        }

        async fn close(&self) -> Result<(), SandboxError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn lost_sandbox_is_fatal_and_decode_is_not() -> Result<()> {
        let gone = SandboxRuntime::borrowed(ScriptedSandbox::new("gone"), RuntimeConfig::new("/ws"));
        let result = gone.run(&CmdRunAction::new("ls")).await;
        assert!(matches!(result, Err(RuntimeError::SandboxUnavailable(_))));

        let binary =
            SandboxRuntime::borrowed(ScriptedSandbox::new("binary"), RuntimeConfig::new("/ws"));
        let observation = binary.run(&CmdRunAction::new("cat /bin/ls")).await?;
        assert_eq!(error_id(&observation), Some(ErrorId::DecodeError));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_become_timeout_errors() -> Result<()> {
        let mut config = RuntimeConfig::new("/ws");
        config.timeout_secs = 3;
        let runtime = SandboxRuntime::borrowed(ScriptedSandbox::new("slow"), config);
        let observation = runtime.run_action(&CmdRunAction::new("sleep 60").into()).await?;
        assert_eq!(error_id(&observation), Some(ErrorId::Timeout));
        assert!(observation.content().contains("partial"));
        Ok(())
    }

    #[tokio::test]
    async fn borrowed_sandbox_survives_close_and_close_is_idempotent() -> Result<()> {
        let sandbox = ScriptedSandbox::new("ok");
        let borrowed = SandboxRuntime::borrowed(sandbox.clone(), RuntimeConfig::new("/ws"));
        borrowed.close().await;
        assert_eq!(sandbox.closes.load(Ordering::SeqCst), 0);

        let owned = SandboxRuntime::owned(sandbox.clone(), RuntimeConfig::new("/ws"));
        owned.close().await;
        owned.close().await;
        assert_eq!(sandbox.closes.load(Ordering::SeqCst), 1);
        Ok(())
    }

    struct FlakyBrowser;

    #[async_trait]
    impl BrowserPort for FlakyBrowser {
        async fn step(&self, action: &str) -> KernelResult<BrowserPage> {
            if action.contains("broken") {
                return Err(KernelError::BrowserUnavailable("page crashed".into()));
            }
            Ok(BrowserPage {
                url: "https://example.com".into(),
                text_content: "Example Domain".into(),
                ..BrowserPage::default()
            })
        }
    }

    #[tokio::test]
    async fn browse_maps_pages_and_failures() -> Result<()> {
        let without = SandboxRuntime::borrowed(ScriptedSandbox::new("ok"), RuntimeConfig::new("/ws"));
        let unavailable = without
            .browse(&BrowseUrlAction {
                url: "https://example.com".into(),
                thought: String::new(),
            })
            .await?;
        assert_eq!(error_id(&unavailable), Some(ErrorId::BrowserUnavailable));

        let with = SandboxRuntime::borrowed(ScriptedSandbox::new("ok"), RuntimeConfig::new("/ws"))
            .with_browser(Arc::new(FlakyBrowser));
        let page = with
            .browse(&BrowseUrlAction {
                url: "https://example.com".into(),
                thought: String::new(),
            })
            .await?;
        match &page {
            Observation::Browser(browser) => {
                assert!(!browser.error);
                assert_eq!(browser.last_browser_action, "goto(\"https://example.com\")");
            }
            other => anyhow::bail!("unexpected observation {other:?}"),
        }

        let failed = with
            .browse(&BrowseUrlAction {
                url: "https://broken.example".into(),
                thought: String::new(),
            })
            .await?;
        match &failed {
            Observation::Browser(browser) => {
                assert!(browser.error);
                assert_eq!(browser.url, "https://broken.example");
                assert!(browser.content.contains("page crashed"));
            }
            other => anyhow::bail!("unexpected observation {other:?}"),
        }
        Ok(())
    }
}
