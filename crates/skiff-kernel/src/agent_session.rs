use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use skiff_condenser::Condenser;
use skiff_controller::{AgentController, ControllerConfig, ControllerHandle, StatusCallback};
use skiff_events::EventStream;
use skiff_policy::SecurityAnalyzer;
use skiff_protocol::{
    Agent, AgentState, BrowserPort, Event, EventSource, Observation, PluginRequirement, SessionId,
    State, StateStore,
};
use skiff_runtime::{Runtime, RuntimeBridge, RuntimeConfig, SandboxRuntime};
use skiff_sandbox::{
    LocalSandbox, LocalSandboxConfig, SandboxLimits, SandboxSpec, sandbox_env_from_host,
};
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

/// Creates the runtime a session executes its actions on. `plugins` are the
/// ones the session's agents need, sorted and deduplicated.
#[async_trait]
pub trait RuntimeFactory: Send + Sync {
    async fn create(
        &self,
        session_id: &SessionId,
        plugins: &[PluginRequirement],
    ) -> Result<Arc<dyn Runtime>>;
}

/// Runtimes over a [`LocalSandbox`] per session, sharing one workspace.
/// Sessions whose [`SandboxSpec`] is equal share a state directory.
pub struct LocalRuntimeFactory {
    config: RuntimeConfig,
    limits: SandboxLimits,
    state_root: PathBuf,
    base_image: String,
    env: BTreeMap<String, String>,
    browser: Option<Arc<dyn BrowserPort>>,
}

impl LocalRuntimeFactory {
    /// `state_root` holds one directory of plugin files per sandbox spec.
    pub fn new(config: RuntimeConfig, limits: SandboxLimits, state_root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            limits,
            state_root: state_root.into(),
            base_image: "local".to_owned(),
            env: sandbox_env_from_host(),
            browser: None,
        }
    }

    pub fn with_base_image(mut self, base_image: impl Into<String>) -> Self {
        self.base_image = base_image.into();
        self
    }

    /// Replaces the environment taken from `SANDBOX_ENV_*` host variables.
    pub fn with_sandbox_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_browser(mut self, browser: Arc<dyn BrowserPort>) -> Self {
        self.browser = Some(browser);
        self
    }

    /// What a sandbox for `plugins` looks like before any command runs.
    pub fn spec(&self, plugins: &[PluginRequirement]) -> SandboxSpec {
        let mut spec = SandboxSpec::new(&self.base_image).with_plugins(plugins.iter().copied());
        spec.env = self.env.clone();
        spec.env.extend(self.config.env.clone());
        spec
    }

    pub fn state_dir(&self, plugins: &[PluginRequirement]) -> PathBuf {
        self.state_root.join(self.spec(plugins).key().short())
    }
}

#[async_trait]
impl RuntimeFactory for LocalRuntimeFactory {
    async fn create(
        &self,
        session_id: &SessionId,
        plugins: &[PluginRequirement],
    ) -> Result<Arc<dyn Runtime>> {
        let spec = self.spec(plugins);
        let key = spec.key();
        let sandbox_config = LocalSandboxConfig::new(&self.config.workspace_base)
            .with_state_dir(self.state_root.join(key.short()))
            .with_env(self.env.clone())
            .with_limits(self.limits.clone());
        let sandbox = LocalSandbox::start(sandbox_config)
            .await
            .with_context(|| format!("failed starting sandbox for session {session_id}"))?;
        info!(session_id = %session_id, sandbox_key = key.short(), "sandbox started");
        let mut runtime = SandboxRuntime::owned(Arc::new(sandbox), self.config.clone());
        if let Some(browser) = &self.browser {
            runtime = runtime.with_browser(browser.clone());
        }
        runtime.apply_env().await?;
        Ok(Arc::new(runtime))
    }
}

/// Everything the controller of a session is built with besides its agent.
#[derive(Clone, Default)]
pub struct StartOptions {
    pub controller: ControllerConfig,
    pub delegates: Vec<(String, Arc<dyn Agent>)>,
    pub analyzer: Option<Arc<dyn SecurityAnalyzer>>,
    pub condenser: Option<Arc<Condenser>>,
    pub on_status: Option<StatusCallback>,
}

struct Running {
    runtime: Arc<dyn Runtime>,
    bridge: Arc<RuntimeBridge>,
    controller: ControllerHandle,
}

/// One session's event stream, runtime, and controller.
pub struct AgentSession {
    session_id: SessionId,
    stream: EventStream,
    state_store: Option<Arc<dyn StateStore>>,
    close_grace: Duration,
    running: Mutex<Option<Running>>,
    closed: AtomicBool,
}

impl AgentSession {
    pub fn new(stream: EventStream, state_store: Option<Arc<dyn StateStore>>) -> Self {
        Self {
            session_id: stream.session_id().clone(),
            stream,
            state_store,
            close_grace: Duration::from_secs(5),
            running: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn stream(&self) -> &EventStream {
        &self.stream
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Agent state reported by the controller, `None` before `start`.
    pub async fn agent_state(&self) -> Option<AgentState> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.controller.agent_state())
    }

    pub async fn wait_for_state(&self, wanted: AgentState, limit: Duration) -> Result<()> {
        let state = {
            let running = self.running.lock().await;
            running
                .as_ref()
                .map(|running| running.controller.watch_state())
                .context("agent session is not running")?
        };
        tokio::time::timeout(limit, async move {
            let mut state = state;
            state.wait_for(|current| *current == wanted).await.map(|_| ())
        })
        .await
        .with_context(|| format!("timed out waiting for agent state {wanted}"))?
        .context("controller stopped")
    }

    /// Brings up the runtime and plugins, then spawns the controller. A
    /// persisted state for this session is resumed.
    #[instrument(skip_all, fields(session_id = %self.session_id, agent = agent.name()))]
    pub async fn start(
        &self,
        agent: Arc<dyn Agent>,
        runtimes: &dyn RuntimeFactory,
        options: StartOptions,
    ) -> Result<()> {
        let mut running = self.running.lock().await;
        if self.is_closed() {
            bail!("session {} is closed", self.session_id);
        }
        if running.is_some() {
            bail!("session {} is already running", self.session_id);
        }

        self.stream.add_event(
            Event::observation(Observation::state_changed(AgentState::Loading)),
            EventSource::Environment,
        );

        let mut plugins = agent.sandbox_plugins();
        for (_, delegate) in &options.delegates {
            plugins.extend(delegate.sandbox_plugins());
        }
        plugins.sort();
        plugins.dedup();
        let runtime = runtimes
            .create(&self.session_id, &plugins)
            .await
            .context("failed creating runtime")?;
        if let Err(err) = runtime.init_plugins(&plugins).await {
            runtime.close().await;
            return Err(err).context("failed initializing sandbox plugins");
        }

        let restored = match &self.state_store {
            Some(store) => store
                .load(&self.session_id)
                .await
                .context("failed loading saved state")?,
            None => None,
        };

        let bridge = RuntimeBridge::new(runtime.clone(), self.stream.clone());
        bridge.attach();

        let mut builder =
            AgentController::builder(agent, self.stream.clone()).config(options.controller);
        for (name, delegate) in options.delegates {
            builder = builder.delegate(name, delegate);
        }
        if let Some(analyzer) = options.analyzer {
            builder = builder.security_analyzer(analyzer);
        }
        if let Some(condenser) = options.condenser {
            builder = builder.condenser(condenser);
        }
        if let Some(on_status) = options.on_status {
            builder = builder.on_status(on_status);
        }
        if let Some(store) = &self.state_store {
            builder = builder.state_store(store.clone());
        }
        if let Some(state) = restored {
            info!(iteration = state.iteration, state = %state.agent_state, "resuming saved state");
            builder = builder.resume_from(state);
        }

        let controller = builder.build().spawn();
        *running = Some(Running {
            runtime,
            bridge,
            controller,
        });
        info!(plugins = plugins.len(), "agent session started");
        Ok(())
    }

    /// Ends the agent loop after a fatal error reported to the client.
    pub async fn stop_agent_loop_for_error(&self) {
        let running = self.running.lock().await;
        let Some(running) = running.as_ref() else {
            return;
        };
        error!(session_id = %self.session_id, "stopping agent loop after error");
        if running.controller.stop(self.close_grace).await.is_none() {
            warn!(session_id = %self.session_id, "agent loop had already ended");
        }
    }

    /// Stops the controller, closes the runtime and the stream, and saves the
    /// final state. Returns that state the first time it is called.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn close(&self) -> Option<State> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return None;
        }
        let running = self.running.lock().await.take();
        let Some(running) = running else {
            self.stream.close().await;
            return None;
        };

        let state = running.controller.stop(self.close_grace).await;
        if state.is_none() {
            warn!("controller did not hand back its state");
        }
        running.bridge.detach();
        running.runtime.close().await;
        self.stream.close().await;

        if let (Some(store), Some(state)) = (&self.state_store, &state)
            && let Err(err) = store.save(state).await
        {
            warn!(error = %err, "failed saving final state");
        }
        info!("agent session closed");
        state
    }
}
