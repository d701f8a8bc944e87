//! # skiff-kernel: session orchestration
//!
//! A [`Kernel`] owns every live session. Each session gets its own event
//! stream (persisted as JSONL), runtime, and agent controller; clients attach
//! through a [`Transport`] and may reconnect with the last event id they saw.

mod agent_session;
mod config;
mod session;
mod store;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use skiff_condenser::Condenser;
use skiff_events::{EventStream, FileEventStore};
use skiff_policy::{SecurityAnalyzer, SessionSecurityAnalyzer};
use skiff_protocol::{Agent, EventId, LlmPort, SessionId, State, StatusMessage, Transport};
use tracing::{info, instrument, warn};

pub use agent_session::{AgentSession, LocalRuntimeFactory, RuntimeFactory, StartOptions};
pub use config::{
    AppConfig, ENV_CONFIRMATION_MODE, ENV_MAX_BUDGET_PER_TASK, ENV_MAX_ITERATIONS,
    ENV_WORKSPACE_BASE,
};
pub use session::{Session, outgoing};
pub use store::FileStateStore;

/// Builds a fresh agent for a session.
pub type AgentFactory = Arc<dyn Fn(&SessionId) -> Arc<dyn Agent> + Send + Sync>;

type Connections = Arc<Mutex<HashMap<SessionId, Arc<Session>>>>;

pub struct KernelBuilder {
    root: PathBuf,
    config: AppConfig,
    agent: AgentFactory,
    delegates: Vec<(String, AgentFactory)>,
    runtimes: Option<Arc<dyn RuntimeFactory>>,
    analyzer: Option<Arc<dyn SecurityAnalyzer>>,
    condenser_llm: Option<Arc<dyn LlmPort>>,
}

impl KernelBuilder {
    /// `root` holds event logs, saved states, and sandbox state directories.
    pub fn new(root: impl Into<PathBuf>, agent: AgentFactory) -> Self {
        Self {
            root: root.into(),
            config: AppConfig::default(),
            agent,
            delegates: Vec::new(),
            runtimes: None,
            analyzer: None,
            condenser_llm: None,
        }
    }

    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    pub fn delegate(mut self, name: impl Into<String>, agent: AgentFactory) -> Self {
        self.delegates.push((name.into(), agent));
        self
    }

    /// Replaces the default local-process sandboxes.
    pub fn runtime_factory(mut self, runtimes: Arc<dyn RuntimeFactory>) -> Self {
        self.runtimes = Some(runtimes);
        self
    }

    pub fn security_analyzer(mut self, analyzer: Arc<dyn SecurityAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Enables history condensation with `llm` as the summarizer.
    pub fn condenser_llm(mut self, llm: Arc<dyn LlmPort>) -> Self {
        self.condenser_llm = Some(llm);
        self
    }

    pub fn build(self) -> Kernel {
        let runtimes = self.runtimes.unwrap_or_else(|| {
            Arc::new(LocalRuntimeFactory::new(
                self.config.runtime_config(),
                self.config.sandbox.clone(),
                self.root.join("sandboxes"),
            ))
        });
        let analyzer = self
            .analyzer
            .unwrap_or_else(|| Arc::new(SessionSecurityAnalyzer::new(self.config.security.clone())));
        let condenser = self
            .condenser_llm
            .map(|llm| Arc::new(Condenser::new(llm, self.config.condenser.clone())));

        Kernel {
            inner: Arc::new(KernelInner {
                event_store: Arc::new(FileEventStore::new(&self.root)),
                state_store: Arc::new(FileStateStore::new(&self.root)),
                root: self.root,
                config: self.config,
                agent: self.agent,
                delegates: self.delegates,
                runtimes,
                analyzer,
                condenser,
                sessions: tokio::sync::Mutex::new(HashMap::new()),
                connections: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }
}

struct KernelInner {
    root: PathBuf,
    config: AppConfig,
    agent: AgentFactory,
    delegates: Vec<(String, AgentFactory)>,
    runtimes: Arc<dyn RuntimeFactory>,
    analyzer: Arc<dyn SecurityAnalyzer>,
    condenser: Option<Arc<Condenser>>,
    event_store: Arc<FileEventStore>,
    state_store: Arc<FileStateStore>,
    sessions: tokio::sync::Mutex<HashMap<SessionId, Arc<AgentSession>>>,
    connections: Connections,
}

/// Session manager. Sessions are independent; cloning shares the manager.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.inner.sessions.lock().await.keys().cloned().collect()
    }

    pub async fn session(&self, session_id: &SessionId) -> Option<Arc<AgentSession>> {
        self.inner.sessions.lock().await.get(session_id).cloned()
    }

    /// Starts a session, or returns it when it is already live. A session
    /// with events on disk is restored and continues its numbering.
    #[instrument(skip(self), fields(session_id = ?session_id.as_ref().map(SessionId::as_str)))]
    pub async fn start_session(&self, session_id: Option<SessionId>) -> Result<Arc<AgentSession>> {
        let session_id = session_id.unwrap_or_else(SessionId::new_uuid);
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(live) = sessions.get(&session_id) {
            return Ok(live.clone());
        }

        let stream = EventStream::restore(session_id.clone(), self.inner.event_store.clone())
            .await
            .with_context(|| format!("failed restoring session {session_id}"))?;
        let session = Arc::new(
            AgentSession::new(stream, Some(self.inner.state_store.clone()))
                .with_close_grace(self.inner.config.close_grace()),
        );

        let agent = (self.inner.agent)(&session_id);
        let delegates = self
            .inner
            .delegates
            .iter()
            .map(|(name, factory)| (name.clone(), factory(&session_id)))
            .collect();
        let options = StartOptions {
            controller: self.inner.config.controller_config(),
            delegates,
            analyzer: Some(self.inner.analyzer.clone()),
            condenser: self.inner.condenser.clone(),
            on_status: Some(status_relay(
                self.inner.connections.clone(),
                session_id.clone(),
            )),
        };
        session
            .start(agent, self.inner.runtimes.as_ref(), options)
            .await
            .with_context(|| format!("failed starting session {session_id}"))?;

        sessions.insert(session_id.clone(), session.clone());
        info!(session_id = %session_id, live = sessions.len(), "session started");
        Ok(session)
    }

    /// Connects `transport` to a session, starting or restoring it when
    /// needed, and replays events after `last_seen_id`. Attaching again
    /// replaces the previous connection.
    #[instrument(skip(self, transport), fields(session_id = %session_id))]
    pub async fn attach(
        &self,
        session_id: SessionId,
        transport: Arc<dyn Transport>,
        last_seen_id: Option<EventId>,
    ) -> Result<Arc<Session>> {
        let agent_session = self.start_session(Some(session_id.clone())).await?;
        let previous = self.inner.connections.lock().remove(&session_id);
        if let Some(previous) = previous {
            previous.detach();
        }
        let connection = Session::new(agent_session, transport);
        connection.attach(last_seen_id).await;
        self.inner
            .connections
            .lock()
            .insert(session_id, connection.clone());
        Ok(connection)
    }

    /// Forwards a client record to the attached session.
    pub async fn dispatch(&self, session_id: &SessionId, value: Value) -> Result<Option<EventId>> {
        let connection = self
            .connection(session_id)
            .with_context(|| format!("no client attached to session {session_id}"))?;
        Ok(connection.dispatch(value).await)
    }

    pub fn connection(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.inner.connections.lock().get(session_id).cloned()
    }

    /// Closes a live session and returns its final state.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn close_session(&self, session_id: &SessionId) -> Result<Option<State>> {
        let session = self
            .inner
            .sessions
            .lock()
            .await
            .remove(session_id)
            .with_context(|| format!("unknown session {session_id}"))?;
        // The client sees the final state changes before it is detached.
        let connection = self.inner.connections.lock().remove(session_id);
        let state = session.close().await;
        if let Some(connection) = connection {
            connection.detach();
        }
        Ok(state)
    }

    /// Closes every live session.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.inner.sessions.lock().await.drain().collect();
        let connections: Vec<_> = self.inner.connections.lock().drain().collect();
        for (session_id, session) in sessions {
            if session.close().await.is_none() {
                warn!(session_id = %session_id, "session closed without a final state");
            }
        }
        for (_, connection) in connections {
            connection.detach();
        }
        info!("kernel shut down");
    }
}

/// Routes controller status messages to whichever client is attached.
fn status_relay(
    connections: Connections,
    session_id: SessionId,
) -> skiff_controller::StatusCallback {
    Arc::new(move |status: StatusMessage| {
        let Some(connection) = connections.lock().get(&session_id).cloned() else {
            warn!(session_id = %session_id, id = %status.id, "status dropped; no client attached");
            return;
        };
        tokio::spawn(async move { connection.send_status(status).await });
    })
}
