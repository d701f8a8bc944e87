mod agent;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use serde_json::{Value, json};
use skiff_kernel::{AgentFactory, AppConfig, KernelBuilder};
use skiff_protocol::{Agent, AgentState, KernelResult, SessionId, Transport};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::agent::ShellAgent;

#[derive(Debug, Parser)]
#[command(name = "skiffd")]
#[command(about = "Run one skiff agent session against a local sandbox")]
struct Cli {
    /// Event logs, saved states, and sandbox state live here.
    #[arg(long, default_value = ".skiff")]
    root: PathBuf,
    /// JSON config file; environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    workspace: Option<PathBuf>,
    #[arg(long)]
    max_iterations: Option<u64>,
    /// Resume or name a session instead of starting a fresh one.
    #[arg(long)]
    session: Option<String>,
    #[arg(long, default_value = "echo hello from skiff")]
    task: String,
    /// Seconds to wait for the agent before closing the session.
    #[arg(long, default_value_t = 300)]
    wait_secs: u64,
}

/// Prints every relayed record as one JSON line.
struct StdoutTransport;

#[async_trait]
impl Transport for StdoutTransport {
    async fn send(&self, payload: Value) -> KernelResult<()> {
        println!("{payload}");
        Ok(())
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    }
    .with_env_overrides()?;
    if let Some(workspace) = &cli.workspace {
        config.workspace_base = workspace.clone();
    }
    if let Some(max_iterations) = cli.max_iterations {
        config.max_iterations = max_iterations;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!(config = %config.redacted(), "configuration loaded");
    tokio::fs::create_dir_all(&config.workspace_base)
        .await
        .with_context(|| format!("failed creating workspace {}", config.workspace_base.display()))?;

    let agents: AgentFactory = Arc::new(|_: &SessionId| -> Arc<dyn Agent> { Arc::new(ShellAgent) });
    let kernel = KernelBuilder::new(&cli.root, agents).config(config).build();

    let session_id = cli
        .session
        .map(SessionId::from_string)
        .unwrap_or_else(SessionId::new_uuid);
    let connection = kernel
        .attach(session_id.clone(), Arc::new(StdoutTransport), None)
        .await?;
    info!(session_id = %session_id, root = %cli.root.display(), "session attached");

    kernel
        .dispatch(
            &session_id,
            json!({"action": "message", "args": {"content": cli.task}}),
        )
        .await?;

    let agent = connection.agent_session().clone();
    let settled = async {
        loop {
            match agent.agent_state().await {
                Some(
                    state @ (AgentState::Finished
                    | AgentState::Rejected
                    | AgentState::Error
                    | AgentState::Stopped
                    | AgentState::AwaitingUserInput),
                ) => return state,
                None => return AgentState::Stopped,
                Some(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    };
    tokio::select! {
        state = tokio::time::timeout(Duration::from_secs(cli.wait_secs), settled) => match state {
            Ok(state) => info!(state = %state, "agent settled"),
            Err(_) => warn!(wait_secs = cli.wait_secs, "agent still running; closing"),
        },
        _ = tokio::signal::ctrl_c() => warn!("interrupted; closing"),
    }

    match kernel.close_session(&session_id).await? {
        Some(state) => info!(
            state = %state.agent_state,
            iterations = state.iteration,
            cost = state.metrics.accumulated_cost,
            "session closed"
        ),
        None => warn!("session closed before the agent started"),
    }
    Ok(())
}
