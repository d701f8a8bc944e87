//! # skiff-controller: the agent loop
//!
//! One [`AgentController`] per session drives its agent step by step against
//! the session's event stream. It enforces the iteration and cost budget,
//! gates risky actions behind user confirmation, runs delegate agents as
//! nested frames, and condenses the history when it grows too large.
//!
//! The controller never calls the runtime. It publishes actions and waits for
//! the observation whose `cause` is the action it published.

mod controller;
mod history;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skiff_protocol::{AgentState, SecurityRisk, StatusMessage};

pub use controller::{AgentController, AgentControllerBuilder, ControllerHandle};

/// Receives status messages the transport should show, such as the reason
/// the loop stopped with an error.
pub type StatusCallback = Arc<dyn Fn(StatusMessage) + Send + Sync>;

pub const STATUS_AGENT_ERROR: &str = "STATUS$AGENT_ERROR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub max_iterations: u64,
    pub max_budget_per_task: Option<f64>,
    /// Bound on the steps of one delegate frame.
    pub max_delegate_iterations: Option<u64>,
    pub confirmation_mode: bool,
    pub confirmation_threshold: SecurityRisk,
    /// How long to wait for the observation of a published action.
    pub pending_action_timeout_ms: u64,
    /// Condense once the history view holds more tokens than this.
    pub condense_threshold_tokens: Option<usize>,
    /// States that end [`AgentController::run`] besides `error` and `stopped`.
    pub exit_on: Vec<AgentState>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            max_budget_per_task: None,
            max_delegate_iterations: None,
            confirmation_mode: false,
            confirmation_threshold: SecurityRisk::High,
            pending_action_timeout_ms: 130_000,
            condense_threshold_tokens: None,
            exit_on: Vec::new(),
        }
    }
}

impl ControllerConfig {
    /// Runs until the agent finishes, rejects, or asks the user something.
    pub fn headless() -> Self {
        Self {
            exit_on: vec![
                AgentState::Finished,
                AgentState::Rejected,
                AgentState::AwaitingUserInput,
            ],
            ..Self::default()
        }
    }

    pub fn pending_action_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_action_timeout_ms)
    }

    pub(crate) fn ends_run(&self, state: AgentState) -> bool {
        matches!(state, AgentState::Error | AgentState::Stopped) || self.exit_on.contains(&state)
    }
}
