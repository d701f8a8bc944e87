//! Ports to external collaborators.
//!
//! The kernel only talks to models, agents, browsers, transports, and state
//! stores through these traits. Traits use `async-trait` for dyn dispatch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::Action;
use crate::error::KernelResult;
use crate::ids::{EventId, SessionId};
use crate::state::State;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Eligible for summarization. System prompts and examples are not.
    #[serde(default)]
    pub condensable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            condensable: false,
            event_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Marks the message as condensable and ties it to its source event.
    pub fn condensable(mut self, event_id: EventId) -> Self {
        self.condensable = true;
        self.event_id = Some(event_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub temperature: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    #[serde(default)]
    pub cost_usd: f64,
}

/// Rough token estimate: four characters per token.
pub fn approximate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[async_trait]
pub trait LlmPort: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> KernelResult<LlmResponse>;

    /// Maximum number of input tokens the model accepts.
    fn context_window(&self) -> usize;

    fn count_tokens(&self, messages: &[ChatMessage]) -> usize {
        messages
            .iter()
            .map(|message| approximate_tokens(&message.content))
            .sum()
    }
}

/// Capabilities an agent needs installed in its sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginRequirement {
    /// Persistent Python interpreter for `run_ipython`.
    Jupyter,
    /// Helper library importable from the interpreter.
    AgentSkills,
}

impl PluginRequirement {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Jupyter => "jupyter",
            Self::AgentSkills => "agent_skills",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub action: Action,
    /// LLM spend incurred by this step.
    pub cost_usd: f64,
}

impl StepOutcome {
    pub fn new(action: impl Into<Action>) -> Self {
        Self {
            action: action.into(),
            cost_usd: 0.0,
        }
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = cost_usd;
        self
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    /// Produces the next action from the current state.
    async fn step(&self, state: &State) -> KernelResult<StepOutcome>;

    fn sandbox_plugins(&self) -> Vec<PluginRequirement> {
        Vec::new()
    }

    async fn reset(&self) {}
}

/// Page state returned by a browser backend after one action.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BrowserPage {
    pub url: String,
    pub text_content: String,
    #[serde(default)]
    pub screenshot: String,
    #[serde(default)]
    pub open_pages_urls: Vec<String>,
    #[serde(default)]
    pub active_page_index: i32,
    #[serde(default)]
    pub axtree_txt: String,
    #[serde(default)]
    pub focused_element_bid: String,
    #[serde(default)]
    pub last_action_error: String,
}

#[async_trait]
pub trait BrowserPort: Send + Sync {
    async fn step(&self, action: &str) -> KernelResult<BrowserPage>;

    async fn close(&self) {}
}

/// Outbound channel to a connected client.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, payload: Value) -> KernelResult<()>;
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, state: &State) -> KernelResult<()>;
    async fn load(&self, session_id: &SessionId) -> KernelResult<Option<State>>;
}
