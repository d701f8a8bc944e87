//! Actions: intents emitted by the agent or the user.
//!
//! Every variant serializes under exactly one `action` tag with its fields in
//! `args`. [`ACTION_TAGS`] is the registry consulted when decoding records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{CommandId, EventId};
use crate::state::AgentState;

/// Risk classification assigned by a security analyzer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SecurityRisk {
    #[default]
    Unknown,
    Low,
    Medium,
    High,
}

impl SecurityRisk {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Whether a runnable action may be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    #[default]
    Confirmed,
    AwaitingConfirmation,
    Rejected,
}

impl ConfirmationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageAction {
    pub content: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub wait_for_response: bool,
}

impl MessageAction {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn waiting(mut self) -> Self {
        self.wait_for_response = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CmdRunAction {
    pub command: String,
    /// Start detached and return immediately with a command id.
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub thought: String,
}

impl CmdRunAction {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CmdKillAction {
    pub command_id: CommandId,
    #[serde(default)]
    pub thought: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IPythonRunCellAction {
    pub code: String,
    #[serde(default)]
    pub thought: String,
    /// Code replayed after an interpreter restart.
    #[serde(default)]
    pub kernel_init_code: String,
}

impl IPythonRunCellAction {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }
}

/// Read `[start, end)` lines of a file; `end = None` reads to EOF.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FileReadAction {
    pub path: String,
    #[serde(default)]
    pub start: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
    #[serde(default)]
    pub thought: String,
}

impl FileReadAction {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Replace `[start, end)` lines of a file with `content`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FileWriteAction {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub start: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
    #[serde(default)]
    pub thought: String,
}

impl FileWriteAction {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BrowseUrlAction {
    pub url: String,
    #[serde(default)]
    pub thought: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BrowseInteractiveAction {
    pub browser_actions: String,
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub browsergym_send_msg_to_user: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentRecallAction {
    pub query: String,
    #[serde(default)]
    pub thought: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentFinishAction {
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub thought: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentRejectAction {
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub thought: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentDelegateAction {
    pub agent: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub thought: String,
}

/// Condensed history. Events up to `last_summarized_event_id` are covered.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentSummarizeAction {
    pub summarized_actions: String,
    pub summarized_observations: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_summarized_event_id: Option<EventId>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AddTaskAction {
    #[serde(default)]
    pub parent: String,
    pub goal: String,
    #[serde(default)]
    pub subtasks: Vec<Value>,
    #[serde(default)]
    pub thought: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModifyTaskAction {
    pub task_id: String,
    pub state: String,
    #[serde(default)]
    pub thought: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChangeAgentStateAction {
    pub agent_state: AgentState,
    #[serde(default)]
    pub thought: String,
}

impl ChangeAgentStateAction {
    pub fn new(agent_state: AgentState) -> Self {
        Self {
            agent_state,
            thought: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NullAction {}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RegenerateAction {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "args")]
pub enum Action {
    #[serde(rename = "message")]
    Message(MessageAction),
    #[serde(rename = "run")]
    CmdRun(CmdRunAction),
    #[serde(rename = "kill")]
    CmdKill(CmdKillAction),
    #[serde(rename = "run_ipython")]
    IPythonRunCell(IPythonRunCellAction),
    #[serde(rename = "read")]
    FileRead(FileReadAction),
    #[serde(rename = "write")]
    FileWrite(FileWriteAction),
    #[serde(rename = "browse")]
    BrowseUrl(BrowseUrlAction),
    #[serde(rename = "browse_interactive")]
    BrowseInteractive(BrowseInteractiveAction),
    #[serde(rename = "recall")]
    AgentRecall(AgentRecallAction),
    #[serde(rename = "finish")]
    AgentFinish(AgentFinishAction),
    #[serde(rename = "reject")]
    AgentReject(AgentRejectAction),
    #[serde(rename = "delegate")]
    AgentDelegate(AgentDelegateAction),
    #[serde(rename = "summarize")]
    AgentSummarize(AgentSummarizeAction),
    #[serde(rename = "add_task")]
    AddTask(AddTaskAction),
    #[serde(rename = "modify_task")]
    ModifyTask(ModifyTaskAction),
    #[serde(rename = "change_agent_state")]
    ChangeAgentState(ChangeAgentStateAction),
    #[serde(rename = "null")]
    Null(NullAction),
    #[serde(rename = "regenerate")]
    Regenerate(RegenerateAction),
}

/// Every `action` tag accepted on the wire.
pub const ACTION_TAGS: &[&str] = &[
    "message",
    "run",
    "kill",
    "run_ipython",
    "read",
    "write",
    "browse",
    "browse_interactive",
    "recall",
    "finish",
    "reject",
    "delegate",
    "summarize",
    "add_task",
    "modify_task",
    "change_agent_state",
    "null",
    "regenerate",
];

impl Action {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::CmdRun(_) => "run",
            Self::CmdKill(_) => "kill",
            Self::IPythonRunCell(_) => "run_ipython",
            Self::FileRead(_) => "read",
            Self::FileWrite(_) => "write",
            Self::BrowseUrl(_) => "browse",
            Self::BrowseInteractive(_) => "browse_interactive",
            Self::AgentRecall(_) => "recall",
            Self::AgentFinish(_) => "finish",
            Self::AgentReject(_) => "reject",
            Self::AgentDelegate(_) => "delegate",
            Self::AgentSummarize(_) => "summarize",
            Self::AddTask(_) => "add_task",
            Self::ModifyTask(_) => "modify_task",
            Self::ChangeAgentState(_) => "change_agent_state",
            Self::Null(_) => "null",
            Self::Regenerate(_) => "regenerate",
        }
    }

    /// Actions the runtime executes against the sandbox.
    pub fn is_runnable(&self) -> bool {
        matches!(
            self,
            Self::CmdRun(_)
                | Self::CmdKill(_)
                | Self::IPythonRunCell(_)
                | Self::FileRead(_)
                | Self::FileWrite(_)
                | Self::BrowseUrl(_)
                | Self::BrowseInteractive(_)
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }

    /// Human-readable rendering used as the event `message`.
    pub fn describe(&self) -> String {
        match self {
            Self::Message(a) => a.content.clone(),
            Self::CmdRun(a) => format!("Running command: {}", a.command),
            Self::CmdKill(a) => format!("Killing command: {}", a.command_id),
            Self::IPythonRunCell(a) => format!("Running Python code interactively: {}", a.code),
            Self::FileRead(a) => format!("Reading file: {}", a.path),
            Self::FileWrite(a) => format!("Writing file: {}", a.path),
            Self::BrowseUrl(a) => format!("Browsing URL: {}", a.url),
            Self::BrowseInteractive(a) => {
                format!("Executing browser actions: {}", a.browser_actions)
            }
            Self::AgentRecall(a) => format!("Searching memory for: {}", a.query),
            Self::AgentFinish(_) => "All done! What's next on the agenda?".to_owned(),
            Self::AgentReject(_) => "Task is rejected by the agent.".to_owned(),
            Self::AgentDelegate(a) => {
                format!("I'm asking {} for help with this task.", a.agent)
            }
            Self::AgentSummarize(a) => format!(
                "Summary of all Action and Observations till now. \nAction: {}\nObservation: {}",
                a.summarized_actions, a.summarized_observations
            ),
            Self::AddTask(a) => format!("Added task: {}", a.goal),
            Self::ModifyTask(a) => format!("Set task {} to {}", a.task_id, a.state),
            Self::ChangeAgentState(a) => format!("Agent state changed to {}", a.agent_state),
            Self::Null(_) => "No action".to_owned(),
            Self::Regenerate(_) => "Regenerating the last response".to_owned(),
        }
    }
}

macro_rules! impl_into_action {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Action {
                fn from(action: $ty) -> Self {
                    Self::$variant(action)
                }
            }
        )*
    };
}

impl_into_action!(
    MessageAction => Message,
    CmdRunAction => CmdRun,
    CmdKillAction => CmdKill,
    IPythonRunCellAction => IPythonRunCell,
    FileReadAction => FileRead,
    FileWriteAction => FileWrite,
    BrowseUrlAction => BrowseUrl,
    BrowseInteractiveAction => BrowseInteractive,
    AgentRecallAction => AgentRecall,
    AgentFinishAction => AgentFinish,
    AgentRejectAction => AgentReject,
    AgentDelegateAction => AgentDelegate,
    AgentSummarizeAction => AgentSummarize,
    AddTaskAction => AddTask,
    ModifyTaskAction => ModifyTask,
    ChangeAgentStateAction => ChangeAgentState,
    NullAction => Null,
    RegenerateAction => Regenerate,
);
