//! Observations: the environment's responses to actions.
//!
//! Every variant carries `content`. On the wire `content` sits at the top
//! level and the remaining fields go into `extras`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::CommandId;
use crate::state::AgentState;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CmdOutputObservation {
    pub content: String,
    pub command_id: CommandId,
    pub command: String,
    pub exit_code: i32,
}

impl CmdOutputObservation {
    pub fn new(content: impl Into<String>, command: impl Into<String>, exit_code: i32) -> Self {
        Self {
            content: content.into(),
            command_id: -1,
            command: command.into(),
            exit_code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IPythonRunCellObservation {
    pub content: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FileReadObservation {
    pub content: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FileWriteObservation {
    pub content: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserObservation {
    pub content: String,
    pub url: String,
    #[serde(default)]
    pub screenshot: String,
    #[serde(default)]
    pub open_pages_urls: Vec<String>,
    #[serde(default = "no_active_page")]
    pub active_page_index: i32,
    /// Flattened accessibility tree of the active page.
    #[serde(default)]
    pub axtree_txt: String,
    #[serde(default)]
    pub focused_element_bid: String,
    #[serde(default)]
    pub last_browser_action: String,
    #[serde(default)]
    pub last_browser_action_error: String,
    #[serde(default)]
    pub error: bool,
}

fn no_active_page() -> i32 {
    -1
}

impl BrowserObservation {
    pub fn failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            content: message.clone(),
            url: url.into(),
            screenshot: String::new(),
            open_pages_urls: Vec::new(),
            active_page_index: -1,
            axtree_txt: String::new(),
            focused_element_bid: String::new(),
            last_browser_action: String::new(),
            last_browser_action_error: message,
            error: true,
        }
    }
}

/// Classification of error observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorId {
    #[default]
    Generic,
    Timeout,
    FileNotFound,
    InvalidRange,
    PermissionDenied,
    IsDirectory,
    DecodeError,
    BrowserUnavailable,
    PluginUnavailable,
    SandboxUnavailable,
    MalformedAction,
    InvalidTask,
    AgentError,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorObservation {
    pub content: String,
    #[serde(default)]
    pub error_id: ErrorId,
}

impl ErrorObservation {
    pub fn new(error_id: ErrorId, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            error_id,
        }
    }

    /// The sandbox is gone and the session cannot continue.
    pub fn is_fatal(&self) -> bool {
        self.error_id == ErrorId::SandboxUnavailable
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentStateChangedObservation {
    pub content: String,
    pub agent_state: AgentState,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentDelegateObservation {
    pub content: String,
    #[serde(default)]
    pub outputs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserRejectObservation {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NullObservation {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "observation", content = "extras")]
pub enum Observation {
    #[serde(rename = "run")]
    CmdOutput(CmdOutputObservation),
    #[serde(rename = "run_ipython")]
    IPythonRunCell(IPythonRunCellObservation),
    #[serde(rename = "read")]
    FileRead(FileReadObservation),
    #[serde(rename = "write")]
    FileWrite(FileWriteObservation),
    #[serde(rename = "browse")]
    Browser(BrowserObservation),
    #[serde(rename = "error")]
    Error(ErrorObservation),
    #[serde(rename = "agent_state_changed")]
    AgentStateChanged(AgentStateChangedObservation),
    #[serde(rename = "delegate")]
    AgentDelegate(AgentDelegateObservation),
    #[serde(rename = "user_rejected")]
    UserRejected(UserRejectObservation),
    #[serde(rename = "null")]
    Null(NullObservation),
}

/// Every `observation` tag accepted on the wire.
pub const OBSERVATION_TAGS: &[&str] = &[
    "run",
    "run_ipython",
    "read",
    "write",
    "browse",
    "error",
    "agent_state_changed",
    "delegate",
    "user_rejected",
    "null",
];

impl Observation {
    pub fn error(error_id: ErrorId, content: impl Into<String>) -> Self {
        Self::Error(ErrorObservation::new(error_id, content))
    }

    pub fn state_changed(agent_state: AgentState) -> Self {
        Self::AgentStateChanged(AgentStateChangedObservation {
            content: String::new(),
            agent_state,
        })
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::CmdOutput(_) => "run",
            Self::IPythonRunCell(_) => "run_ipython",
            Self::FileRead(_) => "read",
            Self::FileWrite(_) => "write",
            Self::Browser(_) => "browse",
            Self::Error(_) => "error",
            Self::AgentStateChanged(_) => "agent_state_changed",
            Self::AgentDelegate(_) => "delegate",
            Self::UserRejected(_) => "user_rejected",
            Self::Null(_) => "null",
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::CmdOutput(o) => &o.content,
            Self::IPythonRunCell(o) => &o.content,
            Self::FileRead(o) => &o.content,
            Self::FileWrite(o) => &o.content,
            Self::Browser(o) => &o.content,
            Self::Error(o) => &o.content,
            Self::AgentStateChanged(o) => &o.content,
            Self::AgentDelegate(o) => &o.content,
            Self::UserRejected(o) => &o.content,
            Self::Null(o) => &o.content,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }

    pub fn describe(&self) -> String {
        match self {
            Self::CmdOutput(o) => format!("Command `{}` executed with exit code {}.", o.command, o.exit_code),
            Self::IPythonRunCell(o) => format!("Code executed in IPython cell:\n{}", o.code),
            Self::FileRead(o) => format!("I read the file {}.", o.path),
            Self::FileWrite(o) => format!("I wrote to the file {}.", o.path),
            Self::Browser(o) => format!("Visited {}", o.url),
            Self::Error(o) => o.content.clone(),
            Self::AgentStateChanged(o) => format!("Agent state changed to {}", o.agent_state),
            Self::AgentDelegate(o) => o.content.clone(),
            Self::UserRejected(o) => o.content.clone(),
            Self::Null(_) => "No observation".to_owned(),
        }
    }
}

macro_rules! impl_into_observation {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Observation {
                fn from(observation: $ty) -> Self {
                    Self::$variant(observation)
                }
            }
        )*
    };
}

impl_into_observation!(
    CmdOutputObservation => CmdOutput,
    IPythonRunCellObservation => IPythonRunCell,
    FileReadObservation => FileRead,
    FileWriteObservation => FileWrite,
    BrowserObservation => Browser,
    ErrorObservation => Error,
    AgentStateChangedObservation => AgentStateChanged,
    AgentDelegateObservation => AgentDelegate,
    UserRejectObservation => UserRejected,
    NullObservation => Null,
);
