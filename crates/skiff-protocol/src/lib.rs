//! # skiff-protocol: shared contract of the skiff agent runtime
//!
//! Types and traits every other crate depends on. No runtime deps (no tokio).
//!
//! ## Module Overview
//!
//! - [`action`]: Action variants, security risk, confirmation status
//! - [`observation`]: Observation variants and error classification
//! - [`event`]: Event envelope and its wire record
//! - [`state`]: AgentState, Metrics, TaskPlan, resumable controller State
//! - [`ports`]: LLM, agent, browser, transport, and state-store ports
//! - [`session`]: client control commands and status messages
//! - [`redact`]: secret masking for logs
//! - [`ids`]: typed identifiers
//! - [`error`]: MalformedEventError, KernelError, KernelResult

pub mod action;
pub mod error;
pub mod event;
pub mod ids;
pub mod observation;
pub mod ports;
pub mod redact;
pub mod session;
pub mod state;

pub use action::{
    ACTION_TAGS, Action, AddTaskAction, AgentDelegateAction, AgentFinishAction,
    AgentRecallAction, AgentRejectAction, AgentSummarizeAction, BrowseInteractiveAction,
    BrowseUrlAction, ChangeAgentStateAction, CmdKillAction, CmdRunAction, ConfirmationStatus,
    FileReadAction, FileWriteAction, IPythonRunCellAction, MessageAction, ModifyTaskAction,
    NullAction, RegenerateAction, SecurityRisk,
};
pub use error::{KernelError, KernelResult, MalformedEventError};
pub use event::{ActionPayload, Event, EventPayload, EventRecord, EventSource};
pub use ids::{CommandId, EventId, SandboxId, SandboxKey, SessionId};
pub use observation::{
    AgentDelegateObservation, AgentStateChangedObservation, BrowserObservation,
    CmdOutputObservation, ErrorId, ErrorObservation, FileReadObservation, FileWriteObservation,
    IPythonRunCellObservation, NullObservation, OBSERVATION_TAGS, Observation,
    UserRejectObservation,
};
pub use ports::{
    Agent, BrowserPage, BrowserPort, ChatMessage, CompletionOptions, LlmPort, LlmResponse,
    PluginRequirement, Role, StateStore, StepOutcome, Transport, approximate_tokens,
};
pub use session::{ControlCommand, StatusKind, StatusMessage, error_payload};
pub use state::{AgentState, Metrics, PlanError, State, Task, TaskPlan, TaskState};
