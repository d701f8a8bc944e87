//! Session control surface: commands arriving from a client and status
//! messages sent back to it.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::action::{Action, ChangeAgentStateAction, MessageAction};
use crate::state::AgentState;

/// A control event from the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    Message {
        content: String,
        #[serde(default)]
        image_urls: Vec<String>,
    },
    Pause,
    Resume,
    Stop,
    Approve,
    Reject,
}

impl ControlCommand {
    pub fn into_action(self) -> Action {
        match self {
            Self::Message {
                content,
                image_urls,
            } => MessageAction {
                content,
                image_urls,
                wait_for_response: false,
            }
            .into(),
            Self::Pause => ChangeAgentStateAction::new(AgentState::Paused).into(),
            Self::Resume => ChangeAgentStateAction::new(AgentState::Running).into(),
            Self::Stop => ChangeAgentStateAction::new(AgentState::Stopped).into(),
            Self::Approve => ChangeAgentStateAction::new(AgentState::UserConfirmed).into(),
            Self::Reject => ChangeAgentStateAction::new(AgentState::UserRejected).into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    #[serde(rename = "type")]
    pub kind: StatusKind,
    pub id: String,
    pub message: String,
}

impl StatusMessage {
    pub fn info(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: StatusKind::Info,
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: StatusKind::Error,
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn to_payload(&self) -> Value {
        json!({
            "status_update": true,
            "type": self.kind,
            "id": self.id,
            "message": self.message,
        })
    }
}

pub fn error_payload(message: &str) -> Value {
    json!({ "error": true, "message": message })
}
