//! Event envelope and its wire record.
//!
//! [`Event`] serializes through [`EventRecord`]:
//!
//! ```text
//! {id, timestamp, source, message, action, args, cause?}        // actions
//! {id, timestamp, source, message, observation, content, extras, cause?}
//! ```
//!
//! `message` is derived on output and ignored on input. Unknown top-level keys
//! are ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::action::{ACTION_TAGS, Action, ConfirmationStatus, SecurityRisk};
use crate::error::MalformedEventError;
use crate::ids::EventId;
use crate::observation::{OBSERVATION_TAGS, Observation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    #[default]
    User,
    Agent,
    Environment,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionPayload {
    pub action: Action,
    pub security_risk: SecurityRisk,
    pub confirmation: ConfirmationStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Action(ActionPayload),
    Observation(Observation),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "EventRecord", into = "EventRecord")]
pub struct Event {
    /// Assigned by the stream on insertion.
    pub id: Option<EventId>,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    pub cause: Option<EventId>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: None,
            timestamp: Utc::now(),
            source: EventSource::default(),
            cause: None,
            payload,
        }
    }

    pub fn action(action: impl Into<Action>) -> Self {
        Self::new(EventPayload::Action(ActionPayload {
            action: action.into(),
            security_risk: SecurityRisk::Unknown,
            confirmation: ConfirmationStatus::Confirmed,
        }))
    }

    pub fn observation(observation: impl Into<Observation>) -> Self {
        Self::new(EventPayload::Observation(observation.into()))
    }

    pub fn with_source(mut self, source: EventSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_cause(mut self, cause: EventId) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn with_risk(mut self, risk: SecurityRisk) -> Self {
        if let EventPayload::Action(payload) = &mut self.payload {
            payload.security_risk = risk;
        }
        self
    }

    pub fn with_confirmation(mut self, confirmation: ConfirmationStatus) -> Self {
        if let EventPayload::Action(payload) = &mut self.payload {
            payload.confirmation = confirmation;
        }
        self
    }

    pub fn as_action(&self) -> Option<&Action> {
        match &self.payload {
            EventPayload::Action(payload) => Some(&payload.action),
            EventPayload::Observation(_) => None,
        }
    }

    pub fn action_payload(&self) -> Option<&ActionPayload> {
        match &self.payload {
            EventPayload::Action(payload) => Some(payload),
            EventPayload::Observation(_) => None,
        }
    }

    pub fn as_observation(&self) -> Option<&Observation> {
        match &self.payload {
            EventPayload::Observation(observation) => Some(observation),
            EventPayload::Action(_) => None,
        }
    }

    pub fn is_null(&self) -> bool {
        match &self.payload {
            EventPayload::Action(payload) => payload.action.is_null(),
            EventPayload::Observation(observation) => observation.is_null(),
        }
    }

    /// Human-readable rendering.
    pub fn message(&self) -> String {
        match &self.payload {
            EventPayload::Action(payload) => payload.action.describe(),
            EventPayload::Observation(observation) => observation.describe(),
        }
    }

    /// Wire form of the event, as [`EventRecord`] serializes it.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    /// Decodes a generic record, classifying every failure.
    pub fn from_value(value: Value) -> Result<Self, MalformedEventError> {
        if !value.is_object() {
            return Err(MalformedEventError::NotAnObject);
        }
        let record: EventRecord = serde_json::from_value(value)
            .map_err(|error| MalformedEventError::BadEnvelope(error.to_string()))?;
        Self::try_from(record)
    }
}

/// Wire form of an [`Event`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: EventSource,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<Value>,
}

const RISK_KEY: &str = "security_risk";
const CONFIRMATION_KEY: &str = "confirmation_state";

impl From<Event> for EventRecord {
    fn from(event: Event) -> Self {
        let message = event.message();
        let mut record = EventRecord {
            id: event.id,
            timestamp: Some(event.timestamp),
            source: event.source,
            message,
            cause: event.cause,
            ..EventRecord::default()
        };
        match event.payload {
            EventPayload::Action(payload) => {
                let tag = payload.action.tag();
                let mut args = take_object(serde_json::to_value(&payload.action), "args");
                args.insert(
                    RISK_KEY.to_owned(),
                    Value::from(payload.security_risk.as_str()),
                );
                args.insert(
                    CONFIRMATION_KEY.to_owned(),
                    Value::from(payload.confirmation.as_str()),
                );
                record.action = Some(tag.to_owned());
                record.args = Some(Value::Object(args));
            }
            EventPayload::Observation(observation) => {
                let tag = observation.tag();
                let mut extras = take_object(serde_json::to_value(&observation), "extras");
                let content = match extras.remove("content") {
                    Some(Value::String(content)) => content,
                    _ => String::new(),
                };
                record.observation = Some(tag.to_owned());
                record.content = Some(content);
                record.extras = Some(Value::Object(extras));
            }
        }
        record
    }
}

impl TryFrom<EventRecord> for Event {
    type Error = MalformedEventError;

    fn try_from(record: EventRecord) -> Result<Self, Self::Error> {
        let payload = match (record.action, record.observation) {
            (Some(tag), None) => EventPayload::Action(decode_action(tag, record.args)?),
            (None, Some(tag)) => EventPayload::Observation(decode_observation(
                tag,
                record.content,
                record.extras,
            )?),
            (Some(_), Some(_)) => return Err(MalformedEventError::AmbiguousTag),
            (None, None) => return Err(MalformedEventError::MissingTag),
        };
        Ok(Self {
            id: record.id,
            timestamp: record.timestamp.unwrap_or_else(Utc::now),
            source: record.source,
            cause: record.cause,
            payload,
        })
    }
}

fn take_object(value: Result<Value, serde_json::Error>, key: &str) -> Map<String, Value> {
    match value {
        Ok(Value::Object(mut map)) => match map.remove(key) {
            Some(Value::Object(inner)) => inner,
            _ => Map::new(),
        },
        _ => Map::new(),
    }
}

fn object_or_empty(tag: &str, value: Option<Value>) -> Result<Map<String, Value>, MalformedEventError> {
    match value {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(other) => Err(MalformedEventError::BadArgs {
            tag: tag.to_owned(),
            reason: format!("expected an object, found {other}"),
        }),
    }
}

fn decode_field<T>(tag: &str, map: &mut Map<String, Value>, key: &str) -> Result<T, MalformedEventError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match map.remove(key) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value).map_err(|error| MalformedEventError::BadArgs {
            tag: tag.to_owned(),
            reason: format!("{key}: {error}"),
        }),
    }
}

fn decode_action(tag: String, args: Option<Value>) -> Result<ActionPayload, MalformedEventError> {
    if !ACTION_TAGS.contains(&tag.as_str()) {
        return Err(MalformedEventError::UnknownTag {
            family: "action",
            tag,
        });
    }
    let mut args = object_or_empty(&tag, args)?;
    let security_risk = decode_field(&tag, &mut args, RISK_KEY)?;
    let confirmation = decode_field(&tag, &mut args, CONFIRMATION_KEY)?;
    let mut envelope = Map::new();
    envelope.insert("action".to_owned(), Value::String(tag.clone()));
    envelope.insert("args".to_owned(), Value::Object(args));
    let action = serde_json::from_value(Value::Object(envelope))
        .map_err(|error| MalformedEventError::BadArgs {
            tag,
            reason: error.to_string(),
        })?;
    Ok(ActionPayload {
        action,
        security_risk,
        confirmation,
    })
}

fn decode_observation(
    tag: String,
    content: Option<String>,
    extras: Option<Value>,
) -> Result<Observation, MalformedEventError> {
    if !OBSERVATION_TAGS.contains(&tag.as_str()) {
        return Err(MalformedEventError::UnknownTag {
            family: "observation",
            tag,
        });
    }
    let mut extras = object_or_empty(&tag, extras)?;
    extras.insert("content".to_owned(), Value::String(content.unwrap_or_default()));
    let mut envelope = Map::new();
    envelope.insert("observation".to_owned(), Value::String(tag.clone()));
    envelope.insert("extras".to_owned(), Value::Object(extras));
    serde_json::from_value(Value::Object(envelope)).map_err(|error| MalformedEventError::BadArgs {
        tag,
        reason: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::*;
    use crate::observation::*;
    use crate::state::AgentState;
    use serde_json::json;

    fn every_action() -> Vec<Action> {
        let mut outputs = Map::new();
        outputs.insert("answer".to_owned(), json!(42));
        vec![
            MessageAction {
                content: "hello".into(),
                image_urls: vec!["https://img/1.png".into()],
                wait_for_response: true,
            }
            .into(),
            CmdRunAction {
                command: "ls -la".into(),
                background: true,
                thought: "look around".into(),
            }
            .into(),
            CmdKillAction {
                command_id: 7,
                thought: String::new(),
            }
            .into(),
            IPythonRunCellAction {
                code: "print(1)".into(),
                thought: "t".into(),
                kernel_init_code: "from agentskills import *".into(),
            }
            .into(),
            FileReadAction {
                path: "src/main.rs".into(),
                start: 3,
                end: Some(9),
                thought: String::new(),
            }
            .into(),
            FileWriteAction::new("notes.txt", "line\n").into(),
            BrowseUrlAction {
                url: "https://example.com".into(),
                thought: String::new(),
            }
            .into(),
            BrowseInteractiveAction {
                browser_actions: "click(\"12\")".into(),
                thought: String::new(),
                browsergym_send_msg_to_user: "hi".into(),
            }
            .into(),
            AgentRecallAction {
                query: "where is config".into(),
                thought: String::new(),
            }
            .into(),
            AgentFinishAction {
                outputs: outputs.clone(),
                thought: "done".into(),
            }
            .into(),
            AgentRejectAction {
                outputs: Map::new(),
                thought: "cannot".into(),
            }
            .into(),
            AgentDelegateAction {
                agent: "browser".into(),
                inputs: outputs,
                thought: String::new(),
            }
            .into(),
            AgentSummarizeAction {
                summarized_actions: "I listed files.".into(),
                summarized_observations: "The agent saw two files.".into(),
                last_summarized_event_id: Some(11),
            }
            .into(),
            AddTaskAction {
                parent: "0".into(),
                goal: "write tests".into(),
                subtasks: vec![json!("unit")],
                thought: String::new(),
            }
            .into(),
            ModifyTaskAction {
                task_id: "0.1".into(),
                state: "completed".into(),
                thought: String::new(),
            }
            .into(),
            ChangeAgentStateAction::new(AgentState::Paused).into(),
            NullAction {}.into(),
            RegenerateAction {}.into(),
        ]
    }

    fn every_observation() -> Vec<Observation> {
        vec![
            CmdOutputObservation {
                content: "total 0".into(),
                command_id: 3,
                command: "ls".into(),
                exit_code: 0,
            }
            .into(),
            IPythonRunCellObservation {
                content: "1".into(),
                code: "print(1)".into(),
            }
            .into(),
            FileReadObservation {
                content: "fn main() {}".into(),
                path: "main.rs".into(),
            }
            .into(),
            FileWriteObservation {
                content: String::new(),
                path: "notes.txt".into(),
            }
            .into(),
            BrowserObservation {
                content: "Example Domain".into(),
                url: "https://example.com".into(),
                screenshot: "data:image/png;base64,AAAA".into(),
                open_pages_urls: vec!["https://example.com".into()],
                active_page_index: 0,
                axtree_txt: "[1] RootWebArea 'Example'".into(),
                focused_element_bid: "1".into(),
                last_browser_action: "goto(\"https://example.com\")".into(),
                last_browser_action_error: String::new(),
                error: false,
            }
            .into(),
            ErrorObservation::new(ErrorId::Timeout, "timed out").into(),
            AgentStateChangedObservation {
                content: String::new(),
                agent_state: AgentState::Running,
            }
            .into(),
            AgentDelegateObservation {
                content: "delegate finished".into(),
                outputs: Map::new(),
            }
            .into(),
            UserRejectObservation {
                content: "rejected".into(),
            }
            .into(),
            NullObservation {
                content: String::new(),
            }
            .into(),
        ]
    }

    #[test]
    fn every_variant_roundtrips_through_the_wire_form() {
        let actions = every_action().into_iter().map(|a| {
            Event::action(a)
                .with_source(EventSource::Agent)
                .with_risk(SecurityRisk::Medium)
        });
        let observations = every_observation().into_iter().map(|o| {
            Event::observation(o)
                .with_source(EventSource::Environment)
                .with_cause(4)
        });
        for (index, mut event) in actions.chain(observations).enumerate() {
            event.id = Some(index as EventId);
            let value = event.to_value().unwrap();
            let back = Event::from_value(value).unwrap();
            assert_eq!(back, event);
        }
    }

    #[test]
    fn action_record_has_expected_shape() {
        let mut event = Event::action(CmdRunAction::new("echo hi")).with_source(EventSource::Agent);
        event.id = Some(5);
        let value = event.to_value().unwrap();
        assert_eq!(value["id"], 5);
        assert_eq!(value["source"], "agent");
        assert_eq!(value["action"], "run");
        assert_eq!(value["args"]["command"], "echo hi");
        assert_eq!(value["args"]["security_risk"], "unknown");
        assert_eq!(value["args"]["confirmation_state"], "confirmed");
        assert_eq!(value["message"], "Running command: echo hi");
        assert!(value.get("observation").is_none());
        assert!(value.get("cause").is_none());
    }

    #[test]
    fn risk_and_confirmation_are_written_as_names() {
        let event = Event::action(CmdRunAction::new("rm -rf build"))
            .with_risk(SecurityRisk::High)
            .with_confirmation(ConfirmationStatus::AwaitingConfirmation);
        let value = event.to_value().unwrap();
        assert_eq!(value["args"]["security_risk"], "high");
        assert_eq!(value["args"]["confirmation_state"], "awaiting_confirmation");
        assert_eq!(Event::from_value(value).unwrap(), event);
    }

    #[test]
    fn observation_record_lifts_content_out_of_extras() {
        let event = Event::observation(CmdOutputObservation::new("hi", "echo hi", 0)).with_cause(2);
        let value = event.to_value().unwrap();
        assert_eq!(value["observation"], "run");
        assert_eq!(value["content"], "hi");
        assert_eq!(value["extras"]["exit_code"], 0);
        assert!(value["extras"].get("content").is_none());
        assert_eq!(value["cause"], 2);
    }

    #[test]
    fn unknown_top_level_keys_are_ignored() {
        let value = json!({
            "id": 1,
            "timestamp": "2024-05-01T10:00:00Z",
            "source": "user",
            "message": "ignored",
            "action": "message",
            "args": {"content": "hi"},
            "ui_hint": {"color": "blue"}
        });
        let event = Event::from_value(value).unwrap();
        assert_eq!(
            event.as_action(),
            Some(&Action::Message(MessageAction::new("hi")))
        );
    }

    #[test]
    fn missing_and_unknown_tags_are_rejected() {
        let missing = Event::from_value(json!({"source": "user", "args": {}}));
        assert_eq!(missing, Err(MalformedEventError::MissingTag));

        let unknown = Event::from_value(json!({"action": "teleport", "args": {}}));
        assert!(matches!(
            unknown,
            Err(MalformedEventError::UnknownTag { family: "action", .. })
        ));

        let unknown_obs = Event::from_value(json!({"observation": "smell", "content": ""}));
        assert!(matches!(
            unknown_obs,
            Err(MalformedEventError::UnknownTag { family: "observation", .. })
        ));
    }

    #[test]
    fn missing_required_args_are_rejected() {
        let result = Event::from_value(json!({"action": "run", "args": {"thought": "no command"}}));
        assert!(matches!(result, Err(MalformedEventError::BadArgs { ref tag, .. }) if tag == "run"));

        let wrong_type = Event::from_value(json!({"action": "kill", "args": {"command_id": "seven"}}));
        assert!(matches!(wrong_type, Err(MalformedEventError::BadArgs { .. })));
    }

    #[test]
    fn non_object_records_are_rejected() {
        assert_eq!(
            Event::from_value(json!(["action", "run"])),
            Err(MalformedEventError::NotAnObject)
        );
    }

    #[test]
    fn event_serde_goes_through_record() {
        let event = Event::action(MessageAction::new("hello")).with_source(EventSource::User);
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
