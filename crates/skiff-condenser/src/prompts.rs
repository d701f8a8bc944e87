use serde_json::Value;
use skiff_protocol::{Action, AgentSummarizeAction, ChatMessage, Role};

use crate::CondenseError;

pub const WORD_LIMIT: usize = 200;

pub const SUMMARY_PROMPT_SYSTEM: &str = r#"Your job is to summarize a history of previous messages in a conversation between an AI persona and a human. The conversation you are given is from a fixed context window and may not be complete. Keep your summary under 200 words; do NOT exceed this word limit.
Only output the summary, do NOT include anything else in your output.
Given the following actions and observations, create a JSON response like this:
{
    "action": "summarize",
    "args": {
        "summarized_actions": "A precise sentence summarizing all the provided actions, written in the first person.",
        "summarized_observations": "A few precise sentences summarizing all the provided observations, written in the third person."
    }
}
Make sure to include in observations any relevant information that the agent needs to remember."#;

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// One `role: content` line per message.
pub fn format_history(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|message| format!("{}: {}", role_name(message.role), message.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Reads a summary from a model reply: a JSON summarize action, possibly
/// inside a code fence, or plain `Action: ... Observation: ...` text.
pub fn parse_summary_response(response: &str) -> Result<AgentSummarizeAction, CondenseError> {
    if let Some(value) = extract_json(response) {
        return match serde_json::from_value::<Action>(value) {
            Ok(Action::AgentSummarize(summary)) => Ok(summary),
            Ok(other) => Err(CondenseError::InvalidSummaryResponse(format!(
                "expected a summarize action, got `{}`",
                other.tag()
            ))),
            Err(err) => Err(CondenseError::InvalidSummaryResponse(format!(
                "failed to parse the response: {err}"
            ))),
        };
    }
    parse_labelled(response).ok_or_else(|| {
        CondenseError::InvalidSummaryResponse(
            "response is neither a JSON summary nor Action/Observation text".to_owned(),
        )
    })
}

fn extract_json(response: &str) -> Option<Value> {
    let trimmed = response.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str(&trimmed[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

fn parse_labelled(response: &str) -> Option<AgentSummarizeAction> {
    let text = response.replace("**", "");
    let action_start = text.find("Action:")? + "Action:".len();
    let observation_at = action_start + text[action_start..].find("Observation:")?;
    let actions = text[action_start..observation_at].trim();
    let observations = text[observation_at + "Observation:".len()..].trim();
    if actions.is_empty() || observations.is_empty() {
        return None;
    }
    Some(AgentSummarizeAction {
        summarized_actions: actions.to_owned(),
        summarized_observations: observations.to_owned(),
        last_summarized_event_id: None,
    })
}

/// The synthetic assistant message carrying an earlier partial summary.
pub fn summary_message(summary: &AgentSummarizeAction) -> ChatMessage {
    ChatMessage::assistant(format!(
        "Summary of all Action and Observations till now. \nAction: {}\nObservation: {}",
        summary.summarized_actions, summary.summarized_observations
    ))
}
