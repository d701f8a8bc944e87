//! The history view an agent steps on, and its rendering for the condenser.

use skiff_condenser::summary_message;
use skiff_events::{EventFilter, EventStream};
use skiff_protocol::{Action, ChatMessage, Event, EventSource, Observation, State};

/// Bookkeeping events that never reach the agent.
fn is_visible(event: &Event) -> bool {
    if let Some(action) = event.as_action() {
        return !matches!(action, Action::ChangeAgentState(_));
    }
    !matches!(event.as_observation(), Some(Observation::AgentStateChanged(_)))
}

/// Events of the frame's window: from its start (or condensation cutoff) on.
pub(crate) fn load_history(stream: &EventStream, state: &State) -> Vec<Event> {
    stream
        .get_events(state.view_start(), None, &EventFilter::default().exclude_null())
        .filter(is_visible)
        .collect()
}

/// Every history event as a condensable chat message tied to its id.
pub(crate) fn to_messages(history: &[Event]) -> Vec<ChatMessage> {
    history
        .iter()
        .filter_map(|event| {
            let id = event.id?;
            let message = match (event.as_action(), event.as_observation()) {
                (Some(Action::AgentSummarize(summary)), _) => summary_message(summary),
                (Some(action), _) if event.source == EventSource::Agent => {
                    ChatMessage::assistant(action.describe())
                }
                (Some(action), _) => ChatMessage::user(action.describe()),
                (None, Some(observation)) if observation.content().is_empty() => {
                    ChatMessage::user(observation.describe())
                }
                (None, Some(observation)) => ChatMessage::user(observation.content()),
                (None, None) => return None,
            };
            Some(message.condensable(id))
        })
        .collect()
}
