use async_trait::async_trait;
use serde_json::{Map, Value, json};
use skiff_protocol::{
    Action, Agent, AgentFinishAction, CmdRunAction, EventSource, KernelResult, MessageAction,
    Observation, State, StepOutcome,
};

/// Runs the latest user message as a shell command and finishes with its
/// output. Enough to drive a session end to end without a model.
#[derive(Debug, Default)]
pub struct ShellAgent;

#[async_trait]
impl Agent for ShellAgent {
    fn name(&self) -> &str {
        "shell"
    }

    async fn step(&self, state: &State) -> KernelResult<StepOutcome> {
        for event in state.history.iter().rev() {
            if let Some(Observation::CmdOutput(output)) = event.as_observation() {
                let mut outputs = Map::new();
                outputs.insert("command".to_owned(), json!(output.command));
                outputs.insert("exit_code".to_owned(), json!(output.exit_code));
                outputs.insert("output".to_owned(), Value::String(output.content.clone()));
                return Ok(StepOutcome::new(AgentFinishAction {
                    outputs,
                    thought: format!("`{}` exited with {}", output.command, output.exit_code),
                }));
            }
            if event.source == EventSource::User
                && let Some(Action::Message(message)) = event.as_action()
            {
                let command = message.content.trim();
                if command.is_empty() {
                    break;
                }
                return Ok(StepOutcome::new(CmdRunAction::new(command)));
            }
        }
        Ok(StepOutcome::new(MessageAction {
            wait_for_response: true,
            ..MessageAction::new("Send a shell command to run.")
        }))
    }
}
