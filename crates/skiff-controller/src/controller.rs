use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use skiff_condenser::Condenser;
use skiff_events::{EventCallback, EventStream, SubscriberKind};
use skiff_policy::SecurityAnalyzer;
use skiff_protocol::{
    Action, Agent, AgentDelegateAction, AgentDelegateObservation, AgentState, ConfirmationStatus,
    ErrorId, Event, EventId, EventPayload, EventSource, KernelError, Observation, PlanError,
    SecurityRisk, SessionId, State, StateStore, StatusMessage, UserRejectObservation,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::history::{load_history, to_messages};
use crate::{ControllerConfig, STATUS_AGENT_ERROR, StatusCallback};

const REJECTED_BY_USER: &str = "The user rejected this action.";

/// One level of the controller stack: an agent and the state it steps on.
struct Frame {
    agent: Arc<dyn Agent>,
    state: State,
    /// Delegate action that opened the frame; `None` for the root.
    opened_by: Option<EventId>,
}

struct PendingAction {
    id: EventId,
    deadline: Instant,
}

/// A risky action held back until the user answers.
struct GatedAction {
    id: EventId,
    action: Action,
    risk: SecurityRisk,
}

enum DelegateEnd {
    Finished(Map<String, Value>),
    Rejected(Map<String, Value>),
    Exhausted(u64),
}

/// Forwards stream events into the controller loop.
struct Inbox(mpsc::UnboundedSender<Event>);

#[async_trait]
impl EventCallback for Inbox {
    async fn on_event(&self, event: Event) -> Result<()> {
        self.0
            .send(event)
            .map_err(|_| anyhow!("controller loop is no longer receiving events"))
    }
}

pub struct AgentControllerBuilder {
    agent: Arc<dyn Agent>,
    stream: EventStream,
    config: ControllerConfig,
    analyzer: Option<Arc<dyn SecurityAnalyzer>>,
    condenser: Option<Arc<Condenser>>,
    state_store: Option<Arc<dyn StateStore>>,
    delegates: HashMap<String, Arc<dyn Agent>>,
    restored: Option<State>,
    on_status: Option<StatusCallback>,
}

impl AgentControllerBuilder {
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn security_analyzer(mut self, analyzer: Arc<dyn SecurityAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn condenser(mut self, condenser: Arc<Condenser>) -> Self {
        self.condenser = Some(condenser);
        self
    }

    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Makes `agent` available to `delegate` actions under `name`.
    pub fn delegate(mut self, name: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        self.delegates.insert(name.into(), agent);
        self
    }

    /// Continues from a persisted state instead of a fresh one.
    pub fn resume_from(mut self, state: State) -> Self {
        self.restored = Some(state);
        self
    }

    pub fn on_status(mut self, callback: StatusCallback) -> Self {
        self.on_status = Some(callback);
        self
    }

    /// Subscribes the controller to its stream. Must be called inside a tokio
    /// runtime; events added after this call are seen by the loop.
    pub fn build(self) -> AgentController {
        let session_id = self.stream.session_id().clone();
        let mut state = match self.restored {
            Some(mut state) => {
                state.agent_state = match state.agent_state {
                    kept @ (AgentState::Running
                    | AgentState::Paused
                    | AgentState::AwaitingUserInput) => kept,
                    _ => AgentState::Loading,
                };
                state.history.clear();
                state
            }
            None => State::new(session_id.clone(), 0, None),
        };
        state.max_iterations = self.config.max_iterations;
        state.max_budget_per_task = self.config.max_budget_per_task;

        let (sender, inbox) = mpsc::unbounded_channel();
        self.stream.subscribe(
            SubscriberKind::AgentController,
            session_id.as_str(),
            Arc::new(Inbox(sender)),
        );
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (state_tx, _) = watch::channel(state.agent_state);

        AgentController {
            session_id,
            stream: self.stream,
            config: self.config,
            root: Frame {
                agent: self.agent,
                state,
                opened_by: None,
            },
            stack: Vec::new(),
            delegates: self.delegates,
            analyzer: self.analyzer,
            condenser: self.condenser,
            state_store: self.state_store,
            on_status: self.on_status,
            inbox,
            shutdown,
            shutdown_tx: Arc::new(shutdown_tx),
            agent_state: state_tx,
            pending: None,
            gated: None,
            oversized_warned: false,
        }
    }
}

/// Drives one session's agent against its event stream.
///
/// Runs as a single task: events from the stream and agent steps are handled
/// strictly one after another.
pub struct AgentController {
    session_id: SessionId,
    stream: EventStream,
    config: ControllerConfig,
    root: Frame,
    stack: Vec<Frame>,
    delegates: HashMap<String, Arc<dyn Agent>>,
    analyzer: Option<Arc<dyn SecurityAnalyzer>>,
    condenser: Option<Arc<Condenser>>,
    state_store: Option<Arc<dyn StateStore>>,
    on_status: Option<StatusCallback>,
    inbox: mpsc::UnboundedReceiver<Event>,
    shutdown: watch::Receiver<bool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    agent_state: watch::Sender<AgentState>,
    pending: Option<PendingAction>,
    gated: Option<GatedAction>,
    /// Set once an over-threshold history could not be shortened.
    oversized_warned: bool,
}

impl AgentController {
    pub fn builder(agent: Arc<dyn Agent>, stream: EventStream) -> AgentControllerBuilder {
        AgentControllerBuilder {
            agent,
            stream,
            config: ControllerConfig::default(),
            analyzer: None,
            condenser: None,
            state_store: None,
            delegates: HashMap::new(),
            restored: None,
            on_status: None,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn agent_state(&self) -> AgentState {
        self.root.state.agent_state
    }

    pub fn spawn(self) -> ControllerHandle {
        let session_id = self.session_id.clone();
        let shutdown = self.shutdown_tx.clone();
        let state = self.agent_state.subscribe();
        let task = tokio::spawn(self.run());
        ControllerHandle {
            session_id,
            shutdown,
            state,
            task: Mutex::new(Some(task)),
        }
    }

    /// Runs until the state is `error`, `stopped`, or one of `exit_on`, the
    /// stream closes, or shutdown is requested. Returns the root state.
    #[instrument(skip(self), fields(session_id = %self.session_id, agent = self.root.agent.name()))]
    pub async fn run(mut self) -> State {
        info!(state = %self.agent_state(), "controller started");
        if self.agent_state() == AgentState::Loading {
            self.set_agent_state(AgentState::Init).await;
        }

        loop {
            while let Ok(event) = self.inbox.try_recv() {
                self.on_event(event).await;
            }
            if self.config.ends_run(self.agent_state()) {
                break;
            }
            let stopping = *self.shutdown.borrow();
            if stopping {
                self.set_agent_state(AgentState::Stopped).await;
                break;
            }
            if self.agent_state() == AgentState::Running && self.pending.is_none() {
                self.step().await;
                continue;
            }

            let deadline = self.pending.as_ref().map(|pending| pending.deadline);
            tokio::select! {
                _ = self.shutdown.changed() => {}
                received = self.inbox.recv() => match received {
                    Some(event) => self.on_event(event).await,
                    None => {
                        warn!("event stream closed; controller exiting");
                        break;
                    }
                },
                _ = sleep_until(deadline) => self.expire_pending().await,
            }
        }

        self.save().await;
        self.finish()
    }

    fn finish(mut self) -> State {
        while let Some(frame) = self.stack.pop() {
            self.fold_into_parent(&frame);
        }
        self.stream
            .unsubscribe(SubscriberKind::AgentController, self.session_id.as_str());
        let mut state = self.root.state;
        state.history.clear();
        info!(
            state = %state.agent_state,
            iteration = state.iteration,
            cost_usd = state.metrics.accumulated_cost,
            "controller stopped"
        );
        state
    }

    fn top(&self) -> &Frame {
        self.stack.last().unwrap_or(&self.root)
    }

    fn top_mut(&mut self) -> &mut Frame {
        self.stack.last_mut().unwrap_or(&mut self.root)
    }

    /// Root state with the live iteration count and the cost of open delegates.
    fn snapshot(&self) -> State {
        let mut state = self.root.state.clone();
        state.iteration = self.top().state.iteration;
        for frame in &self.stack {
            state.metrics.merge(&frame.state.metrics);
        }
        state
    }

    fn fold_into_parent(&mut self, child: &Frame) {
        let parent = self.top_mut();
        parent.state.iteration = child.state.iteration;
        parent.state.metrics.merge(&child.state.metrics);
    }

    fn observe(
        &self,
        observation: impl Into<Observation>,
        cause: Option<EventId>,
        source: EventSource,
    ) -> EventId {
        let mut event = Event::observation(observation);
        if let Some(cause) = cause {
            event = event.with_cause(cause);
        }
        self.stream.add_event(event, source)
    }

    fn publish(&self, action: impl Into<Action>) -> EventId {
        self.stream
            .add_event(Event::action(action), EventSource::Agent)
    }

    async fn on_event(&mut self, event: Event) {
        match &event.payload {
            EventPayload::Action(payload) => {
                // Actions the controller published itself come back here too.
                if event.source == EventSource::Agent {
                    return;
                }
                match &payload.action {
                    Action::Message(_) if event.source == EventSource::User => {
                        self.on_user_message().await;
                    }
                    Action::ChangeAgentState(change) => {
                        self.on_state_request(change.agent_state).await;
                    }
                    _ => {}
                }
            }
            EventPayload::Observation(observation) => {
                if let Some(pending) = &self.pending
                    && event.cause == Some(pending.id)
                {
                    debug!(action_id = pending.id, observation = observation.tag(), "pending action observed");
                    self.pending = None;
                }
                if let Observation::Error(failure) = observation
                    && failure.is_fatal()
                {
                    self.fail(failure.content.clone()).await;
                }
            }
        }
    }

    async fn on_user_message(&mut self) {
        match self.agent_state() {
            AgentState::Init
            | AgentState::AwaitingUserInput
            | AgentState::Paused
            | AgentState::Finished
            | AgentState::Rejected => self.set_agent_state(AgentState::Running).await,
            _ => {}
        }
    }

    async fn on_state_request(&mut self, requested: AgentState) {
        match requested {
            AgentState::UserConfirmed | AgentState::UserRejected => {
                if self.agent_state() != AgentState::AwaitingUserConfirmation {
                    warn!(%requested, state = %self.agent_state(), "no action awaits confirmation");
                    return;
                }
                let Some(gated) = self.gated.take() else {
                    return;
                };
                if requested == AgentState::UserConfirmed {
                    self.release(gated).await;
                } else {
                    self.reject(gated).await;
                }
            }
            AgentState::Running => {
                let target = if self.gated.is_some() {
                    AgentState::AwaitingUserConfirmation
                } else {
                    AgentState::Running
                };
                self.set_agent_state(target).await;
            }
            AgentState::Paused | AgentState::Stopped => self.set_agent_state(requested).await,
            other => warn!(requested = %other, "state cannot be requested"),
        }
    }

    async fn release(&mut self, gated: GatedAction) {
        let event = Event::action(gated.action)
            .with_risk(gated.risk)
            .with_cause(gated.id);
        let id = self.stream.add_event(event, EventSource::Agent);
        info!(action_id = id, confirmed = gated.id, "user confirmed action");
        self.track(id);
        self.set_agent_state(AgentState::Running).await;
    }

    async fn reject(&mut self, gated: GatedAction) {
        info!(action_id = gated.id, "user rejected action");
        self.observe(
            UserRejectObservation {
                content: REJECTED_BY_USER.to_owned(),
            },
            Some(gated.id),
            EventSource::User,
        );
        self.set_agent_state(AgentState::Running).await;
    }

    fn track(&mut self, id: EventId) {
        self.pending = Some(PendingAction {
            id,
            deadline: Instant::now() + self.config.pending_action_timeout(),
        });
    }

    async fn expire_pending(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let limit = self.config.pending_action_timeout();
        warn!(action_id = pending.id, ?limit, "no observation before timeout");
        self.observe(
            Observation::error(
                ErrorId::Timeout,
                format!("No observation arrived within {limit:?}; the action may still be running."),
            ),
            Some(pending.id),
            EventSource::Environment,
        );
    }

    async fn set_agent_state(&mut self, new: AgentState) {
        let old = self.root.state.agent_state;
        if old == new {
            return;
        }
        self.root.state.agent_state = new;
        if matches!(new, AgentState::Stopped | AgentState::Error) {
            self.pending = None;
            self.gated = None;
            self.reset_agents().await;
        }
        info!(from = %old, to = %new, "agent state changed");
        self.observe(
            Observation::state_changed(new),
            None,
            EventSource::Environment,
        );
        self.agent_state.send_replace(new);
        self.save().await;
    }

    async fn fail(&mut self, reason: String) {
        if self.agent_state() == AgentState::Error {
            return;
        }
        error!(%reason, "agent loop failed");
        self.root.state.last_error = Some(reason.clone());
        if let Some(on_status) = &self.on_status {
            on_status(StatusMessage::error(STATUS_AGENT_ERROR, reason));
        }
        self.set_agent_state(AgentState::Error).await;
    }

    async fn reset_agents(&self) {
        let agents: Vec<Arc<dyn Agent>> = std::iter::once(&self.root)
            .chain(&self.stack)
            .map(|frame| frame.agent.clone())
            .collect();
        for agent in agents {
            agent.reset().await;
        }
    }

    async fn save(&self) {
        let Some(store) = &self.state_store else {
            return;
        };
        if let Err(err) = store.save(&self.snapshot()).await {
            warn!(error = %err, "failed saving controller state");
        }
    }

    #[instrument(skip(self), fields(depth = self.stack.len()))]
    async fn step(&mut self) {
        if let Some(reason) = self.snapshot().budget_exhausted() {
            self.fail(reason).await;
            return;
        }
        if !self.stack.is_empty()
            && let Some(max) = self.config.max_delegate_iterations
            && self.top().state.local_iteration >= max
        {
            self.end_delegate(DelegateEnd::Exhausted(max)).await;
            return;
        }

        self.refresh_history().await;
        let agent = self.top().agent.clone();
        let outcome = agent.step(&self.top().state).await;

        let frame = self.top_mut();
        frame.state.history.clear();
        frame.state.iteration += 1;
        frame.state.local_iteration += 1;
        let iteration = frame.state.iteration;
        match outcome {
            Ok(outcome) => {
                frame.state.metrics.add_cost(outcome.cost_usd);
                debug!(
                    iteration,
                    action = outcome.action.tag(),
                    cost_usd = outcome.cost_usd,
                    "agent stepped"
                );
                self.dispatch(outcome.action).await;
            }
            Err(err) if err.is_recoverable() => {
                warn!(iteration, error = %err, "agent step failed; reporting it to the agent");
                let error_id = match &err {
                    KernelError::Llm(_) => ErrorId::AgentError,
                    _ => ErrorId::MalformedAction,
                };
                self.observe(
                    Observation::error(error_id, err.to_string()),
                    None,
                    EventSource::Environment,
                );
            }
            Err(err) => self.fail(err.to_string()).await,
        }
    }

    async fn refresh_history(&mut self) {
        let history = load_history(&self.stream, &self.top().state);
        let history = self.condense_if_needed(history).await;
        self.top_mut().state.history = history;
    }

    /// Replaces an oversized history with a summary, or drops its oldest half
    /// when summarizing fails.
    async fn condense_if_needed(&mut self, history: Vec<Event>) -> Vec<Event> {
        let (Some(condenser), Some(threshold)) =
            (self.condenser.clone(), self.config.condense_threshold_tokens)
        else {
            return history;
        };
        let messages = to_messages(&history);
        let tokens = condenser.count_tokens(&messages);
        if tokens <= threshold {
            self.oversized_warned = false;
            return history;
        }

        let truncation_id = match condenser.condense(&messages).await {
            Ok(condensation) => {
                let cost_usd = condensation.cost_usd;
                let summary = condensation.summary;
                match summary.last_summarized_event_id {
                    Some(cutoff) => {
                        self.top_mut().state.metrics.add_cost(cost_usd);
                        let summary_id = self.publish(summary);
                        info!(tokens, cutoff, summary_id, "history condensed");
                        Some(cutoff + 1)
                    }
                    None => oldest_half_cutoff(&history),
                }
            }
            Err(err) => {
                warn!(tokens, error = %err, "condensation failed; dropping oldest half of history");
                oldest_half_cutoff(&history)
            }
        };
        let Some(truncation_id) = truncation_id else {
            if !self.oversized_warned {
                self.oversized_warned = true;
                warn!(
                    tokens,
                    threshold,
                    events = history.len(),
                    "history over the condensation threshold but nothing can be dropped"
                );
            }
            return history;
        };
        self.top_mut().state.truncation_id = Some(truncation_id);
        load_history(&self.stream, &self.top().state)
    }

    async fn dispatch(&mut self, action: Action) {
        if action.is_runnable() {
            self.submit(action).await;
            return;
        }
        match action {
            Action::AgentDelegate(delegate) => self.start_delegate(delegate).await,
            Action::AgentFinish(finish) => {
                let outputs = finish.outputs.clone();
                self.publish(finish);
                if self.stack.is_empty() {
                    self.root.state.outputs = outputs;
                    self.set_agent_state(AgentState::Finished).await;
                } else {
                    self.end_delegate(DelegateEnd::Finished(outputs)).await;
                }
            }
            Action::AgentReject(reject) => {
                let outputs = reject.outputs.clone();
                self.publish(reject);
                if self.stack.is_empty() {
                    self.root.state.outputs = outputs;
                    self.set_agent_state(AgentState::Rejected).await;
                } else {
                    self.end_delegate(DelegateEnd::Rejected(outputs)).await;
                }
            }
            Action::Message(message) => {
                let wait = message.wait_for_response;
                self.publish(message);
                if wait {
                    self.set_agent_state(AgentState::AwaitingUserInput).await;
                }
            }
            Action::AddTask(task) => {
                let id = self.publish(task.clone());
                let result = self
                    .top_mut()
                    .state
                    .plan
                    .add_task(&task.parent, &task.goal, &task.subtasks)
                    .map(|task_id| debug!(%task_id, "task added"));
                self.report_plan(id, result);
            }
            Action::ModifyTask(task) => {
                let id = self.publish(task.clone());
                let result = self
                    .top_mut()
                    .state
                    .plan
                    .set_state(&task.task_id, &task.state);
                self.report_plan(id, result);
            }
            Action::ChangeAgentState(change) => {
                let requested = change.agent_state;
                self.publish(change);
                self.on_state_request(requested).await;
            }
            other => {
                self.publish(other);
            }
        }
    }

    fn report_plan(&self, id: EventId, result: Result<(), PlanError>) {
        if let Err(err) = result {
            warn!(action_id = id, error = %err, "invalid task update");
            self.observe(
                Observation::error(ErrorId::InvalidTask, err.to_string()),
                Some(id),
                EventSource::Environment,
            );
        }
    }

    /// Publishes a runnable action, holding it for confirmation when its
    /// risk reaches the threshold in confirmation mode.
    async fn submit(&mut self, action: Action) {
        let risk = match &self.analyzer {
            Some(analyzer) => analyzer.analyze(&self.session_id, &action).await,
            None => SecurityRisk::Unknown,
        };

        if self.config.confirmation_mode && risk >= self.config.confirmation_threshold {
            let event = Event::action(action.clone())
                .with_risk(risk)
                .with_confirmation(ConfirmationStatus::AwaitingConfirmation);
            let id = self.stream.add_event(event, EventSource::Agent);
            info!(action_id = id, ?risk, "action awaits user confirmation");
            self.gated = Some(GatedAction { id, action, risk });
            self.set_agent_state(AgentState::AwaitingUserConfirmation)
                .await;
            return;
        }

        let id = self
            .stream
            .add_event(Event::action(action).with_risk(risk), EventSource::Agent);
        self.track(id);
    }

    async fn start_delegate(&mut self, delegate: AgentDelegateAction) {
        let id = self.publish(delegate.clone());
        let Some(agent) = self.delegates.get(&delegate.agent).cloned() else {
            warn!(agent = %delegate.agent, "delegate agent is not registered");
            self.observe(
                Observation::error(
                    ErrorId::AgentError,
                    format!("No agent is registered under the name `{}`", delegate.agent),
                ),
                Some(id),
                EventSource::Environment,
            );
            return;
        };
        agent.reset().await;
        let state = self
            .top()
            .state
            .for_delegate(delegate.inputs, self.stream.next_id());
        info!(agent = %delegate.agent, level = state.delegate_level, "delegate started");
        self.stack.push(Frame {
            agent,
            state,
            opened_by: Some(id),
        });
    }

    async fn end_delegate(&mut self, end: DelegateEnd) {
        let Some(child) = self.stack.pop() else {
            return;
        };
        self.fold_into_parent(&child);
        let name = child.agent.name().to_owned();
        let (content, outputs) = match end {
            DelegateEnd::Finished(outputs) => {
                (format!("{name} finished the delegated task."), outputs)
            }
            DelegateEnd::Rejected(outputs) => {
                (format!("{name} rejected the delegated task."), outputs)
            }
            DelegateEnd::Exhausted(max) => (
                format!("{name} stopped after reaching its limit of {max} iterations."),
                Map::new(),
            ),
        };
        info!(agent = %name, iteration = child.state.iteration, "delegate ended");
        self.observe(
            AgentDelegateObservation { content, outputs },
            child.opened_by,
            EventSource::Agent,
        );
    }
}

fn oldest_half_cutoff(history: &[Event]) -> Option<EventId> {
    if history.len() < 2 {
        return None;
    }
    history.get(history.len() / 2).and_then(|event| event.id)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Control surface of a spawned [`AgentController`].
pub struct ControllerHandle {
    session_id: SessionId,
    shutdown: Arc<watch::Sender<bool>>,
    state: watch::Receiver<AgentState>,
    task: Mutex<Option<JoinHandle<State>>>,
}

impl ControllerHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn agent_state(&self) -> AgentState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<AgentState> {
        self.state.clone()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Waits until the controller reports `wanted`.
    pub async fn wait_for_state(&self, wanted: AgentState, limit: Duration) -> Result<()> {
        let mut state = self.state.clone();
        tokio::time::timeout(limit, async move {
            state.wait_for(|current| *current == wanted).await.map(|_| ())
        })
        .await
        .with_context(|| format!("timed out waiting for agent state {wanted}"))?
        .with_context(|| format!("controller stopped before reaching {wanted}"))
    }

    /// Waits for the loop to end on its own and returns its final state.
    pub async fn join(&self) -> Result<State> {
        let task = self.task.lock().take().context("controller was already joined")?;
        task.await.context("controller task failed")
    }

    /// Asks the loop to stop and waits up to `grace` for it; aborts it after.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn stop(&self, grace: Duration) -> Option<State> {
        self.shutdown.send_replace(true);
        let task = self.task.lock().take()?;
        let abort = task.abort_handle();
        match tokio::time::timeout(grace, task).await {
            Ok(Ok(state)) => Some(state),
            Ok(Err(err)) => {
                warn!(error = %err, "controller task failed while stopping");
                None
            }
            Err(_) => {
                warn!(?grace, "controller did not stop in time; aborting");
                abort.abort();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skiff_condenser::CondenserConfig;
    use skiff_events::{EventFilter, callback_fn};
    use skiff_policy::{PatternSecurityAnalyzer, RiskPolicy};
    use skiff_protocol::{
        AddTaskAction, AgentFinishAction, ChangeAgentStateAction, ChatMessage,
        CmdOutputObservation, CmdRunAction,
        CompletionOptions, KernelResult, LlmPort, LlmResponse, MessageAction, ModifyTaskAction,
        StepOutcome, TaskState,
    };
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LIMIT: Duration = Duration::from_secs(10);

    struct ScriptedAgent {
        name: &'static str,
        script: Mutex<VecDeque<KernelResult<StepOutcome>>>,
        /// Returned once the script runs out.
        fallback: Action,
        steps: AtomicUsize,
        seen: Mutex<Vec<State>>,
    }

    impl ScriptedAgent {
        fn new(name: &'static str, actions: Vec<Action>) -> Arc<Self> {
            Self::with_results(name, actions.into_iter().map(|a| Ok(StepOutcome::new(a))).collect())
        }

        fn with_results(name: &'static str, results: Vec<KernelResult<StepOutcome>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                script: Mutex::new(results.into()),
                fallback: AgentFinishAction::default().into(),
                steps: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn repeating(name: &'static str, action: Action) -> Arc<Self> {
            Arc::new(Self {
                name,
                script: Mutex::new(VecDeque::new()),
                fallback: action,
                steps: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn steps(&self) -> usize {
            self.steps.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Agent for ScriptedAgent {
        fn name(&self) -> &str {
            self.name
        }

        async fn step(&self, state: &State) -> KernelResult<StepOutcome> {
            self.steps.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(state.clone());
            let next = self.script.lock().pop_front();
            next.unwrap_or_else(|| Ok(StepOutcome::new(self.fallback.clone())))
        }
    }

    /// Executes confirmed runnable actions by answering with a caused
    /// observation. Returns the number of executions.
    fn attach_runtime(stream: &EventStream, reply: fn(&Action) -> Observation) -> Arc<AtomicUsize> {
        let executed = Arc::new(AtomicUsize::new(0));
        let counter = executed.clone();
        let writer = stream.clone();
        stream.subscribe(
            SubscriberKind::Runtime,
            "fake",
            callback_fn(move |event: Event| {
                let counter = counter.clone();
                let writer = writer.clone();
                async move {
                    let Some(payload) = event.action_payload() else {
                        return Ok(());
                    };
                    if !payload.action.is_runnable()
                        || payload.confirmation != ConfirmationStatus::Confirmed
                    {
                        return Ok(());
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    let mut observation = Event::observation(reply(&payload.action));
                    if let Some(id) = event.id {
                        observation = observation.with_cause(id);
                    }
                    writer.add_event(observation, EventSource::Environment);
                    Ok(())
                }
            }),
        );
        executed
    }

    fn command_done(_action: &Action) -> Observation {
        CmdOutputObservation::new("done", "cmd", 0).into()
    }

    fn sandbox_lost(_action: &Action) -> Observation {
        Observation::error(ErrorId::SandboxUnavailable, "sandbox process exited")
    }

    fn headless(max_iterations: u64) -> ControllerConfig {
        ControllerConfig {
            max_iterations,
            pending_action_timeout_ms: 5_000,
            ..ControllerConfig::headless()
        }
    }

    fn events(stream: &EventStream) -> Vec<Event> {
        stream.get_events(0, None, &EventFilter::default()).collect()
    }

    fn state_changes(stream: &EventStream) -> Vec<AgentState> {
        events(stream)
            .iter()
            .filter_map(|event| match event.as_observation() {
                Some(Observation::AgentStateChanged(change)) => Some(change.agent_state),
                _ => None,
            })
            .collect()
    }

    fn user_says(stream: &EventStream, text: &str) {
        stream.add_event(Event::action(MessageAction::new(text)), EventSource::User);
    }

    async fn finish(handle: &ControllerHandle) -> Result<State> {
        tokio::time::timeout(LIMIT, handle.join())
            .await
            .context("controller did not finish")?
    }

    #[tokio::test]
    async fn iteration_limit_stops_after_exactly_that_many_steps() -> Result<()> {
        let stream = EventStream::new(SessionId::from_string("budget"));
        let agent = ScriptedAgent::repeating("looper", MessageAction::new("still working").into());
        let handle = AgentController::builder(agent.clone(), stream.clone())
            .config(headless(3))
            .build()
            .spawn();
        user_says(&stream, "count to infinity");

        let state = finish(&handle).await?;
        assert_eq!(agent.steps(), 3);
        assert_eq!(state.iteration, 3);
        assert_eq!(state.agent_state, AgentState::Error);
        assert!(
            state
                .last_error
                .as_deref()
                .is_some_and(|reason| reason.contains("maximum number of iterations (3)"))
        );
        assert_eq!(
            state_changes(&stream),
            vec![AgentState::Init, AgentState::Running, AgentState::Error]
        );
        Ok(())
    }

    #[tokio::test]
    async fn cost_budget_stops_the_loop() -> Result<()> {
        let stream = EventStream::new(SessionId::from_string("cost"));
        let results = (0..5)
            .map(|_| Ok(StepOutcome::new(MessageAction::new("pricey")).with_cost(0.4)))
            .collect();
        let agent = ScriptedAgent::with_results("spender", results);
        let config = ControllerConfig {
            max_budget_per_task: Some(1.0),
            ..headless(100)
        };
        let handle = AgentController::builder(agent.clone(), stream.clone())
            .config(config)
            .build()
            .spawn();
        user_says(&stream, "go");

        let state = finish(&handle).await?;
        assert_eq!(agent.steps(), 3);
        assert_eq!(state.agent_state, AgentState::Error);
        assert!(state.last_error.unwrap_or_default().contains("budget exceeded"));
        Ok(())
    }

    #[tokio::test]
    async fn runnable_actions_wait_for_their_observation() -> Result<()> {
        let stream = EventStream::new(SessionId::from_string("runnable"));
        let executed = attach_runtime(&stream, command_done);
        let agent = ScriptedAgent::new(
            "runner",
            vec![CmdRunAction::new("ls").into(), AgentFinishAction::default().into()],
        );
        let handle = AgentController::builder(agent.clone(), stream.clone())
            .config(headless(10))
            .build()
            .spawn();
        user_says(&stream, "list files");

        let state = finish(&handle).await?;
        assert_eq!(state.agent_state, AgentState::Finished);
        assert_eq!(executed.load(Ordering::SeqCst), 1);

        let seen = agent.seen.lock();
        let second = seen.get(1).context("agent stepped once")?;
        assert!(second.history.iter().any(|event| matches!(
            event.as_observation(),
            Some(Observation::CmdOutput(output)) if output.content == "done"
        )));
        Ok(())
    }

    #[tokio::test]
    async fn missing_observation_times_out() -> Result<()> {
        let stream = EventStream::new(SessionId::from_string("pending"));
        let agent = ScriptedAgent::new(
            "waiter",
            vec![CmdRunAction::new("sleep 100").into(), AgentFinishAction::default().into()],
        );
        let config = ControllerConfig {
            pending_action_timeout_ms: 50,
            ..headless(10)
        };
        let handle = AgentController::builder(agent, stream.clone())
            .config(config)
            .build()
            .spawn();
        user_says(&stream, "wait");

        let state = finish(&handle).await?;
        assert_eq!(state.agent_state, AgentState::Finished);
        let all = events(&stream);
        let run_id = all
            .iter()
            .find(|event| matches!(event.as_action(), Some(Action::CmdRun(_))))
            .and_then(|event| event.id);
        let timeout = all
            .iter()
            .find(|event| {
                matches!(event.as_observation(), Some(Observation::Error(e)) if e.error_id == ErrorId::Timeout)
            })
            .context("timeout observation")?;
        assert_eq!(timeout.cause, run_id);
        Ok(())
    }

    #[tokio::test]
    async fn risky_action_runs_only_after_approval() -> Result<()> {
        let stream = EventStream::new(SessionId::from_string("approve"));
        let executed = attach_runtime(&stream, command_done);
        let agent = ScriptedAgent::new(
            "cleaner",
            vec![
                CmdRunAction::new("rm -rf /tmp/build").into(),
                AgentFinishAction::default().into(),
            ],
        );
        let config = ControllerConfig {
            confirmation_mode: true,
            ..headless(10)
        };
        let handle = AgentController::builder(agent, stream.clone())
            .config(config)
            .security_analyzer(Arc::new(PatternSecurityAnalyzer::from_policy(
                &RiskPolicy::default(),
            )))
            .build()
            .spawn();
        user_says(&stream, "clean up");

        handle
            .wait_for_state(AgentState::AwaitingUserConfirmation, LIMIT)
            .await?;
        assert_eq!(executed.load(Ordering::SeqCst), 0);
        let gated = events(&stream)
            .into_iter()
            .find(|event| matches!(event.as_action(), Some(Action::CmdRun(_))))
            .context("gated action")?;
        let payload = gated.action_payload().context("action payload")?;
        assert_eq!(payload.security_risk, SecurityRisk::High);
        assert_eq!(payload.confirmation, ConfirmationStatus::AwaitingConfirmation);

        stream.add_event(
            Event::action(ChangeAgentStateAction::new(AgentState::UserConfirmed)),
            EventSource::User,
        );
        let state = finish(&handle).await?;
        assert_eq!(state.agent_state, AgentState::Finished);
        assert_eq!(executed.load(Ordering::SeqCst), 1);

        let released = events(&stream)
            .into_iter()
            .filter(|event| matches!(event.as_action(), Some(Action::CmdRun(_))))
            .nth(1)
            .context("released action")?;
        assert_eq!(released.cause, gated.id);
        assert_eq!(
            released.action_payload().map(|p| p.confirmation),
            Some(ConfirmationStatus::Confirmed)
        );
        Ok(())
    }

    #[tokio::test]
    async fn rejected_action_never_reaches_the_runtime() -> Result<()> {
        let stream = EventStream::new(SessionId::from_string("reject"));
        let executed = attach_runtime(&stream, command_done);
        let agent = ScriptedAgent::new(
            "cleaner",
            vec![
                CmdRunAction::new("rm -rf /").into(),
                AgentFinishAction::default().into(),
            ],
        );
        let config = ControllerConfig {
            confirmation_mode: true,
            ..headless(10)
        };
        let handle = AgentController::builder(agent.clone(), stream.clone())
            .config(config)
            .security_analyzer(Arc::new(PatternSecurityAnalyzer::from_policy(
                &RiskPolicy::default(),
            )))
            .build()
            .spawn();
        user_says(&stream, "clean everything");

        handle
            .wait_for_state(AgentState::AwaitingUserConfirmation, LIMIT)
            .await?;
        stream.add_event(
            Event::action(ChangeAgentStateAction::new(AgentState::UserRejected)),
            EventSource::User,
        );
        let state = finish(&handle).await?;

        assert_eq!(state.agent_state, AgentState::Finished);
        assert_eq!(executed.load(Ordering::SeqCst), 0);
        assert_eq!(
            state_changes(&stream),
            vec![
                AgentState::Init,
                AgentState::Running,
                AgentState::AwaitingUserConfirmation,
                AgentState::Running,
                AgentState::Finished,
            ]
        );
        let all = events(&stream);
        let gated_id = all
            .iter()
            .find(|event| matches!(event.as_action(), Some(Action::CmdRun(_))))
            .and_then(|event| event.id);
        let rejection = all
            .iter()
            .find(|event| matches!(event.as_observation(), Some(Observation::UserRejected(_))))
            .context("rejection observation")?;
        assert_eq!(rejection.cause, gated_id);
        assert_eq!(agent.steps(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn low_risk_actions_skip_confirmation() -> Result<()> {
        let stream = EventStream::new(SessionId::from_string("low-risk"));
        let executed = attach_runtime(&stream, command_done);
        let agent = ScriptedAgent::new(
            "lister",
            vec![CmdRunAction::new("ls -la").into(), AgentFinishAction::default().into()],
        );
        let config = ControllerConfig {
            confirmation_mode: true,
            ..headless(10)
        };
        let handle = AgentController::builder(agent, stream.clone())
            .config(config)
            .security_analyzer(Arc::new(PatternSecurityAnalyzer::from_policy(
                &RiskPolicy::default(),
            )))
            .build()
            .spawn();
        user_says(&stream, "look around");

        let state = finish(&handle).await?;
        assert_eq!(state.agent_state, AgentState::Finished);
        assert_eq!(executed.load(Ordering::SeqCst), 1);
        assert!(!state_changes(&stream).contains(&AgentState::AwaitingUserConfirmation));
        Ok(())
    }

    #[tokio::test]
    async fn delegate_shares_iterations_and_reports_back() -> Result<()> {
        let stream = EventStream::new(SessionId::from_string("delegate"));
        let mut inputs = Map::new();
        inputs.insert("task".into(), json!("count files"));
        let root = ScriptedAgent::new(
            "manager",
            vec![
                AgentDelegateAction {
                    agent: "counter".into(),
                    inputs,
                    thought: String::new(),
                }
                .into(),
                AgentFinishAction::default().into(),
            ],
        );
        let mut outputs = Map::new();
        outputs.insert("count".into(), json!(3));
        let helper = ScriptedAgent::new(
            "counter",
            vec![
                MessageAction::new("counting").into(),
                AgentFinishAction {
                    outputs,
                    thought: String::new(),
                }
                .into(),
            ],
        );
        let handle = AgentController::builder(root.clone(), stream.clone())
            .config(headless(20))
            .delegate("counter", helper.clone())
            .build()
            .spawn();
        user_says(&stream, "how many files?");

        let state = finish(&handle).await?;
        assert_eq!(state.agent_state, AgentState::Finished);
        assert_eq!(state.iteration, 4);
        assert_eq!(state.local_iteration, 2);
        assert_eq!(root.steps(), 2);
        assert_eq!(helper.steps(), 2);

        {
            let seen = helper.seen.lock();
            let last = seen.last().context("helper stepped")?;
            assert_eq!(last.delegate_level, 1);
            assert_eq!(last.iteration, 2);
            assert_eq!(last.local_iteration, 1);
            assert_eq!(last.inputs.get("task"), Some(&json!("count files")));
        }

        let all = events(&stream);
        let delegate_id = all
            .iter()
            .find(|event| matches!(event.as_action(), Some(Action::AgentDelegate(_))))
            .and_then(|event| event.id);
        let report = all
            .iter()
            .find_map(|event| match event.as_observation() {
                Some(Observation::AgentDelegate(report)) => Some((event.cause, report.clone())),
                _ => None,
            })
            .context("delegate observation")?;
        assert_eq!(report.0, delegate_id);
        assert_eq!(report.1.outputs.get("count"), Some(&json!(3)));
        Ok(())
    }

    #[tokio::test]
    async fn delegate_is_cut_off_at_its_own_limit() -> Result<()> {
        let stream = EventStream::new(SessionId::from_string("delegate-limit"));
        let root = ScriptedAgent::new(
            "manager",
            vec![
                AgentDelegateAction {
                    agent: "rambler".into(),
                    ..AgentDelegateAction::default()
                }
                .into(),
                AgentFinishAction::default().into(),
            ],
        );
        let helper = ScriptedAgent::repeating("rambler", MessageAction::new("more").into());
        let config = ControllerConfig {
            max_delegate_iterations: Some(2),
            ..headless(20)
        };
        let handle = AgentController::builder(root, stream.clone())
            .config(config)
            .delegate("rambler", helper.clone())
            .build()
            .spawn();
        user_says(&stream, "go");

        let state = finish(&handle).await?;
        assert_eq!(state.agent_state, AgentState::Finished);
        assert_eq!(helper.steps(), 2);
        assert_eq!(state.iteration, 4);
        let report = events(&stream)
            .into_iter()
            .find_map(|event| match event.as_observation() {
                Some(Observation::AgentDelegate(report)) => Some(report.content.clone()),
                _ => None,
            })
            .context("delegate observation")?;
        assert!(report.contains("limit of 2 iterations"));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_delegate_is_reported_to_the_agent() -> Result<()> {
        let stream = EventStream::new(SessionId::from_string("no-delegate"));
        let root = ScriptedAgent::new(
            "manager",
            vec![AgentDelegateAction {
                agent: "ghost".into(),
                ..AgentDelegateAction::default()
            }
            .into()],
        );
        let handle = AgentController::builder(root, stream.clone())
            .config(headless(5))
            .build()
            .spawn();
        user_says(&stream, "go");

        let state = finish(&handle).await?;
        assert_eq!(state.agent_state, AgentState::Finished);
        assert!(events(&stream).iter().any(|event| matches!(
            event.as_observation(),
            Some(Observation::Error(e)) if e.error_id == ErrorId::AgentError && e.content.contains("ghost")
        )));
        Ok(())
    }

    #[tokio::test]
    async fn lost_sandbox_ends_in_error_with_status() -> Result<()> {
        let stream = EventStream::new(SessionId::from_string("fatal"));
        attach_runtime(&stream, sandbox_lost);
        let statuses: Arc<Mutex<Vec<StatusMessage>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = statuses.clone();
        let agent = ScriptedAgent::repeating("runner", CmdRunAction::new("ls").into());
        let handle = AgentController::builder(agent.clone(), stream.clone())
            .config(headless(10))
            .on_status(Arc::new(move |status: StatusMessage| sink.lock().push(status)))
            .build()
            .spawn();
        user_says(&stream, "go");

        let state = finish(&handle).await?;
        assert_eq!(state.agent_state, AgentState::Error);
        assert_eq!(agent.steps(), 1);
        assert_eq!(state.last_error.as_deref(), Some("sandbox process exited"));
        let statuses = statuses.lock();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].id, STATUS_AGENT_ERROR);
        Ok(())
    }

    #[tokio::test]
    async fn recoverable_agent_errors_become_observations() -> Result<()> {
        let stream = EventStream::new(SessionId::from_string("recover"));
        let agent = ScriptedAgent::with_results(
            "sloppy",
            vec![
                Err(KernelError::MalformedAction("reply was not json".into())),
                Ok(StepOutcome::new(AgentFinishAction::default())),
            ],
        );
        let handle = AgentController::builder(agent.clone(), stream.clone())
            .config(headless(5))
            .build()
            .spawn();
        user_says(&stream, "go");

        let state = finish(&handle).await?;
        assert_eq!(state.agent_state, AgentState::Finished);
        assert_eq!(state.iteration, 2);
        assert!(events(&stream).iter().any(|event| matches!(
            event.as_observation(),
            Some(Observation::Error(e)) if e.error_id == ErrorId::MalformedAction
        )));
        Ok(())
    }

    #[tokio::test]
    async fn unrecoverable_agent_error_stops_the_loop() -> Result<()> {
        let stream = EventStream::new(SessionId::from_string("unrecoverable"));
        let agent = ScriptedAgent::with_results(
            "broken",
            vec![Err(KernelError::InvalidState("agent lost its prompt".into()))],
        );
        let handle = AgentController::builder(agent, stream.clone())
            .config(headless(5))
            .build()
            .spawn();
        user_says(&stream, "go");

        let state = finish(&handle).await?;
        assert_eq!(state.agent_state, AgentState::Error);
        assert!(state.last_error.unwrap_or_default().contains("agent lost its prompt"));
        Ok(())
    }

    #[tokio::test]
    async fn task_actions_update_the_plan() -> Result<()> {
        let stream = EventStream::new(SessionId::from_string("plan"));
        let agent = ScriptedAgent::new(
            "planner",
            vec![
                AddTaskAction {
                    goal: "ship the fix".into(),
                    subtasks: vec![json!("write test")],
                    ..AddTaskAction::default()
                }
                .into(),
                AddTaskAction {
                    parent: "7".into(),
                    goal: "orphan".into(),
                    ..AddTaskAction::default()
                }
                .into(),
                ModifyTaskAction {
                    task_id: "0".into(),
                    state: "completed".into(),
                    thought: String::new(),
                }
                .into(),
            ],
        );
        let handle = AgentController::builder(agent, stream.clone())
            .config(headless(10))
            .build()
            .spawn();
        user_says(&stream, "plan it");

        let state = finish(&handle).await?;
        assert_eq!(state.plan.tasks.len(), 1);
        assert_eq!(
            state.plan.find("0.0").map(|task| task.state),
            Some(TaskState::Completed)
        );
        let invalid = events(&stream)
            .iter()
            .filter(|event| matches!(
                event.as_observation(),
                Some(Observation::Error(e)) if e.error_id == ErrorId::InvalidTask
            ))
            .count();
        assert_eq!(invalid, 1);
        Ok(())
    }

    #[tokio::test]
    async fn waiting_message_hands_control_back_to_the_user() -> Result<()> {
        let stream = EventStream::new(SessionId::from_string("ask"));
        let agent = ScriptedAgent::new(
            "asker",
            vec![MessageAction::new("Which branch?").waiting().into()],
        );
        let handle = AgentController::builder(agent.clone(), stream.clone())
            .config(headless(10))
            .build()
            .spawn();
        user_says(&stream, "merge it");

        let state = finish(&handle).await?;
        assert_eq!(state.agent_state, AgentState::AwaitingUserInput);
        assert_eq!(agent.steps(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn user_pause_and_resume_are_honored() -> Result<()> {
        let stream = EventStream::new(SessionId::from_string("pause"));
        let agent = ScriptedAgent::new(
            "worker",
            vec![MessageAction::new("Need input").waiting().into()],
        );
        let handle = AgentController::builder(agent.clone(), stream.clone())
            .build()
            .spawn();
        handle.wait_for_state(AgentState::Init, LIMIT).await?;
        stream.add_event(
            Event::action(ChangeAgentStateAction::new(AgentState::Paused)),
            EventSource::User,
        );
        handle.wait_for_state(AgentState::Paused, LIMIT).await?;
        assert_eq!(agent.steps(), 0);

        stream.add_event(
            Event::action(ChangeAgentStateAction::new(AgentState::Running)),
            EventSource::User,
        );
        handle
            .wait_for_state(AgentState::AwaitingUserInput, LIMIT)
            .await?;
        assert_eq!(agent.steps(), 1);

        stream.add_event(
            Event::action(ChangeAgentStateAction::new(AgentState::Stopped)),
            EventSource::User,
        );
        let state = finish(&handle).await?;
        assert_eq!(state.agent_state, AgentState::Stopped);
        Ok(())
    }

    #[tokio::test]
    async fn stop_request_ends_an_idle_controller() -> Result<()> {
        let stream = EventStream::new(SessionId::from_string("stop"));
        let agent = ScriptedAgent::new("idle", Vec::new());
        let handle = AgentController::builder(agent, stream.clone())
            .build()
            .spawn();
        handle.wait_for_state(AgentState::Init, LIMIT).await?;
        assert!(handle.is_running());

        let state = handle
            .stop(Duration::from_secs(5))
            .await
            .context("controller stopped in time")?;
        assert_eq!(state.agent_state, AgentState::Stopped);
        assert!(!handle.is_running());
        assert_eq!(stream.subscriber_count(), 0);
        Ok(())
    }

    struct MemoryStore {
        saved: Mutex<Vec<State>>,
    }

    #[async_trait]
    impl StateStore for MemoryStore {
        async fn save(&self, state: &State) -> KernelResult<()> {
            self.saved.lock().push(state.clone());
            Ok(())
        }

        async fn load(&self, _session_id: &SessionId) -> KernelResult<Option<State>> {
            Ok(self.saved.lock().last().cloned())
        }
    }

    #[tokio::test]
    async fn transitions_are_saved_and_state_can_resume() -> Result<()> {
        let stream = EventStream::new(SessionId::from_string("persist"));
        let store = Arc::new(MemoryStore {
            saved: Mutex::new(Vec::new()),
        });
        let agent = ScriptedAgent::new("first", vec![MessageAction::new("hello").into()]);
        let handle = AgentController::builder(agent, stream.clone())
            .config(headless(10))
            .state_store(store.clone())
            .build()
            .spawn();
        user_says(&stream, "hi");
        finish(&handle).await?;

        let saved = store.load(stream.session_id()).await?.context("state saved")?;
        assert_eq!(saved.agent_state, AgentState::Finished);
        assert_eq!(saved.iteration, 2);

        let agent = ScriptedAgent::new("second", Vec::new());
        let handle = AgentController::builder(agent.clone(), stream.clone())
            .config(headless(10))
            .resume_from(saved)
            .build()
            .spawn();
        user_says(&stream, "one more thing");
        let state = finish(&handle).await?;
        assert_eq!(state.agent_state, AgentState::Finished);
        assert_eq!(state.iteration, 3);
        assert_eq!(agent.steps(), 1);
        Ok(())
    }

    struct SummaryModel {
        reply: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmPort for SummaryModel {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _options: &CompletionOptions,
        ) -> KernelResult<LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(LlmResponse {
                content: self.reply.to_owned(),
                cost_usd: 0.0,
            })
        }

        fn context_window(&self) -> usize {
            10_000
        }
    }

    fn agent_message_id(stream: &EventStream, text: &str) -> Option<EventId> {
        events(stream).into_iter().find_map(|event| match event.as_action() {
            Some(Action::Message(message))
                if event.source == EventSource::Agent && message.content == text =>
            {
                event.id
            }
            _ => None,
        })
    }

    async fn run_condensing(reply: &'static str) -> Result<(EventStream, State, usize)> {
        let stream = EventStream::new(SessionId::from_string("condense"));
        let model = Arc::new(SummaryModel {
            reply,
            calls: AtomicUsize::new(0),
        });
        let agent = ScriptedAgent::new(
            "chatty",
            vec![
                MessageAction::new("step one").into(),
                MessageAction::new("step two").into(),
                AgentFinishAction::default().into(),
            ],
        );
        let config = ControllerConfig {
            condense_threshold_tokens: Some(2),
            ..headless(10)
        };
        let handle = AgentController::builder(agent, stream.clone())
            .config(config)
            .condenser(Arc::new(Condenser::new(model.clone(), CondenserConfig::default())))
            .build()
            .spawn();
        user_says(&stream, "go");
        let state = finish(&handle).await?;
        Ok((stream, state, model.calls.load(Ordering::SeqCst)))
    }

    #[tokio::test]
    async fn oversized_history_is_replaced_by_a_summary() -> Result<()> {
        let (stream, state, calls) = run_condensing(
            r#"{"action":"summarize","args":{"summarized_actions":"I started.","summarized_observations":"The user said go."}}"#,
        )
        .await?;
        assert_eq!(state.agent_state, AgentState::Finished);
        assert_eq!(calls, 1);

        let step_one = agent_message_id(&stream, "step one");
        let summary = events(&stream)
            .into_iter()
            .find_map(|event| match event.as_action() {
                Some(Action::AgentSummarize(summary)) => Some(summary.clone()),
                _ => None,
            })
            .context("summary published")?;
        assert_eq!(summary.last_summarized_event_id, step_one);
        assert_eq!(state.truncation_id, agent_message_id(&stream, "step two"));
        Ok(())
    }

    #[tokio::test]
    async fn failed_condensation_falls_back_to_truncation() -> Result<()> {
        let (stream, state, calls) = run_condensing("I cannot summarize this.").await?;
        assert_eq!(state.agent_state, AgentState::Finished);
        assert_eq!(calls, 2);
        assert!(
            !events(&stream)
                .iter()
                .any(|event| matches!(event.as_action(), Some(Action::AgentSummarize(_))))
        );
        assert_eq!(state.truncation_id, agent_message_id(&stream, "step two"));
        Ok(())
    }

    #[tokio::test]
    async fn single_oversized_event_is_kept_and_reported_once() -> Result<()> {
        let stream = EventStream::new(SessionId::from_string("oversized"));
        let model = Arc::new(SummaryModel {
            reply: "unused",
            calls: AtomicUsize::new(0),
        });
        let config = ControllerConfig {
            condense_threshold_tokens: Some(1),
            ..headless(10)
        };
        let agent = ScriptedAgent::new("big", Vec::new());
        let mut controller = AgentController::builder(agent, stream.clone())
            .config(config)
            .condenser(Arc::new(Condenser::new(model.clone(), CondenserConfig::default())))
            .build();
        let id = stream.add_event(
            Event::action(MessageAction::new("word ".repeat(500))),
            EventSource::User,
        );
        let history = vec![stream.get_event(id).context("event stored")?];

        let first = controller.condense_if_needed(history.clone()).await;
        assert_eq!(first, history);
        assert!(controller.oversized_warned);
        let second = controller.condense_if_needed(history.clone()).await;
        assert_eq!(second, history);
        assert!(controller.oversized_warned);
        assert_eq!(controller.top().state.truncation_id, None);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);

        let shorter = controller.condense_if_needed(Vec::new()).await;
        assert!(shorter.is_empty());
        assert!(!controller.oversized_warned);
        Ok(())
    }
}
