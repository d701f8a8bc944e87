//! Controller state: lifecycle enum, metrics, task plan, and the resumable
//! per-session [`State`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::Event;
use crate::ids::{EventId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Loading,
    Init,
    Running,
    AwaitingUserInput,
    AwaitingUserConfirmation,
    Paused,
    Stopped,
    Finished,
    Rejected,
    Error,
    /// Request value answering a confirmation prompt. Never held by a controller.
    UserConfirmed,
    /// Request value answering a confirmation prompt. Never held by a controller.
    UserRejected,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Init => "init",
            Self::Running => "running",
            Self::AwaitingUserInput => "awaiting_user_input",
            Self::AwaitingUserConfirmation => "awaiting_user_confirmation",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Finished => "finished",
            Self::Rejected => "rejected",
            Self::Error => "error",
            Self::UserConfirmed => "user_confirmed",
            Self::UserRejected => "user_rejected",
        }
    }

    pub fn is_confirmation_answer(&self) -> bool {
        matches!(self, Self::UserConfirmed | Self::UserRejected)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub accumulated_cost: f64,
    #[serde(default)]
    pub costs: Vec<f64>,
}

impl Metrics {
    pub fn add_cost(&mut self, cost: f64) {
        if cost > 0.0 {
            self.accumulated_cost += cost;
            self.costs.push(cost);
        }
    }

    pub fn merge(&mut self, other: &Metrics) {
        self.accumulated_cost += other.accumulated_cost;
        self.costs.extend_from_slice(&other.costs);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Open,
    InProgress,
    Completed,
    Abandoned,
    Verified,
}

impl TaskState {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "abandoned" => Some(Self::Abandoned),
            "verified" => Some(Self::Verified),
            _ => None,
        }
    }

    fn closes_subtasks(&self) -> bool {
        matches!(self, Self::Completed | Self::Abandoned | Self::Verified)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub goal: String,
    #[serde(default)]
    pub state: TaskState,
    #[serde(default)]
    pub subtasks: Vec<Task>,
}

impl Task {
    fn set_state_recursive(&mut self, state: TaskState) {
        self.state = state;
        if state.closes_subtasks() {
            for task in &mut self.subtasks {
                task.set_state_recursive(state);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("no task with id `{0}`")]
    UnknownTask(String),
    #[error("unknown task state `{0}`")]
    UnknownState(String),
    #[error("subtask must be a goal string or an object with a `goal`")]
    BadSubtask,
}

/// Hierarchical task list driven by AddTask/ModifyTask actions.
///
/// Ids are dotted positions: top-level tasks are `0`, `1`, ...; the children
/// of `0` are `0.0`, `0.1`, ...
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskPlan {
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl TaskPlan {
    /// Adds `goal` under `parent` (empty for top level) and returns its id.
    pub fn add_task(
        &mut self,
        parent: &str,
        goal: &str,
        subtasks: &[Value],
    ) -> Result<String, PlanError> {
        let siblings = if parent.is_empty() {
            &mut self.tasks
        } else {
            &mut self
                .find_mut(parent)
                .ok_or_else(|| PlanError::UnknownTask(parent.to_owned()))?
                .subtasks
        };
        let id = child_id(parent, siblings.len());
        siblings.push(Task {
            id: id.clone(),
            goal: goal.to_owned(),
            state: TaskState::Open,
            subtasks: Vec::new(),
        });
        for subtask in subtasks {
            let (sub_goal, nested) = match subtask {
                Value::String(goal) => (goal.as_str(), Vec::new()),
                Value::Object(map) => {
                    let goal = map
                        .get("goal")
                        .and_then(Value::as_str)
                        .ok_or(PlanError::BadSubtask)?;
                    let nested = map
                        .get("subtasks")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    (goal, nested)
                }
                _ => return Err(PlanError::BadSubtask),
            };
            self.add_task(&id, sub_goal, &nested)?;
        }
        Ok(id)
    }

    pub fn set_state(&mut self, id: &str, state: &str) -> Result<(), PlanError> {
        let state = TaskState::parse(state).ok_or_else(|| PlanError::UnknownState(state.to_owned()))?;
        let task = self
            .find_mut(id)
            .ok_or_else(|| PlanError::UnknownTask(id.to_owned()))?;
        task.set_state_recursive(state);
        Ok(())
    }

    pub fn find(&self, id: &str) -> Option<&Task> {
        let mut level = &self.tasks;
        let mut found = None;
        for index in parse_path(id)? {
            let task = level.get(index)?;
            level = &task.subtasks;
            found = Some(task);
        }
        found
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Task> {
        let path = parse_path(id)?;
        let (first, rest) = path.split_first()?;
        let mut task = self.tasks.get_mut(*first)?;
        for index in rest {
            task = task.subtasks.get_mut(*index)?;
        }
        Some(task)
    }
}

fn child_id(parent: &str, index: usize) -> String {
    if parent.is_empty() {
        index.to_string()
    } else {
        format!("{parent}.{index}")
    }
}

fn parse_path(id: &str) -> Option<Vec<usize>> {
    if id.is_empty() {
        return None;
    }
    id.split('.').map(|part| part.parse().ok()).collect()
}

/// Mutable controller state for one frame (top-level agent or delegate).
///
/// `history` is a view rebuilt from the event stream before every step and
/// is not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub session_id: SessionId,
    #[serde(default)]
    pub agent_state: AgentState,
    #[serde(default)]
    pub iteration: u64,
    #[serde(default)]
    pub local_iteration: u64,
    pub max_iterations: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_budget_per_task: Option<f64>,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub delegate_level: u32,
    /// First event id visible to this frame.
    #[serde(default)]
    pub start_id: EventId,
    /// Events before this id have been condensed away.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncation_id: Option<EventId>,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub plan: TaskPlan,
    #[serde(skip)]
    pub history: Vec<Event>,
}

impl State {
    pub fn new(session_id: SessionId, max_iterations: u64, max_budget_per_task: Option<f64>) -> Self {
        Self {
            session_id,
            agent_state: AgentState::Loading,
            iteration: 0,
            local_iteration: 0,
            max_iterations,
            max_budget_per_task,
            metrics: Metrics::default(),
            last_error: None,
            delegate_level: 0,
            start_id: 0,
            truncation_id: None,
            inputs: Map::new(),
            outputs: Map::new(),
            plan: TaskPlan::default(),
            history: Vec::new(),
        }
    }

    /// State for a delegate frame: same global counters, fresh local ones.
    pub fn for_delegate(&self, inputs: Map<String, Value>, start_id: EventId) -> Self {
        Self {
            session_id: self.session_id.clone(),
            agent_state: AgentState::Running,
            iteration: self.iteration,
            local_iteration: 0,
            max_iterations: self.max_iterations,
            max_budget_per_task: self.max_budget_per_task,
            metrics: Metrics::default(),
            last_error: None,
            delegate_level: self.delegate_level + 1,
            start_id,
            truncation_id: None,
            inputs,
            outputs: Map::new(),
            plan: TaskPlan::default(),
            history: Vec::new(),
        }
    }

    /// Reason the loop must stop, if the iteration or cost budget is spent.
    pub fn budget_exhausted(&self) -> Option<String> {
        if self.iteration >= self.max_iterations {
            return Some(format!(
                "Agent reached maximum number of iterations ({})",
                self.max_iterations
            ));
        }
        if let Some(max_budget) = self.max_budget_per_task
            && self.metrics.accumulated_cost >= max_budget
        {
            return Some(format!(
                "Task budget exceeded. Current cost: {:.2}, Max budget: {:.2}",
                self.metrics.accumulated_cost, max_budget
            ));
        }
        None
    }

    /// First event id of the replay window.
    pub fn view_start(&self) -> EventId {
        self.truncation_id.map_or(self.start_id, |t| t.max(self.start_id))
    }
}
