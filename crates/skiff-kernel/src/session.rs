use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use skiff_protocol::{
    ControlCommand, Event, EventId, EventSource, Observation, SessionId, StatusKind,
    StatusMessage, Transport, error_payload,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::agent_session::AgentSession;

/// Observations a client shows as the agent's own output.
fn shown_as_agent(observation: &Observation) -> bool {
    matches!(
        observation,
        Observation::CmdOutput(_)
            | Observation::Browser(_)
            | Observation::IPythonRunCell(_)
            | Observation::AgentStateChanged(_)
            | Observation::Error(_)
    )
}

/// Wire form of an event for the client, or `None` when it is not relayed.
pub fn outgoing(event: &Event) -> Option<Value> {
    if event.is_null() {
        return None;
    }
    let value = if event.source == EventSource::Environment
        && event.as_observation().is_some_and(shown_as_agent)
    {
        event.clone().with_source(EventSource::Agent).to_value()
    } else {
        event.to_value()
    };
    match value {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(event_id = ?event.id, error = %err, "event not relayed; serialization failed");
            None
        }
    }
}

/// A client connection to an [`AgentSession`].
pub struct Session {
    agent: Arc<AgentSession>,
    transport: Arc<dyn Transport>,
    /// Highest event id already sent; replay and live delivery share it.
    last_sent: Mutex<Option<EventId>>,
    relay: SyncMutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(agent: Arc<AgentSession>, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            agent,
            transport,
            last_sent: Mutex::new(None),
            relay: SyncMutex::new(None),
        })
    }

    pub fn session_id(&self) -> &SessionId {
        self.agent.session_id()
    }

    pub fn agent_session(&self) -> &Arc<AgentSession> {
        &self.agent
    }

    /// Sends every event after `last_seen_id` in order, then keeps relaying
    /// new events until detached or the stream closes. Attaching again
    /// replaces the relay. Returns how many stored events were replayed.
    #[instrument(skip(self), fields(session_id = %self.session_id()))]
    pub async fn attach(self: &Arc<Self>, last_seen_id: Option<EventId>) -> usize {
        self.detach();
        let stream = self.agent.stream();
        let mut last_sent = self.last_sent.lock().await;
        let from = match (last_seen_id, *last_sent) {
            (Some(seen), Some(sent)) => seen.max(sent) + 1,
            (Some(id), None) | (None, Some(id)) => id + 1,
            (None, None) => 0,
        };

        let mut events = stream.stream_from(from);
        let mut replayed = 0;
        if let Some(stored) = stream.latest_id().filter(|stored| *stored >= from) {
            while let Some(event) = events.next().await {
                if let Some(payload) = outgoing(&event) {
                    self.send(payload).await;
                    replayed += 1;
                }
                *last_sent = event.id.or(*last_sent);
                if event.id.is_some_and(|id| id >= stored) {
                    break;
                }
            }
        }
        drop(last_sent);

        let session = Arc::downgrade(self);
        let relay = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.forward(event).await;
            }
        });
        if let Some(previous) = self.relay.lock().replace(relay) {
            previous.abort();
        }
        info!(from, replayed, "client attached");
        replayed
    }

    /// Stops relaying events to the transport.
    pub fn detach(&self) {
        if let Some(relay) = self.relay.lock().take() {
            relay.abort();
        }
    }

    pub fn is_attached(&self) -> bool {
        self.relay
            .lock()
            .as_ref()
            .is_some_and(|relay| !relay.is_finished())
    }

    async fn send(&self, payload: Value) {
        if let Err(err) = self.transport.send(payload).await {
            warn!(session_id = %self.session_id(), error = %err, "transport send failed");
        }
    }

    async fn forward(&self, event: Event) {
        let mut last_sent = self.last_sent.lock().await;
        if let (Some(id), Some(sent)) = (event.id, *last_sent)
            && id <= sent
        {
            return;
        }
        if let Some(payload) = outgoing(&event) {
            self.send(payload).await;
        }
        *last_sent = event.id.or(*last_sent);
    }

    /// Appends a client record to the stream as a user event. A record that
    /// does not decode is answered with an error payload instead.
    pub async fn dispatch(&self, value: Value) -> Option<EventId> {
        match Event::from_value(value) {
            Ok(event) => {
                let id = self.agent.stream().add_event(event, EventSource::User);
                debug!(session_id = %self.session_id(), event_id = id, "client event added");
                Some(id)
            }
            Err(err) => {
                warn!(session_id = %self.session_id(), error = %err, "malformed client event");
                self.send_error(&format!("Invalid event: {err}")).await;
                None
            }
        }
    }

    pub fn dispatch_command(&self, command: ControlCommand) -> EventId {
        self.agent
            .stream()
            .add_event(Event::action(command.into_action()), EventSource::User)
    }

    /// Sends a status update. An error status stops the agent loop first.
    pub async fn send_status(&self, status: StatusMessage) {
        if status.kind == StatusKind::Error {
            self.agent.stop_agent_loop_for_error().await;
        }
        self.send(status.to_payload()).await;
    }

    pub async fn send_error(&self, message: &str) {
        self.send(error_payload(message)).await;
    }
}
