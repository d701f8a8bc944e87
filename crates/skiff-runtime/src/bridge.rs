use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use skiff_events::{EventCallback, EventStream, SubscriberKind};
use skiff_protocol::{ConfirmationStatus, ErrorId, Event, EventSource, Observation};
use tracing::{debug, error, instrument};

use crate::Runtime;

/// Executes runnable actions published on a stream and appends their
/// observations, caused by the action, as environment events.
pub struct RuntimeBridge {
    runtime: Arc<dyn Runtime>,
    stream: EventStream,
}

impl RuntimeBridge {
    pub fn new(runtime: Arc<dyn Runtime>, stream: EventStream) -> Arc<Self> {
        Arc::new(Self { runtime, stream })
    }

    /// Subscribes to the stream as the session's runtime. Attaching again
    /// replaces the earlier subscription.
    pub fn attach(self: &Arc<Self>) {
        let subscriber_id = self.stream.session_id().to_string();
        self.stream
            .subscribe(SubscriberKind::Runtime, subscriber_id, self.clone());
    }

    pub fn detach(&self) {
        self.stream
            .unsubscribe(SubscriberKind::Runtime, self.stream.session_id().as_str());
    }

    #[instrument(skip(self, event), fields(event_id = ?event.id))]
    async fn handle(&self, event: Event) {
        let Some(payload) = event.action_payload() else {
            return;
        };
        if !payload.action.is_runnable() {
            return;
        }
        if payload.confirmation != ConfirmationStatus::Confirmed {
            debug!(
                confirmation = ?payload.confirmation,
                "skipping action that is not confirmed"
            );
            return;
        }

        let observation = match self.runtime.run_action(&payload.action).await {
            Ok(observation) => observation,
            Err(err) => {
                error!(error = %err, action = payload.action.tag(), "runtime failed");
                Observation::error(ErrorId::SandboxUnavailable, err.to_string())
            }
        };
        let mut reply = Event::observation(observation);
        if let Some(cause) = event.id {
            reply = reply.with_cause(cause);
        }
        self.stream.add_event(reply, EventSource::Environment);
    }
}

#[async_trait]
impl EventCallback for RuntimeBridge {
    async fn on_event(&self, event: Event) -> Result<()> {
        self.handle(event).await;
        Ok(())
    }
}
