use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use futures_util::stream::BoxStream;
use indexmap::IndexMap;
use parking_lot::Mutex;
use skiff_protocol::{Event, EventId, EventPayload, EventSource, SessionId};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, instrument, warn};

use crate::store::EventStore;

const LIVE_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriberKind {
    AgentController,
    Runtime,
    Test,
}

impl SubscriberKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentController => "agent_controller",
            Self::Runtime => "runtime",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for SubscriberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait EventCallback: Send + Sync {
    async fn on_event(&self, event: Event) -> Result<()>;
}

struct FnCallback<F>(F);

#[async_trait]
impl<F, Fut> EventCallback for FnCallback<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn on_event(&self, event: Event) -> Result<()> {
        (self.0)(event).await
    }
}

/// Wraps an async closure as a subscriber callback.
pub fn callback_fn<F, Fut>(f: F) -> Arc<dyn EventCallback>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnCallback(f))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFamily {
    Actions,
    Observations,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub source: Option<EventSource>,
    pub family: Option<EventFamily>,
    pub exclude_null: bool,
    pub reverse: bool,
}

impl EventFilter {
    pub fn source(mut self, source: EventSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn family(mut self, family: EventFamily) -> Self {
        self.family = Some(family);
        self
    }

    pub fn exclude_null(mut self) -> Self {
        self.exclude_null = true;
        self
    }

    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if self.source.is_some_and(|source| source != event.source) {
            return false;
        }
        let family_ok = match (self.family, &event.payload) {
            (None, _) => true,
            (Some(EventFamily::Actions), EventPayload::Action(_)) => true,
            (Some(EventFamily::Observations), EventPayload::Observation(_)) => true,
            _ => false,
        };
        family_ok && !(self.exclude_null && event.is_null())
    }
}

type SubscriberKey = (SubscriberKind, String);

enum PersistCommand {
    Append(Event),
    Flush(oneshot::Sender<()>),
}

struct StreamState {
    next_id: EventId,
    events: Vec<Event>,
    subscribers: IndexMap<SubscriberKey, mpsc::UnboundedSender<Event>>,
    live: Option<broadcast::Sender<Event>>,
    persist: Option<mpsc::UnboundedSender<PersistCommand>>,
}

struct StreamInner {
    session_id: SessionId,
    state: Mutex<StreamState>,
}

/// Append-only event log of one session.
///
/// Ids are assigned densely by [`EventStream::add_event`]. Every subscriber
/// owns a FIFO queue drained by its own task, so a slow or failing callback
/// never blocks the producer or other subscribers.
#[derive(Clone)]
pub struct EventStream {
    inner: Arc<StreamInner>,
}

impl EventStream {
    pub fn new(session_id: SessionId) -> Self {
        Self::from_events(session_id, Vec::new(), None)
    }

    /// A stream whose events are also written to `store`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_store(session_id: SessionId, store: Arc<dyn EventStore>) -> Self {
        let persist = spawn_writer(session_id.clone(), store);
        Self::from_events(session_id, Vec::new(), Some(persist))
    }

    /// Reloads a persisted session and continues numbering after its last id.
    #[instrument(skip(store), fields(session_id = %session_id))]
    pub async fn restore(session_id: SessionId, store: Arc<dyn EventStore>) -> Result<Self> {
        let events = store
            .read_from(&session_id, 0, usize::MAX)
            .await
            .with_context(|| format!("failed restoring event stream for {session_id}"))?;
        info!(count = events.len(), "event stream restored");
        let persist = spawn_writer(session_id.clone(), store);
        Ok(Self::from_events(session_id, events, Some(persist)))
    }

    fn from_events(
        session_id: SessionId,
        events: Vec<Event>,
        persist: Option<mpsc::UnboundedSender<PersistCommand>>,
    ) -> Self {
        let next_id = events
            .iter()
            .filter_map(|event| event.id)
            .max()
            .map_or(0, |id| id + 1);
        let (live, _) = broadcast::channel(LIVE_BUFFER);
        Self {
            inner: Arc::new(StreamInner {
                session_id,
                state: Mutex::new(StreamState {
                    next_id,
                    events,
                    subscribers: IndexMap::new(),
                    live: Some(live),
                    persist,
                }),
            }),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    /// Assigns the next id, stores the event, and schedules delivery.
    pub fn add_event(&self, event: Event, source: EventSource) -> EventId {
        let mut event = event;
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        event.id = Some(id);
        event.source = source;
        event.timestamp = Utc::now();
        state.events.push(event.clone());

        state.subscribers.retain(|(kind, subscriber_id), sender| {
            let delivered = sender.send(event.clone()).is_ok();
            if !delivered {
                warn!(%kind, subscriber_id, "dropping subscriber with closed queue");
            }
            delivered
        });
        if let Some(persist) = &state.persist
            && persist.send(PersistCommand::Append(event.clone())).is_err()
        {
            warn!(event_id = id, "event writer stopped; event not persisted");
        }
        if let Some(live) = &state.live {
            let _ = live.send(event);
        }
        debug!(event_id = id, ?source, "event added");
        id
    }

    /// Registers `callback` under `(kind, subscriber_id)`, replacing any
    /// previous registration with the same key.
    ///
    /// Must be called inside a tokio runtime.
    pub fn subscribe(
        &self,
        kind: SubscriberKind,
        subscriber_id: impl Into<String>,
        callback: Arc<dyn EventCallback>,
    ) {
        let subscriber_id = subscriber_id.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Event>();
        let label = format!("{kind}:{subscriber_id}");
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let event_id = event.id;
                match AssertUnwindSafe(callback.on_event(event)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        warn!(subscriber = %label, ?event_id, %error, "subscriber callback failed");
                    }
                    Err(_) => {
                        warn!(subscriber = %label, ?event_id, "subscriber callback panicked");
                    }
                }
            }
            debug!(subscriber = %label, "subscriber queue drained");
        });

        let previous = self
            .inner
            .state
            .lock()
            .subscribers
            .insert((kind, subscriber_id.clone()), sender);
        if previous.is_some() {
            debug!(%kind, subscriber_id, "subscriber replaced");
        }
    }

    pub fn unsubscribe(&self, kind: SubscriberKind, subscriber_id: &str) {
        let removed = self
            .inner
            .state
            .lock()
            .subscribers
            .shift_remove(&(kind, subscriber_id.to_owned()));
        if removed.is_none() {
            warn!(%kind, subscriber_id, "unsubscribe for unknown subscriber");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    /// Events with `start_id <= id <= end_id` that pass `filter`.
    ///
    /// The result is a snapshot; calling again restarts from the same range.
    pub fn get_events(
        &self,
        start_id: EventId,
        end_id: Option<EventId>,
        filter: &EventFilter,
    ) -> std::vec::IntoIter<Event> {
        let mut selected: Vec<Event> = {
            let state = self.inner.state.lock();
            let from = state.events.partition_point(|event| event.id < Some(start_id));
            state.events[from..]
                .iter()
                .take_while(|event| end_id.is_none_or(|end| event.id.is_some_and(|id| id <= end)))
                .filter(|event| filter.matches(event))
                .cloned()
                .collect()
        };
        if filter.reverse {
            selected.reverse();
        }
        selected.into_iter()
    }

    pub fn get_event(&self, id: EventId) -> Option<Event> {
        let state = self.inner.state.lock();
        let index = state.events.partition_point(|event| event.id < Some(id));
        state.events.get(index).filter(|event| event.id == Some(id)).cloned()
    }

    /// Id the next added event will receive.
    pub fn next_id(&self) -> EventId {
        self.inner.state.lock().next_id
    }

    pub fn latest_id(&self) -> Option<EventId> {
        self.inner.state.lock().next_id.checked_sub(1)
    }

    /// Stored events from `start_id`, then live events as they are added.
    ///
    /// The backlog snapshot and the live subscription are taken under one lock,
    /// so nothing is skipped or repeated at the boundary.
    pub fn stream_from(&self, start_id: EventId) -> BoxStream<'static, Event> {
        let (backlog, live) = {
            let state = self.inner.state.lock();
            let from = state.events.partition_point(|event| event.id < Some(start_id));
            let backlog: Vec<Event> = state.events[from..].to_vec();
            (backlog, state.live.as_ref().map(broadcast::Sender::subscribe))
        };
        let stream = self.clone();
        Box::pin(async_stream::stream! {
            let mut next = start_id;
            for event in backlog {
                next = event.id.map_or(next, |id| id + 1);
                yield event;
            }
            let Some(live) = live else { return };
            let mut live = BroadcastStream::new(live);
            while let Some(item) = live.next().await {
                match item {
                    Ok(event) => {
                        if event.id.is_some_and(|id| id >= next) {
                            next = event.id.map_or(next, |id| id + 1);
                            yield event;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "live stream lagged; refilling from log");
                        for event in stream.get_events(next, None, &EventFilter::default()) {
                            next = event.id.map_or(next, |id| id + 1);
                            yield event;
                        }
                    }
                }
            }
        })
    }

    /// Waits until every added event has been handed to the store.
    pub async fn flush(&self) {
        let persist = self.inner.state.lock().persist.clone();
        if let Some(persist) = persist {
            let (done, wait) = oneshot::channel();
            if persist.send(PersistCommand::Flush(done)).is_ok() {
                let _ = wait.await;
            }
        }
    }

    /// Drops every subscriber and ends live streams. Stored events stay
    /// readable.
    #[instrument(skip(self), fields(session_id = %self.inner.session_id))]
    pub async fn close(&self) {
        self.flush().await;
        let mut state = self.inner.state.lock();
        let dropped = state.subscribers.len();
        state.subscribers.clear();
        state.live = None;
        state.persist = None;
        info!(dropped, "event stream closed");
    }
}

fn spawn_writer(
    session_id: SessionId,
    store: Arc<dyn EventStore>,
) -> mpsc::UnboundedSender<PersistCommand> {
    let (sender, mut receiver) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(command) = receiver.recv().await {
            match command {
                PersistCommand::Append(event) => {
                    if let Err(error) = store.append(&session_id, &event).await {
                        warn!(session_id = %session_id, event_id = ?event.id, %error, "failed persisting event");
                    }
                }
                PersistCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
    });
    sender
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use anyhow::{Result, bail};
    use skiff_protocol::{
        CmdOutputObservation, CmdRunAction, MessageAction, NullAction, Observation,
    };
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    use super::*;
    use crate::store::FileEventStore;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn collector() -> (Arc<dyn EventCallback>, UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let callback = callback_fn(move |event| {
            let sender = sender.clone();
            async move {
                sender.send(event)?;
                Ok(())
            }
        });
        (callback, receiver)
    }

    async fn next(receiver: &mut UnboundedReceiver<Event>) -> Result<Event> {
        match timeout(Duration::from_secs(2), receiver.recv()).await {
            Ok(Some(event)) => Ok(event),
            _ => bail!("no event delivered"),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_all_events_in_order() -> Result<()> {
        let stream = EventStream::new(SessionId::new_uuid());
        let (callback, mut received) = collector();
        stream.subscribe(SubscriberKind::Test, "ordering", callback);

        for n in 0..20 {
            let id = stream.add_event(
                Event::action(CmdRunAction::new(format!("echo {n}"))),
                EventSource::Agent,
            );
            assert_eq!(id, n);
        }

        for expected in 0..20 {
            let event = next(&mut received).await?;
            assert_eq!(event.id, Some(expected));
            assert_eq!(event.source, EventSource::Agent);
        }
        Ok(())
    }

    #[test]
    fn subscriber_kinds_have_stable_names() {
        let names: Vec<String> = [
            SubscriberKind::AgentController,
            SubscriberKind::Runtime,
            SubscriberKind::Test,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(names, ["agent_controller", "runtime", "test"]);
    }

    #[tokio::test]
    async fn resubscribing_replaces_the_previous_registration() -> Result<()> {
        let stream = EventStream::new(SessionId::new_uuid());
        let (first, mut first_received) = collector();
        let (second, mut second_received) = collector();
        stream.subscribe(SubscriberKind::Test, "sid", first);
        stream.subscribe(SubscriberKind::Test, "sid", second);
        assert_eq!(stream.subscriber_count(), 1);

        for _ in 0..3 {
            stream.add_event(Event::action(MessageAction::new("hi")), EventSource::User);
        }
        for expected in 0..3 {
            assert_eq!(next(&mut second_received).await?.id, Some(expected));
        }
        assert!(
            timeout(Duration::from_millis(100), first_received.recv())
                .await
                .map_or(true, |event| event.is_none())
        );
        Ok(())
    }

    #[tokio::test]
    async fn failing_subscribers_are_isolated() -> Result<()> {
        let stream = EventStream::new(SessionId::new_uuid());
        stream.subscribe(
            SubscriberKind::Test,
            "errors",
            callback_fn(|_event| async { bail!("subscriber exploded") }),
        );
        stream.subscribe(
            SubscriberKind::Test,
            "panics",
            callback_fn(|event: Event| async move {
                if event.id == Some(0) {
                    panic!("subscriber panicked");
                }
                Ok(())
            }),
        );
        let (healthy, mut received) = collector();
        stream.subscribe(SubscriberKind::Test, "healthy", healthy);

        stream.add_event(Event::action(MessageAction::new("a")), EventSource::User);
        stream.add_event(Event::action(MessageAction::new("b")), EventSource::User);

        assert_eq!(next(&mut received).await?.id, Some(0));
        assert_eq!(next(&mut received).await?.id, Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() -> Result<()> {
        let stream = EventStream::new(SessionId::new_uuid());
        let (callback, mut received) = collector();
        stream.subscribe(SubscriberKind::Runtime, "rt", callback);
        stream.add_event(Event::action(MessageAction::new("a")), EventSource::User);
        assert_eq!(next(&mut received).await?.id, Some(0));

        stream.unsubscribe(SubscriberKind::Runtime, "rt");
        stream.add_event(Event::action(MessageAction::new("b")), EventSource::User);
        assert!(next(&mut received).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn get_events_filters_and_restarts() -> Result<()> {
        let stream = EventStream::new(SessionId::new_uuid());
        let action = stream.add_event(Event::action(CmdRunAction::new("ls")), EventSource::Agent);
        stream.add_event(
            Event::observation(CmdOutputObservation::new("a.txt", "ls", 0)).with_cause(action),
            EventSource::Environment,
        );
        stream.add_event(Event::action(NullAction {}), EventSource::Agent);
        stream.add_event(Event::action(MessageAction::new("next?")), EventSource::User);

        let all: Vec<EventId> = stream
            .get_events(0, None, &EventFilter::default())
            .filter_map(|event| event.id)
            .collect();
        assert_eq!(all, vec![0, 1, 2, 3]);

        let window: Vec<EventId> = stream
            .get_events(1, Some(2), &EventFilter::default())
            .filter_map(|event| event.id)
            .collect();
        assert_eq!(window, vec![1, 2]);

        let agent_actions: Vec<EventId> = stream
            .get_events(
                0,
                None,
                &EventFilter::default()
                    .source(EventSource::Agent)
                    .family(EventFamily::Actions)
                    .exclude_null()
                    .reverse(),
            )
            .filter_map(|event| event.id)
            .collect();
        assert_eq!(agent_actions, vec![0]);

        let reversed: Vec<EventId> = stream
            .get_events(0, None, &EventFilter::default().reverse())
            .filter_map(|event| event.id)
            .collect();
        assert_eq!(reversed, vec![3, 2, 1, 0]);

        assert!(matches!(
            stream.get_event(1).and_then(|event| event.as_observation().cloned()),
            Some(Observation::CmdOutput(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn stream_from_replays_then_tails() -> Result<()> {
        let stream = EventStream::new(SessionId::new_uuid());
        for _ in 0..3 {
            stream.add_event(Event::action(MessageAction::new("old")), EventSource::User);
        }
        let mut replay = stream.stream_from(1);
        stream.add_event(Event::action(MessageAction::new("new")), EventSource::User);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let Ok(Some(event)) = timeout(Duration::from_secs(2), replay.next()).await else {
                bail!("replay ended early");
            };
            ids.push(event.id);
        }
        assert_eq!(ids, vec![Some(1), Some(2), Some(3)]);

        stream.close().await;
        assert!(
            timeout(Duration::from_secs(2), replay.next())
                .await
                .is_ok_and(|event| event.is_none())
        );
        Ok(())
    }

    #[tokio::test]
    async fn restored_stream_continues_numbering() -> Result<()> {
        let root = unique_test_root("skiff-stream-restore");
        let store: Arc<dyn EventStore> = Arc::new(FileEventStore::new(&root));
        let session_id = SessionId::new_uuid();

        let stream = EventStream::with_store(session_id.clone(), store.clone());
        stream.add_event(Event::action(MessageAction::new("one")), EventSource::User);
        stream.add_event(Event::action(MessageAction::new("two")), EventSource::User);
        stream.close().await;

        let restored = EventStream::restore(session_id, store).await?;
        assert_eq!(restored.get_events(0, None, &EventFilter::default()).count(), 2);
        let id = restored.add_event(Event::action(MessageAction::new("three")), EventSource::User);
        assert_eq!(id, 2);
        restored.flush().await;

        let _ = tokio::fs::remove_dir_all(root).await;
        Ok(())
    }
}
