use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use skiff_protocol::{Event, EventId, SessionId};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, instrument, warn};

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends an event whose id must directly follow the latest stored id.
    async fn append(&self, session_id: &SessionId, event: &Event) -> Result<()>;
    async fn read_from(
        &self,
        session_id: &SessionId,
        from_id: EventId,
        limit: usize,
    ) -> Result<Vec<Event>>;
    async fn latest_id(&self, session_id: &SessionId) -> Result<Option<EventId>>;
}

/// One JSONL file per session under `<root>/events/`.
#[derive(Debug)]
pub struct FileEventStore {
    root: PathBuf,
    write_locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
    latest_cache: Mutex<HashMap<SessionId, Option<EventId>>>,
}

impl FileEventStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Mutex::new(HashMap::new()),
            latest_cache: Mutex::new(HashMap::new()),
        }
    }

    fn file_path(&self, session_id: &SessionId) -> PathBuf {
        self.root
            .join("events")
            .join(format!("{}.jsonl", session_id.as_str()))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create events dir {parent:?}"))?;
        }
        Ok(())
    }

    fn lock_for(&self, session_id: &SessionId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.write_locks.lock();
        guard
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Reads only the `id` of each line so a malformed payload cannot hide
    /// the sequence position.
    async fn scan_latest_id(path: &Path) -> Result<Option<EventId>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(None);
        }

        let file = OpenOptions::new().read(true).open(path).await?;
        let mut reader = BufReader::new(file).lines();
        let mut latest = None;

        while let Some(line) = reader.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let id = serde_json::from_str::<Value>(&line)
                .ok()
                .and_then(|value| value.get("id").and_then(Value::as_u64));
            if let Some(id) = id {
                latest = Some(latest.map_or(id, |current: EventId| current.max(id)));
            }
        }
        Ok(latest)
    }

    fn cached_latest_id(&self, session_id: &SessionId) -> Option<Option<EventId>> {
        self.latest_cache.lock().get(session_id).copied()
    }

    fn update_cached_id(&self, session_id: &SessionId, latest: Option<EventId>) {
        self.latest_cache.lock().insert(session_id.clone(), latest);
    }
}

#[async_trait]
impl EventStore for FileEventStore {
    #[instrument(skip(self, event), fields(session_id = %session_id, event_id = ?event.id))]
    async fn append(&self, session_id: &SessionId, event: &Event) -> Result<()> {
        let path = self.file_path(session_id);
        Self::ensure_parent(&path).await?;

        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let latest = match self.cached_latest_id(session_id) {
            Some(latest) => latest,
            None => {
                let latest = Self::scan_latest_id(&path).await?;
                self.update_cached_id(session_id, latest);
                latest
            }
        };

        let expected = latest.map_or(0, |id| id + 1);
        let Some(actual) = event.id else {
            bail!("cannot persist an event without an id for session {session_id}");
        };
        if actual != expected {
            warn!(expected, actual, "sequence conflict while appending event");
            bail!("sequence conflict for session {session_id}: expected {expected}, got {actual}");
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed opening event log {path:?}"))?;

        let line = serde_json::to_string(event).context("failed serializing event")?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        self.update_cached_id(session_id, Some(actual));
        debug!("event appended to store");
        Ok(())
    }

    #[instrument(skip(self), fields(session_id = %session_id, from_id, limit))]
    async fn read_from(
        &self,
        session_id: &SessionId,
        from_id: EventId,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let path = self.file_path(session_id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new().read(true).open(&path).await?;
        let mut reader = BufReader::new(file).lines();
        let mut out = Vec::new();
        let mut line_number = 0_usize;

        while let Some(line) = reader.next_line().await? {
            line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            let event = match serde_json::from_str::<Value>(&line)
                .map_err(|error| error.to_string())
                .and_then(|value| Event::from_value(value).map_err(|error| error.to_string()))
            {
                Ok(event) => event,
                Err(error) => {
                    warn!(line_number, %error, "skipping malformed event in {path:?}");
                    continue;
                }
            };
            if event.id.is_some_and(|id| id >= from_id) {
                out.push(event);
            }
            if out.len() >= limit {
                break;
            }
        }
        debug!(count = out.len(), "events loaded from store");
        Ok(out)
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn latest_id(&self, session_id: &SessionId) -> Result<Option<EventId>> {
        if let Some(latest) = self.cached_latest_id(session_id) {
            return Ok(latest);
        }

        let path = self.file_path(session_id);
        let latest = Self::scan_latest_id(&path).await?;
        self.update_cached_id(session_id, latest);
        debug!(?latest, "latest event id resolved");
        Ok(latest)
    }
}
