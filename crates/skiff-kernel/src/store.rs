use std::path::PathBuf;

use async_trait::async_trait;
use skiff_protocol::{KernelError, KernelResult, SessionId, State, StateStore};
use tokio::fs;
use tracing::{debug, instrument};

/// Controller state as pretty JSON at `<root>/sessions/<sid>/state.json`.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn state_path(&self, session_id: &SessionId) -> PathBuf {
        self.root
            .join("sessions")
            .join(session_id.as_str())
            .join("state.json")
    }
}

fn io_error(action: &str, path: &std::path::Path, error: std::io::Error) -> KernelError {
    KernelError::Io(format!("failed to {action} {}: {error}", path.display()))
}

#[async_trait]
impl StateStore for FileStateStore {
    #[instrument(skip(self, state), fields(session_id = %state.session_id))]
    async fn save(&self, state: &State) -> KernelResult<()> {
        let path = self.state_path(&state.session_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| io_error("create", parent, err))?;
        }
        let body = serde_json::to_vec_pretty(state)?;
        // Atomic replace.
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, body)
            .await
            .map_err(|err| io_error("write", &staging, err))?;
        fs::rename(&staging, &path)
            .await
            .map_err(|err| io_error("replace", &path, err))?;
        debug!(state = %state.agent_state, iteration = state.iteration, "state saved");
        Ok(())
    }

    async fn load(&self, session_id: &SessionId) -> KernelResult<Option<State>> {
        let path = self.state_path(session_id);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error("read", &path, err)),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }
}
