//! A long-lived child process driven over stdin with an output marker.
//!
//! Every request is followed by a line that makes the child print
//! `<marker><status>[ <tail>]` on its own line once the request is done.
//! Everything read before that line is the request's output.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::SandboxError;

/// Output collected for one request, capped at a byte limit.
#[derive(Debug, Default)]
pub(crate) struct OutputBuffer {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl OutputBuffer {
    fn push(&mut self, line: &[u8], max_bytes: usize) {
        let room = max_bytes.saturating_sub(self.bytes.len());
        if line.len() > room {
            self.bytes.extend_from_slice(&line[..room]);
            self.truncated = true;
        } else {
            self.bytes.extend_from_slice(line);
        }
    }

    /// Decodes the collected bytes. Invalid UTF-8 is an error unless the
    /// cut happened inside a multi-byte character at the truncation point.
    pub fn into_text(self) -> Result<String, SandboxError> {
        let text = match String::from_utf8(self.bytes) {
            Ok(text) => text,
            Err(err) if self.truncated => {
                let valid = err.utf8_error().valid_up_to();
                let mut bytes = err.into_bytes();
                bytes.truncate(valid);
                String::from_utf8(bytes).map_err(|_| SandboxError::Decode)?
            }
            Err(_) => return Err(SandboxError::Decode),
        };
        if self.truncated {
            Ok(format!("{text}\n[output truncated]"))
        } else {
            Ok(text)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MarkerLine {
    pub status: i32,
    pub tail: Option<String>,
}

pub(crate) struct ProcessSession {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    marker: String,
}

impl ProcessSession {
    /// Starts a non-interactive bash with stderr folded into stdout.
    pub async fn spawn_shell(
        cwd: &Path,
        env: &BTreeMap<String, String>,
        handshake: Duration,
    ) -> Result<Self, SandboxError> {
        let mut command = std::process::Command::new("bash");
        command.args(["--noprofile", "--norc"]);
        command.current_dir(cwd);
        command.envs(env);
        let mut session = Self::spawn_with_marker(command, new_marker())?;
        let setup = session.shell_request("exec 2>&1");
        session.send(&setup).await?;
        session.handshake(handshake).await?;
        Ok(session)
    }

    /// Starts the Python driver script at `driver`.
    pub async fn spawn_python(
        driver: &Path,
        cwd: &Path,
        env: &BTreeMap<String, String>,
        handshake: Duration,
    ) -> Result<Self, SandboxError> {
        let marker = new_marker();
        let mut command = std::process::Command::new("python3");
        command.arg("-u").arg(driver).arg(&marker);
        command.current_dir(cwd);
        command.envs(env);
        let mut session = Self::spawn_with_marker(command, marker)?;
        let probe = session.cell_request("pass");
        session.send(&probe).await?;
        session.handshake(handshake).await?;
        Ok(session)
    }

    fn spawn_with_marker(
        mut command: std::process::Command,
        marker: String,
    ) -> Result<Self, SandboxError> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = Command::from(command)
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| SandboxError::Unavailable(format!("failed to spawn process: {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Unavailable("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Unavailable("child stdout not captured".into()))?;
        debug!(pid = ?child.id(), "sandbox process started");
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            marker,
        })
    }

    async fn handshake(&mut self, limit: Duration) -> Result<(), SandboxError> {
        let mut discard = OutputBuffer::default();
        match tokio::time::timeout(limit, self.read_until_marker(&mut discard, 0)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(SandboxError::Unavailable(
                "process did not answer the startup handshake".into(),
            )),
        }
    }

    /// Shell request: the command, then a marker line carrying `$?` and the
    /// working directory the command left behind.
    pub fn shell_request(&self, command: &str) -> String {
        format!(
            "{command}\nprintf '\\n%s%s %s\\n' '{}' \"$?\" \"$PWD\"\n",
            self.marker
        )
    }

    /// Interpreter request: the cell source terminated by `<marker>_END`.
    pub fn cell_request(&self, code: &str) -> String {
        format!("{code}\n{}_END\n", self.marker)
    }

    pub async fn send(&mut self, payload: &str) -> Result<(), SandboxError> {
        let write = async {
            self.stdin.write_all(payload.as_bytes()).await?;
            self.stdin.flush().await
        };
        write
            .await
            .map_err(|err| SandboxError::Unavailable(format!("process stdin closed: {err}")))
    }

    /// Reads output lines into `buffer` until the marker line arrives. The
    /// newline emitted just before the marker is not part of the output.
    pub async fn read_until_marker(
        &mut self,
        buffer: &mut OutputBuffer,
        max_bytes: usize,
    ) -> Result<MarkerLine, SandboxError> {
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = self
                .stdout
                .read_until(b'\n', &mut line)
                .await
                .map_err(|err| SandboxError::Unavailable(format!("process stdout: {err}")))?;
            if read == 0 {
                return Err(SandboxError::Unavailable("process exited".into()));
            }
            if let Some(rest) = line.strip_prefix(self.marker.as_bytes()) {
                if buffer.bytes.last() == Some(&b'\n') {
                    buffer.bytes.pop();
                }
                return Ok(parse_marker_tail(&String::from_utf8_lossy(rest)));
            }
            buffer.push(&line, max_bytes);
        }
    }

    /// Terminates the process group, escalating to SIGKILL after `grace`.
    pub async fn terminate(mut self, grace: Duration) {
        let Some(pid) = self.child.id() else {
            return;
        };
        signal_group(pid, "TERM").await;
        if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
            warn!(pid, "sandbox process ignored SIGTERM, killing");
            signal_group(pid, "KILL").await;
            if let Err(err) = self.child.kill().await {
                warn!(pid, error = %err, "failed to kill sandbox process");
            }
        }
        debug!(pid, "sandbox process stopped");
    }
}

fn new_marker() -> String {
    format!("__SKIFF_DONE_{}__", uuid::Uuid::new_v4().simple())
}

fn parse_marker_tail(rest: &str) -> MarkerLine {
    let rest = rest.trim_end_matches(['\r', '\n']);
    let (status, tail) = match rest.split_once(' ') {
        Some((status, tail)) => (status, Some(tail.to_owned())),
        None => (rest, None),
    };
    MarkerLine {
        status: status.trim().parse().unwrap_or(-1),
        tail,
    }
}

/// Sends `signal` to the process group led by `pid`.
pub(crate) async fn signal_group(pid: u32, signal: &str) {
    let status = Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(err) = status {
        warn!(pid, signal, error = %err, "failed to signal process group");
    }
}
