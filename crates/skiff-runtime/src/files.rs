//! Sandbox path mapping and line-ranged file access on the host workspace.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use skiff_protocol::ErrorId;
use tokio::fs;

/// A file operation failure that becomes an Error observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileError {
    pub error_id: ErrorId,
    pub message: String,
}

impl FileError {
    fn new(error_id: ErrorId, message: impl Into<String>) -> Self {
        Self {
            error_id,
            message: message.into(),
        }
    }
}

/// Maps paths as the sandbox sees them onto the host workspace.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    /// Where the workspace is mounted inside the sandbox.
    pub mount: PathBuf,
    /// The workspace directory on the host.
    pub base: PathBuf,
}

impl WorkspacePaths {
    pub fn new(mount: impl Into<PathBuf>, base: impl Into<PathBuf>) -> Self {
        Self {
            mount: mount.into(),
            base: base.into(),
        }
    }

    /// Resolves `path` against `working_dir` inside the sandbox and returns
    /// the host path. Paths outside the mount are refused.
    pub fn resolve(&self, path: &str, working_dir: &str) -> Result<PathBuf, FileError> {
        let requested = Path::new(path);
        let in_sandbox = if requested.is_absolute() {
            normalize(requested)
        } else {
            normalize(&Path::new(working_dir).join(requested))
        };
        let mount = normalize(&self.mount);
        let relative = in_sandbox
            .strip_prefix(&mount)
            .map_err(|_| denied(path))?;
        let host = self.base.join(relative);
        self.ensure_inside_base(&host, path)?;
        Ok(host)
    }

    // Catches symlinks that point out of the workspace.
    fn ensure_inside_base(&self, host: &Path, requested: &str) -> Result<(), FileError> {
        let Ok(base) = self.base.canonicalize() else {
            return Ok(());
        };
        let existing = host
            .ancestors()
            .find(|ancestor| ancestor.exists())
            .and_then(|ancestor| ancestor.canonicalize().ok());
        match existing {
            Some(resolved) if !resolved.starts_with(&base) => Err(denied(requested)),
            _ => Ok(()),
        }
    }
}

fn denied(path: &str) -> FileError {
    FileError::new(
        ErrorId::PermissionDenied,
        format!(
            "You're not allowed to access this path: {path}. You can only access paths inside the workspace."
        ),
    )
}

/// Lexically removes `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Splits text into lines that keep their terminators.
fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

fn check_range(start: usize, end: Option<usize>, len: usize, path: &str) -> Result<usize, FileError> {
    let end = end.unwrap_or(len).min(len);
    if start > len || start > end {
        return Err(FileError::new(
            ErrorId::InvalidRange,
            format!("Invalid line range [{start}, {end}) for {path} with {len} lines"),
        ));
    }
    Ok(end)
}

async fn read_text(host: &Path, path: &str) -> Result<Option<String>, FileError> {
    match fs::read(host).await {
        Ok(bytes) => String::from_utf8(bytes).map(Some).map_err(|_| {
            FileError::new(
                ErrorId::DecodeError,
                format!("File could not be decoded as utf-8: {path}"),
            )
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) if host.is_dir() || err.kind() == ErrorKind::IsADirectory => Err(is_dir(path)),
        Err(err) => Err(FileError::new(
            ErrorId::Generic,
            format!("Failed to read {path}: {err}"),
        )),
    }
}

fn is_dir(path: &str) -> FileError {
    FileError::new(
        ErrorId::IsDirectory,
        format!("Path is a directory: {path}. You can only read files"),
    )
}

/// Returns lines `[start, end)` of the file; `end = None` reads to the end.
pub async fn read_range(
    host: &Path,
    path: &str,
    start: usize,
    end: Option<usize>,
) -> Result<String, FileError> {
    if host.is_dir() {
        return Err(is_dir(path));
    }
    let text = read_text(host, path)
        .await?
        .ok_or_else(|| FileError::new(ErrorId::FileNotFound, format!("File not found: {path}")))?;
    if start == 0 && end.is_none() {
        return Ok(text);
    }
    let lines = split_lines(&text);
    let end = check_range(start, end, lines.len(), path)?;
    Ok(lines[start..end].concat())
}

/// Replaces lines `[start, end)` with `content`; `end = None` replaces
/// through the end of the file. A missing file is created, parents included.
pub async fn write_range(
    host: &Path,
    path: &str,
    content: &str,
    start: usize,
    end: Option<usize>,
) -> Result<(), FileError> {
    if host.is_dir() {
        return Err(is_dir(path));
    }
    let existing = read_text(host, path).await?.unwrap_or_default();
    let lines = split_lines(&existing);
    let end = check_range(start, end, lines.len(), path)?;

    let mut updated = lines[..start].concat();
    updated.push_str(content);
    let rest = lines[end..].concat();
    if !rest.is_empty() && !content.is_empty() && !content.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&rest);

    if let Some(parent) = host.parent() {
        fs::create_dir_all(parent).await.map_err(|err| {
            FileError::new(ErrorId::Generic, format!("Failed to create {}: {err}", parent.display()))
        })?;
    }
    fs::write(host, updated).await.map_err(|err| {
        let error_id = if err.kind() == ErrorKind::PermissionDenied {
            ErrorId::PermissionDenied
        } else {
            ErrorId::Generic
        };
        FileError::new(error_id, format!("Failed to write {path}: {err}"))
    })
}
