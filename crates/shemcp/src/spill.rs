//! Disk spill for large outputs.
//!
//! When a command produces more than a page of output, the full stream is
//! mirrored to `$HOME/.shemcp/tmp/exec-<uuid>.out` (stderr to `.err`) and
//! addressed by an `mcp://tmp/...` URI that `read_file_chunk` can range-read
//! later. Spill I/O never fails a request: a sink that hits an error removes
//! its partial file and the response falls back to the in-memory window.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

/// URI scheme prefix for spill files.
pub const SPILL_URI_PREFIX: &str = "mcp://tmp/";

#[derive(Debug, Error)]
pub enum SpillError {
    #[error("uri must start with {SPILL_URI_PREFIX}: {0}")]
    InvalidUri(String),
    #[error("file not found: {0}")]
    NotFound(String),
}

/// Paths and URIs for one execution's spill files.
///
/// Files are created lazily; a side that never writes has no file on disk.
#[derive(Debug, Clone)]
pub struct SpillHandle {
    pub stdout_path: PathBuf,
    pub stdout_uri: String,
    pub stderr_path: PathBuf,
    pub stderr_uri: String,
}

/// The spill directory and URI mapping.
#[derive(Debug, Clone)]
pub struct SpillStore {
    dir: PathBuf,
}

impl SpillStore {
    /// Store under `$HOME/.shemcp/tmp`, falling back to the system temp
    /// directory when no home is available.
    pub fn new() -> Self {
        let dir = dirs::home_dir()
            .map(|home| home.join(".shemcp").join("tmp"))
            .unwrap_or_else(|| std::env::temp_dir().join("shemcp-tmp"));
        Self { dir }
    }

    /// Store rooted at an explicit directory (tests).
    pub fn with_dir(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Mint paths and URIs for a new execution.
    pub fn new_handle(&self) -> SpillHandle {
        let id = Uuid::new_v4();
        let out = format!("exec-{id}.out");
        let err = format!("exec-{id}.err");
        SpillHandle {
            stdout_path: self.dir.join(&out),
            stdout_uri: format!("{SPILL_URI_PREFIX}{out}"),
            stderr_path: self.dir.join(&err),
            stderr_uri: format!("{SPILL_URI_PREFIX}{err}"),
        }
    }

    /// Map an `mcp://tmp/...` URI back to a path inside the store.
    ///
    /// The basename must be a plain file name; separators and `..` are
    /// rejected so a URI can never address outside the spill directory.
    pub fn resolve_uri(&self, uri: &str) -> Result<PathBuf, SpillError> {
        let basename = uri
            .strip_prefix(SPILL_URI_PREFIX)
            .ok_or_else(|| SpillError::InvalidUri(uri.to_string()))?;
        if basename.is_empty()
            || basename.contains('/')
            || basename.contains('\\')
            || basename.contains("..")
        {
            return Err(SpillError::InvalidUri(uri.to_string()));
        }
        Ok(self.dir.join(basename))
    }

    /// Delete a spill file, logging rather than failing on error.
    pub async fn remove(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "removed spill file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), %err, "failed to remove spill file"),
        }
    }
}

impl Default for SpillStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Size of a spill file in bytes.
pub async fn file_size(path: &Path) -> std::io::Result<u64> {
    Ok(tokio::fs::metadata(path).await?.len())
}

/// Streaming read of `[start, end)`. `end ≤ start` yields an empty buffer;
/// reads past EOF stop at EOF.
pub async fn read_range(path: &Path, start: u64, end: u64) -> std::io::Result<Vec<u8>> {
    if end <= start {
        return Ok(Vec::new());
    }
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let mut data = Vec::with_capacity((end - start) as usize);
    file.take(end - start).read_to_end(&mut data).await?;
    Ok(data)
}

/// Lazily-created append sink for one stream of one execution.
///
/// The first write creates the directory and file. Any I/O error poisons the
/// sink: the partial file is removed and the stream degrades to memory-only.
#[derive(Debug)]
pub(crate) struct SpillSink {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    written: u64,
    failed: bool,
}

impl SpillSink {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            written: 0,
            failed: false,
        }
    }

    pub(crate) async fn append(&mut self, chunk: &[u8]) {
        if self.failed || chunk.is_empty() {
            return;
        }
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                if let Err(err) = tokio::fs::create_dir_all(parent).await {
                    warn!(dir = %parent.display(), %err, "cannot create spill directory");
                    self.failed = true;
                    return;
                }
            }
            match tokio::fs::File::create(&self.path).await {
                Ok(file) => self.file = Some(file),
                Err(err) => {
                    warn!(path = %self.path.display(), %err, "cannot create spill file");
                    self.failed = true;
                    return;
                }
            }
        }
        if let Some(file) = self.file.as_mut() {
            if let Err(err) = file.write_all(chunk).await {
                warn!(path = %self.path.display(), %err, "spill write failed; dropping spill");
                self.failed = true;
                self.file = None;
                let _ = tokio::fs::remove_file(&self.path).await;
                self.written = 0;
                return;
            }
            self.written += chunk.len() as u64;
        }
    }

    /// Flush and report whether the file was retained (any bytes written and
    /// no failure).
    pub(crate) async fn finish(mut self) -> Option<PathBuf> {
        if let Some(file) = self.file.as_mut() {
            if let Err(err) = file.flush().await {
                warn!(path = %self.path.display(), %err, "spill flush failed; dropping spill");
                let _ = tokio::fs::remove_file(&self.path).await;
                return None;
            }
        }
        if self.failed || self.written == 0 {
            if self.file.is_some() {
                let _ = tokio::fs::remove_file(&self.path).await;
            }
            return None;
        }
        Some(self.path)
    }
}
