//! Sandbox root resolution and working-directory validation.
//!
//! The root is picked once at startup and frozen. Every requested cwd must
//! then sit inside the root, or inside a verified sibling git worktree; the
//! check is lexical containment first, then a realpath comparison so symlinks
//! cannot smuggle a path out of the boundary.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info};

use crate::worktree::WorktreeRegistry;

/// Environment overrides for the sandbox root, in precedence order.
pub const SANDBOX_ROOT_ENV_VARS: [&str; 2] = ["SHEMCP_SANDBOX_ROOT", "SHEMCP_ROOT"];

/// Pick the sandbox root for this process.
///
/// Precedence: the first override env var naming an existing directory, then
/// the nearest ancestor of the current directory containing a `.git` entry,
/// then the current directory itself. The result is canonicalized and must
/// not change for the process lifetime.
pub fn resolve_sandbox_root() -> std::io::Result<PathBuf> {
    for var in SANDBOX_ROOT_ENV_VARS {
        if let Ok(value) = std::env::var(var) {
            let path = PathBuf::from(&value);
            if path.is_dir() {
                let root = path.canonicalize()?;
                info!(%var, root = %root.display(), "sandbox root from environment");
                return Ok(root);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    for ancestor in cwd.ancestors() {
        if ancestor.join(".git").exists() {
            let root = ancestor.canonicalize()?;
            info!(root = %root.display(), "sandbox root from enclosing git repository");
            return Ok(root);
        }
    }

    let root = cwd.canonicalize()?;
    info!(root = %root.display(), "sandbox root from current directory");
    Ok(root)
}

/// Why a working directory was refused.
///
/// "Not allowed" and "not accessible" are deliberately distinct so agents can
/// tell a typo from a boundary violation.
#[derive(Debug, Error)]
pub enum CwdError {
    #[error("cwd not allowed: {path} (must be within {root})")]
    Outside { path: String, root: String },
    #[error("cwd not accessible: {path}")]
    NotAccessible { path: String },
    #[error("cwd not allowed: {path} (resolved outside sandbox root)")]
    EscapesRoot { path: String },
}

/// The sandbox boundary plus the session's verified worktree roots.
///
/// The allowlist only grows, and only after `git worktree list` has vouched
/// for a path; concurrent requests may race to insert the same root, which is
/// idempotent.
#[derive(Debug)]
pub struct Sandbox {
    root: PathBuf,
    worktree_detection: bool,
    allowlist: Mutex<BTreeSet<PathBuf>>,
    registry: WorktreeRegistry,
}

impl Sandbox {
    /// Wrap an already-canonicalized root.
    pub fn new(root: PathBuf, worktree_detection: bool) -> Self {
        Self {
            root,
            worktree_detection,
            allowlist: Mutex::new(BTreeSet::new()),
            registry: WorktreeRegistry::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot of the session worktree allowlist.
    pub fn session_worktrees(&self) -> Vec<PathBuf> {
        self.allowlist
            .lock()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Validate a candidate working directory (absolute) and return it in
    /// lexically normalized form.
    ///
    /// Containment is checked against the sandbox root first, then against
    /// the session worktree allowlist, and finally (when enabled) against a
    /// fresh worktree lookup. A contained path must still exist, be
    /// traversable, and realpath-resolve inside its boundary.
    pub async fn validate_cwd(&self, candidate: &Path) -> Result<PathBuf, CwdError> {
        let normalized = normalize_lexical(candidate);

        if normalized.starts_with(&self.root) {
            check_accessible(&normalized, &self.root)?;
            return Ok(normalized);
        }

        if let Some(worktree_root) = self.allowed_worktree_for(&normalized) {
            check_accessible(&normalized, &worktree_root)?;
            return Ok(normalized);
        }

        if self.worktree_detection {
            if let Some(worktree_root) = self
                .registry
                .validate_worktree_path(&normalized, &self.root)
                .await
            {
                debug!(worktree = %worktree_root.display(), "worktree added to session allowlist");
                if let Ok(mut set) = self.allowlist.lock() {
                    set.insert(worktree_root.clone());
                }
                check_accessible(&normalized, &worktree_root)?;
                return Ok(normalized);
            }
        }

        Err(CwdError::Outside {
            path: normalized.display().to_string(),
            root: self.root.display().to_string(),
        })
    }

    fn allowed_worktree_for(&self, path: &Path) -> Option<PathBuf> {
        let set = self.allowlist.lock().ok()?;
        set.iter().find(|root| path.starts_with(root)).cloned()
    }

    /// Drop the cached worktree list (tests).
    pub fn clear_worktree_cache(&self) {
        self.registry.clear();
    }
}

/// Resolve `.` and `..` components without touching the filesystem.
///
/// Only called with absolute inputs; `..` at the root is dropped rather than
/// preserved.
pub(crate) fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// The accessibility half of cwd validation: the directory must exist, be
/// listable and traversable, and its realpath must stay inside the realpath
/// of `boundary`.
fn check_accessible(path: &Path, boundary: &Path) -> Result<(), CwdError> {
    let display = path.display().to_string();

    let metadata = std::fs::metadata(path).map_err(|_| CwdError::NotAccessible {
        path: display.clone(),
    })?;
    if !metadata.is_dir() {
        return Err(CwdError::NotAccessible { path: display });
    }
    std::fs::read_dir(path).map_err(|_| CwdError::NotAccessible {
        path: display.clone(),
    })?;

    let real_path = path.canonicalize().map_err(|_| CwdError::NotAccessible {
        path: display.clone(),
    })?;
    let real_boundary = boundary.canonicalize().map_err(|_| CwdError::NotAccessible {
        path: display.clone(),
    })?;

    if real_path.strip_prefix(&real_boundary).is_err() {
        return Err(CwdError::EscapesRoot { path: display });
    }
    Ok(())
}
