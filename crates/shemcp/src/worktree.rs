//! Sibling git-worktree discovery and verification.
//!
//! A requested path that falls outside the sandbox root may still be a
//! legitimate checkout of the same repository (`myproject-feature` next to
//! `myproject`). The registry applies a cheap shape filter before asking
//! `git worktree list --porcelain` for the authoritative answer, and caches
//! that answer for a minute.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// How long a fetched worktree list stays valid.
pub const WORKTREE_CACHE_TTL: Duration = Duration::from_secs(60);

/// Cap on the `git worktree list` subprocess.
const GIT_TIMEOUT: Duration = Duration::from_secs(5);

/// One record from `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub head: String,
    pub branch: Option<String>,
}

#[derive(Debug)]
struct CacheEntry {
    worktrees: Vec<WorktreeInfo>,
    fetched_at: Instant,
    root: PathBuf,
}

#[derive(Debug, Error)]
enum WorktreeError {
    #[error("failed to run git: {0}")]
    Io(#[from] std::io::Error),
    #[error("git worktree list timed out")]
    Timeout,
    #[error("git worktree list failed: {0}")]
    Git(String),
}

/// TTL cache over `git worktree list` for a single sandbox root.
#[derive(Debug, Default)]
pub struct WorktreeRegistry {
    cache: Mutex<Option<CacheEntry>>,
}

impl WorktreeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the worktree root covering `requested`, if `requested` is a
    /// verified sibling worktree of `sandbox_root` or lies inside one.
    ///
    /// Subprocess failures are logged and treated as "no worktrees"; callers
    /// then reject the path through the ordinary boundary error.
    pub async fn validate_worktree_path(
        &self,
        requested: &Path,
        sandbox_root: &Path,
    ) -> Option<PathBuf> {
        let candidate = worktree_shape_candidate(requested, sandbox_root)?;
        let worktrees = self.worktrees_for(sandbox_root).await;
        worktrees
            .iter()
            .find(|wt| candidate == wt.path || candidate.starts_with(&wt.path))
            .map(|wt| wt.path.clone())
    }

    /// Drop the cache so the next lookup refetches (tests).
    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }

    async fn worktrees_for(&self, sandbox_root: &Path) -> Vec<WorktreeInfo> {
        if let Ok(cache) = self.cache.lock() {
            if let Some(entry) = cache.as_ref() {
                if entry.root == sandbox_root && entry.fetched_at.elapsed() < WORKTREE_CACHE_TTL {
                    return entry.worktrees.clone();
                }
            }
        }

        let worktrees = match fetch_worktrees(sandbox_root).await {
            Ok(list) => {
                debug!(count = list.len(), "fetched git worktree list");
                list
            }
            Err(err) => {
                warn!(%err, "git worktree list failed; treating as no worktrees");
                Vec::new()
            }
        };

        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some(CacheEntry {
                worktrees: worktrees.clone(),
                fetched_at: Instant::now(),
                root: sandbox_root.to_path_buf(),
            });
        }
        worktrees
    }
}

/// Shape filter: walking up from `requested`, find the ancestor that sits
/// next to the sandbox root and whose name extends the root's name
/// (`myproject` → `myproject-feature`). The root itself never qualifies.
fn worktree_shape_candidate(requested: &Path, sandbox_root: &Path) -> Option<PathBuf> {
    let root_parent = sandbox_root.parent()?;
    let root_name = sandbox_root.file_name()?.to_str()?;

    let mut current = Some(requested);
    while let Some(path) = current {
        if path == sandbox_root {
            return None;
        }
        if path.parent() == Some(root_parent) {
            let name = path.file_name()?.to_str()?;
            if name != root_name && name.starts_with(root_name) {
                return Some(path.to_path_buf());
            }
            return None;
        }
        current = path.parent();
    }
    None
}

async fn fetch_worktrees(sandbox_root: &Path) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let output = tokio::time::timeout(
        GIT_TIMEOUT,
        Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(sandbox_root)
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| WorktreeError::Timeout)??;

    if !output.status.success() {
        return Err(WorktreeError::Git(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(parse_porcelain(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `git worktree list --porcelain`: blank-line-separated records of
/// `worktree <abs>`, `HEAD <sha>`, and `branch <ref>` or `detached`. Unknown
/// attribute lines are ignored for forward compatibility.
fn parse_porcelain(output: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut head = String::new();
    let mut branch: Option<String> = None;

    let mut flush = |path: &mut Option<PathBuf>, head: &mut String, branch: &mut Option<String>| {
        if let Some(p) = path.take() {
            worktrees.push(WorktreeInfo {
                path: p,
                head: std::mem::take(head),
                branch: branch.take(),
            });
        } else {
            head.clear();
            *branch = None;
        }
    };

    for line in output.lines() {
        if line.is_empty() {
            flush(&mut path, &mut head, &mut branch);
        } else if let Some(rest) = line.strip_prefix("worktree ") {
            path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            head = rest.to_string();
        } else if let Some(rest) = line.strip_prefix("branch ") {
            branch = Some(rest.to_string());
        }
        // "detached" and unknown attributes fall through
    }
    flush(&mut path, &mut head, &mut branch);
    worktrees
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn test_parse_porcelain_records() {
        let output = "worktree /u/proj\n\
                      HEAD abc123\n\
                      branch refs/heads/main\n\
                      \n\
                      worktree /u/proj-feature\n\
                      HEAD def456\n\
                      detached\n";
        let worktrees = parse_porcelain(output);

        assert_eq!(worktrees.len(), 2);
        assert_eq!(worktrees[0].path, PathBuf::from("/u/proj"));
        assert_eq!(worktrees[0].head, "abc123");
        assert_eq!(worktrees[0].branch.as_deref(), Some("refs/heads/main"));
        assert_eq!(worktrees[1].path, PathBuf::from("/u/proj-feature"));
        assert!(worktrees[1].branch.is_none());
    }

    #[test]
    fn test_parse_porcelain_ignores_unknown_lines() {
        let output = "worktree /u/proj\nHEAD abc\nlocked reason\nprunable gone\n";
        let worktrees = parse_porcelain(output);
        assert_eq!(worktrees.len(), 1);
    }

    #[test]
    fn test_parse_porcelain_empty() {
        assert!(parse_porcelain("").is_empty());
    }

    #[test]
    fn test_shape_candidate_direct_sibling() {
        let candidate = worktree_shape_candidate(
            Path::new("/u/proj-feature"),
            Path::new("/u/proj"),
        );
        assert_eq!(candidate, Some(PathBuf::from("/u/proj-feature")));
    }

    #[test]
    fn test_shape_candidate_nested_path() {
        let candidate = worktree_shape_candidate(
            Path::new("/u/proj_bugfix/src/deep"),
            Path::new("/u/proj"),
        );
        assert_eq!(candidate, Some(PathBuf::from("/u/proj_bugfix")));
    }

    #[test]
    fn test_shape_rejects_unrelated_sibling() {
        assert!(worktree_shape_candidate(Path::new("/u/other"), Path::new("/u/proj")).is_none());
    }

    #[test]
    fn test_shape_rejects_the_root_itself() {
        assert!(worktree_shape_candidate(Path::new("/u/proj"), Path::new("/u/proj")).is_none());
        assert!(
            worktree_shape_candidate(Path::new("/u/proj/src"), Path::new("/u/proj")).is_none()
        );
    }

    #[test]
    fn test_shape_rejects_prefix_of_root_name() {
        // "pro" does not extend "proj"
        assert!(worktree_shape_candidate(Path::new("/u/pro"), Path::new("/u/proj")).is_none());
    }

    #[tokio::test]
    async fn test_registry_returns_none_outside_git() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("proj");
        let sibling = dir.path().join("proj-feature");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&sibling).unwrap();

        let registry = WorktreeRegistry::new();
        // Not a git repository: subprocess fails, cached as empty.
        let result = registry.validate_worktree_path(&sibling, &root).await;
        assert!(result.is_none());
    }

    /// Build a repo with one commit and a sibling worktree named
    /// `<root>-feature`. Returns `None` when git is unavailable.
    pub(crate) fn git_fixture() -> Option<(tempfile::TempDir, PathBuf, PathBuf)> {
        use std::process::Command;

        let git_ok = Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !git_ok {
            eprintln!("skipping: git not available");
            return None;
        }

        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        let root = base.join("proj");
        std::fs::create_dir_all(&root).unwrap();

        let git = |args: &[&str]| {
            let output = Command::new("git")
                .args(args)
                .current_dir(&root)
                .env("GIT_CONFIG_GLOBAL", "/dev/null")
                .env("GIT_CONFIG_SYSTEM", "/dev/null")
                .env("GIT_AUTHOR_NAME", "test")
                .env("GIT_AUTHOR_EMAIL", "test@example.com")
                .env("GIT_COMMITTER_NAME", "test")
                .env("GIT_COMMITTER_EMAIL", "test@example.com")
                .output()
                .unwrap();
            assert!(
                output.status.success(),
                "git {:?} failed: {}",
                args,
                String::from_utf8_lossy(&output.stderr)
            );
        };

        git(&["init", "--quiet"]);
        std::fs::write(root.join("README"), "fixture\n").unwrap();
        git(&["add", "README"]);
        git(&["commit", "--quiet", "-m", "init"]);
        git(&["worktree", "add", "--quiet", "../proj-feature"]);

        let worktree = base.join("proj-feature");
        Some((dir, root, worktree))
    }

    #[tokio::test]
    async fn test_real_worktree_is_verified() {
        let Some((_dir, root, worktree)) = git_fixture() else {
            return;
        };

        let registry = WorktreeRegistry::new();
        let verified = registry
            .validate_worktree_path(&worktree.join("src"), &root)
            .await;
        assert_eq!(verified, Some(worktree.clone()));

        // An unrelated sibling stays rejected even though git ran.
        let unrelated = root.parent().unwrap().join("other");
        assert!(
            registry
                .validate_worktree_path(&unrelated, &root)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_registry_caches_between_calls() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("proj");
        std::fs::create_dir_all(&root).unwrap();

        let registry = WorktreeRegistry::new();
        let _ = registry
            .validate_worktree_path(&dir.path().join("proj-x"), &root)
            .await;
        assert!(registry.cache.lock().unwrap().is_some());

        registry.clear();
        assert!(registry.cache.lock().unwrap().is_none());
    }
}
