//! Configuration surface for the shemcp server.
//!
//! Configuration is TOML, loaded from an explicit `--config` path or from
//! `$HOME/.shemcp/config.toml` when present. Every field has a curated
//! default so the server runs usefully with no file at all.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading a configuration file.
///
/// These are fatal at startup: a server with a half-parsed policy must not
/// serve requests.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level configuration for the server.
///
/// The allow/deny lists are ordered regex sources; they are compiled into a
/// [`Policy`](crate::Policy) once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShemcpConfig {
    /// Ordered allow patterns, matched against the reconstructed command line.
    pub allow: Vec<String>,
    /// Ordered deny patterns; deny wins over allow.
    pub deny: Vec<String>,
    /// Ceiling for per-request timeouts, in seconds.
    pub timeout_seconds: u64,
    /// Ceiling for per-stream captured output, in bytes.
    pub max_output_bytes: u64,
    /// Environment variable names forwarded from the parent to children.
    pub env_allowlist: Vec<String>,
    /// Whether sibling git worktrees extend the sandbox boundary.
    pub worktree_detection: bool,
}

impl Default for ShemcpConfig {
    fn default() -> Self {
        Self {
            allow: default_allow(),
            deny: default_deny(),
            timeout_seconds: 300,
            max_output_bytes: 10_000_000,
            env_allowlist: default_env_allowlist(),
            worktree_detection: true,
        }
    }
}

fn default_allow() -> Vec<String> {
    [
        // File and text utilities
        r"^(ls|pwd|cat|grep|rg|find|head|tail|wc|echo|printf|seq|date|tree|stat|file|sort|uniq|cut|awk|sed|diff|which|env|xargs|basename|dirname|du|df)\b",
        // Version control (pushes are governed by the deny list)
        r"^git\b",
        // Rust
        r"^cargo (check|build|test|run|doc|clippy|fmt|tree|metadata|add|update)\b",
        r"^rustc\b",
        r"^rustup\b",
        // Python
        r"^(python|python3)\b",
        r"^(pip|pip3)\b",
        // Node.js
        r"^(node|npm|npx|yarn|pnpm|bun)\b",
        // Go
        r"^go\b",
        // Build tools
        r"^(make|cmake|ninja)\b",
        // Misc dev tools
        r"^(jq|curl|tar|gzip|gunzip|zip|unzip|sha256sum|md5sum)\b",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

fn default_deny() -> Vec<String> {
    [
        // Pushes to protected branches
        r"git push .*\b(main|master|release)\b",
        // Force pushes anywhere
        r"git push .*(--force|-f)\b",
        // History rewrites that reach remotes
        r"git push .*--delete\b",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

fn default_env_allowlist() -> Vec<String> {
    [
        "PATH", "HOME", "USER", "SHELL", "LANG", "LC_ALL", "TERM", "TMPDIR", "TZ", "EDITOR",
        "CARGO_HOME", "RUSTUP_HOME", "GOPATH", "NODE_ENV",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

/// Default config file location, `$HOME/.shemcp/config.toml`.
///
/// Returns `None` when the home directory cannot be determined.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".shemcp").join("config.toml"))
}

impl ShemcpConfig {
    /// Load configuration from `path`, or from the default location, or fall
    /// back to compiled-in defaults.
    ///
    /// An explicit `path` must exist and parse. The default-location file is
    /// optional, but if present it must parse.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_file(path),
            None => match default_config_path() {
                Some(default) if default.is_file() => Self::load_file(&default),
                _ => Ok(Self::default()),
            },
        }
    }

    fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_defaults_are_sane() {
        let config = ShemcpConfig::default();

        assert!(!config.allow.is_empty());
        assert!(!config.deny.is_empty());
        assert_eq!(config.timeout_seconds, 300);
        assert_eq!(config.max_output_bytes, 10_000_000);
        assert!(config.env_allowlist.iter().any(|n| n == "PATH"));
        assert!(config.worktree_detection);
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
allow = ["^echo\\b"]
deny = ["^rm\\b"]
timeout_seconds = 60
max_output_bytes = 500000
env_allowlist = ["PATH"]
worktree_detection = false
"#
        )
        .unwrap();

        let config = ShemcpConfig::load(Some(&path)).unwrap();
        assert_eq!(config.allow, vec!["^echo\\b"]);
        assert_eq!(config.deny, vec!["^rm\\b"]);
        assert_eq!(config.timeout_seconds, 60);
        assert_eq!(config.max_output_bytes, 500_000);
        assert!(!config.worktree_detection);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "timeout_seconds = 30\n").unwrap();

        let config = ShemcpConfig::load(Some(&path)).unwrap();
        assert_eq!(config.timeout_seconds, 30);
        assert!(!config.allow.is_empty());
        assert_eq!(config.max_output_bytes, 10_000_000);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ShemcpConfig::load(Some(&dir.path().join("nope.toml")));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "allow = 12\n").unwrap();

        let result = ShemcpConfig::load(Some(&path));
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }
}
