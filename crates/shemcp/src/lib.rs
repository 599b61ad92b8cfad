//! shemcp: sandboxed shell execution for AI agents.
//!
//! This crate implements the policy-and-execution pipeline behind the shemcp
//! MCP server: sandbox root resolution, command normalization (env prefixes
//! and `bash -c` wrappers), regex allow/deny policy, working-directory
//! validation with git-worktree awareness, and bounded subprocess execution
//! with cursor pagination and disk spill for large outputs.
//!
//! The MCP transport and tool schemas live in the `shemcp-mcp` crate; this
//! crate knows nothing about JSON-RPC.

pub mod command;
mod config;
mod executor;
mod page;
mod policy;
mod sandbox;
mod spill;
mod worktree;

pub use config::{ConfigError, ShemcpConfig, default_config_path};
pub use executor::{
    ExecError, ExecOutcome, ExecRequest, Executor, OnLargeOutput, assemble_command,
    build_child_env, effective_max_output_bytes, effective_timeout_ms,
};
pub use page::{
    Cursor, CursorError, DEFAULT_LIMIT_BYTES, DEFAULT_LIMIT_LINES, MAX_LIMIT_BYTES,
    MAX_LIMIT_LINES, PageError, PageRequest, count_lines, parse_cursor, parse_page, sniff_mime,
};
pub use policy::{Policy, PolicyCheck, PolicyError, RuleType};
pub use sandbox::{CwdError, SANDBOX_ROOT_ENV_VARS, Sandbox, resolve_sandbox_root};
pub use spill::{SPILL_URI_PREFIX, SpillError, SpillHandle, SpillStore, file_size, read_range};
pub use worktree::{WorktreeInfo, WorktreeRegistry};
