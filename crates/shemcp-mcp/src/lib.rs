//! shemcp MCP server.
//!
//! Exposes the shemcp execution pipeline over the Model Context Protocol as
//! three tools:
//!
//! - `shell_exec` — run a command under the sandbox policy with mandatory
//!   cursor pagination,
//! - `read_file_chunk` — range-read a spill file by its `mcp://tmp/` URI,
//! - `shell_info` — report the sandbox root and the active policy patterns.
//!
//! All responses are structured JSON; denials and input errors come back as
//! tool errors with a plain-text explanation the agent can act on.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rmcp::{
    ErrorData as McpError, ServerHandler,
    model::*,
    schemars::{self, JsonSchema},
    service::{RequestContext, RoleServer},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use shemcp::command::{
    StrippedCommand, WrapperParse, parse_wrapper, strip_env_prefix, tokenize,
};
use shemcp::{
    Cursor, DEFAULT_LIMIT_BYTES, ExecRequest, Executor, MAX_LIMIT_BYTES, OnLargeOutput, Policy,
    PolicyCheck, Sandbox, SpillStore, assemble_command, build_child_env, count_lines,
    effective_max_output_bytes, effective_timeout_ms, file_size, parse_cursor, parse_page,
    read_range, sniff_mime,
};

/// Parameters for the `shell_exec` tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ShellExecParams {
    /// Executable to run. Leading `KEY=value` tokens are treated as
    /// environment assignments for the command.
    pub cmd: String,

    /// Arguments, in order.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory, relative to the sandbox root. Absolute paths are
    /// rejected. Defaults to the sandbox root itself.
    #[serde(default)]
    pub cwd: Option<String>,

    /// Legacy timeout in milliseconds (1..300000). `timeout_seconds` wins
    /// when both are present.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Timeout in seconds (1..300).
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Per-stream output cap in bytes (1000..10000000).
    #[serde(default)]
    pub max_output_bytes: Option<u64>,

    /// Mandatory pagination object:
    /// `{cursor: {cursor_type: "bytes", offset: >= 0}, limit_bytes?: 1..40000,
    /// limit_lines?: 1..100000}`.
    #[serde(default)]
    pub page: Option<Value>,

    /// What to do when output exceeds the page: "spill" (default) mirrors the
    /// full stream to a temp file, "truncate" keeps only the page, "error"
    /// fails the call.
    #[serde(default)]
    pub on_large_output: Option<String>,
}

/// Parameters for the `read_file_chunk` tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReadFileChunkParams {
    /// Spill file URI; must start with `mcp://tmp/`.
    pub uri: String,

    /// Byte cursor `{cursor_type: "bytes", offset: >= 0}`; defaults to the
    /// start of the file.
    #[serde(default)]
    pub cursor: Option<Value>,

    /// Bytes per chunk (default 40000, max 40000).
    #[serde(default)]
    pub limit_bytes: Option<i64>,
}

/// Parameters for the `shell_info` tool (none).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ShellInfoParams {}

#[derive(Debug, Serialize)]
struct EffectiveLimits {
    timeout_ms: u64,
    max_output_bytes: u64,
    limit_bytes: u64,
    limit_lines: u64,
}

#[derive(Debug, Serialize)]
struct ShellExecResponse {
    exit_code: i32,
    signal: Option<String>,
    duration_ms: u64,
    stdout_chunk: String,
    stderr_chunk: String,
    bytes_start: u64,
    bytes_end: u64,
    total_bytes: u64,
    truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<Cursor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    spill_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stderr_spill_uri: Option<String>,
    mime: String,
    line_count: u64,
    stderr_count: u64,
    cmdline: Vec<String>,
    effective_cmdline: Vec<String>,
    cwd: String,
    effective_limits: EffectiveLimits,
}

#[derive(Debug, Serialize)]
struct ReadFileChunkResponse {
    data: String,
    bytes_start: u64,
    bytes_end: u64,
    total_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<Cursor>,
    mime: String,
}

/// A request that never reached (or failed inside) the executor.
///
/// `Input` is prefixed with "Error: " on the wire; `Verbatim` carries
/// already-formatted text such as the policy denial block.
#[derive(Debug)]
enum Rejection {
    Input(String),
    Verbatim(String),
}

impl Rejection {
    fn into_text(self) -> String {
        match self {
            Rejection::Input(message) => format!("Error: {message}"),
            Rejection::Verbatim(text) => text,
        }
    }
}

/// MCP server wrapping the shemcp pipeline.
#[derive(Clone)]
pub struct ShemcpServer {
    policy: Arc<Policy>,
    sandbox: Arc<Sandbox>,
    executor: Arc<Executor>,
    spill: SpillStore,
}

impl std::fmt::Debug for ShemcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShemcpServer")
            .field("sandbox_root", &self.sandbox.root())
            .finish_non_exhaustive()
    }
}

impl ShemcpServer {
    /// Create a server around a compiled policy and a canonicalized sandbox
    /// root, spilling to the default `$HOME/.shemcp/tmp` store.
    pub fn new(policy: Policy, sandbox_root: PathBuf) -> Self {
        Self::with_spill_store(policy, sandbox_root, SpillStore::new())
    }

    /// As [`ShemcpServer::new`] but with an explicit spill directory (tests).
    pub fn with_spill_store(policy: Policy, sandbox_root: PathBuf, spill: SpillStore) -> Self {
        let sandbox = Sandbox::new(sandbox_root, policy.worktree_detection());
        Self {
            policy: Arc::new(policy),
            sandbox: Arc::new(sandbox),
            executor: Arc::new(Executor::new(spill.clone())),
            spill,
        }
    }

    pub fn sandbox_root(&self) -> &Path {
        self.sandbox.root()
    }

    // ==================== shell_exec ====================

    async fn shell_exec(&self, params: ShellExecParams) -> Result<CallToolResult, McpError> {
        match self.run_shell_exec(params).await {
            Ok(response) => {
                let value = serde_json::to_value(response).map_err(|err| {
                    McpError::internal_error(format!("serialize response: {err}"), None)
                })?;
                Ok(CallToolResult::structured(value))
            }
            Err(rejection) => Ok(CallToolResult::error(vec![Content::text(
                rejection.into_text(),
            )])),
        }
    }

    async fn run_shell_exec(
        &self,
        params: ShellExecParams,
    ) -> Result<ShellExecResponse, Rejection> {
        if params.cmd.trim().is_empty() {
            return Err(Rejection::Input("cmd must be a non-empty string".to_string()));
        }

        let page = parse_page(params.page.as_ref())
            .map_err(|err| Rejection::Input(err.to_string()))?;
        let on_large_output = parse_on_large_output(params.on_large_output.as_deref())?;

        let stripped = strip_env_prefix(&params.cmd, &params.args)
            .map_err(|err| Rejection::Input(err.to_string()))?;
        let wrapper = parse_wrapper(&stripped.cmd, &stripped.args)
            .map_err(|err| Rejection::Input(err.to_string()))?;

        // Original tokens (env prefixes included) for echo and diagnostics.
        let mut cmdline = vec![params.cmd.clone()];
        cmdline.extend(params.args.iter().cloned());

        let policy_line = reconstruct_command_line(&stripped, &wrapper);
        let check = self.policy.check_command(&policy_line);
        if !check.allowed {
            debug!(command = %policy_line, reason = %check.reason, "command denied");
            return Err(Rejection::Verbatim(format_denial(
                &check,
                &policy_line,
                &cmdline,
                &wrapper,
            )));
        }

        let cwd_param = params.cwd.as_deref().unwrap_or(".");
        if Path::new(cwd_param).is_absolute() {
            return Err(Rejection::Input(format!(
                "cwd must be relative to the sandbox root; received {cwd_param} (sandbox root: {})",
                self.sandbox.root().display()
            )));
        }
        let candidate = self.sandbox.root().join(cwd_param);
        let cwd = self
            .sandbox
            .validate_cwd(&candidate)
            .await
            .map_err(|err| Rejection::Input(err.to_string()))?;

        let timeout_ms = effective_timeout_ms(
            params.timeout_seconds,
            params.timeout_ms,
            self.policy.timeout_ms(),
        );
        let max_output_bytes =
            effective_max_output_bytes(params.max_output_bytes, self.policy.max_output_bytes());

        let env = build_child_env(self.policy.env_allowlist(), &stripped.env_vars);
        let (program, args) = assemble_command(&stripped, &wrapper);
        let mut effective_cmdline = vec![program.clone()];
        effective_cmdline.extend(args.iter().cloned());

        let outcome = self
            .executor
            .execute(ExecRequest {
                program,
                args,
                cwd: cwd.clone(),
                env,
                timeout: Duration::from_millis(timeout_ms),
                cursor_offset: page.cursor.offset,
                limit_bytes: page.limit_bytes,
                limit_lines: page.limit_lines,
                max_output_bytes,
                on_large_output,
            })
            .await
            .map_err(|err| Rejection::Verbatim(err.to_string()))?;

        let mime = sniff_mime(&outcome.stdout_chunk).to_string();
        Ok(ShellExecResponse {
            exit_code: outcome.exit_code,
            signal: outcome.signal,
            duration_ms: outcome.duration_ms,
            line_count: count_lines(&outcome.stdout_chunk),
            stderr_count: count_lines(&outcome.stderr_chunk),
            stdout_chunk: outcome.stdout_chunk,
            stderr_chunk: outcome.stderr_chunk,
            bytes_start: outcome.bytes_start,
            bytes_end: outcome.bytes_end,
            total_bytes: outcome.total_bytes,
            truncated: outcome.truncated,
            next_cursor: outcome.next_cursor,
            spill_uri: outcome.spill_uri,
            stderr_spill_uri: outcome.stderr_spill_uri,
            mime,
            cmdline,
            effective_cmdline,
            cwd: cwd.display().to_string(),
            effective_limits: EffectiveLimits {
                timeout_ms,
                max_output_bytes,
                limit_bytes: page.limit_bytes,
                limit_lines: page.limit_lines,
            },
        })
    }

    // ==================== read_file_chunk ====================

    async fn read_file_chunk(
        &self,
        params: ReadFileChunkParams,
    ) -> Result<CallToolResult, McpError> {
        match self.run_read_file_chunk(params).await {
            Ok(response) => {
                let value = serde_json::to_value(response).map_err(|err| {
                    McpError::internal_error(format!("serialize response: {err}"), None)
                })?;
                Ok(CallToolResult::structured(value))
            }
            Err(rejection) => Ok(CallToolResult::error(vec![Content::text(
                rejection.into_text(),
            )])),
        }
    }

    async fn run_read_file_chunk(
        &self,
        params: ReadFileChunkParams,
    ) -> Result<ReadFileChunkResponse, Rejection> {
        let path = self
            .spill
            .resolve_uri(&params.uri)
            .map_err(|err| Rejection::Input(err.to_string()))?;

        let offset = match params.cursor.as_ref() {
            Some(value) => {
                parse_cursor(value)
                    .map_err(|err| Rejection::Input(format!("invalid cursor: {err}")))?
                    .offset
            }
            None => 0,
        };

        let limit_bytes = match params.limit_bytes {
            None => DEFAULT_LIMIT_BYTES,
            Some(value) if value >= 1 && value as u64 <= MAX_LIMIT_BYTES => value as u64,
            Some(_) => {
                return Err(Rejection::Input(format!(
                    "limit_bytes must be between 1 and {MAX_LIMIT_BYTES}"
                )));
            }
        };

        let total_bytes = file_size(&path)
            .await
            .map_err(|_| Rejection::Input(format!("file not found: {}", params.uri)))?;

        let bytes_start = offset.min(total_bytes);
        let bytes_end = bytes_start.saturating_add(limit_bytes).min(total_bytes);
        let data = read_range(&path, bytes_start, bytes_end)
            .await
            .map_err(|err| Rejection::Input(format!("failed to read {}: {err}", params.uri)))?;

        let next_cursor = (bytes_end < total_bytes).then(|| Cursor::bytes(bytes_end));
        if next_cursor.is_none() {
            // The caller has consumed to the end; the spill file is done.
            self.spill.remove(&path).await;
        }

        let data = String::from_utf8_lossy(&data).into_owned();
        let mime = sniff_mime(&data).to_string();
        Ok(ReadFileChunkResponse {
            data,
            bytes_start,
            bytes_end,
            total_bytes,
            next_cursor,
            mime,
        })
    }

    // ==================== shell_info ====================

    fn shell_info(&self) -> Result<CallToolResult, McpError> {
        let value = serde_json::json!({
            "sandbox_root": self.sandbox.root().display().to_string(),
            "server_version": env!("CARGO_PKG_VERSION"),
            "command_policy": {
                "allow": self.policy.allow_sources(),
                "deny": self.policy.deny_sources(),
            },
        });
        Ok(CallToolResult::structured(value))
    }

    // ==================== tool descriptors ====================

    fn tool<P: JsonSchema>(name: &'static str, title: &'static str, description: String) -> Tool {
        let schema = schemars::schema_for!(P);
        let schema_json = serde_json::to_value(schema).unwrap_or_default();
        let input_schema = match schema_json {
            Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        };
        Tool {
            name: name.into(),
            title: Some(title.into()),
            description: Some(description.into()),
            input_schema,
            output_schema: None,
            annotations: None,
            icons: None,
        }
    }

    fn shell_exec_tool(&self) -> Tool {
        let description = format!(
            "Execute a command inside the sandbox at {}. Commands are checked \
            against a regex allow/deny policy; bash/sh -c wrappers are unwrapped \
            so the inner command is what gets checked. Responses are paginated \
            by byte cursor; outputs larger than one page spill to a temp file \
            readable with read_file_chunk. The `page` object and its `cursor` \
            are required, and `cwd` must be relative to the sandbox root.",
            self.sandbox.root().display()
        );
        Self::tool::<ShellExecParams>("shell_exec", "Execute Shell Command", description)
    }

    fn read_file_chunk_tool(&self) -> Tool {
        Self::tool::<ReadFileChunkParams>(
            "read_file_chunk",
            "Read Spill File Chunk",
            "Read a byte range from a spill file produced by shell_exec. The \
            URI must start with mcp://tmp/. Chunks are at most 40000 bytes; \
            follow next_cursor to read the rest."
                .to_string(),
        )
    }

    fn shell_info_tool(&self) -> Tool {
        Self::tool::<ShellInfoParams>(
            "shell_info",
            "Sandbox Info",
            "Report the sandbox root, server version, and the active command \
            policy (allow and deny patterns)."
                .to_string(),
        )
    }
}

impl ServerHandler for ShemcpServer {
    fn get_info(&self) -> ServerInfo {
        let instructions = format!(
            "shemcp provides sandboxed shell execution rooted at {}. Use \
            'shell_exec' to run commands (pagination is mandatory; start with \
            cursor offset 0), 'read_file_chunk' to fetch spilled output by \
            URI, and 'shell_info' to inspect the command policy. Commands and \
            working directories outside the policy are denied with the \
            matching rule so you can adjust.",
            self.sandbox.root().display()
        );

        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(instructions.into()),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: vec![
                self.shell_exec_tool(),
                self.read_file_chunk_tool(),
                self.shell_info_tool(),
            ],
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let arguments = request
            .arguments
            .map(Value::Object)
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        match request.name.as_ref() {
            "shell_exec" => {
                let params: ShellExecParams = serde_json::from_value(arguments)
                    .map_err(|err| McpError::invalid_params(format!("Invalid parameters: {err}"), None))?;
                info!(cmd = %params.cmd, "shell_exec");
                self.shell_exec(params).await
            }
            "read_file_chunk" => {
                let params: ReadFileChunkParams = serde_json::from_value(arguments)
                    .map_err(|err| McpError::invalid_params(format!("Invalid parameters: {err}"), None))?;
                self.read_file_chunk(params).await
            }
            "shell_info" => self.shell_info(),
            other => Err(McpError::invalid_params(
                format!("Unknown tool: {other}"),
                None,
            )),
        }
    }
}

fn parse_on_large_output(value: Option<&str>) -> Result<OnLargeOutput, Rejection> {
    match value {
        None | Some("spill") => Ok(OnLargeOutput::Spill),
        Some("truncate") => Ok(OnLargeOutput::Truncate),
        Some("error") => Ok(OnLargeOutput::Error),
        Some(other) => Err(Rejection::Input(format!(
            "on_large_output must be one of spill|truncate|error; received {other}"
        ))),
    }
}

/// The command line the policy sees: the tokenized wrapper command string for
/// wrappers, otherwise the stripped cmd + args, joined by single spaces.
fn reconstruct_command_line(stripped: &StrippedCommand, wrapper: &WrapperParse) -> String {
    if wrapper.is_wrapper {
        if let Some(command_string) = wrapper.command_string.as_deref() {
            return tokenize(command_string).join(" ");
        }
    }
    let mut tokens = vec![stripped.cmd.clone()];
    tokens.extend(stripped.args.iter().cloned());
    tokens.join(" ")
}

fn format_denial(
    check: &PolicyCheck,
    policy_line: &str,
    cmdline: &[String],
    wrapper: &WrapperParse,
) -> String {
    let mut text = format!(
        "Denied by policy: {policy_line}\n\nReason: {}",
        check.reason
    );
    if let (Some(rule), Some(rule_type)) = (&check.matched_rule, &check.rule_type) {
        text.push_str(&format!("\nMatched {rule_type} rule: /{rule}/"));
    }
    if wrapper.is_wrapper {
        text.push_str(&format!(
            "\n\nOriginal command: {}\nUnwrapped command: {policy_line}",
            cmdline.join(" ")
        ));
    }
    text
}
