//! shemcp MCP server binary.
//!
//! Runs the sandboxed shell execution service over stdio. The sandbox root is
//! resolved once at startup (SHEMCP_SANDBOX_ROOT / SHEMCP_ROOT, else the
//! enclosing git repository, else the current directory) and the command
//! policy is loaded from `--config` or `~/.shemcp/config.toml` when present.
//!
//! Logs go to stderr and to `~/.shemcp/debug.log`; MCP traffic owns stdout.

use std::fs::OpenOptions;
use std::path::PathBuf;

use clap::Parser;
use rmcp::ServiceExt;
use shemcp::{Policy, ShemcpConfig, resolve_sandbox_root};
use shemcp_mcp::ShemcpServer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// shemcp MCP server - sandboxed shell execution for AI agents
#[derive(Parser, Debug)]
#[command(name = "shemcp-mcp", version)]
#[command(about = "MCP server providing policy-checked sandboxed shell execution")]
struct Args {
    /// Path to a TOML config file. Defaults to ~/.shemcp/config.toml when
    /// that file exists; otherwise compiled-in defaults apply.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

/// Install tracing with an stderr layer plus an append-only file layer at
/// `~/.shemcp/debug.log`. The returned guard must live as long as the
/// process so the non-blocking writer flushes.
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter =
        || EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let log_file = dirs::home_dir()
        .map(|home| home.join(".shemcp"))
        .and_then(|dir| {
            std::fs::create_dir_all(&dir).ok()?;
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("debug.log"))
                .ok()
        });

    match log_file {
        Some(file) => {
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(env_filter())
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(env_filter())
                .init();
            tracing::warn!("no home directory; debug.log disabled");
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging();

    let config = ShemcpConfig::load(args.config.as_deref())?;
    let policy = Policy::from_config(&config)?;
    let sandbox_root = resolve_sandbox_root()?;

    tracing::info!(
        root = %sandbox_root.display(),
        allow_rules = policy.allow_sources().len(),
        deny_rules = policy.deny_sources().len(),
        worktree_detection = policy.worktree_detection(),
        "starting shemcp MCP server"
    );

    let server = ShemcpServer::new(policy, sandbox_root);

    let service = server
        .serve(rmcp::transport::stdio())
        .await
        .inspect_err(|e| {
            tracing::error!("failed to start MCP service: {}", e);
        })?;

    tracing::info!("shemcp MCP server running");

    service.waiting().await?;

    tracing::info!("shemcp MCP server shutting down");

    Ok(())
}
