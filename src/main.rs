#![forbid(unsafe_code)]

//! `agent-huddle`: host or join an agent team and stream its events.
//!
//! Events observed on the local bus are printed to stdout as one JSON
//! object per line; logs go to stderr.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use agent_huddle::team::{EventStream, JoinOptions, TeamManager};
use agent_huddle::{AppError, Result, TeamConfig};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-huddle", about = "Encrypted agent team coordination", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Host a new team and become its coordinator.
    Host {
        /// Team id to create or resume.
        #[arg(long)]
        team_id: Option<String>,
    },
    /// Join the team coordinated at ADDRESS.
    Join {
        /// Coordinator address (`host:port`).
        address: String,
        /// Role advertised to the team.
        #[arg(long, default_value = "editor")]
        role: String,
        /// Promise not to mutate shared state.
        #[arg(long)]
        read_only: bool,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = match args.config {
        Some(path) => TeamConfig::load_from_path(path)?,
        None => TeamConfig::new(default_root()?),
    }
    .apply_env_overrides()?;
    info!(root = %config.root.display(), "configuration loaded");

    let manager = TeamManager::open(config)?;
    let events = manager.subscribe();

    // ── Join ────────────────────────────────────────────
    let options = match args.command {
        Command::Host { team_id } => {
            let options = JoinOptions::host();
            match team_id {
                Some(team_id) => options.with_team_id(team_id),
                None => options,
            }
        }
        Command::Join {
            address,
            role,
            read_only,
        } => JoinOptions::connect(address)
            .with_role(role)
            .read_only(read_only),
    };
    let state = manager.join(options).await?;
    info!(
        team_id = %state.team_id,
        broker = %state.broker_address,
        node_id = manager.node_id(),
        "team ready"
    );
    println!("{}", state.broker_address);

    // ── Stream events until shutdown ────────────────────
    tokio::select! {
        () = stream_events(events) => {}
        () = shutdown_signal() => info!("shutdown signal received"),
    }

    if let Err(err) = manager.leave().await {
        error!(%err, "leave failed");
    }
    info!("agent-huddle shut down");
    Ok(())
}

async fn stream_events(mut events: EventStream) {
    while let Some(event) = events.recv().await {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(err) => error!(%err, kind = event.kind(), "failed to encode event"),
        }
    }
}

fn default_root() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".agent-huddle").join("teams"))
        .ok_or_else(|| AppError::Config("HOME is not set; pass --config".into()))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
