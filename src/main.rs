use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use db_diagnostics::application::*;
use db_diagnostics::config::{DiagnosticsConfig, LogFormat};
use db_diagnostics::diagnostics::DiagnosticCategories;
use db_diagnostics::monitoring::MonitorMode;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "db-diag")]
#[command(about = "PostgreSQL health diagnostics, baselines and triage")]
#[command(version)]
struct Cli {
    /// Connection target (URL or key=value descriptor)
    #[arg(long, env = "DBDIAG_TARGET", global = true, hide_env_values = true)]
    target: Option<String>,

    /// TOML configuration file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full diagnostic suite
    Run {
        /// Comma separated categories (connection,network,query,server,database,pool,stability) or "all"
        #[arg(long, default_value = "all")]
        categories: DiagnosticCategories,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Five-stage root cause triage
    Triage {
        #[arg(long)]
        json: bool,
    },
    /// Baseline capture and comparison
    Baseline {
        #[command(subcommand)]
        command: BaselineCommands,
    },
    /// Run diagnostics on an interval until interrupted
    Monitor {
        #[arg(long, default_value = "all")]
        categories: DiagnosticCategories,
        /// Interval between runs in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
        /// "full" or "quick"
        #[arg(long)]
        mode: Option<MonitorMode>,
    },
    /// Sample a client-side connection pool and rate its health
    Pool {
        #[arg(long, default_value = "10")]
        max_connections: u32,
        #[arg(long, default_value = "10")]
        samples: u32,
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum BaselineCommands {
    /// Capture and store a new baseline
    Capture {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "10")]
        samples: u32,
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },
    /// Compare a live run against a stored baseline
    Compare {
        /// Baseline name; defaults to the newest baseline for the target
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List stored baselines
    List {
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(config: &DiagnosticsConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let registry = tracing_subscriber::registry().with(filter);

    // Reports go to stdout, logs to stderr
    match config.logging.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<DiagnosticsConfig> {
    match path {
        Some(path) => DiagnosticsConfig::from_file(path),
        None => DiagnosticsConfig::from_env(),
    }
}

fn require_target(target: Option<String>) -> Result<String> {
    target.context("No target given; pass --target or set DBDIAG_TARGET")
}

/// Token cancelled on Ctrl-C so in-flight probes stop promptly.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("🛑 Interrupt received, shutting down...");
                trigger.cancel();
            }
            Err(e) => warn!("Unable to listen for Ctrl-C: {}", e),
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_ref()).context("Failed to load configuration")?;
    init_logging(&config);

    let app = Application::new(config)?;
    let token = shutdown_token();

    match cli.command {
        Commands::Run { categories, json } => {
            let target = require_target(cli.target)?;
            let handler = RunCommandHandler::new(app.container.clone());
            handler.run(&target, categories, json, &token).await
        }
        Commands::Triage { json } => {
            let target = require_target(cli.target)?;
            let handler = TriageCommandHandler::new(app.container.clone());
            handler.run(&target, json, &token).await
        }
        Commands::Baseline { command } => {
            handle_baseline_command(command, cli.target, &app, &token).await
        }
        Commands::Monitor {
            categories,
            interval_ms,
            mode,
        } => {
            let target = require_target(cli.target)?;
            let handler = MonitorCommandHandler::new(app.container.clone());
            handler
                .run(
                    &target,
                    categories,
                    interval_ms.map(Duration::from_millis),
                    mode,
                    &token,
                )
                .await
        }
        Commands::Pool {
            max_connections,
            samples,
            interval_ms,
            json,
        } => {
            let target = require_target(cli.target)?;
            let handler = PoolCommandHandler::new(app.container.clone());
            handler
                .check(
                    &target,
                    max_connections,
                    samples,
                    Duration::from_millis(interval_ms),
                    json,
                    &token,
                )
                .await
        }
    }
}

async fn handle_baseline_command(
    command: BaselineCommands,
    target: Option<String>,
    app: &Application,
    token: &CancellationToken,
) -> Result<()> {
    let handler = BaselineCommandHandler::new(app.container.clone());
    match command {
        BaselineCommands::Capture {
            name,
            samples,
            interval_ms,
        } => {
            let target = require_target(target)?;
            handler
                .capture(&target, &name, samples, Duration::from_millis(interval_ms), token)
                .await
        }
        BaselineCommands::Compare { name, json } => {
            let target = require_target(target)?;
            handler.compare(&target, name.as_deref(), json, token).await
        }
        BaselineCommands::List { json } => handler.list(json).await,
    }
}
