//! `goban`: run Go engines from the command line.
//!
//! Loads an engine config (see [`config`] for the environment overrides),
//! starts the engine and either analyses one position, streams live
//! progress while pondering, or just checks that the engine starts.
//! Results go to stdout as JSON; logs go to stderr and, with `--log-dir`, to a
//! daily log file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use engine::{AnalysisOptions, AnalysisQuery, AnalysisResult, Engine, EngineConfig, EngineError};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod position;

use position::PositionArgs;

#[derive(Parser)]
#[command(name = "goban", about = "Analyse Go positions with KataGo or Leela Zero", version)]
struct Cli {
    /// Engine config file. Defaults to `GOBAN_ENGINE_CONFIG`.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to daily files in this directory.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyse one position and print the final result.
    Analyze {
        #[command(flatten)]
        position: PositionArgs,

        /// Stop after this many visits.
        #[arg(long)]
        visits: Option<u32>,

        /// Stop after this many seconds of search.
        #[arg(long)]
        max_time_secs: Option<f64>,

        /// Number of candidate moves to print.
        #[arg(long)]
        candidates: Option<usize>,

        /// Give up if no result arrives within this many seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Rank candidates by visits instead of the engine's order.
        #[arg(long)]
        by_visits: bool,

        #[arg(long)]
        pretty: bool,
    },
    /// Search without a budget and print every progress update.
    Ponder {
        #[command(flatten)]
        position: PositionArgs,

        /// How long to ponder before stopping.
        #[arg(long, default_value_t = 10)]
        seconds: u64,

        #[arg(long, default_value_t = 500)]
        interval_ms: u64,

        #[arg(long)]
        candidates: Option<usize>,
    },
    /// Start the engine, print its process status and shut it down.
    Check,
}

fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "goban");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_line_number(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE),
        )
        .with(file_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    Ok(guard)
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<EngineConfig> {
    let path = path.unwrap_or_else(config::get_engine_config_path);
    let mut engine_config = EngineConfig::from_file(&path)
        .with_context(|| format!("failed to load engine config {}", path.display()))?;

    if let Some(program) = config::get_program_override() {
        tracing::info!("Engine program overridden: {}", program.display());
        engine_config.program = program;
    }
    if let Some(grace) = config::get_shutdown_grace_ms() {
        engine_config.shutdown_grace_ms = grace;
    }
    Ok(engine_config)
}

fn print_result(result: &AnalysisResult, pretty: bool) -> anyhow::Result<()> {
    let json = if pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };
    println!("{}", json);
    Ok(())
}

async fn analyze(engine: &Engine, query: AnalysisQuery, pretty: bool) -> anyhow::Result<()> {
    let ticket = engine.submit(query)?;
    let id = ticket.id();

    let result = tokio::select! {
        result = ticket.wait() => result.context("analysis failed")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            engine.cancel(id)?;
            return Ok(());
        }
    };
    print_result(&result, pretty)
}

async fn ponder(engine: &Engine, query: AnalysisQuery, seconds: u64) -> anyhow::Result<()> {
    let mut ticket = engine.submit(query)?;
    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            update = ticket.next_progress() => match update {
                Some(result) => print_result(&result, false)?,
                None => break,
            },
        }
    }

    if let Err(e) = engine.cancel(ticket.id()) {
        tracing::debug!("Nothing to cancel: {}", e);
    }
    match ticket.wait().await {
        Ok(result) => print_result(&result, false),
        Err(EngineError::Cancelled) => Ok(()),
        Err(e) => Err(e).context("pondering failed"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_dir.as_deref())?;

    let engine_config = load_config(cli.config)?;
    tracing::info!(
        engine = %engine_config.label,
        family = %engine_config.family,
        "Starting engine {}",
        engine_config.program.display()
    );
    let engine = Engine::spawn(engine_config)
        .await
        .context("failed to start engine")?;

    let outcome = match cli.command {
        Commands::Analyze {
            position,
            visits,
            max_time_secs,
            candidates,
            timeout_secs,
            by_visits,
            pretty,
        } => {
            let options = AnalysisOptions {
                max_visits: visits,
                max_time: max_time_secs.and_then(|s| Duration::try_from_secs_f64(s).ok()),
                max_candidates: candidates,
                timeout: timeout_secs.map(Duration::from_secs),
                order_by_visits: by_visits,
                ..Default::default()
            };
            match position.to_position() {
                Ok(pos) => {
                    let query = AnalysisQuery::new(pos).with_options(options);
                    analyze(&engine, query, pretty).await
                }
                Err(e) => Err(e),
            }
        }
        Commands::Ponder {
            position,
            seconds,
            interval_ms,
            candidates,
        } => {
            let options = AnalysisOptions {
                max_candidates: candidates,
                report_interval: Some(Duration::from_millis(interval_ms)),
                ..Default::default()
            };
            match position.to_position() {
                Ok(pos) => {
                    let query = AnalysisQuery::new(pos).with_options(options);
                    ponder(&engine, query, seconds).await
                }
                Err(e) => Err(e),
            }
        }
        Commands::Check => match engine.status() {
            Some(status) => serde_json::to_string_pretty(&status)
                .map(|json| println!("{}", json))
                .map_err(anyhow::Error::from),
            None => Err(EngineError::NotStarted.into()),
        },
    };

    engine.shutdown().await;
    outcome
}
