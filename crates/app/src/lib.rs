use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use vidsmith_core::config::{config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig};
use vidsmith_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, RuntimeLogMode,
    DEFAULT_LOG_FILTER,
};
use vidsmith_core::probe::{FfprobeProber, MediaProber};
use vidsmith_core::runtime::locate_binary;
use vidsmith_core::server::{app_router, AppState};
use vidsmith_core::store::sweeper::{spawn_sweeper, SweepSchedule};
use vidsmith_core::store::{ArtifactStore, SweepReport};

#[derive(Parser)]
#[command(
    name = "vidsmith",
    about = "Lightweight browser-driven video editing backend",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Evict expired uploads and outputs once, then exit.
    Sweep(SweepArgs),
    /// Print the media facts ffprobe reports for a file.
    Probe(ProbeArgs),
}

#[derive(Args)]
struct SweepArgs {
    #[arg(long, help = "Override the configured retention age")]
    max_age_secs: Option<u64>,
}

#[derive(Args)]
struct ProbeArgs {
    file: PathBuf,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RuntimeLogMode::Cli
    } else {
        RuntimeLogMode::Server
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        mode,
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    info!(
        mode = mode.as_str(),
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    let config = load_config(&resolved_data_dir)?;
    match cli.command {
        Some(Commands::Sweep(args)) => {
            let report = run_sweep(&config, &resolved_data_dir, args.max_age_secs).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Some(Commands::Probe(args)) => {
            let info = FfprobeProber::new(config.engine.ffprobe_bin.clone())
                .probe(&args.file)
                .await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
        None => run_server(config, cli.port, cli.host, resolved_data_dir).await,
    }
}

fn init_logging(
    mode: RuntimeLogMode,
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);

    let init_options = LoggingInitOptions {
        mode,
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = parse_env_filter_with_fallback(&init_plan.filters.console, "console");

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let fallback = match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(parse_env_filter_with_fallback(&init_plan.filters.file, "file"));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
            }
            None
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
            }
            Some((attempted_log_dir, reason))
        }
    };

    if let Some((attempted_log_dir, reason)) = fallback {
        warn!(
            attempted_log_dir = ?attempted_log_dir,
            reason = %reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

/// First run writes a default config.toml; a broken file falls back to defaults.
/// Environment overrides are applied last and must parse.
fn load_config(data_dir: &Path) -> Result<AppConfig> {
    if let Err(error) = initialize_data_dir(data_dir) {
        warn!(error = %error, "Failed to initialize data directory");
    }
    let mut config = match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(error) => {
            warn!(error = %format!("{error:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config
        .apply_env_overrides()
        .context("invalid environment override")?;
    Ok(config)
}

fn bind_address(config: &AppConfig, port: Option<u16>, host: Option<String>) -> String {
    let port = port.unwrap_or(config.server.port);
    let host = host.unwrap_or_else(|| config.server.host.clone());
    format!("{host}:{port}")
}

async fn run_sweep(config: &AppConfig, data_dir: &Path, max_age_secs: Option<u64>) -> SweepReport {
    let store = ArtifactStore::new(
        resolve_relative_to(data_dir, &config.paths.uploads_dir),
        resolve_relative_to(data_dir, &config.paths.processed_dir),
    );
    let max_age = max_age_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.retention.max_age());
    let report = store.sweep_expired(max_age).await;
    info!(
        scanned = report.scanned,
        removed = report.removed,
        failed = report.failed,
        "Manual sweep finished"
    );
    report
}

async fn run_server(
    config: AppConfig,
    port: Option<u16>,
    host: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    match locate_binary(&config.engine.ffmpeg_bin) {
        Some(path) => info!(ffmpeg = %path.display(), "Found ffmpeg"),
        None => warn!(
            ffmpeg = %config.engine.ffmpeg_bin,
            "ffmpeg not found; edit requests will fail until it is installed"
        ),
    }

    let state = AppState::from_config(&config, &data_dir).await?;
    let shutdown = CancellationToken::new();
    let sweeper = spawn_sweeper(
        state.store().clone(),
        SweepSchedule::from(&config.retention),
        shutdown.clone(),
    );

    let app = app_router(state);
    let addr = bind_address(&config, port, host);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "Starting vidsmith server");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(error = %error, "Failed to listen for shutdown signal");
            }
            info!("Shutdown requested");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(error) = sweeper.await {
        warn!(error = %error, "Retention sweeper ended abnormally");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::SystemTime;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn bare_invocation_serves() {
        let cli = Cli::try_parse_from(["vidsmith", "-p", "8080", "--host", "127.0.0.1"])
            .expect("parse");
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(8080));
        assert_eq!(cli.host.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn global_flags_reach_subcommands() {
        let cli = Cli::try_parse_from([
            "vidsmith",
            "sweep",
            "--max-age-secs",
            "60",
            "-vv",
            "--data-dir",
            "/tmp/vs",
        ])
        .expect("parse");
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/vs")));
        match cli.command {
            Some(Commands::Sweep(args)) => assert_eq!(args.max_age_secs, Some(60)),
            _ => panic!("expected sweep subcommand"),
        }
    }

    #[test]
    fn probe_requires_a_file() {
        assert!(Cli::try_parse_from(["vidsmith", "probe"]).is_err());
        let cli = Cli::try_parse_from(["vidsmith", "probe", "clip.mp4"]).expect("parse");
        assert!(matches!(cli.command, Some(Commands::Probe(ProbeArgs { file })) if file == PathBuf::from("clip.mp4")));
    }

    #[test]
    fn cli_bind_flags_override_config() {
        let config = AppConfig::default();
        assert_eq!(bind_address(&config, None, None), "0.0.0.0:5000");
        assert_eq!(
            bind_address(&config, Some(9000), Some("localhost".to_string())),
            "localhost:9000"
        );
    }

    #[tokio::test]
    async fn sweep_uses_override_age() {
        let data_dir = tempdir().expect("tempdir");
        let config = AppConfig::default();
        let uploads = data_dir.path().join("uploads");
        fs::create_dir_all(&uploads).expect("uploads dir");
        let stale = uploads.join("stale.mp4");
        fs::write(&stale, b"old").expect("write");
        let file = fs::File::options().write(true).open(&stale).expect("open");
        file.set_modified(SystemTime::now() - Duration::from_secs(600))
            .expect("age file");

        let kept = run_sweep(&config, data_dir.path(), None).await;
        assert_eq!(kept.removed, 0);
        assert!(stale.exists());

        let swept = run_sweep(&config, data_dir.path(), Some(60)).await;
        assert_eq!(swept.removed, 1);
        assert!(!stale.exists());
    }

    #[test]
    fn first_run_writes_default_config() {
        let data_dir = tempdir().expect("tempdir");
        initialize_data_dir(data_dir.path()).expect("initialize");
        let written = config_path(data_dir.path());
        assert!(written.is_file());
        assert_eq!(
            AppConfig::load_from_path(&written).expect("load"),
            AppConfig::default()
        );
    }
}
