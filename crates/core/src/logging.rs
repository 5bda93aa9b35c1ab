//! Tracing filter selection, the rolling file sink, and panic crash reports.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fmt, fs,
    io::{self, Write},
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use chrono::{DateTime, Utc};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_CRASH_DIR_NAME: &str = "crash";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "vidsmith";

/// Subprocess targets written by the engine: (target, console level).
/// The file sink always records them at debug.
const FFMPEG_TARGETS: [(&str, &str); 2] = [("ffmpeg_stderr", "error"), ("ffmpeg_progress", "warn")];

static CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static HOOK_INSTALL: Mutex<()> = Mutex::new(());
static WRITING_CRASH_REPORT: AtomicBool = AtomicBool::new(false);
static CRASH_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeLogMode {
    Cli,
    Server,
}

impl RuntimeLogMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Server => "server",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub mode: RuntimeLogMode,
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            mode: RuntimeLogMode::Server,
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LogFilters,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookInstallPlan {
    Installed {
        crash_dir: PathBuf,
    },
    AlreadyInstalled {
        crash_dir: PathBuf,
    },
    Fallback {
        attempted_crash_dir: Option<PathBuf>,
        reason: String,
    },
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: open_file_sink(options),
    }
}

/// `--log-filter` wins, then `-v`/`-vv`, then `RUST_LOG`, then `info`.
/// ffmpeg chatter is tuned only when nothing was chosen on the command line.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LogFilters {
    let explicit = options.cli_log_filter.clone().or(match options.verbose {
        0 => None,
        1 => Some("debug".to_string()),
        _ => Some("trace".to_string()),
    });
    if let Some(filter) = explicit {
        return LogFilters {
            console: filter.clone(),
            file: filter,
        };
    }

    let base = options
        .rust_log_env
        .clone()
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    let with_targets = |level_for: fn(&str) -> &str| {
        FFMPEG_TARGETS
            .iter()
            .map(|(target, console_level)| format!("{target}={}", level_for(*console_level)))
            .chain(std::iter::once(base.clone()))
            .collect::<Vec<_>>()
            .join(",")
    };
    LogFilters {
        console: with_targets(|console_level| console_level),
        file: with_targets(|_| "debug"),
    }
}

fn open_file_sink(options: &LoggingInitOptions) -> FileSinkPlan {
    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };
    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    let appender = fs::create_dir_all(&log_dir)
        .map_err(|err| format!("failed to create log directory: {err}"))
        .and_then(|()| {
            RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
                .filename_suffix("log")
                .max_log_files(options.retention_files.max(1))
                .build(&log_dir)
                .map_err(|err| format!("failed to initialize rolling file sink: {err}"))
        });

    match appender {
        Ok(appender) => FileSinkPlan::Ready { log_dir, appender },
        Err(reason) => FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason,
        },
    }
}

/// Chain a hook that drops one report per panic into `<data_dir>/logs/crash`.
/// Installing twice keeps the first directory.
pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookInstallPlan {
    if let Some(crash_dir) = CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: crash_dir.clone(),
        };
    }
    let Some(data_dir) = data_dir else {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: None,
            reason: "panic hook disabled: data_dir is not configured".to_string(),
        };
    };
    let crash_dir = data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME);
    if let Err(err) = fs::create_dir_all(&crash_dir) {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: Some(crash_dir),
            reason: format!("failed to create crash artifact directory: {err}"),
        };
    }

    let _guard = HOOK_INSTALL
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let previous = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_crash(&hook_dir, info);
        previous(info);
    }));
    let _ = CRASH_DIR.set(crash_dir.clone());
    PanicHookInstallPlan::Installed { crash_dir }
}

fn record_crash(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic inside the writer must not recurse into another report.
    if WRITING_CRASH_REPORT.swap(true, Ordering::AcqRel) {
        return;
    }
    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        CrashReport::capture(info).write_into(crash_dir)
    }));
    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => eprintln!(
            "Warning: failed to write panic crash artifact under '{}': {err}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic hook failed while writing crash artifact under '{}'.",
            crash_dir.display()
        ),
    }
    WRITING_CRASH_REPORT.store(false, Ordering::Release);
}

#[derive(Debug)]
struct CrashReport {
    at: DateTime<Utc>,
    thread: String,
    location: String,
    payload: String,
    backtrace: Backtrace,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        Self {
            at: Utc::now(),
            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            payload: payload_text(info.payload()),
            backtrace: Backtrace::capture(),
        }
    }

    fn write_into(&self, crash_dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(crash_dir)?;
        let sequence = CRASH_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = crash_dir.join(format!(
            "panic-{}-{sequence:06}.log",
            self.at.format("%Y%m%d-%H%M%S-%f")
        ));
        let mut file = fs::File::create(&path)?;
        write!(file, "{self}")?;
        file.flush()?;
        Ok(path)
    }
}

impl fmt::Display for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let policy = match self.backtrace.status() {
            BacktraceStatus::Captured => "captured",
            BacktraceStatus::Disabled => "disabled (set RUST_BACKTRACE=1/full to enable)",
            _ => "unsupported",
        };
        writeln!(f, "timestamp_utc={}", self.at.to_rfc3339())?;
        writeln!(f, "thread={}", self.thread)?;
        writeln!(f, "location={}", self.location)?;
        writeln!(f, "payload={}", self.payload)?;
        writeln!(f, "backtrace_policy={policy}")?;
        writeln!(f, "backtrace:")?;
        writeln!(f, "{}", self.backtrace)
    }
}

fn payload_text(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|text| text.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}
