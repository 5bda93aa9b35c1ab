use std::collections::VecDeque;
use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::catalog::graph::num;
use crate::catalog::TransformPlan;
use crate::error::EngineError;
use crate::runtime::{command_for, locate_binary};
use crate::store;

/// Lines of ffmpeg stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// Substrings ffmpeg prints when a run has failed even if it exits 0.
const FAILURE_MARKERS: &[&str] = &[
    "Conversion failed!",
    "Error opening",
    "Invalid data found",
    "Error while",
    "No such file or directory",
    "matches no streams",
    "Error initializing",
];

/// Executes a [`TransformPlan`] into a file.
#[async_trait]
pub trait TranscodeEngine: Send + Sync {
    async fn run(&self, plan: &TransformPlan, output: &Path) -> Result<(), EngineError>;
}

#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    binary: String,
}

impl FfmpegEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn is_available(&self) -> bool {
        locate_binary(&self.binary).is_some()
    }

    async fn execute(&self, plan: &TransformPlan, output: &Path) -> Result<(), EngineError> {
        let args = build_ffmpeg_args(plan, output);
        info!(
            operation = plan.operation,
            inputs = plan.inputs.len(),
            output = %output.display(),
            "Starting ffmpeg"
        );
        debug!(?args, "ffmpeg arguments");

        let mut child = command_for(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| EngineError::Spawn {
                binary: self.binary.clone(),
                reason: err.to_string(),
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let progress = async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            let mut out_time = String::new();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match line.split_once('=') {
                        Some(("out_time", value)) => out_time = value.trim().to_string(),
                        Some(("progress", state)) => {
                            debug!(target: "ffmpeg_progress", out_time = %out_time, state, "progress");
                        }
                        _ => {}
                    },
                    Ok(None) => break,
                    Err(err) => {
                        debug!(target: "ffmpeg_progress", "read error: {}", err);
                        break;
                    }
                }
            }
        };

        let diagnostics = async move {
            let mut scan = StderrScan::default();
            let Some(stderr) = stderr else { return scan };
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        debug!(target: "ffmpeg_stderr", "{}", line);
                        scan.push(line);
                    }
                    Ok(None) => break,
                    Err(err) => {
                        debug!(target: "ffmpeg_stderr", "read error: {}", err);
                        break;
                    }
                }
            }
            scan
        };

        let (status, (), scan) = tokio::join!(child.wait(), progress, diagnostics);
        let status = status
            .map_err(|err| EngineError::Aborted(format!("failed to wait for ffmpeg: {err}")))?;

        if let Some(err) = scan.into_error(status) {
            return Err(err);
        }
        verify_output(output).await?;

        info!(operation = plan.operation, output = %output.display(), "ffmpeg finished");
        Ok(())
    }
}

#[async_trait]
impl TranscodeEngine for FfmpegEngine {
    async fn run(&self, plan: &TransformPlan, output: &Path) -> Result<(), EngineError> {
        let result = self.execute(plan, output).await;
        if let Err(err) = &result {
            warn!(operation = plan.operation, error = %err, "ffmpeg run failed");
            store::discard(output).await;
        }
        result
    }
}

/// Full ffmpeg command line for a plan, output path last.
pub fn build_ffmpeg_args(plan: &TransformPlan, output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-progress",
        "pipe:1",
        "-nostats",
        "-y",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();

    for (index, input) in plan.inputs.iter().enumerate() {
        if index == 0 {
            if let Some(seek) = plan.seek {
                args.push("-ss".into());
                args.push(num(seek).into());
            }
        }
        args.push("-i".into());
        args.push(input.as_os_str().to_os_string());
    }

    if let Some(graph) = &plan.complex_graph {
        args.push("-filter_complex".into());
        args.push(graph.to_string().into());
        for map in &plan.maps {
            args.push("-map".into());
            args.push(map.into());
        }
    }
    if let Some(chain) = plan.video_filters.as_ref().filter(|c| !c.is_empty()) {
        args.push("-vf".into());
        args.push(chain.to_string().into());
    }
    if let Some(chain) = plan.audio_filters.as_ref().filter(|c| !c.is_empty()) {
        args.push("-af".into());
        args.push(chain.to_string().into());
    }
    if let Some(duration) = plan.duration {
        args.push("-t".into());
        args.push(num(duration).into());
    }

    args.extend(plan.encoding.iter().map(OsString::from));
    args.push(output.as_os_str().to_os_string());
    args
}

#[derive(Debug, Default)]
struct StderrScan {
    tail: VecDeque<String>,
    marker: Option<&'static str>,
}

impl StderrScan {
    fn push(&mut self, line: String) {
        if self.marker.is_none() {
            self.marker = FAILURE_MARKERS
                .iter()
                .copied()
                .find(|marker| line.contains(marker));
        }
        if self.tail.len() == STDERR_TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line);
    }

    fn tail(&self) -> String {
        self.tail.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    fn into_error(self, status: ExitStatus) -> Option<EngineError> {
        classify(status.success(), &status.to_string(), self)
    }
}

fn classify(success: bool, status: &str, scan: StderrScan) -> Option<EngineError> {
    let stderr_tail = scan.tail();
    match (success, scan.marker) {
        (_, Some(marker)) => Some(EngineError::MarkedFailure {
            marker,
            stderr_tail,
        }),
        (false, None) => Some(EngineError::Failed {
            status: status.to_string(),
            stderr_tail,
        }),
        (true, None) => None,
    }
}

async fn verify_output(output: &Path) -> Result<(), EngineError> {
    match tokio::fs::metadata(output).await {
        Ok(metadata) if metadata.len() > 0 => Ok(()),
        Ok(_) => Err(EngineError::EmptyOutput(output.to_path_buf())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Err(EngineError::MissingOutput(output.to_path_buf()))
        }
        Err(err) => Err(EngineError::Aborted(format!(
            "failed to inspect output {}: {err}",
            output.display()
        ))),
    }
}
