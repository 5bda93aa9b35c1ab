use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::runtime::command_for;

/// The subset of stream facts the catalog and upload responses need.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub has_video: bool,
    pub has_audio: bool,
}

#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo>;
}

// ffprobe JSON model (serde)
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(Deserialize, Debug)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
    #[serde(default)]
    disposition: std::collections::HashMap<String, serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct FfprobeFormat {
    duration: Option<String>,
}

impl FfprobeStream {
    fn is_attached_picture(&self) -> bool {
        self.disposition
            .get("attached_pic")
            .and_then(serde_json::Value::as_i64)
            .is_some_and(|flag| flag != 0)
    }
}

fn parse_seconds(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
}

pub fn parse_ffprobe_json(json: &[u8]) -> Result<MediaInfo> {
    let probe: FfprobeOutput =
        serde_json::from_slice(json).context("failed to parse ffprobe JSON")?;

    let video = probe.streams.iter().find(|stream| {
        stream.codec_type.as_deref() == Some("video") && !stream.is_attached_picture()
    });
    let has_audio = probe
        .streams
        .iter()
        .any(|stream| stream.codec_type.as_deref() == Some("audio"));

    let duration = probe
        .format
        .as_ref()
        .and_then(|format| parse_seconds(format.duration.as_deref()))
        .or_else(|| {
            probe
                .streams
                .iter()
                .filter_map(|stream| parse_seconds(stream.duration.as_deref()))
                .reduce(f64::max)
        })
        .unwrap_or(0.0);

    Ok(MediaInfo {
        duration,
        width: video.and_then(|v| v.width).unwrap_or(0),
        height: video.and_then(|v| v.height).unwrap_or(0),
        has_video: video.is_some(),
        has_audio,
    })
}

/// Runs the external `ffprobe` binary.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    binary: String,
}

impl FfprobeProber {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<MediaInfo> {
        debug!(path = %path.display(), "running ffprobe");
        let output = command_for(&self.binary)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to execute {}; is FFmpeg installed?", self.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            );
        }

        parse_ffprobe_json(&output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_FFPROBE_JSON: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080,
             "disposition": {"default": 1, "attached_pic": 0}},
            {"index": 1, "codec_type": "audio", "codec_name": "aac", "duration": "12.480000"}
        ],
        "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "12.500000"}
    }"#;

    #[test]
    fn parses_dimensions_duration_and_audio() {
        let info = parse_ffprobe_json(SAMPLE_FFPROBE_JSON.as_bytes()).unwrap();
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert!((info.duration - 12.5).abs() < 1e-9);
        assert!(info.has_video);
        assert!(info.has_audio);
    }

    #[test]
    fn falls_back_to_stream_duration() {
        let json = r#"{
            "streams": [
                {"codec_type": "audio", "duration": "3.2"},
                {"codec_type": "audio", "duration": "4.75"}
            ],
            "format": {}
        }"#;
        let info = parse_ffprobe_json(json.as_bytes()).unwrap();
        assert!((info.duration - 4.75).abs() < 1e-9);
        assert!(!info.has_video);
        assert_eq!((info.width, info.height), (0, 0));
    }

    #[test]
    fn ignores_cover_art_streams() {
        let json = r#"{
            "streams": [
                {"codec_type": "video", "width": 600, "height": 600, "disposition": {"attached_pic": 1}},
                {"codec_type": "audio"}
            ],
            "format": {"duration": "180.0"}
        }"#;
        let info = parse_ffprobe_json(json.as_bytes()).unwrap();
        assert!(!info.has_video);
        assert_eq!(info.width, 0);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(parse_ffprobe_json(b"not json").is_err());
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let prober = FfprobeProber::new("vidsmith-definitely-missing-ffprobe");
        let err = prober
            .probe(Path::new("/nonexistent.mp4"))
            .await
            .expect_err("binary does not exist");
        assert!(format!("{err:#}").contains("failed to execute"));
    }
}
