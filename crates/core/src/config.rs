use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "VIDSMITH_DATA_DIR";
const ENV_PORT: &str = "PORT";
const ENV_HOST: &str = "VIDSMITH_HOST";
const ENV_ALLOWED_ORIGINS: &str = "VIDSMITH_ALLOWED_ORIGINS";
const ENV_MAX_CONCURRENT_JOBS: &str = "VIDSMITH_MAX_CONCURRENT_JOBS";
const ENV_RETENTION_SECS: &str = "VIDSMITH_RETENTION_SECS";
const ENV_MAX_UPLOAD_BYTES: &str = "VIDSMITH_MAX_UPLOAD_BYTES";

pub const ANY_ORIGIN: &str = "*";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub limits: LimitsConfig,
    pub retention: RetentionConfig,
    pub output: OutputConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub uploads_dir: PathBuf,
    pub processed_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_upload_bytes: u64,
    pub max_files_per_upload: usize,
    pub max_concurrent_jobs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_age_secs: u64,
    pub sweep_interval_secs: u64,
    pub initial_delay_secs: u64,
}

/// Low-resource encoding profile applied to every transform output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
    pub video_bitrate: String,
    pub max_bitrate: String,
    pub buffer_size: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub threads: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub frame_rate: u32,
    pub sample_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            host: "0.0.0.0".to_string(),
            allowed_origins: vec![ANY_ORIGIN.to_string()],
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            uploads_dir: PathBuf::from("uploads"),
            processed_dir: PathBuf::from("processed"),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: 500 * 1024 * 1024,
            max_files_per_upload: 10,
            max_concurrent_jobs: 1,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 60 * 60,
            sweep_interval_secs: 15 * 60,
            initial_delay_secs: 5,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            preset: "ultrafast".to_string(),
            crf: 28,
            video_bitrate: "1M".to_string(),
            max_bitrate: "1.5M".to_string(),
            buffer_size: "2M".to_string(),
            audio_codec: "aac".to_string(),
            audio_bitrate: "128k".to_string(),
            threads: 1,
            max_width: 1280,
            max_height: 720,
            frame_rate: 30,
            sample_rate: 44_100,
            font_file: None,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
        }
    }
}

impl RetentionConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }
}

impl LimitsConfig {
    /// A zero ceiling would park every job forever.
    pub fn concurrency(&self) -> usize {
        self.max_concurrent_jobs.max(1)
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Apply process environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| env::var(key).ok())
    }

    /// Override lookup is injectable so tests never touch the real environment.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(ENV_PORT) {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("invalid {ENV_PORT} value: {port}"))?;
        }
        if let Some(host) = lookup(ENV_HOST) {
            self.server.host = host.trim().to_string();
        }
        if let Some(origins) = lookup(ENV_ALLOWED_ORIGINS) {
            self.server.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(ToOwned::to_owned)
                .collect();
        }
        if let Some(jobs) = lookup(ENV_MAX_CONCURRENT_JOBS) {
            self.limits.max_concurrent_jobs = jobs
                .trim()
                .parse()
                .with_context(|| format!("invalid {ENV_MAX_CONCURRENT_JOBS} value: {jobs}"))?;
        }
        if let Some(secs) = lookup(ENV_RETENTION_SECS) {
            self.retention.max_age_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("invalid {ENV_RETENTION_SECS} value: {secs}"))?;
        }
        if let Some(bytes) = lookup(ENV_MAX_UPLOAD_BYTES) {
            self.limits.max_upload_bytes = bytes
                .trim()
                .parse()
                .with_context(|| format!("invalid {ENV_MAX_UPLOAD_BYTES} value: {bytes}"))?;
        }
        Ok(())
    }

    pub fn allows_any_origin(&self) -> bool {
        self.server.allowed_origins.is_empty()
            || self
                .server
                .allowed_origins
                .iter()
                .any(|origin| origin == ANY_ORIGIN)
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. VIDSMITH_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and write a default config.toml on first run.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
