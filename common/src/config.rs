use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;
use url::Url;

/// Lowest accepted poll rate, in fetches per second.
pub const MIN_RATE: u32 = 1;
/// Highest accepted poll rate, in fetches per second.
pub const MAX_RATE: u32 = 60;
/// Highest accepted denoise strength. 0 disables the filter.
pub const MAX_DENOISE: u32 = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The two values written back when the user connects to a camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default = "default_rate")]
    pub rate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub denoise: u32,
    #[serde(default = "default_filter_program")]
    pub program: String,
    /// Arguments passed to `program`. `{strength}` is replaced by the
    /// denoise strength.
    #[serde(default = "default_filter_args")]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_latency_samples")]
    pub latency_samples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    #[serde(default = "default_max_height")]
    pub max_height: u32,
    /// chrono format string for the frame timestamp label.
    #[serde(default = "default_time_format")]
    pub time_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            denoise: 0,
            program: default_filter_program(),
            args: default_filter_args(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout(),
            latency_samples: default_latency_samples(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_width: default_max_width(),
            max_height: default_max_height(),
            time_format: default_time_format(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check every user-supplied value. Runs before a poll session starts so
    /// that a bad value never surfaces mid-session.
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_source_url(&self.source.url)?;
        check_rate(self.source.rate)?;
        check_denoise(self.filter.denoise)?;
        Ok(())
    }

    /// Write the whole config back to `path`. The file is replaced via a
    /// sibling temp file so a crash never leaves it half-written.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, content)
            .map_err(|e| ConfigError::WriteFile(tmp.display().to_string(), e))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| ConfigError::WriteFile(path.display().to_string(), e))?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }
}

/// Parse a camera snapshot URL. Only http and https are accepted.
pub fn parse_source_url(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidUrl(raw.to_string(), "empty".into()));
    }
    let url = Url::parse(trimmed).map_err(|e| ConfigError::InvalidUrl(raw.to_string(), e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::InvalidUrl(
            raw.to_string(),
            format!("unsupported scheme {other:?}"),
        )),
    }
}

pub fn check_rate(rate: u32) -> Result<u32, ConfigError> {
    if (MIN_RATE..=MAX_RATE).contains(&rate) {
        Ok(rate)
    } else {
        Err(ConfigError::RateOutOfRange(rate))
    }
}

pub fn check_denoise(strength: u32) -> Result<u32, ConfigError> {
    if strength <= MAX_DENOISE {
        Ok(strength)
    } else {
        Err(ConfigError::DenoiseOutOfRange(strength))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("failed to serialize config: {0}")]
    Serialize(String),
    #[error("failed to write config file {0}: {1}")]
    WriteFile(String, std::io::Error),
    #[error("invalid source URL {0:?}: {1}")]
    InvalidUrl(String, String),
    #[error("poll rate {0} out of range, expected 1..=60 per second")]
    RateOutOfRange(u32),
    #[error("denoise strength {0} out of range, expected 0..=500")]
    DenoiseOutOfRange(u32),
}

// Default value functions
fn default_rate() -> u32 {
    1
}
fn default_filter_program() -> String {
    "ffmpeg".into()
}
fn default_filter_args() -> Vec<String> {
    [
        "-loglevel",
        "warning",
        "-i",
        "-",
        "-c:v",
        "mjpeg",
        "-qscale:v",
        "2",
        "-vf",
        "vaguedenoiser=threshold={strength}",
        "-f",
        "image2pipe",
        "-",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_fetch_timeout() -> u64 {
    10
}
fn default_latency_samples() -> usize {
    12
}
fn default_bind() -> String {
    "127.0.0.1:8080".into()
}
fn default_max_width() -> u32 {
    1920
}
fn default_max_height() -> u32 {
    1080
}
fn default_time_format() -> String {
    "%-I:%M:%S%.3f %p".into()
}
fn default_log_level() -> String {
    "info".into()
}
