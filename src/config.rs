//! Configuration loading and resolution
//!
//! Priority (highest to lowest):
//! 1. Command-line overrides
//! 2. Environment variables
//! 3. TOML file passed with `--config`
//! 4. Defaults

use crate::liveness::HttpLivenessOracle;
use crate::recorder::{EncodeCommand, FfmpegCommand, Layout, ShellCommand, StopTimeouts};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const IDENTITY_PLACEHOLDER: &str = "{identity}";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("invalid value for {var}: '{value}'")]
    InvalidEnv { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Resolved configuration; every field has a default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub output_dir: PathBuf,
    pub ffmpeg_path: String,
    /// Shell script run instead of ffmpeg; see [`ShellCommand`]
    pub encode_script: Option<String>,
    pub hls_time: u32,
    pub hls_list_size: u32,
    pub reconnect_delay_max: u32,
    /// Seconds between reconciliation ticks
    pub auto_record_interval: u64,
    /// Seconds between retention sweeps
    pub cleanup_interval: u64,
    pub stop_timeout: u64,
    pub writer_join_timeout: u64,
    pub default_retention_days: u32,
    pub liveness_url_template: String,
    pub liveness_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./data"),
            ffmpeg_path: "ffmpeg".to_string(),
            encode_script: None,
            hls_time: 4,
            hls_list_size: 6,
            reconnect_delay_max: 30,
            auto_record_interval: 120,
            cleanup_interval: 3600,
            stop_timeout: 10,
            writer_join_timeout: 2,
            default_retention_days: crate::models::DEFAULT_RETENTION_DAYS,
            liveness_url_template: "https://chaturbate.com/api/chatvideocontext/{identity}/"
                .to_string(),
            liveness_timeout: 10,
        }
    }
}

/// Command-line overrides for configuration
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub ffmpeg_path: Option<String>,
    pub auto_record_interval: Option<u64>,
    pub cleanup_interval: Option<u64>,
}

/// Resolve configuration from all sources
pub fn resolve_config(overrides: &ConfigOverrides) -> Result<Config, ConfigError> {
    let mut config = match &overrides.config_path {
        Some(path) => load_config_file(path)?,
        None => Config::default(),
    };
    apply_env_overrides(&mut config, |var| std::env::var(var).ok())?;
    apply_cli_overrides(&mut config, overrides);
    config.validate()?;
    Ok(config)
}

/// Load config from a TOML file
pub fn load_config_file(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&contents)?)
}

/// Apply environment variable overrides read through `lookup`
pub fn apply_env_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    fn parsed<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
        value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { var, value })
    }

    if let Some(dir) = lookup("OUTPUT_DIR") {
        config.output_dir = PathBuf::from(dir);
    }
    if let Some(path) = lookup("FFMPEG_PATH") {
        config.ffmpeg_path = path;
    }
    if let Some(script) = lookup("ENCODE_SCRIPT") {
        config.encode_script = Some(script);
    }
    if let Some(v) = lookup("HLS_TIME") {
        config.hls_time = parsed("HLS_TIME", v)?;
    }
    if let Some(v) = lookup("HLS_LIST_SIZE") {
        config.hls_list_size = parsed("HLS_LIST_SIZE", v)?;
    }
    if let Some(v) = lookup("AUTO_RECORD_INTERVAL") {
        config.auto_record_interval = parsed("AUTO_RECORD_INTERVAL", v)?;
    }
    if let Some(v) = lookup("CLEANUP_INTERVAL") {
        config.cleanup_interval = parsed("CLEANUP_INTERVAL", v)?;
    }
    if let Some(url) = lookup("LIVENESS_URL") {
        config.liveness_url_template = url;
    }
    Ok(())
}

fn apply_cli_overrides(config: &mut Config, overrides: &ConfigOverrides) {
    if let Some(dir) = &overrides.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(path) = &overrides.ffmpeg_path {
        config.ffmpeg_path = path.clone();
    }
    if let Some(secs) = overrides.auto_record_interval {
        config.auto_record_interval = secs;
    }
    if let Some(secs) = overrides.cleanup_interval {
        config.cleanup_interval = secs;
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.auto_record_interval == 0 {
            return invalid("auto_record_interval must be at least 1 second");
        }
        if self.cleanup_interval == 0 {
            return invalid("cleanup_interval must be at least 1 second");
        }
        if self.hls_time == 0 || self.hls_list_size == 0 {
            return invalid("hls_time and hls_list_size must be positive");
        }
        if self.default_retention_days == 0 {
            return invalid("default_retention_days must be at least 1");
        }
        if !self.liveness_url_template.contains(IDENTITY_PLACEHOLDER) {
            return Err(ConfigError::Invalid(format!(
                "liveness_url_template must contain {}",
                IDENTITY_PLACEHOLDER
            )));
        }
        if self.ffmpeg_path.trim().is_empty() {
            return invalid("ffmpeg_path must not be empty");
        }
        Ok(())
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.output_dir)
    }

    pub fn stop_timeouts(&self) -> StopTimeouts {
        StopTimeouts {
            terminate: Duration::from_secs(self.stop_timeout),
            writer_join: Duration::from_secs(self.writer_join_timeout),
        }
    }

    pub fn auto_record_interval(&self) -> Duration {
        Duration::from_secs(self.auto_record_interval)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }

    /// The encode command sessions are launched with
    pub fn encoder(&self) -> Arc<dyn EncodeCommand> {
        match &self.encode_script {
            Some(script) => Arc::new(ShellCommand::new(script.clone())),
            None => Arc::new(FfmpegCommand {
                ffmpeg_path: self.ffmpeg_path.clone(),
                hls_time: self.hls_time,
                hls_list_size: self.hls_list_size,
                reconnect_delay_max: self.reconnect_delay_max,
            }),
        }
    }

    pub fn liveness_oracle(&self) -> Result<HttpLivenessOracle, reqwest::Error> {
        HttpLivenessOracle::new(
            self.liveness_url_template.clone(),
            Duration::from_secs(self.liveness_timeout),
        )
    }
}
