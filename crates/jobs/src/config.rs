// crates/jobs/src/config.rs
//! Job system configuration.
//!
//! Values come from [`JobsConfig::default`], optionally overridden by
//! `AUDIOSCRIBE_*` environment variables via [`JobsConfig::from_env`].

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const ENV_WORKERS: &str = "AUDIOSCRIBE_WORKERS";
pub const ENV_GRACE_MS: &str = "AUDIOSCRIBE_GRACE_MS";
pub const ENV_EVENT_BUFFER: &str = "AUDIOSCRIBE_EVENT_BUFFER";
pub const ENV_TRANSCRIBER: &str = "AUDIOSCRIBE_TRANSCRIBER";
pub const ENV_TRANSCRIBER_ARGS: &str = "AUDIOSCRIBE_TRANSCRIBER_ARGS";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Fixed worker pool size. Not adjusted at runtime.
    pub workers: usize,
    /// Interval between SIGTERM and SIGKILL when terminating a transcriber.
    pub grace_period_ms: u64,
    /// Per-subscriber event buffer of the progress hub.
    pub event_buffer: usize,
    /// Transcription executable and its leading arguments.
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Number of trailing stderr lines kept for failure messages.
    pub stderr_tail_lines: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            grace_period_ms: 5_000,
            event_buffer: 32,
            executable: PathBuf::from("python3"),
            args: vec!["-m".into(), "transcriber".into()],
            stderr_tail_lines: 20,
        }
    }
}

impl JobsConfig {
    /// Defaults overridden by any `AUDIOSCRIBE_*` variables that are set and parse.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_parse::<usize>(ENV_WORKERS) {
            config.workers = n;
        }
        if let Some(ms) = env_parse::<u64>(ENV_GRACE_MS) {
            config.grace_period_ms = ms;
        }
        if let Some(n) = env_parse::<usize>(ENV_EVENT_BUFFER) {
            config.event_buffer = n;
        }
        if let Ok(exe) = std::env::var(ENV_TRANSCRIBER) {
            if !exe.is_empty() {
                config.executable = PathBuf::from(exe);
            }
        }
        if let Ok(args) = std::env::var(ENV_TRANSCRIBER_ARGS) {
            config.args = args.split_whitespace().map(str::to_string).collect();
        }
        config
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Reject values the queue cannot run with.
    ///
    /// A single worker is allowed, but a multi-track parent holds its worker
    /// while its tracks run, so such a pool fails multi-track jobs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "workers",
                message: "must be at least 1".into(),
            });
        }
        if self.workers == 1 {
            tracing::warn!("Single-worker pool: multi-track jobs will fail");
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                key: "event_buffer",
                message: "must be greater than 0".into(),
            });
        }
        if self.executable.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "executable",
                message: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = JobsConfig::default();
        assert_eq!(config.workers, 2);
        assert_eq!(config.grace_period(), Duration::from_secs(5));
        assert_eq!(config.event_buffer, 32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_accepts_single_worker_rejects_none() {
        let single = JobsConfig {
            workers: 1,
            ..Default::default()
        };
        assert!(single.validate().is_ok());

        let none = JobsConfig {
            workers: 0,
            ..Default::default()
        };
        let err = none.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "workers", .. }));
    }

    #[test]
    fn validate_rejects_zero_buffer() {
        let config = JobsConfig {
            event_buffer: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserialize_partial_config() {
        let json = r#"{ "workers": 4, "executable": "/opt/transcribe" }"#;
        let config: JobsConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.executable, PathBuf::from("/opt/transcribe"));
        assert_eq!(config.grace_period_ms, 5_000);
    }
}
