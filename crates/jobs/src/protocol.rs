// crates/jobs/src/protocol.rs
//! Line protocol spoken by the transcriber on stdout.
//!
//! One JSON object per line:
//! - `{"stage": "diarize", "progress": 0.4}`
//! - `{"result": {...}}` (last one wins)
//! - `{"error": "model not found"}`
//!
//! Anything else is skipped.

use serde::Deserialize;

use crate::error::JobError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ProtocolLine {
    Progress {
        #[serde(default)]
        stage: Option<String>,
        progress: f64,
    },
    Result {
        result: serde_json::Value,
    },
    Error {
        error: String,
    },
}

/// Longest excerpt of an unparsable line that gets logged.
const LOGGED_LINE_CHARS: usize = 200;

pub fn parse_line(line: &str) -> Option<ProtocolLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<ProtocolLine>(trimmed) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            let excerpt: String = trimmed.chars().take(LOGGED_LINE_CHARS).collect();
            tracing::debug!(error = %e, line = %excerpt, "Skipping unparsable transcriber line");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub progress: f64,
    pub stage: Option<String>,
}

/// How the transcriber process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub success: bool,
    pub code: Option<i32>,
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            success: status.success(),
            code: status.code(),
        }
    }
}

/// Folds protocol lines into progress updates and a final outcome.
#[derive(Debug, Default)]
pub struct ProtocolState {
    parsed: usize,
    progress: f64,
    result: Option<serde_json::Value>,
    reported_error: Option<String>,
}

impl ProtocolState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn parsed_lines(&self) -> usize {
        self.parsed
    }

    /// Feed one stdout line. Returns an update to publish for progress lines;
    /// progress never goes backwards.
    pub fn feed(&mut self, line: &str) -> Option<ProgressUpdate> {
        let parsed = parse_line(line)?;
        self.parsed += 1;
        match parsed {
            ProtocolLine::Progress { stage, progress } => {
                if progress.is_finite() {
                    self.progress = self.progress.max(progress.clamp(0.0, 1.0));
                }
                Some(ProgressUpdate {
                    progress: self.progress,
                    stage,
                })
            }
            ProtocolLine::Result { result } => {
                self.result = Some(result);
                None
            }
            ProtocolLine::Error { error } => {
                self.reported_error = Some(error);
                None
            }
        }
    }

    /// Final outcome once the process exited. `stderr_tail` is used when the
    /// transcriber reported no error of its own.
    pub fn finish(self, exit: ExitInfo, stderr_tail: &str) -> Result<serde_json::Value, JobError> {
        let stderr_tail = stderr_tail.trim();
        if !exit.success {
            let message = self
                .reported_error
                .or_else(|| (!stderr_tail.is_empty()).then(|| stderr_tail.to_string()))
                .unwrap_or_else(|| match exit.code {
                    Some(code) => format!("exited with status {code}"),
                    None => "terminated by signal".to_string(),
                });
            return Err(JobError::exit(exit.code, message));
        }
        if self.parsed == 0 {
            return Err(JobError::exit(
                exit.code,
                "transcriber produced no parsable output",
            ));
        }
        self.result
            .ok_or_else(|| JobError::exit(exit.code, "exited without a result payload"))
    }
}
