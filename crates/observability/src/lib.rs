// crates/observability/src/lib.rs
//! Tracing setup shared by the audioscribe binaries.
//!
//! `RUST_LOG` wins when set; otherwise [`DEFAULT_FILTER`] applies.

use std::str::FromStr;

use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "warn,audioscribe_jobs=info,audioscribe_server=info";

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" | "text" | "pretty" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("unknown log format `{other}` (expected compact or json)"),
        }
    }
}

/// Filter from `RUST_LOG`, falling back to `default`.
pub fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into())
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(DEFAULT_FILTER))
        .with_target(true);
    match format {
        LogFormat::Compact => builder
            .compact()
            .try_init()
            .map_err(|e| anyhow::anyhow!(e))?,
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .try_init()
            .map_err(|e| anyhow::anyhow!(e))?,
    }
    tracing::debug!(?format, "Tracing initialised");
    Ok(())
}

/// Request/response tracing for the HTTP layer.
pub fn http_trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>, DefaultMakeSpan, (), DefaultOnResponse> {
    TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(())
        .on_response(DefaultOnResponse::new().level(Level::INFO))
}
