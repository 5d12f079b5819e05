//! CLI stats commands (`pstats-bridge json|encode|config ...`).

use clap::Subcommand;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use std::path::{Path, PathBuf};

use crate::{
    BridgeResult, Config, FILE_ROUTE_PREFIX, KEY_STYLE_ENV, KeyStyle, StatsCodec, StatsHandler,
};

#[derive(Debug, Subcommand)]
pub enum StatsCommand {
    /// Convert a report the way a `/json/<name>` request would.
    Json {
        /// Stored report name, or an absolute path with `--file`.
        #[arg(value_name = "PROFILE")]
        profile: String,
        /// Look the report up by filesystem path (needs single-user mode).
        #[arg(long)]
        file: bool,
        #[arg(long = "timeout-ms")]
        timeout_ms: Option<u64>,
        #[arg(long = "poll-ms")]
        poll_ms: Option<u64>,
        #[arg(long = "key-style")]
        key_style: Option<KeyStyle>,
        /// Answer failures with 500 and timeouts with 504.
        #[arg(long = "distinguish-failures")]
        distinguish_failures: bool,
    },
    /// Convert a report in-process, without a worker or time limit.
    Encode {
        path: PathBuf,
        #[arg(long = "key-style", default_value = "joined")]
        key_style: KeyStyle,
    },
    /// Print the effective configuration.
    Config,
    /// Worker entry point: writes the report's JSON to stdout.
    #[command(hide = true)]
    EncodeWorker {
        path: PathBuf,
        #[arg(long = "key-style", env = KEY_STYLE_ENV, default_value = "joined")]
        key_style: KeyStyle,
    },
}

/// Machine-readable result of `pstats-bridge json`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsEnvelope {
    #[serde(rename = "requestId")]
    pub request_id: Option<String>,
    #[serde(rename = "requestPath")]
    pub request_path: String,
    pub outcome: String,
    pub status: u16,
    #[serde(rename = "contentType")]
    pub content_type: Option<String>,
    #[serde(rename = "bodyBytes")]
    pub body_bytes: usize,
    #[serde(rename = "elapsedMs")]
    pub elapsed_ms: Option<u64>,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "finishedAt")]
    pub finished_at: String,
    pub diagnostic: Option<String>,
    pub body: String,
}

/// Applies per-invocation overrides from `json` flags.
pub fn apply_json_overrides(
    mut config: Config,
    timeout_ms: Option<u64>,
    poll_ms: Option<u64>,
    key_style: Option<KeyStyle>,
    distinguish_failures: bool,
) -> Config {
    if let Some(ms) = timeout_ms {
        config.timeout_ms = ms;
    }
    if let Some(ms) = poll_ms {
        config.poll_interval_ms = ms;
    }
    if let Some(style) = key_style {
        config.key_style = style;
    }
    config.distinguish_failures |= distinguish_failures;
    config
}

/// Runs one stats request on a single-threaded event loop.
pub fn json_command(config: Config, profile: &str, file: bool) -> BridgeResult<StatsEnvelope> {
    config.validate()?;
    let (request_path, prof_name) = if file {
        let trimmed = profile.trim_start_matches('/');
        (format!("{FILE_ROUTE_PREFIX}{trimmed}.json"), trimmed)
    } else {
        (format!("/json/{profile}.json"), profile)
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let handler = StatsHandler::new(config);
    let started_at = now_rfc3339();
    let exchange = runtime.block_on(handler.handle(&request_path, prof_name));
    let finished_at = now_rfc3339();

    let (request_id, outcome, elapsed_ms, diagnostic) = match &exchange.record {
        Some(record) => (
            Some(record.request_id.to_string()),
            record.outcome.label().to_string(),
            Some(record.elapsed.as_millis() as u64),
            match &record.outcome {
                crate::TaskOutcome::Failed { diagnostic } => Some(diagnostic.clone()),
                _ => None,
            },
        ),
        None => (None, "rejected".to_string(), None, None),
    };

    let response = exchange.response;
    Ok(StatsEnvelope {
        request_id,
        request_path,
        outcome,
        status: response.status,
        content_type: response.content_type.map(str::to_string),
        body_bytes: response.body.len(),
        elapsed_ms,
        started_at,
        finished_at,
        diagnostic,
        body: response.body,
    })
}

pub fn encode_command(path: &Path, key_style: KeyStyle) -> BridgeResult<String> {
    StatsCodec::new(key_style).encode(path)
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}
