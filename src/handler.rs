//! Request handling for `/json/<name>` stats requests.

use serde::Serialize;

use std::sync::Arc;

use crate::{BoundedTaskRunner, BridgeError, Config, RunRecord, TaskOutcome, resolve_report_path};

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";

/// What the HTTP layer should send back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsResponse {
    pub status: u16,
    #[serde(rename = "contentType")]
    pub content_type: Option<&'static str>,
    pub body: String,
}

impl StatsResponse {
    pub fn json(body: String) -> Self {
        Self {
            status: 200,
            content_type: Some(JSON_CONTENT_TYPE),
            body,
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            body: String::new(),
        }
    }

    pub fn not_found() -> Self {
        Self::empty(404)
    }

    pub fn bad_request() -> Self {
        Self::empty(400)
    }
}

/// Response plus the run that produced it, if a worker was started.
#[derive(Debug, Clone)]
pub struct StatsExchange {
    pub response: StatsResponse,
    pub record: Option<RunRecord>,
}

/// Shared handler. Holds configuration only; every request gets its own
/// runner and worker.
#[derive(Debug, Clone)]
pub struct StatsHandler {
    config: Arc<Config>,
}

impl StatsHandler {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub async fn get(&self, request_path: &str, prof_name: &str) -> StatsResponse {
        self.handle(request_path, prof_name).await.response
    }

    pub async fn handle(&self, request_path: &str, prof_name: &str) -> StatsExchange {
        let rejected = |response| StatsExchange {
            response,
            record: None,
        };

        let path = match resolve_report_path(&self.config, request_path, prof_name) {
            Ok(path) => path,
            Err(err @ BridgeError::NotFound(_)) => {
                tracing::warn!(request_path, "rejected: {err}");
                return rejected(StatsResponse::not_found());
            }
            Err(err) => {
                tracing::warn!(request_path, "rejected: {err}");
                return rejected(StatsResponse::bad_request());
            }
        };

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            _ => {
                tracing::warn!(request_path, path = %path.display(), "report not found");
                return rejected(StatsResponse::not_found());
            }
        }

        let runner = match BoundedTaskRunner::from_config(&self.config) {
            Ok(runner) => runner,
            Err(err) => {
                tracing::error!(request_path, "cannot build runner: {err}");
                return rejected(self.failure_response(500));
            }
        };

        match runner.run(&path).await {
            Ok(record) => StatsExchange {
                response: self.respond(&record.outcome),
                record: Some(record),
            },
            Err(err) => {
                tracing::error!(request_path, "cannot start worker: {err}");
                rejected(self.failure_response(500))
            }
        }
    }

    fn respond(&self, outcome: &TaskOutcome) -> StatsResponse {
        match outcome {
            TaskOutcome::Completed { content } if content.is_empty() => StatsResponse::empty(200),
            TaskOutcome::Completed { content } => StatsResponse::json(content.clone()),
            TaskOutcome::Failed { .. } => self.failure_response(500),
            TaskOutcome::TimedOut => self.failure_response(504),
        }
    }

    fn failure_response(&self, distinguished_status: u16) -> StatsResponse {
        if self.config.distinguish_failures {
            StatsResponse::empty(distinguished_status)
        } else {
            StatsResponse::empty(200)
        }
    }
}
