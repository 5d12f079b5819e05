use anyhow::Result;
use pstats_bridge::{Config, StatsEnvelope};

pub struct CliLogger {
    json: bool,
    no_color: bool,
}

impl CliLogger {
    pub fn new(json: bool, no_color: bool) -> Self {
        Self { json, no_color }
    }

    /// The effective configuration, in the same form `pstats-bridge.toml` takes.
    pub fn print_config(&self, config: &Config) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(config)?);
        } else {
            print!("{}", toml::to_string_pretty(config)?);
        }
        Ok(())
    }

    /// Body goes to stdout untouched; the summary line goes to stderr so the
    /// output can be piped straight into a file.
    pub fn print_envelope(&self, envelope: &StatsEnvelope) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(envelope)?);
            return Ok(());
        }

        if !envelope.body.is_empty() {
            println!("{}", envelope.body);
        }
        eprintln!("{}", self.summary(envelope));
        if let Some(diagnostic) = &envelope.diagnostic {
            eprintln!("{} {diagnostic}", self.style("worker", "33;1"));
        }
        Ok(())
    }

    pub fn print_error(&self, msg: &str) {
        if self.json {
            println!("{}", serde_json::json!({ "outcome": "error", "message": msg }));
            return;
        }
        eprintln!("{} {msg}", self.style("error", "31;1"));
    }

    fn summary(&self, envelope: &StatsEnvelope) -> String {
        let outcome = match envelope.outcome.as_str() {
            "completed" => self.style("COMPLETED", "32;1"),
            "timed_out" => self.style("TIMEOUT", "33;1"),
            "failed" => self.style("FAILED", "31;1"),
            _ => self.style("REJECTED", "31;1"),
        };

        let mut out = format!(
            "{} {} {}",
            self.style("pstats-bridge", "36;1"),
            outcome,
            self.style(&envelope.status.to_string(), "37;1")
        );
        if let Some(ms) = envelope.elapsed_ms {
            out.push_str(&format!(" {} {ms}ms", self.style("elapsed", "90")));
        }
        out.push_str(&format!(" {} {}", self.style("bytes", "90"), envelope.body_bytes));
        if let Some(id) = &envelope.request_id {
            out.push_str(&format!(" {} {id}", self.style("request", "90")));
        }
        out
    }

    fn style(&self, text: &str, ansi: &str) -> String {
        if self.no_color {
            return text.to_string();
        }
        format!("\x1b[{ansi}m{text}\x1b[0m")
    }
}
