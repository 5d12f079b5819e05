mod cli_logger;

use anyhow::Result;
use clap::Parser;
use pstats_bridge::{
    Config, DEFAULT_CONFIG_FILE, StatsCodec, StatsCommand, apply_json_overrides, encode_command,
    json_command,
};
use tracing_subscriber::EnvFilter;

use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;

use crate::cli_logger::CliLogger;

/// Exit code of the worker when the report cannot be converted.
const WORKER_FAILURE: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "pstats-bridge", version, about = "Serve pstats profiles as viewer JSON")]
struct Cli {
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Emit machine-readable JSON.
    #[arg(long, global = true)]
    json: bool,

    #[arg(long = "no-color", global = true)]
    no_color: bool,

    /// Enable direct filesystem lookups (`--file`).
    #[arg(long = "single-user", global = true)]
    single_user: bool,

    #[command(subcommand)]
    command: StatsCommand,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let StatsCommand::EncodeWorker { path, key_style } = &cli.command {
        return run_worker(path, *key_style);
    }

    let logger = CliLogger::new(cli.json, cli.no_color);
    match run(&cli, &logger) {
        Ok(code) => code,
        Err(err) => {
            logger.print_error(&format!("{err:#}"));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, logger: &CliLogger) -> Result<ExitCode> {
    let mut config = Config::load_optional(&cli.config);
    config.single_user_mode |= cli.single_user;

    match &cli.command {
        StatsCommand::Json {
            profile,
            file,
            timeout_ms,
            poll_ms,
            key_style,
            distinguish_failures,
        } => {
            let config = apply_json_overrides(
                config,
                *timeout_ms,
                *poll_ms,
                *key_style,
                *distinguish_failures,
            );
            let envelope = json_command(config, profile, *file)?;
            logger.print_envelope(&envelope)?;
            Ok(if envelope.outcome == "completed" {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        StatsCommand::Encode { path, key_style } => {
            let json = encode_command(path, *key_style)?;
            println!("{json}");
            Ok(ExitCode::SUCCESS)
        }
        StatsCommand::Config => {
            logger.print_config(&config)?;
            Ok(ExitCode::SUCCESS)
        }
        StatsCommand::EncodeWorker { path, key_style } => Ok(run_worker(path, *key_style)),
    }
}

/// Runs inside the isolated worker process: JSON on stdout, diagnostics on
/// stderr, non-zero exit on failure.
fn run_worker(path: &std::path::Path, key_style: pstats_bridge::KeyStyle) -> ExitCode {
    match StatsCodec::new(key_style).encode(path) {
        Ok(json) => {
            let mut stdout = std::io::stdout().lock();
            if let Err(err) = stdout.write_all(json.as_bytes()).and_then(|()| stdout.flush()) {
                eprintln!("failed to write output: {err}");
                return ExitCode::from(WORKER_FAILURE);
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{}: {err}", path.display());
            ExitCode::from(WORKER_FAILURE)
        }
    }
}
