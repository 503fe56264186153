//! ferret - terminal feed reader
//!
//! Browse feed items and search them progressively: lexical hits first,
//! then semantic matches, then an optional rerank.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use ferret::Result;
use ferret::app::AppContext;
use ferret::cli::Cli;
use ferret::cli::output::robot_error;
use ferret::config::Config;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            if cli.robot {
                // Robot mode: JSON error output to stdout
                let payload = serde_json::to_string(&robot_error(&e)).unwrap_or_default();
                println!("{payload}");
            } else {
                eprintln!("Error: {e}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let ctx = AppContext::from_cli(cli)?;
    ferret::cli::commands::run(&ctx, cli.command.as_ref())
}

fn init_tracing(cli: &Cli) {
    if cli.quiet {
        return;
    }

    let filter = match cli.verbose {
        0 => "warn,ferret=info",
        1 => "info,ferret=debug",
        2 => "debug,ferret=trace",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    if cli.is_interactive() {
        // The reader owns the terminal, so logs go to a file.
        let Some(file) = log_file(cli) else {
            return;
        };
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .init();
    } else if cli.robot {
        // JSON logging for robot mode
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        // Human-readable logging
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn log_file(cli: &Cli) -> Option<std::fs::File> {
    let dir: PathBuf = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => Config::default_data_dir().ok()?,
    };
    std::fs::create_dir_all(&dir).ok()?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("ferret.log"))
        .ok()
}
