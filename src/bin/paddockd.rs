//! The container-management daemon.
//!
//! Runs in the foreground. Configuration comes from the file named on
//! the command line or from the compiled-in default path; a missing
//! file means defaults. Exit code 0 on a clean, signal-driven
//! shutdown, non-zero on any fatal initialization failure.

use clap::Parser;
use paddock::{Config, Daemon};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "paddockd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path.
    #[arg(long, default_value = paddock::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log verbose lock and event traffic.
    #[arg(long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("cannot load configuration: {}", err);
            return ExitCode::from(1);
        }
    };

    let filter = if args.verbose || config.log.verbose {
        "paddock=debug".to_string()
    } else {
        config.log.filter.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let daemon = match Daemon::new(config) {
        Ok(daemon) => daemon,
        Err(err) => {
            error!(error = %err, "cannot initialize daemon");
            return ExitCode::from(1);
        }
    };

    if let Err(err) = daemon.bootstrap() {
        error!(error = %err, "cannot bootstrap container tree");
        return ExitCode::from(2);
    }

    match daemon.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "daemon failed");
            ExitCode::from(3)
        }
    }
}
