mod capabilities;
mod checks;
mod config;
mod context;
mod environment;
mod error;
mod exec;
mod hardener;
mod mount;
mod namespace;
mod pipeline;
mod privilege;
mod sandbox;
mod stack;
mod supervisor;
mod utils;
mod vfs;

use clap::Parser;
use config::Cli;
use context::InvocationContext;
use error::LaunchError;
use sandbox::Sandbox;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "ROOTBOX_LOG";

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            return if error.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_tracing(cli.process.verbose);

    exit_code(run(cli))
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let context = InvocationContext::capture()?;
    let config = cli.into_launch_config(&context).map_err(LaunchError::from)?;

    Sandbox::new(config, context).launch()
}

fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        })
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn exit_code(result: anyhow::Result<i32>) -> ExitCode {
    let code = match result {
        Ok(code) => code,
        Err(error) => match error.downcast_ref::<LaunchError>() {
            Some(launch_error) => {
                eprintln!("rootbox: {launch_error}");
                launch_error.exit_code()
            }
            None => {
                eprintln!("rootbox: {error:#}");
                1
            }
        },
    };

    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
