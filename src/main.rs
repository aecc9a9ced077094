//! Entry point: parse args, set up logging, hand off to the driver.

use std::process::ExitCode;

use clap::Parser;
use cupdater::cli::Args;

#[tokio::main]
async fn main() -> ExitCode
{
	let args = Args::parse();

	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_max_level(verbosity_to_level(args.verbose))
		.init();

	match cupdater::driver::run(args).await {
		Ok((code, _launch_hook)) => exit_code(code),
		Err(e) => {
			eprintln!("fatal: {e:#}");
			ExitCode::FAILURE
		},
	}
}

fn verbosity_to_level(verbose: u8) -> tracing::Level
{
	match verbose {
		0 => tracing::Level::WARN,
		1 => tracing::Level::INFO,
		2 => tracing::Level::DEBUG,
		_ => tracing::Level::TRACE,
	}
}

fn exit_code(code: i32) -> ExitCode
{
	if code == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
