use std::time::Duration;

use clap::Parser;
use puzzle_client_core::telemetry::logging as logctl;
use puzzle_client_core::terminal::app;
use puzzle_client_core::terminal::cli::Cli;
use puzzle_client_core::terminal::error::CliError;
use tracing::debug;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(app::run(cli));
    // stdin is read on a blocking thread that never sees EOF after 'quit'
    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}
