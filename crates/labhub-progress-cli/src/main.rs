use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = labhub_progress_cli::Cli::parse();
    match labhub_progress_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::debug!(error = %format!("{err:#}"), "command failed");
            eprintln!("{}", labhub_progress_cli::render_error(&err));
            ExitCode::FAILURE
        }
    }
}
