//! imgtriage - photo collection triage
//!
//! Entry point for the imgtriage CLI.

use clap::Parser;
use imgtriage::{
    cli::Cli,
    error::{ExitCode, StructuredError},
};

fn main() {
    // Provider keys may live in .env; a missing file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let json_errors = cli.json_errors;

    match imgtriage::run_app(cli) {
        Ok(code) => std::process::exit(code.as_i32()),
        Err(err) => {
            // Interruptions finish normally with their own code.
            let exit_code = ExitCode::GeneralError;

            if json_errors {
                let structured = StructuredError::new(&err, exit_code);
                match serde_json::to_string_pretty(&structured) {
                    Ok(json) => eprintln!("{json}"),
                    Err(_) => eprintln!("[{}] Error: {:#}", exit_code.code_prefix(), err),
                }
            } else {
                eprintln!("[{}] Error: {:#}", exit_code.code_prefix(), err);
            }

            std::process::exit(exit_code.as_i32());
        }
    }
}
