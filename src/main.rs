use std::process::ExitCode;

use clap::Parser;
use segan_trainer::cli::TrainArgs;
use segan_trainer::{runtime, session};

fn main() -> ExitCode {
    runtime::setup_environment();

    if cfg!(debug_assertions) {
        eprintln!(
            "Warning: running a debug build. Training can be much slower. Use `cargo run --release ...`."
        );
    }

    let args = TrainArgs::parse();
    match session::run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            for cause in err.chain().skip(1) {
                eprintln!("  caused by: {cause}");
            }
            ExitCode::FAILURE
        }
    }
}
