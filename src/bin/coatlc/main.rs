//! # coatlc
//!
//! This binary is the compiler driver of Coatl. It exposes every pipeline
//! stage (frontend, backend, linker) as a subcommand and combines them into
//! a single `build` command.
mod cli;
mod commands;

use cli::*;

use coatl::error::CompileError;
use log::error;

fn main() {
    let args = Cli::init();

    simple_logger::init_with_level(args.log_level()).unwrap();

    let result = match &args.command {
        Commands::Ir(stage) => commands::run_frontend(stage),
        Commands::Asm(stage) => commands::run_backend(stage),
        Commands::Link(link) => commands::run_linker(link),
        Commands::Build(stage) => commands::build_executable(stage),
    };

    if let Err(err) = result {
        // Coded frontend diagnostics additionally print the machine-readable
        // record consumed by the diagnostic formatter.
        if let CompileError::Parse(diag) = &err {
            eprintln!("{}", diag.record());
        }
        error!("{err}");
        std::process::exit(1);
    }
}
