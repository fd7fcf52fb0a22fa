//! # Cli
//!
//! This module contains everything needed for parsing the CLI arguments for
//! coatlc.

use clap::{Args, Parser, Subcommand};

/// Struct containing the CLI configuration for coatlc.
#[derive(Parser, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log more compiler internals; repeat for more detail (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

impl Cli {
    pub fn init() -> Self {
        Cli::parse()
    }

    /// Errors and warnings are always logged; each `-v` widens the level.
    pub fn log_level(&self) -> log::Level {
        match self.verbose {
            0 => log::Level::Warn,
            1 => log::Level::Info,
            2 => log::Level::Debug,
            _ => log::Level::Trace,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Compile a .coatl/.mee source file to coatl_ir v1 text.
    Ir(StageArgs),

    /// Lower a .ir file to x86-64 assembly (Intel syntax).
    Asm(StageArgs),

    /// Link a single relocatable object into a static executable.
    Link(LinkArgs),

    /// Build an executable from source (frontend, backend, as, linker).
    Build(StageArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StageArgs {
    /// The input file of this stage.
    #[arg(index = 1)]
    pub file: std::path::PathBuf,

    /// The output file of this stage.
    #[arg(short, long)]
    pub output: std::path::PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct LinkArgs {
    /// The input object file.
    #[arg(index = 1)]
    pub file: std::path::PathBuf,

    /// The output executable.
    #[arg(short, long)]
    pub output: std::path::PathBuf,

    /// The entry symbol of the executable.
    #[arg(long, default_value = coatl::linker::DEFAULT_ENTRY)]
    pub entry: String,
}
