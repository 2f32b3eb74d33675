//! `bench`: run tiered agent benchmarks from a resumable checkpoint.

mod cli;
mod visualize;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use engine::core::tier::TierId;
use engine::exit_codes;

use crate::cli::RunArgs;
use crate::visualize::Format;

#[derive(Parser)]
#[command(
    name = "bench",
    version,
    about = "Checkpointed tier benchmark orchestrator for coding agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an experiment, resuming from its checkpoint when one exists.
    Run(RunArgs),
    /// Rebuild the completed-run index from `run_result.json` files.
    Repair {
        /// Checkpoint file, or the experiment directory holding it.
        checkpoint: PathBuf,
    },
    /// Print checkpoint state.
    Visualize {
        /// Checkpoint file, or the experiment directory holding it.
        checkpoint: PathBuf,
        #[arg(long, value_enum, default_value_t = Format::Tree)]
        format: Format,
        /// Only show these tiers (comma-separated).
        #[arg(long, value_delimiter = ',')]
        tier: Vec<TierId>,
    },
}

fn main() {
    engine::logging::init("info");
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::FAILURE);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => cli::cmd_run(&args),
        Command::Repair { checkpoint } => cli::cmd_repair(&checkpoint),
        Command::Visualize {
            checkpoint,
            format,
            tier,
        } => cli::cmd_visualize(&checkpoint, format, &tier),
    }
}
