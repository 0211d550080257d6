//! kiln: detect, build, cache and serve a web project.
//!
//! # Usage
//!
//! ```text
//! kiln [run] [-m DIR] [-o DIR] [-b CMD] [-s CMD] [--no-git] [-p PORT] [--force] ...
//! kiln stop   [-m DIR]
//! kiln status [-m DIR] [--json]
//! kiln detect [-m DIR] [--json]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::{
    control::{StatusArgs, StopArgs},
    detect::DetectArgs,
    run::RunArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "kiln",
    version,
    about = "Build a web project once, skip rebuilds while nothing changed, and serve it",
    long_about = None,
    args_conflicts_with_subcommands = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Arguments for the default `run` command.
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build if needed, then serve until stopped (the default).
    Run(RunArgs),

    /// Ask a running kiln for the project to stop.
    Stop(StopArgs),

    /// Show whether kiln is running for the project and what it last built.
    Status(StatusArgs),

    /// Print the pipeline kiln would use, without running anything.
    Detect(DetectArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run(cli.run)) {
        Commands::Run(args) => args.run(),
        Commands::Stop(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Detect(args) => args.run(),
    }
}

/// Install the fmt subscriber on stderr. `RUST_LOG` wins over the flags.
pub(crate) fn init_tracing(silent: bool, verbose: bool) {
    let default = if silent {
        "off"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
