//! DFTr CLI - per-object Linemod pose training driver
//!
//! Provides a `dftr` command that trains, evaluates and visualizes one Linemod object
//! class per invocation, and checks that a project tree is ready for training.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{train, verify};

/// DFTr - Linemod 6D pose training driver
#[derive(Parser, Debug)]
#[command(
    name = "dftr",
    author,
    version,
    about = "DFTr - per-object Linemod 6D pose training",
    long_about = "Trains and evaluates the DFTr keypoint-voting pose network for one Linemod object class.\nOne process per device; rank 0 writes checkpoints, metrics and the run log."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Project root holding `datasets/` and `train_log/`
    #[arg(short = 'r', long, default_value = ".", global = true)]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train or evaluate one object class
    ///
    /// Without a mode flag this trains; `--debug`, `--test`, `--test-pose`, `--test-gt`,
    /// `--cal-metrics`, `--view-dpt` and `--eval-net` select the other modes.
    Train(train::TrainArgs),

    /// Check the dataset, models and model code under the project root
    Verify {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    // stdout is reserved for command output (`--json`).
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let code = match args.command {
        Command::Train(train_args) => train::execute(args.root, train_args).await?,
        Command::Verify { json } => verify::execute(&args.root, json)?,
    };
    std::process::exit(code);
}
