mod export_dataset;
mod export_pgn;
mod game_visitor;
mod import_pgn;
mod info;

use anyhow::{Context, Result};
use bot::config::Config;
use clap::{Parser, Subcommand};
use export_dataset::{export_dataset, ExportDatasetCommand};
use export_pgn::{export_pgn, ExportPgnCommand};
use import_pgn::{import_pgn, ImportPgnCommand};
use info::{info, InfoCommand};
use std::path::PathBuf;

#[derive(Parser)]
struct Cli {
    /// TOML configuration file shared with the bot
    #[arg(long, global = true, default_value = "bot.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyzes the games of a PGN file and adds them to the experience store
    ImportPgn(ImportPgnCommand),
    /// Writes the analyzed positions of the store as a `fen,score,bestmove` CSV
    ExportDataset(ExportDatasetCommand),
    /// Writes stored games as PGN
    ExportPgn(ExportPgnCommand),
    /// Displays a feature set or a model checkpoint
    Info(InfoCommand),
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    bot::logging::init(&config.logging, false);

    match args.command {
        Commands::ImportPgn(cmd) => import_pgn(cmd, config),
        Commands::ExportDataset(cmd) => export_dataset(cmd, config),
        Commands::ExportPgn(cmd) => export_pgn(cmd, config),
        Commands::Info(cmd) => info(cmd, config),
    }
}
