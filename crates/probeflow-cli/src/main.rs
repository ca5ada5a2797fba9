mod commands;
mod logging;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "probeflow", version, about = "ETL pipeline for archived network measurements")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Process one archive into a local JSON-lines file
    Parse(commands::parse::ParseArgs),
    /// Enqueue archives for reprocessing by date prefix
    Reprocess(commands::reprocess::ReprocessArgs),
    /// Dedup intermediate per-day tables and promote them to production
    Promote(commands::promote::PromoteArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Parse(args) => commands::parse::execute(args).await,
        Commands::Reprocess(args) => commands::reprocess::execute(args).await,
        Commands::Promote(args) => commands::promote::execute(args).await,
    }
}
